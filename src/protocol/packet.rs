//! Packet: one protocol message plus its fragment-tracking state.
//!
//! A packet received in fragments starts life with a preallocated payload
//! and a table of missing fragment slots. It only becomes visible to
//! dispatch once [`Packet::is_complete`] holds.
//!
//! # Example
//!
//! ```
//! use framewire::protocol::{Packet, PacketType};
//!
//! let mut packet = Packet::new(PacketType::Request, 0x19, 4);
//! packet.begin_fragmented(1000, 512).unwrap();
//! assert_eq!(packet.missing_fragments(), 2);
//!
//! packet.set_fragment(1, &[0u8; 488]).unwrap();
//! packet.set_fragment(0, &[0u8; 512]).unwrap();
//! assert!(packet.is_complete());
//! ```

use std::fmt;

use bytes::Bytes;

use super::codes::{is_notification_code, ErrorCode};
use super::wire_format::{fragment_count, fragment_len, max_total_length};
use crate::error::{FramewireError, Result};

/// Which end of a connection a component sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
}

/// The four kinds of protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// Client to server, expects a Reply.
    Request,
    /// Server to client, answers a Request.
    Reply,
    /// Server to client, unsolicited.
    Notification,
    /// Client to server, answers a Notification.
    Response,
}

impl PacketType {
    /// Classify an incoming packet from its code and the receiving side.
    pub fn classify(receiver: Role, code: u8) -> Self {
        match (receiver, is_notification_code(code)) {
            (Role::Client, false) => PacketType::Reply,
            (Role::Client, true) => PacketType::Notification,
            (Role::Server, false) => PacketType::Request,
            (Role::Server, true) => PacketType::Response,
        }
    }

    /// Reply and Response headers carry a status byte.
    #[inline]
    pub fn has_status(self) -> bool {
        matches!(self, PacketType::Reply | PacketType::Response)
    }
}

/// Completion hook fired when the reply to a request arrives (or never will).
pub type ReplyCallback = Box<dyn FnOnce(Result<Packet>) + Send + 'static>;

/// Bookkeeping for a payload that arrives in fragments.
#[derive(Debug, Clone)]
struct FragmentTable {
    received: Vec<bool>,
    missing: usize,
    max_datasize: usize,
}

/// A single protocol message.
pub struct Packet {
    code: u8,
    seq: u8,
    status: ErrorCode,
    kind: PacketType,
    payload: Vec<u8>,
    fragments: Option<FragmentTable>,
    recv_callback: Option<ReplyCallback>,
}

impl Packet {
    /// Create an empty packet.
    pub fn new(kind: PacketType, code: u8, seq: u8) -> Self {
        Self {
            code,
            seq,
            status: ErrorCode::Success,
            kind,
            payload: Vec::new(),
            fragments: None,
            recv_callback: None,
        }
    }

    /// Create a packet that owns a copy of `payload`.
    pub fn with_payload(kind: PacketType, code: u8, seq: u8, payload: &[u8]) -> Self {
        let mut packet = Self::new(kind, code, seq);
        packet.payload = payload.to_vec();
        packet
    }

    /// Builder-style status setter.
    pub fn with_status(mut self, status: ErrorCode) -> Self {
        self.status = status;
        self
    }

    #[inline]
    pub fn code(&self) -> u8 {
        self.code
    }

    #[inline]
    pub fn seq(&self) -> u8 {
        self.seq
    }

    #[inline]
    pub fn set_seq(&mut self, seq: u8) {
        self.seq = seq;
    }

    #[inline]
    pub fn status(&self) -> ErrorCode {
        self.status
    }

    #[inline]
    pub fn set_status(&mut self, status: ErrorCode) {
        self.status = status;
    }

    #[inline]
    pub fn kind(&self) -> PacketType {
        self.kind
    }

    /// Payload bytes received (or to be sent) so far.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload length in bytes.
    #[inline]
    pub fn packet_length(&self) -> usize {
        self.payload.len()
    }

    /// Consume the packet, returning its payload without copying.
    pub fn into_payload(self) -> Bytes {
        Bytes::from(self.payload)
    }

    /// (Re)allocate a zero-filled payload of `length` bytes.
    ///
    /// Allocation failure surfaces as `ResourceLimit` and is never retried.
    pub fn allocate_buffer(&mut self, length: usize) -> Result<()> {
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(length)
            .map_err(|_| FramewireError::Status(ErrorCode::ResourceLimit))?;
        buffer.resize(length, 0);
        self.payload = buffer;
        Ok(())
    }

    /// Prepare to receive `total` bytes split into `max_datasize` chunks.
    pub fn begin_fragmented(&mut self, total: usize, max_datasize: usize) -> Result<()> {
        if max_datasize == 0 || total > max_total_length(max_datasize) {
            return Err(FramewireError::Protocol(format!(
                "fragmented length {} not representable with max_datasize {}",
                total, max_datasize
            )));
        }
        self.allocate_buffer(total)?;
        let count = fragment_count(total, max_datasize);
        self.fragments = Some(FragmentTable {
            received: vec![false; count],
            missing: count,
            max_datasize,
        });
        Ok(())
    }

    /// Number of fragments this packet is split into (0 if not fragmented).
    pub fn fragment_count(&self) -> usize {
        self.fragments.as_ref().map_or(0, |t| t.received.len())
    }

    /// Expected data length of fragment `index`, if it exists.
    pub fn expected_fragment_len(&self, index: usize) -> Option<usize> {
        let table = self.fragments.as_ref()?;
        if index >= table.received.len() {
            return None;
        }
        Some(fragment_len(index, self.payload.len(), table.max_datasize))
    }

    /// Copy fragment `index` into place.
    ///
    /// Returns `Ok(false)` for a duplicate. Out-of-range indices and
    /// wrongly-sized chunks are protocol errors.
    pub fn set_fragment(&mut self, index: usize, data: &[u8]) -> Result<bool> {
        let total = self.payload.len();
        let table = self.fragments.as_mut().ok_or_else(|| {
            FramewireError::Protocol("fragment for a non-fragmented packet".to_string())
        })?;
        if index >= table.received.len() {
            return Err(FramewireError::Protocol(format!(
                "fragment index {} out of range (packet has {})",
                index,
                table.received.len()
            )));
        }
        let expected = fragment_len(index, total, table.max_datasize);
        if data.len() != expected {
            return Err(FramewireError::Protocol(format!(
                "fragment {} carries {} bytes, expected {}",
                index,
                data.len(),
                expected
            )));
        }
        if table.received[index] {
            return Ok(false);
        }
        let offset = index * table.max_datasize;
        self.payload[offset..offset + expected].copy_from_slice(data);
        table.received[index] = true;
        table.missing -= 1;
        Ok(true)
    }

    /// Whether fragment `index` has yet to arrive.
    pub fn is_missing(&self, index: usize) -> bool {
        self.fragments
            .as_ref()
            .is_some_and(|t| t.received.get(index).is_some_and(|seen| !seen))
    }

    #[inline]
    pub fn missing_fragments(&self) -> usize {
        self.fragments.as_ref().map_or(0, |t| t.missing)
    }

    /// Complete iff no fragment is missing.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.missing_fragments() == 0
    }

    /// Attach an asynchronous completion handler for the reply.
    pub fn set_recv_callback<F>(&mut self, callback: F)
    where
        F: FnOnce(Result<Packet>) + Send + 'static,
    {
        self.recv_callback = Some(Box::new(callback));
    }

    pub fn has_recv_callback(&self) -> bool {
        self.recv_callback.is_some()
    }

    pub(crate) fn take_recv_callback(&mut self) -> Option<ReplyCallback> {
        self.recv_callback.take()
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("kind", &self.kind)
            .field("code", &format_args!("0x{:02X}", self.code))
            .field("seq", &self.seq)
            .field("status", &self.status)
            .field("len", &self.payload.len())
            .field("missing", &self.missing_fragments())
            .field("callback", &self.recv_callback.is_some())
            .finish()
    }
}
