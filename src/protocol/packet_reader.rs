//! Receive-side packet assembly.
//!
//! Uses `bytes::BytesMut` to accumulate socket reads and a small state
//! machine to cut them into packets:
//! - `WaitingForHeader`: need the 4-byte prefix plus its extra fields
//! - `WaitingForPayload`: ordinary header parsed, need N payload bytes
//! - `WaitingForFragment`: continuation header parsed, need its data
//!
//! Fragmented packets are parked in a [`PacketQueue`] until every fragment
//! has arrived. `push` only ever returns complete packets.
//!
//! # Example
//!
//! ```ignore
//! use framewire::protocol::{PacketReader, Role};
//!
//! let mut reader = PacketReader::new(Role::Server, 512);
//! let packets = reader.push(&chunk_from_socket)?;
//! for packet in packets {
//!     println!("request 0x{:02X} seq {}", packet.code(), packet.seq());
//! }
//! ```

use bytes::BytesMut;

use super::codes::ErrorCode;
use super::packet::{Packet, PacketType, Role};
use super::wire_format::{
    load_byte, load_long, max_total_length, Header, HeaderKind, BASE_HEADER_SIZE,
};
use crate::error::{FramewireError, Result};
use crate::queue::PacketQueue;

/// Parser state.
#[derive(Debug, Clone, Copy)]
enum State {
    WaitingForHeader,
    WaitingForPayload {
        kind: PacketType,
        code: u8,
        seq: u8,
        status: ErrorCode,
        remaining: usize,
    },
    WaitingForFragment {
        code: u8,
        seq: u8,
        index: usize,
        len: usize,
    },
}

/// Turns a byte stream into complete packets for one connection.
pub struct PacketReader {
    buffer: BytesMut,
    state: State,
    role: Role,
    max_datasize: usize,
    queue: PacketQueue,
}

impl PacketReader {
    /// Create a reader for the given receiving side and fragment size.
    pub fn new(role: Role, max_datasize: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            state: State::WaitingForHeader,
            role,
            max_datasize,
            queue: PacketQueue::new(),
        }
    }

    /// Push data into the buffer and return every packet it completes.
    ///
    /// # Errors
    ///
    /// Any protocol violation (crash sentinel, orphan or out-of-range
    /// fragment, reuse of a `(code, seq)` pair that is still being
    /// reassembled, oversized total length). The connection must be
    /// aborted; the reader is left in an unspecified state.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Packet>> {
        self.buffer.extend_from_slice(data);

        while self.step()? {}

        let mut complete = Vec::new();
        while let Some(packet) = self.queue.pop_complete() {
            complete.push(packet);
        }
        Ok(complete)
    }

    /// Advance the state machine once. Returns false when more input is needed.
    fn step(&mut self) -> Result<bool> {
        match self.state {
            State::WaitingForHeader => {
                let Some(header) = Header::decode(&self.buffer) else {
                    return Ok(false);
                };
                if header.is_crash_sentinel() {
                    return Err(FramewireError::Protocol(
                        "peer crashed mid-write (sentinel header)".to_string(),
                    ));
                }

                let kind = PacketType::classify(self.role, header.code);
                let needed = BASE_HEADER_SIZE + header.extra_len(kind.has_status());
                if self.buffer.len() < needed {
                    return Ok(false);
                }
                let head = self.buffer.split_to(needed);
                let status = if kind.has_status() {
                    ErrorCode::from_status_byte(load_byte(&head, BASE_HEADER_SIZE))
                } else {
                    ErrorCode::Success
                };

                match header.kind {
                    HeaderKind::Ordinary { length } => {
                        self.state = State::WaitingForPayload {
                            kind,
                            code: header.code,
                            seq: header.seq,
                            status,
                            remaining: length as usize,
                        };
                    }
                    HeaderKind::FragmentStart => {
                        let total = load_long(&head, needed - 4) as usize;
                        self.start_fragmented(kind, header, status, total)?;
                    }
                    HeaderKind::Fragment { index } => {
                        let index = index as usize;
                        let packet = self
                            .queue
                            .find_incomplete_mut(header.code, header.seq)
                            .ok_or_else(|| {
                                FramewireError::Protocol(format!(
                                    "orphan fragment {} for code 0x{:02X} seq {}",
                                    index, header.code, header.seq
                                ))
                            })?;
                        let len = packet.expected_fragment_len(index).ok_or_else(|| {
                            FramewireError::Protocol(format!(
                                "fragment index {} out of range for code 0x{:02X} seq {}",
                                index, header.code, header.seq
                            ))
                        })?;
                        self.state = State::WaitingForFragment {
                            code: header.code,
                            seq: header.seq,
                            index,
                            len,
                        };
                    }
                }
                Ok(true)
            }

            State::WaitingForPayload {
                kind,
                code,
                seq,
                status,
                remaining,
            } => {
                if self.buffer.len() < remaining {
                    return Ok(false);
                }
                let data = self.buffer.split_to(remaining);
                let packet = Packet::with_payload(kind, code, seq, &data).with_status(status);
                self.queue.push(packet);
                self.state = State::WaitingForHeader;
                Ok(true)
            }

            State::WaitingForFragment {
                code,
                seq,
                index,
                len,
            } => {
                if self.buffer.len() < len {
                    return Ok(false);
                }
                let data = self.buffer.split_to(len);
                let packet = self.queue.find_incomplete_mut(code, seq).ok_or_else(|| {
                    FramewireError::Protocol(format!(
                        "fragment target vanished for code 0x{:02X} seq {}",
                        code, seq
                    ))
                })?;
                if !packet.set_fragment(index, &data)? {
                    tracing::debug!(code, seq, index, "Ignoring duplicate fragment");
                }
                self.state = State::WaitingForHeader;
                Ok(true)
            }
        }
    }

    fn start_fragmented(
        &mut self,
        kind: PacketType,
        header: Header,
        status: ErrorCode,
        total: usize,
    ) -> Result<()> {
        if self.queue.has_incomplete(header.code, header.seq) {
            return Err(FramewireError::Protocol(format!(
                "code 0x{:02X} seq {} reused while a fragmented packet is incomplete",
                header.code, header.seq
            )));
        }
        if total > max_total_length(self.max_datasize) {
            return Err(FramewireError::Protocol(format!(
                "fragmented length {} exceeds maximum {}",
                total,
                max_total_length(self.max_datasize)
            )));
        }
        let mut packet = Packet::new(kind, header.code, header.seq).with_status(status);
        packet.begin_fragmented(total, self.max_datasize)?;
        self.queue.push(packet);
        Ok(())
    }

    /// Number of bytes buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Number of fragmented packets still being reassembled.
    pub fn incomplete(&self) -> usize {
        self.queue.incomplete_count()
    }

    /// Drop all buffered bytes and partial packets.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.queue.clear();
        self.state = State::WaitingForHeader;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForPayload { .. } => "WaitingForPayload",
            State::WaitingForFragment { .. } => "WaitingForFragment",
        }
    }
}
