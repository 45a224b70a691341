//! Holding area for packets between arrival and dispatch.
//!
//! Packets are kept in arrival order. Incomplete (fragmented) packets sit
//! in the queue while their fragments trickle in and are found again by a
//! linear `(code, seq)` match; dispatch only ever sees complete packets.

use std::collections::VecDeque;

use crate::protocol::Packet;

/// FIFO of received packets.
#[derive(Debug, Default)]
pub struct PacketQueue {
    packets: VecDeque<Packet>,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a packet in arrival order.
    pub fn push(&mut self, packet: Packet) {
        self.packets.push_back(packet);
    }

    /// Find the incomplete packet still collecting fragments for `(code, seq)`.
    pub fn find_incomplete_mut(&mut self, code: u8, seq: u8) -> Option<&mut Packet> {
        self.packets
            .iter_mut()
            .find(|p| !p.is_complete() && p.code() == code && p.seq() == seq)
    }

    /// True if an incomplete packet for `(code, seq)` is queued.
    pub fn has_incomplete(&self, code: u8, seq: u8) -> bool {
        self.packets
            .iter()
            .any(|p| !p.is_complete() && p.code() == code && p.seq() == seq)
    }

    /// Remove and return the oldest complete packet, skipping incomplete ones.
    pub fn pop_complete(&mut self) -> Option<Packet> {
        let index = self.packets.iter().position(Packet::is_complete)?;
        self.packets.remove(index)
    }

    /// Remove the first packet matching `(code, seq)`, complete or not.
    pub fn remove(&mut self, code: u8, seq: u8) -> Option<Packet> {
        let index = self
            .packets
            .iter()
            .position(|p| p.code() == code && p.seq() == seq)?;
        self.packets.remove(index)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn incomplete_count(&self) -> usize {
        self.packets.iter().filter(|p| !p.is_complete()).count()
    }

    pub fn clear(&mut self) {
        self.packets.clear();
    }
}
