//! The 128-slot table of outstanding sequence numbers on one connection.

/// Number of concurrently outstanding requests per connection.
pub const SEQ_SLOTS: usize = 128;

#[derive(Debug)]
struct Slot<T> {
    code: u8,
    value: T,
}

/// Maps sequence numbers to whatever is waiting on them.
///
/// Allocation scans forward from the slot after the last one handed out,
/// wrapping around, so recently freed numbers are not immediately reused.
#[derive(Debug)]
pub struct SeqTable<T> {
    slots: Vec<Option<Slot<T>>>,
    last: usize,
    outstanding: usize,
}

impl<T> SeqTable<T> {
    pub fn new() -> Self {
        Self {
            slots: (0..SEQ_SLOTS).map(|_| None).collect(),
            last: SEQ_SLOTS - 1,
            outstanding: 0,
        }
    }

    /// The sequence number the next [`SeqTable::attach`] would use, if any.
    pub fn next_seq_num(&self) -> Option<u8> {
        (1..=SEQ_SLOTS)
            .map(|step| (self.last + step) % SEQ_SLOTS)
            .find(|&i| self.slots[i].is_none())
            .map(|i| i as u8)
    }

    /// Claim a free sequence number for a request with the given code.
    ///
    /// Returns `None` when all 128 slots are in use.
    pub fn attach(&mut self, code: u8, value: T) -> Option<u8> {
        let seq = self.next_seq_num()?;
        let index = seq as usize;
        self.slots[index] = Some(Slot { code, value });
        self.last = index;
        self.outstanding += 1;
        Some(seq)
    }

    /// Release the slot for an arriving reply.
    ///
    /// The reply must match both sequence number and code; anything else
    /// leaves the table untouched and returns `None`.
    pub fn complete(&mut self, seq: u8, code: u8) -> Option<T> {
        let slot = self.slots.get_mut(seq as usize)?;
        if slot.as_ref().map(|s| s.code) != Some(code) {
            return None;
        }
        self.outstanding -= 1;
        slot.take().map(|s| s.value)
    }

    /// Free a slot regardless of code (timeouts, send failures).
    pub fn release(&mut self, seq: u8) -> Option<T> {
        let value = self.slots.get_mut(seq as usize)?.take()?.value;
        self.outstanding -= 1;
        Some(value)
    }

    /// Whatever currently waits on `seq`.
    pub fn peek(&self, seq: u8) -> Option<&T> {
        self.slots.get(seq as usize)?.as_ref().map(|s| &s.value)
    }

    pub fn is_pending(&self, seq: u8) -> bool {
        self.slots.get(seq as usize).is_some_and(Option::is_some)
    }

    #[inline]
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Empty the table, returning everything that was waiting.
    pub fn drain(&mut self) -> Vec<T> {
        self.outstanding = 0;
        self.slots
            .iter_mut()
            .filter_map(|slot| slot.take().map(|s| s.value))
            .collect()
    }
}

impl<T> Default for SeqTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_128_distinct_then_exhausted() {
        let mut table = SeqTable::new();
        let mut seen = HashSet::new();
        for i in 0..SEQ_SLOTS {
            let seq = table.attach(0x0D, i).unwrap();
            assert!(seen.insert(seq), "sequence {} handed out twice", seq);
        }
        assert_eq!(table.outstanding(), 128);
        assert_eq!(table.next_seq_num(), None);
        assert_eq!(table.attach(0x0D, 999), None);
    }

    #[test]
    fn test_scan_starts_after_last_used() {
        let mut table = SeqTable::new();
        assert_eq!(table.attach(1, ()), Some(0));
        assert_eq!(table.attach(1, ()), Some(1));
        table.release(0);
        // slot 0 is free but the scan continues from 2
        assert_eq!(table.attach(1, ()), Some(2));
    }

    #[test]
    fn test_wraparound_reuses_freed_slot() {
        let mut table = SeqTable::new();
        for _ in 0..SEQ_SLOTS {
            table.attach(1, ()).unwrap();
        }
        table.release(5);
        assert_eq!(table.next_seq_num(), Some(5));
        assert_eq!(table.attach(1, ()), Some(5));
    }

    #[test]
    fn test_complete_requires_matching_code() {
        let mut table = SeqTable::new();
        let seq = table.attach(0x10, "lock").unwrap();

        assert_eq!(table.complete(seq, 0x11), None);
        assert!(table.is_pending(seq));
        assert_eq!(table.complete(seq, 0x10), Some("lock"));
        assert!(!table.is_pending(seq));
        assert_eq!(table.complete(seq, 0x10), None);
        assert_eq!(table.outstanding(), 0);
    }

    #[test]
    fn test_drain() {
        let mut table = SeqTable::new();
        table.attach(1, 10).unwrap();
        table.attach(2, 20).unwrap();
        let mut drained = table.drain();
        drained.sort();
        assert_eq!(drained, vec![10, 20]);
        assert_eq!(table.outstanding(), 0);
        assert_eq!(table.release(0), None);
    }
}
