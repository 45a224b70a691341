//! Wire format encoding and decoding.
//!
//! Every multi-byte field is big-endian. Three header shapes share the
//! leading four bytes:
//! ```text
//! ordinary        ┌──────────┬──────┬─────┬─────────┐
//!                 │ length   │ code │ seq │[status] │ + length bytes
//!                 │ u16 <8000│ u8   │ u8  │ u8      │
//!                 └──────────┴──────┴─────┴─────────┘
//! fragment start  ┌──────────┬──────┬─────┬─────────┬───────────┐
//!                 │ 0xFFFF   │ code │ seq │[status] │ total u32 │
//!                 └──────────┴──────┴─────┴─────────┴───────────┘
//! fragment        ┌──────────────┬──────┬─────┐
//!                 │ 0x8000|index │ code │ seq │ + fragment_len(index) bytes
//!                 └──────────────┴──────┴─────┘
//! ```
//!
//! The status byte is present on Reply and Response packets only.

/// Size of the common header prefix (length/sentinel, code, seq).
pub const BASE_HEADER_SIZE: usize = 4;

/// Size of the optional status byte.
pub const STATUS_SIZE: usize = 1;

/// Size of the total-length field that follows a fragment-start header.
pub const TOTAL_LENGTH_SIZE: usize = 4;

/// Length value announcing the start of a fragmented packet.
pub const FRAGMENT_SENTINEL: u16 = 0xFFFF;

/// High bit marking a continuation fragment.
pub const FRAGMENT_FLAG: u16 = 0x8000;

/// Largest payload length an ordinary header can carry.
pub const MAX_ORDINARY_LENGTH: usize = 0x7FFF;

/// Number of fragment indices addressable by the 15-bit index field.
pub const MAX_FRAGMENTS: usize = 0x8000;

/// Default fragmentation threshold.
pub const DEFAULT_MAX_DATASIZE: usize = 512;

/// Code and sequence value written by a peer that died mid-write.
pub const CRASH_SENTINEL: u8 = 0xFF;

/// Store one byte at `offset`.
///
/// # Panics
///
/// Panics if `buf` is too short; callers validate lengths first.
#[inline]
pub fn store_byte(value: u8, buf: &mut [u8], offset: usize) {
    buf[offset] = value;
}

/// Store a big-endian u16 at `offset`.
#[inline]
pub fn store_short(value: u16, buf: &mut [u8], offset: usize) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

/// Store a big-endian u32 at `offset`.
#[inline]
pub fn store_long(value: u32, buf: &mut [u8], offset: usize) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

#[inline]
pub fn load_byte(buf: &[u8], offset: usize) -> u8 {
    buf[offset]
}

#[inline]
pub fn load_short(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

#[inline]
pub fn load_long(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

/// Number of fragments needed to carry `total` bytes.
#[inline]
pub fn fragment_count(total: usize, max_datasize: usize) -> usize {
    total.div_ceil(max_datasize)
}

/// Data length of fragment `index` of a `total`-byte payload.
///
/// Every fragment is full-sized except the last, which carries the remainder.
#[inline]
pub fn fragment_len(index: usize, total: usize, max_datasize: usize) -> usize {
    let start = index * max_datasize;
    total.saturating_sub(start).min(max_datasize)
}

/// Largest payload that can be fragmented at the given threshold.
#[inline]
pub fn max_total_length(max_datasize: usize) -> usize {
    MAX_FRAGMENTS * max_datasize
}

/// Shape of the leading 16-bit field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderKind {
    /// Non-fragmented packet carrying `length` payload bytes.
    Ordinary { length: u16 },
    /// Start of a fragmented packet; a u32 total length follows.
    FragmentStart,
    /// Continuation fragment with the given 0-based index.
    Fragment { index: u16 },
}

/// The four-byte header prefix shared by every packet on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: HeaderKind,
    pub code: u8,
    pub seq: u8,
}

impl Header {
    /// Header for an ordinary packet.
    pub fn ordinary(length: u16, code: u8, seq: u8) -> Self {
        debug_assert!(length as usize <= MAX_ORDINARY_LENGTH);
        Self {
            kind: HeaderKind::Ordinary { length },
            code,
            seq,
        }
    }

    /// Header announcing a fragmented packet.
    pub fn fragment_start(code: u8, seq: u8) -> Self {
        Self {
            kind: HeaderKind::FragmentStart,
            code,
            seq,
        }
    }

    /// Header for continuation fragment `index`.
    pub fn fragment(index: u16, code: u8, seq: u8) -> Self {
        debug_assert!((index as usize) < MAX_FRAGMENTS);
        Self {
            kind: HeaderKind::Fragment { index },
            code,
            seq,
        }
    }

    /// Encode the four-byte prefix.
    ///
    /// # Example
    ///
    /// ```
    /// use framewire::protocol::Header;
    ///
    /// let bytes = Header::ordinary(5, 0x0D, 3).encode();
    /// assert_eq!(bytes, [0x00, 0x05, 0x0D, 0x03]);
    /// ```
    pub fn encode(&self) -> [u8; BASE_HEADER_SIZE] {
        let mut buf = [0u8; BASE_HEADER_SIZE];
        let lead = match self.kind {
            HeaderKind::Ordinary { length } => length,
            HeaderKind::FragmentStart => FRAGMENT_SENTINEL,
            HeaderKind::Fragment { index } => FRAGMENT_FLAG | index,
        };
        store_short(lead, &mut buf, 0);
        store_byte(self.code, &mut buf, 2);
        store_byte(self.seq, &mut buf, 3);
        buf
    }

    /// Decode the four-byte prefix.
    ///
    /// Returns `None` if the buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < BASE_HEADER_SIZE {
            return None;
        }
        let lead = load_short(buf, 0);
        let kind = if lead == FRAGMENT_SENTINEL {
            HeaderKind::FragmentStart
        } else if lead & FRAGMENT_FLAG != 0 {
            HeaderKind::Fragment {
                index: lead & !FRAGMENT_FLAG,
            }
        } else {
            HeaderKind::Ordinary { length: lead }
        };
        Some(Self {
            kind,
            code: load_byte(buf, 2),
            seq: load_byte(buf, 3),
        })
    }

    /// A peer that crashed mid-write leaves 0xFF in both code and seq.
    #[inline]
    pub fn is_crash_sentinel(&self) -> bool {
        self.code == CRASH_SENTINEL && self.seq == CRASH_SENTINEL
    }

    /// Bytes that follow the prefix before data begins.
    #[inline]
    pub fn extra_len(&self, has_status: bool) -> usize {
        let status = if has_status { STATUS_SIZE } else { 0 };
        match self.kind {
            HeaderKind::Ordinary { .. } => status,
            HeaderKind::FragmentStart => status + TOTAL_LENGTH_SIZE,
            HeaderKind::Fragment { .. } => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_load_roundtrip() {
        let mut buf = [0u8; 8];
        store_byte(0xAB, &mut buf, 0);
        store_short(0x1234, &mut buf, 1);
        store_long(0xDEADBEEF, &mut buf, 3);

        assert_eq!(buf[..7], [0xAB, 0x12, 0x34, 0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(load_byte(&buf, 0), 0xAB);
        assert_eq!(load_short(&buf, 1), 0x1234);
        assert_eq!(load_long(&buf, 3), 0xDEADBEEF);
    }

    #[test]
    fn test_header_shapes() {
        let start = Header::fragment_start(0x19, 7).encode();
        assert_eq!(start, [0xFF, 0xFF, 0x19, 0x07]);

        let frag = Header::fragment(3, 0x19, 7).encode();
        assert_eq!(frag, [0x80, 0x03, 0x19, 0x07]);

        assert_eq!(Header::decode(&start).unwrap().kind, HeaderKind::FragmentStart);
        assert_eq!(
            Header::decode(&frag).unwrap().kind,
            HeaderKind::Fragment { index: 3 }
        );
        assert_eq!(
            Header::decode(&[0x7F, 0xFF, 1, 2]).unwrap().kind,
            HeaderKind::Ordinary { length: 0x7FFF }
        );
    }

    #[test]
    fn test_decode_too_short_buffer() {
        assert!(Header::decode(&[0u8; 3]).is_none());
    }

    #[test]
    fn test_crash_sentinel() {
        let header = Header::decode(&[0x00, 0x00, 0xFF, 0xFF]).unwrap();
        assert!(header.is_crash_sentinel());
        assert!(!Header::ordinary(0, 0xFF, 0).is_crash_sentinel());
    }

    #[test]
    fn test_extra_len() {
        assert_eq!(Header::ordinary(1, 0, 0).extra_len(false), 0);
        assert_eq!(Header::ordinary(1, 0, 0).extra_len(true), 1);
        assert_eq!(Header::fragment_start(0, 0).extra_len(true), 5);
        assert_eq!(Header::fragment(0, 0, 0).extra_len(true), 0);
    }

    #[test]
    fn test_fragment_arithmetic() {
        assert_eq!(fragment_count(10_000, 512), 20);
        assert_eq!(fragment_len(0, 10_000, 512), 512);
        assert_eq!(fragment_len(19, 10_000, 512), 10_000 - 19 * 512);
        assert_eq!(fragment_count(1024, 512), 2);
        assert_eq!(fragment_len(1, 1024, 512), 512);
        assert_eq!(max_total_length(512), 0x8000 * 512);
    }
}
