//! Payload builders and bounds-checked readers.
//!
//! Both sides lay out request and reply bodies with WireCodec fields and
//! NUL-terminated strings. [`PayloadReader`] never panics: every read past
//! the end (or missing terminator) is reported as `InvalidParameters`.

use bytes::Bytes;

use super::codes::ErrorCode;
use super::wire_format::{load_long, load_short, store_long, store_short};

/// Appends protocol fields to a growable buffer.
#[derive(Debug, Default, Clone)]
pub struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub fn put_u16(&mut self, value: u16) -> &mut Self {
        let offset = self.buf.len();
        self.buf.resize(offset + 2, 0);
        store_short(value, &mut self.buf, offset);
        self
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        let offset = self.buf.len();
        self.buf.resize(offset + 4, 0);
        store_long(value, &mut self.buf, offset);
        self
    }

    /// Append `text` followed by a NUL terminator.
    ///
    /// Callers reject embedded NULs before building a payload.
    pub fn put_cstr(&mut self, text: &str) -> &mut Self {
        debug_assert!(!text.contains('\0'));
        self.buf.extend_from_slice(text.as_bytes());
        self.buf.push(0);
        self
    }

    pub fn put_bytes(&mut self, data: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(data);
        self
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Bytes {
        Bytes::from(self.buf)
    }
}

/// Sequential reader over a received payload.
#[derive(Debug, Clone)]
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn ensure(&self, n: usize) -> Result<(), ErrorCode> {
        if self.remaining() < n {
            Err(ErrorCode::InvalidParameters)
        } else {
            Ok(())
        }
    }

    pub fn u8(&mut self) -> Result<u8, ErrorCode> {
        self.ensure(1)?;
        let value = self.buf[self.pos];
        self.pos += 1;
        Ok(value)
    }

    pub fn u16(&mut self) -> Result<u16, ErrorCode> {
        self.ensure(2)?;
        let value = load_short(self.buf, self.pos);
        self.pos += 2;
        Ok(value)
    }

    pub fn u32(&mut self) -> Result<u32, ErrorCode> {
        self.ensure(4)?;
        let value = load_long(self.buf, self.pos);
        self.pos += 4;
        Ok(value)
    }

    /// Read a NUL-terminated UTF-8 string.
    pub fn cstr(&mut self) -> Result<&'a str, ErrorCode> {
        let rest = &self.buf[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(ErrorCode::InvalidParameters)?;
        let text = std::str::from_utf8(&rest[..end]).map_err(|_| ErrorCode::InvalidParameters)?;
        self.pos += end + 1;
        Ok(text)
    }

    /// Read a trailing optional string; `None` once the payload is exhausted.
    pub fn opt_cstr(&mut self) -> Result<Option<&'a str>, ErrorCode> {
        if self.is_empty() {
            Ok(None)
        } else {
            self.cstr().map(Some)
        }
    }

    /// Read strings until the payload is exhausted.
    pub fn cstr_list(&mut self) -> Result<Vec<&'a str>, ErrorCode> {
        let mut items = Vec::new();
        while !self.is_empty() {
            items.push(self.cstr()?);
        }
        Ok(items)
    }

    /// Everything not yet consumed.
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }

    /// Remaining bytes as UTF-8 text.
    pub fn rest_str(&mut self) -> Result<&'a str, ErrorCode> {
        std::str::from_utf8(self.rest()).map_err(|_| ErrorCode::InvalidParameters)
    }
}

/// Build a payload holding a sequence of strings.
pub fn cstr_list<'s, I>(items: I) -> Bytes
where
    I: IntoIterator<Item = &'s str>,
{
    let mut writer = PayloadWriter::new();
    for item in items {
        writer.put_cstr(item);
    }
    writer.finish()
}
