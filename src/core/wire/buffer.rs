//! Bounds-checked big-endian reader/writer for the device wire format.
//!
//! All multi-byte integers are big-endian; variable-length buffers are
//! 16-bit size-prefixed ("sized" fields below). Every read validates its
//! size field against the bytes actually available; a size that would run
//! past the buffer end is an error, never a panic or a silent truncation.

use thiserror::Error;

/// Errors produced while reading or writing wire-format bytes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("buffer truncated: needed {needed} more byte(s)")]
    Truncated { needed: usize },
    #[error("declared size {declared} does not match {actual} available byte(s)")]
    SizeMismatch { declared: usize, actual: usize },
    #[error("variable-length field of {len} bytes exceeds the 16-bit size prefix")]
    Oversize { len: usize },
    #[error("{0} trailing byte(s) after the final field")]
    TrailingBytes(usize),
    #[error("unknown framing tag {0:#06x}")]
    BadTag(u16),
}

/// Append-only command builder.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    #[must_use]
    pub fn new() -> Self {
        WireWriter { buf: Vec::with_capacity(64) }
    }

    pub fn write_u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn write_u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn write_u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn write_i32(&mut self, v: i32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn write_bytes(&mut self, v: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(v);
        self
    }

    /// Write a 16-bit size-prefixed variable-length buffer.
    ///
    /// # Errors
    /// Returns `WireError::Oversize` if `v` cannot be described by a 16-bit
    /// size prefix.
    pub fn write_sized(&mut self, v: &[u8]) -> Result<&mut Self, WireError> {
        let len = u16::try_from(v.len()).map_err(|_| WireError::Oversize { len: v.len() })?;
        self.write_u16(len);
        self.buf.extend_from_slice(v);
        Ok(self)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Forward-only reader over a response (or parameter-area) byte slice.
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        WireReader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        let remaining = self.buf.len() - self.pos;
        if n > remaining {
            return Err(WireError::Truncated { needed: n - remaining });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        self.take(n)
    }

    /// Read a 16-bit size-prefixed variable-length buffer.
    pub fn read_sized(&mut self) -> Result<&'a [u8], WireError> {
        let len = self.read_u16()? as usize;
        self.take(len)
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Consume and return every byte left in the buffer.
    pub fn take_remaining(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    /// Assert the reader has consumed the whole buffer.
    ///
    /// # Errors
    /// Returns `WireError::TrailingBytes` if any input remains; a response
    /// longer than its structure describes is malformed, not ignorable.
    pub fn expect_end(&self) -> Result<(), WireError> {
        if self.pos == self.buf.len() {
            Ok(())
        } else {
            Err(WireError::TrailingBytes(self.buf.len() - self.pos))
        }
    }
}
