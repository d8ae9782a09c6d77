//! Binary cursor over captured message bytes.
//!
//! Every dissector reads its vendor's wire format through this cursor:
//! bounds-checked integer reads (big- and little-endian), NUL-terminated
//! strings, and the length-prefixed value form shared by the bind/data-row
//! messages, where a length field of all-one bits is the SQL NULL sentinel
//! and must never be treated as a byte count.

use crate::error::DissectError;

/// Length prefix value that encodes SQL NULL (all bits set, i.e. `-1`).
pub const NULL_LENGTH: u32 = u32::MAX;

/// A forward-only cursor over a byte slice.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
    vendor: &'static str,
}

impl<'a> Cursor<'a> {
    pub fn new(vendor: &'static str, data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            vendor,
        }
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Current offset from the start of the buffer.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn need(&self, n: usize) -> Result<(), DissectError> {
        if self.remaining() < n {
            return Err(DissectError::Truncated {
                vendor: self.vendor,
                needed: n,
                have: self.remaining(),
            });
        }
        Ok(())
    }

    /// Take the next `n` bytes and advance past them.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8], DissectError> {
        self.need(n)?;
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Skip `n` bytes.
    pub fn skip(&mut self, n: usize) -> Result<(), DissectError> {
        self.need(n)?;
        self.pos += n;
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, DissectError> {
        Ok(self.take(1)?[0])
    }

    /// Look at the next byte without consuming it.
    pub fn peek_u8(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    pub fn read_u16_be(&mut self) -> Result<u16, DissectError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32_be(&mut self) -> Result<u32, DissectError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u16_le(&mut self) -> Result<u16, DissectError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    /// 3-byte little-endian length used by the MySQL frame header.
    pub fn read_u24_le(&mut self) -> Result<u32, DissectError> {
        let b = self.take(3)?;
        Ok(u32::from(b[0]) | u32::from(b[1]) << 8 | u32::from(b[2]) << 16)
    }

    pub fn read_u32_le(&mut self) -> Result<u32, DissectError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64_le(&mut self) -> Result<u64, DissectError> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_le_bytes(buf))
    }

    /// MySQL length-encoded integer.
    pub fn read_lenenc_uint(&mut self) -> Result<u64, DissectError> {
        match self.read_u8()? {
            n @ 0..=0xfa => Ok(u64::from(n)),
            0xfc => Ok(u64::from(self.read_u16_le()?)),
            0xfd => Ok(u64::from(self.read_u24_le()?)),
            0xfe => self.read_u64_le(),
            other => Err(DissectError::Malformed {
                vendor: self.vendor,
                message: "lenenc-int",
                reason: format!("unexpected marker byte {other:#04x}"),
            }),
        }
    }

    /// Read bytes up to (and consuming) the next NUL terminator.
    pub fn read_cstr(&mut self) -> Result<&'a [u8], DissectError> {
        let rest = &self.data[self.pos..];
        match rest.iter().position(|&b| b == 0) {
            Some(end) => {
                let out = &rest[..end];
                self.pos += end + 1;
                Ok(out)
            }
            None => Err(DissectError::Malformed {
                vendor: self.vendor,
                message: "cstring",
                reason: "missing NUL terminator".into(),
            }),
        }
    }

    /// Read a 4-byte big-endian length followed by that many bytes.
    ///
    /// A length of all-one bits short-circuits to `None` (SQL NULL); it is
    /// never interpreted as a 4 GiB value.
    pub fn read_len_prefixed_be(&mut self) -> Result<Option<&'a [u8]>, DissectError> {
        let len = self.read_u32_be()?;
        if len == NULL_LENGTH {
            return Ok(None);
        }
        Ok(Some(self.take(len as usize)?))
    }

    /// Scan forward for the first occurrence of `pattern`, leaving the cursor
    /// positioned just past it. Returns false (cursor unmoved) when absent.
    pub fn seek_past(&mut self, pattern: &[u8]) -> bool {
        if pattern.is_empty() {
            return true;
        }
        let rest = &self.data[self.pos..];
        let mut i = 0;
        while i + pattern.len() <= rest.len() {
            if &rest[i..i + pattern.len()] == pattern {
                self.pos += i + pattern.len();
                return true;
            }
            i += 1;
        }
        false
    }
}

/// Lossy UTF-8 view of raw wire bytes.
pub fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
