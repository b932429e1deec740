//! TL primitive serialization.
//!
//! Integers are little-endian. `int128` and `int256` are raw byte arrays.
//! Byte strings carry a one-byte length below 254, otherwise a `0xfe`
//! marker followed by a 24-bit length, and are zero-padded to a multiple
//! of four bytes.

use crate::WireError;
use bytes::{BufMut, Bytes, BytesMut};

/// Constructor of a boxed `Vector t`
pub const VECTOR: u32 = 0x1cb5c415;

/// Longest byte string TL can carry (24-bit length)
pub const MAX_STRING_LEN: usize = 0x00ff_ffff;

/// Serialized size of a TL byte string of `len` bytes.
pub fn string_size(len: usize) -> usize {
    let header = if len < 254 { 1 } else { 4 };
    (header + len + 3) & !3
}

/// Appends TL values to a growable buffer
#[derive(Debug, Default)]
pub struct TlWriter {
    buf: BytesMut,
}

impl TlWriter {
    /// Create an empty writer
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a writer with room for `capacity` bytes
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Write a constructor id or `#` value
    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32_le(value);
        self
    }

    /// Write an `int`
    pub fn write_i32(&mut self, value: i32) -> &mut Self {
        self.buf.put_i32_le(value);
        self
    }

    /// Write a `long`
    pub fn write_u64(&mut self, value: u64) -> &mut Self {
        self.buf.put_u64_le(value);
        self
    }

    /// Write an `int128`
    pub fn write_int128(&mut self, value: &[u8; 16]) -> &mut Self {
        self.buf.put_slice(value);
        self
    }

    /// Write an `int256`
    pub fn write_int256(&mut self, value: &[u8; 32]) -> &mut Self {
        self.buf.put_slice(value);
        self
    }

    /// Write a TL `bytes`/`string` value.
    ///
    /// Values longer than [`MAX_STRING_LEN`] cannot be represented; callers
    /// never produce them since the largest strings are 256-byte numbers.
    pub fn write_bytes(&mut self, value: &[u8]) -> &mut Self {
        let len = value.len();
        let header = if len < 254 {
            self.buf.put_u8(len as u8);
            1
        } else {
            self.buf.put_u8(254);
            self.buf.put_uint_le((len & MAX_STRING_LEN) as u64, 3);
            4
        };
        self.buf.put_slice(value);
        let padding = (4 - (header + len) % 4) % 4;
        self.buf.put_bytes(0, padding);
        self
    }

    /// Write raw bytes with no length prefix
    pub fn write_raw(&mut self, value: &[u8]) -> &mut Self {
        self.buf.put_slice(value);
        self
    }

    /// Write a boxed `Vector<long>`
    pub fn write_vector_u64(&mut self, values: &[u64]) -> &mut Self {
        self.write_u32(VECTOR);
        self.write_i32(values.len() as i32);
        for value in values {
            self.write_u64(*value);
        }
        self
    }

    /// Bytes written so far
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written yet
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finish writing and return the serialized value
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Reads TL values from a byte slice
#[derive(Debug, Clone)]
pub struct TlReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> TlReader<'a> {
    /// Start reading at the beginning of `data`
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Number of bytes consumed so far
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Unread bytes
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    /// Whether every byte has been consumed
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Read exactly `len` raw bytes
    pub fn read_raw(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        let available = self.data.len() - self.pos;
        if available < len {
            return Err(WireError::Truncated(len - available));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_raw(N)?);
        Ok(out)
    }

    /// Look at the next `u32` without consuming it
    pub fn peek_u32(&self) -> Result<u32, WireError> {
        self.clone().read_u32()
    }

    /// Read a constructor id or `#` value
    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    /// Read an `int`
    pub fn read_i32(&mut self) -> Result<i32, WireError> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    /// Read a `long`
    pub fn read_u64(&mut self) -> Result<u64, WireError> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    /// Read an `int128`
    pub fn read_int128(&mut self) -> Result<[u8; 16], WireError> {
        self.read_array()
    }

    /// Read an `int256`
    pub fn read_int256(&mut self) -> Result<[u8; 32], WireError> {
        self.read_array()
    }

    /// Read a constructor id and require it to be `expected`
    pub fn expect_constructor(&mut self, expected: u32) -> Result<(), WireError> {
        let found = self.read_u32()?;
        if found != expected {
            return Err(WireError::UnexpectedConstructor(found));
        }
        Ok(())
    }

    /// Read a TL `bytes`/`string` value
    pub fn read_bytes(&mut self) -> Result<&'a [u8], WireError> {
        let first = self.read_raw(1)?[0];
        let (header, len) = match first {
            255 => return Err(WireError::Malformed("string length prefix")),
            254 => {
                let raw = self.read_raw(3)?;
                (4, u32::from_le_bytes([raw[0], raw[1], raw[2], 0]) as usize)
            }
            short => (1, short as usize),
        };
        let value = self.read_raw(len)?;
        let padding = (4 - (header + len) % 4) % 4;
        self.read_raw(padding)?;
        Ok(value)
    }

    /// Read a `Vector<long>`, boxed or bare depending on `boxed`
    pub fn read_vector_u64(&mut self, boxed: bool) -> Result<Vec<u64>, WireError> {
        if boxed {
            self.expect_constructor(VECTOR)?;
        }
        let count = self.read_count(8)?;
        (0..count).map(|_| self.read_u64()).collect()
    }

    /// Read a vector element count and check it against the remaining input
    pub fn read_count(&mut self, min_item_size: usize) -> Result<usize, WireError> {
        let count = self.read_i32()?;
        if count < 0 {
            return Err(WireError::Malformed("negative vector length"));
        }
        let count = count as usize;
        let needed = count.saturating_mul(min_item_size);
        let available = self.data.len() - self.pos;
        if needed > available {
            return Err(WireError::Truncated(needed - available));
        }
        Ok(count)
    }
}
