//! SSH primitive data types (RFC 4251 §5) shared by every packet.
//!
//! - `byte`, `boolean`: one byte
//! - `uint32`, `uint64`: big-endian
//! - `string`: `uint32` length followed by that many raw bytes

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{ProtocolError, Result};

/// Cursor over a received packet body.
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    /// Wrap a packet body.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn ensure(&self, field: &'static str, len: usize) -> Result<()> {
        if self.buf.len() < len {
            return Err(ProtocolError::Truncated {
                field,
                needed: len - self.buf.len(),
            });
        }
        Ok(())
    }

    /// Read a single byte.
    pub fn read_u8(&mut self, field: &'static str) -> Result<u8> {
        self.ensure(field, 1)?;
        Ok(self.buf.get_u8())
    }

    /// Read an SSH boolean (any non-zero byte is true).
    pub fn read_bool(&mut self, field: &'static str) -> Result<bool> {
        Ok(self.read_u8(field)? != 0)
    }

    /// Read a big-endian `uint32`.
    pub fn read_u32(&mut self, field: &'static str) -> Result<u32> {
        self.ensure(field, 4)?;
        Ok(self.buf.get_u32())
    }

    /// Read a big-endian `uint64`.
    pub fn read_u64(&mut self, field: &'static str) -> Result<u64> {
        self.ensure(field, 8)?;
        Ok(self.buf.get_u64())
    }

    /// Read a length-prefixed byte string, borrowing from the packet.
    pub fn read_bytes(&mut self, field: &'static str) -> Result<&'a [u8]> {
        let len = self.read_u32(field)? as usize;
        self.ensure(field, len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn read_string(&mut self, field: &'static str) -> Result<String> {
        let raw = self.read_bytes(field)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::InvalidUtf8(field))
    }

    /// Read a length-prefixed string that may contain arbitrary bytes.
    ///
    /// Invalid UTF-8 is replaced rather than rejected, so that later
    /// validation can refuse the value with a uniform error.
    pub fn read_string_lossy(&mut self, field: &'static str) -> Result<String> {
        let raw = self.read_bytes(field)?;
        Ok(String::from_utf8_lossy(raw).into_owned())
    }

    /// Consume everything that is left.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = self.buf;
        self.buf = &[];
        rest
    }

    /// Assert that the packet was fully consumed.
    pub fn finish(self) -> Result<()> {
        if !self.buf.is_empty() {
            return Err(ProtocolError::TrailingData(self.buf.len()));
        }
        Ok(())
    }
}

/// Append a length-prefixed byte string.
pub fn put_bytes(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
}

/// Append a length-prefixed UTF-8 string.
pub fn put_string(buf: &mut BytesMut, value: &str) {
    put_bytes(buf, value.as_bytes());
}

/// Append an SSH boolean.
pub fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

/// Append an SSH `name-list` (comma separated names).
pub fn put_name_list(buf: &mut BytesMut, names: &[String]) {
    put_string(buf, &names.join(","));
}

/// Split an SSH `name-list` into its names.
pub fn parse_name_list(raw: &str) -> Vec<String> {
    if raw.is_empty() {
        return Vec::new();
    }
    raw.split(',').map(str::to_owned).collect()
}
