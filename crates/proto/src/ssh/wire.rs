//! SSH data type encoding (RFC 4251 Section 5).
//!
//! Writers append to a [`BytesMut`]; [`WireReader`] walks a received payload
//! with bounds checks on every field.
//!
//! ```text
//! byte        single octet
//! boolean     single octet, 0 = false
//! uint32      4 octets, big-endian
//! string      uint32 length || bytes
//! mpint       string holding a two's complement big-endian integer
//! name-list   string holding comma-separated ASCII names
//! ```

use bytes::{BufMut, BytesMut};
use kiln_platform::{KilnError, KilnResult};
use num_bigint::BigUint;

/// Writes an SSH `string`.
pub fn put_string(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

/// Writes an SSH `boolean`.
pub fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

/// Writes a name-list.
pub fn put_name_list(buf: &mut BytesMut, names: &[String]) {
    put_string(buf, names.join(",").as_bytes());
}

/// Writes a non-negative big-endian integer as an SSH `mpint`.
pub fn put_mpint(buf: &mut BytesMut, magnitude: &[u8]) {
    buf.put_slice(&encode_mpint(magnitude));
}

/// Writes a [`BigUint`] as an SSH `mpint`.
pub fn put_biguint(buf: &mut BytesMut, value: &BigUint) {
    put_mpint(buf, &value.to_bytes_be());
}

/// Encodes a big integer as SSH mpint format.
///
/// Leading zero bytes are stripped, zero is encoded with an empty body, and a
/// 0x00 byte is prepended when the high bit would otherwise mark it negative.
pub fn encode_mpint(data: &[u8]) -> Vec<u8> {
    let start = data.iter().position(|&b| b != 0).unwrap_or(data.len());
    let trimmed = &data[start..];

    if trimmed.is_empty() {
        return vec![0, 0, 0, 0];
    }

    let needs_padding = trimmed[0] & 0x80 != 0;
    let length = trimmed.len() + usize::from(needs_padding);

    let mut result = Vec::with_capacity(4 + length);
    result.extend_from_slice(&(length as u32).to_be_bytes());
    if needs_padding {
        result.push(0);
    }
    result.extend_from_slice(trimmed);
    result
}

/// Bounds-checked reader over an SSH message payload.
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> WireReader<'a> {
    /// Creates a reader positioned at the start of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    /// Returns the unread tail and consumes it.
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.offset..];
        self.offset = self.data.len();
        rest
    }

    /// Reads exactly `len` raw bytes.
    pub fn read_bytes(&mut self, len: usize) -> KilnResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(KilnError::Protocol(format!(
                "Message truncated: need {} bytes at offset {}, have {}",
                len,
                self.offset,
                self.remaining()
            )));
        }
        let bytes = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(bytes)
    }

    /// Reads a `byte`.
    pub fn read_u8(&mut self) -> KilnResult<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    /// Reads a `boolean`.
    pub fn read_bool(&mut self) -> KilnResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads a `uint32`.
    pub fn read_u32(&mut self) -> KilnResult<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a `string` as raw bytes.
    pub fn read_string(&mut self) -> KilnResult<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.read_bytes(len)
    }

    /// Reads a `string` that must be valid UTF-8.
    pub fn read_utf8(&mut self) -> KilnResult<&'a str> {
        let bytes = self.read_string()?;
        std::str::from_utf8(bytes)
            .map_err(|_| KilnError::Protocol("String contains invalid UTF-8".to_string()))
    }

    /// Reads a name-list.
    pub fn read_name_list(&mut self) -> KilnResult<Vec<String>> {
        let list = self.read_string()?;
        let list = std::str::from_utf8(list)
            .map_err(|_| KilnError::Protocol("Name-list contains invalid UTF-8".to_string()))?;
        if list.is_empty() {
            Ok(vec![])
        } else {
            Ok(list.split(',').map(String::from).collect())
        }
    }

    /// Reads a non-negative `mpint`.
    pub fn read_mpint(&mut self) -> KilnResult<BigUint> {
        let bytes = self.read_string()?;
        if bytes.first().is_some_and(|b| b & 0x80 != 0) {
            return Err(KilnError::Protocol("Negative mpint".to_string()));
        }
        Ok(BigUint::from_bytes_be(bytes))
    }
}
