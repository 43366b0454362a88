//! SSH wire encoding (RFC 4251 Section 5).
//!
//! Writing goes through the [`WireWrite`] extension trait on any
//! [`bytes::BufMut`]; reading goes through [`WireReader`], a cursor over a
//! borrowed slice that refuses to read past the end.
//!
//! # Example
//!
//! ```rust
//! use bytes::BytesMut;
//! use latch_proto::ssh::wire::{WireReader, WireWrite};
//!
//! let mut buf = BytesMut::new();
//! buf.put_str("ssh-userauth");
//! buf.put_bool(true);
//! buf.put_mpint(&[0x80, 0x01]);
//!
//! let mut reader = WireReader::new(&buf);
//! assert_eq!(reader.read_utf8().unwrap(), "ssh-userauth");
//! assert!(reader.read_bool().unwrap());
//! assert_eq!(reader.read_mpint().unwrap(), vec![0x80, 0x01]);
//! assert!(reader.is_empty());
//! ```

use bytes::BufMut;
use latch_platform::{LatchError, LatchResult};
use std::fmt;

/// Attempt to read past the end of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnderflowError {
    /// Bytes the read needed.
    pub wanted: usize,
    /// Bytes that were left.
    pub remaining: usize,
}

impl fmt::Display for UnderflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "buffer underflow: wanted {} bytes, {} remaining",
            self.wanted, self.remaining
        )
    }
}

impl std::error::Error for UnderflowError {}

impl From<UnderflowError> for LatchError {
    fn from(err: UnderflowError) -> Self {
        LatchError::Protocol(err.to_string())
    }
}

/// Strips leading zero bytes from a big-endian magnitude.
///
/// Zero normalizes to an empty slice, which is how RFC 4251 encodes it.
pub fn mpint_magnitude(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

/// Encoding helpers for SSH data types.
pub trait WireWrite: BufMut {
    /// Writes a boolean as a single byte.
    fn put_bool(&mut self, value: bool) {
        self.put_u8(u8::from(value));
    }

    /// Writes a length-prefixed byte string.
    fn put_string(&mut self, data: &[u8]) {
        self.put_u32(data.len() as u32);
        self.put_slice(data);
    }

    /// Writes a length-prefixed UTF-8 string.
    fn put_str(&mut self, value: &str) {
        self.put_string(value.as_bytes());
    }

    /// Writes a non-negative big-endian integer as an mpint.
    ///
    /// Leading zeros are stripped and a zero byte is prepended when the
    /// most significant bit is set.
    fn put_mpint(&mut self, magnitude: &[u8]) {
        let trimmed = mpint_magnitude(magnitude);
        if trimmed.first().map_or(false, |&b| b & 0x80 != 0) {
            self.put_u32(trimmed.len() as u32 + 1);
            self.put_u8(0);
        } else {
            self.put_u32(trimmed.len() as u32);
        }
        self.put_slice(trimmed);
    }

    /// Writes a comma-separated name-list.
    fn put_name_list<S: AsRef<str>>(&mut self, names: &[S]) {
        let joined = names
            .iter()
            .map(|n| n.as_ref())
            .collect::<Vec<_>>()
            .join(",");
        self.put_str(&joined);
    }
}

impl<B: BufMut + ?Sized> WireWrite for B {}

/// Read cursor over an SSH-encoded buffer.
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    /// Creates a reader positioned at the start of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Current cursor offset.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// True when every byte has been consumed.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Returns the unread tail and moves the cursor to the end.
    pub fn rest(&mut self) -> &'a [u8] {
        let tail = &self.data[self.pos..];
        self.pos = self.data.len();
        tail
    }

    /// Reads exactly `len` raw bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], UnderflowError> {
        if self.remaining() < len {
            return Err(UnderflowError {
                wanted: len,
                remaining: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Reads a single byte.
    pub fn read_u8(&mut self) -> Result<u8, UnderflowError> {
        Ok(self.read_bytes(1)?[0])
    }

    /// Reads a boolean; any non-zero byte is true.
    pub fn read_bool(&mut self) -> Result<bool, UnderflowError> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads a big-endian u32.
    pub fn read_u32(&mut self) -> Result<u32, UnderflowError> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a big-endian u64.
    pub fn read_u64(&mut self) -> Result<u64, UnderflowError> {
        let b = self.read_bytes(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    /// Reads a length-prefixed byte string.
    pub fn read_string(&mut self) -> Result<&'a [u8], UnderflowError> {
        let len = self.read_u32()? as usize;
        self.read_bytes(len)
    }

    /// Reads a length-prefixed string and checks that it is UTF-8.
    pub fn read_utf8(&mut self) -> LatchResult<&'a str> {
        let raw = self.read_string()?;
        std::str::from_utf8(raw)
            .map_err(|_| LatchError::Protocol("Invalid UTF-8 in string field".to_string()))
    }

    /// Reads an mpint and returns its normalized magnitude.
    ///
    /// Zero is returned as a single zero byte. Negative values are rejected.
    pub fn read_mpint(&mut self) -> LatchResult<Vec<u8>> {
        let raw = self.read_string()?;
        if raw.first().map_or(false, |&b| b & 0x80 != 0) {
            return Err(LatchError::Protocol("Negative mpint".to_string()));
        }
        let magnitude = mpint_magnitude(raw);
        if magnitude.is_empty() {
            Ok(vec![0])
        } else {
            Ok(magnitude.to_vec())
        }
    }

    /// Reads a comma-separated name-list.
    pub fn read_name_list(&mut self) -> LatchResult<Vec<String>> {
        let raw = self.read_utf8()?;
        if raw.is_empty() {
            return Ok(Vec::new());
        }
        Ok(raw.split(',').map(str::to_string).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_primitives() {
        let mut buf = BytesMut::new();
        buf.put_u8(7);
        buf.put_bool(false);
        buf.put_u32(0xDEAD_BEEF);
        buf.put_u64(1 << 40);
        buf.put_string(b"abc");

        let mut r = WireReader::new(&buf);
        assert_eq!(r.read_u8().unwrap(), 7);
        assert!(!r.read_bool().unwrap());
        assert_eq!(r.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(r.read_u64().unwrap(), 1 << 40);
        assert_eq!(r.read_string().unwrap(), b"abc");
        assert!(r.is_empty());
    }

    #[test]
    fn test_underflow() {
        let data = [0u8, 0, 0, 9, b'x'];
        let mut r = WireReader::new(&data);
        let err = r.read_string().unwrap_err();
        assert_eq!(
            err,
            UnderflowError {
                wanted: 9,
                remaining: 1
            }
        );

        let mut r = WireReader::new(&[1, 2]);
        assert!(r.read_u32().is_err());
        // Failed read leaves the cursor untouched
        assert_eq!(r.position(), 0);

        let latch: LatchError = err.into();
        assert!(matches!(latch, LatchError::Protocol(msg) if msg.contains("underflow")));
    }

    #[test]
    fn test_mpint_encoding() {
        // RFC 4251 Section 5 examples
        let mut buf = BytesMut::new();
        buf.put_mpint(&[]);
        assert_eq!(&buf[..], &[0, 0, 0, 0]);

        let mut buf = BytesMut::new();
        buf.put_mpint(&[0x09, 0xa3, 0x78, 0xf9, 0xb2, 0xe3, 0x32, 0xa7]);
        assert_eq!(
            &buf[..],
            &[0, 0, 0, 8, 0x09, 0xa3, 0x78, 0xf9, 0xb2, 0xe3, 0x32, 0xa7]
        );

        let mut buf = BytesMut::new();
        buf.put_mpint(&[0x80]);
        assert_eq!(&buf[..], &[0, 0, 0, 2, 0x00, 0x80]);

        // Leading zeros are stripped before the sign check
        let mut buf = BytesMut::new();
        buf.put_mpint(&[0x00, 0x00, 0x7f, 0x01]);
        assert_eq!(&buf[..], &[0, 0, 0, 2, 0x7f, 0x01]);
    }

    #[test]
    fn test_mpint_read_normalizes() {
        let mut r = WireReader::new(&[0, 0, 0, 0]);
        assert_eq!(r.read_mpint().unwrap(), vec![0]);

        let mut r = WireReader::new(&[0, 0, 0, 3, 0, 0, 0x05]);
        assert_eq!(r.read_mpint().unwrap(), vec![0x05]);

        let mut r = WireReader::new(&[0, 0, 0, 2, 0x00, 0x80]);
        assert_eq!(r.read_mpint().unwrap(), vec![0x80]);

        let mut r = WireReader::new(&[0, 0, 0, 1, 0xff]);
        assert!(r.read_mpint().is_err());
    }

    #[test]
    fn test_name_list() {
        let mut buf = BytesMut::new();
        buf.put_name_list(&["aes128-ctr", "aes256-ctr"]);
        buf.put_name_list::<&str>(&[]);

        let mut r = WireReader::new(&buf);
        assert_eq!(r.read_name_list().unwrap(), vec!["aes128-ctr", "aes256-ctr"]);
        assert!(r.read_name_list().unwrap().is_empty());
    }

    #[test]
    fn test_invalid_utf8() {
        let data = [0u8, 0, 0, 2, 0xff, 0xfe];
        let mut r = WireReader::new(&data);
        assert!(r.read_utf8().is_err());
    }
}
