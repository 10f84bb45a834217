//! Wire primitives shared by the codecs.
//!
//! STTP is a big-endian protocol; every multi-byte field below reads in
//! network order. [`WireReader`] is a bounds-checked cursor over a
//! received payload: reads past the end return [`Error::Truncated`]
//! instead of panicking, so a malformed frame can be discarded without
//! taking the connection down with it.

pub mod cipher;
pub mod compress;
pub mod varint;

use crate::error::{Error, Result};

/// Bounds-checked big-endian cursor over a byte slice.
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> WireReader<'a> {
    /// Create a reader over the whole slice.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    /// Check if the reader is exhausted.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Current read offset from the start of the slice.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Consume and return the next `len` bytes.
    pub fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(Error::Truncated {
                expected: len,
                actual: self.remaining(),
            });
        }
        let slice = &self.data[self.position..self.position + len];
        self.position += len;
        Ok(slice)
    }

    /// Skip `len` bytes.
    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.take(len).map(|_| ())
    }

    /// The unconsumed tail of the slice.
    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.position..];
        self.position = self.data.len();
        slice
    }

    /// Read a `u8`.
    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Read a big-endian `u16`.
    pub fn u16_be(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Read a big-endian `u32`.
    pub fn u32_be(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a big-endian `u64`.
    pub fn u64_be(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Read a big-endian `f32`.
    pub fn f32_be(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.u32_be()?))
    }

    /// Read a 16-byte field.
    pub fn bytes_16(&mut self) -> Result<[u8; 16]> {
        let b = self.take(16)?;
        let mut out = [0u8; 16];
        out.copy_from_slice(b);
        Ok(out)
    }

    /// Read a length-prefixed UTF-8 string (`u32` big-endian length).
    pub fn string(&mut self) -> Result<&'a str> {
        let len = self.u32_be()? as usize;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes).map_err(|e| Error::decode(format!("invalid UTF-8: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_reads() {
        let data = [0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x03];
        let mut r = WireReader::new(&data);
        assert_eq!(r.u8().unwrap(), 1);
        assert_eq!(r.u16_be().unwrap(), 2);
        assert_eq!(r.u32_be().unwrap(), 3);
        assert!(r.is_empty());
    }

    #[test]
    fn test_truncated_read() {
        let mut r = WireReader::new(&[0x00, 0x01]);
        match r.u32_be() {
            Err(Error::Truncated { expected, actual }) => {
                assert_eq!(expected, 4);
                assert_eq!(actual, 2);
            }
            other => panic!("expected Truncated, got {other:?}"),
        }
    }

    #[test]
    fn test_length_prefixed_string() {
        let data = [0x00, 0x00, 0x00, 0x04, b'T', b'E', b'S', b'T', 0xFF];
        let mut r = WireReader::new(&data);
        assert_eq!(r.string().unwrap(), "TEST");
        assert_eq!(r.remaining(), 1);
    }

    #[test]
    fn test_rest_consumes_tail() {
        let data = [1, 2, 3, 4];
        let mut r = WireReader::new(&data);
        r.skip(1).unwrap();
        assert_eq!(r.rest(), &[2, 3, 4]);
        assert!(r.is_empty());
    }
}
