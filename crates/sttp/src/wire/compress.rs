//! Gzip helpers for signal-index-cache and metadata payloads.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::error::{Error, Result};

/// Inflate a gzip-framed payload.
pub fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() * 4);
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| Error::decode(format!("gzip inflate failed: {e}")))?;
    Ok(out)
}

/// Deflate a payload into a gzip frame.
pub fn deflate(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    // Writing into a Vec cannot fail.
    encoder.write_all(data).expect("write to Vec");
    encoder.finish().expect("finish to Vec")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let payload = b"signal index cache image".repeat(32);
        let packed = deflate(&payload);
        assert!(packed.len() < payload.len());
        assert_eq!(inflate(&packed).unwrap(), payload);
    }

    #[test]
    fn test_inflate_rejects_garbage() {
        assert!(inflate(&[0xDE, 0xAD, 0xBE, 0xEF]).is_err());
    }
}
