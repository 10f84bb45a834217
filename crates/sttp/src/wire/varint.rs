//! 7-bit variable-length integer encoding.
//!
//! Values are emitted little-endian in 7-bit groups with the high bit as
//! a continuation marker. A `u32` takes 1-5 bytes, a `u64` 1-9; the last
//! possible byte carries a full 8 bits so the maximum length never
//! overflows. Decoding is unrolled: each step XORs away the continuation
//! bits the previous groups mixed in, so the correction constants grow as
//! `0x80, 0x4080, 0x204080, ...`.

use super::WireReader;
use crate::error::Result;

/// Encode a `u32`, appending 1-5 bytes to `out`.
pub fn encode_u32(mut value: u32, out: &mut Vec<u8>) {
    for _ in 0..4 {
        if value < 0x80 {
            out.push(value as u8);
            return;
        }
        out.push(value as u8 | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Encode a `u64`, appending 1-9 bytes to `out`.
pub fn encode_u64(mut value: u64, out: &mut Vec<u8>) {
    for _ in 0..8 {
        if value < 0x80 {
            out.push(value as u8);
            return;
        }
        out.push(value as u8 | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Number of bytes [`encode_u32`] produces for `value`.
pub fn size_u32(value: u32) -> usize {
    match value {
        0..=0x7F => 1,
        0x80..=0x3FFF => 2,
        0x4000..=0x1F_FFFF => 3,
        0x20_0000..=0xFFF_FFFF => 4,
        _ => 5,
    }
}

/// Decode a `u32` written by [`encode_u32`].
pub fn decode_u32(r: &mut WireReader<'_>) -> Result<u32> {
    let b0 = u32::from(r.u8()?);
    if b0 < 0x80 {
        return Ok(b0);
    }
    let b1 = u32::from(r.u8()?);
    if b1 < 0x80 {
        return Ok(b0 ^ (b1 << 7) ^ 0x80);
    }
    let b2 = u32::from(r.u8()?);
    if b2 < 0x80 {
        return Ok(b0 ^ (b1 << 7) ^ (b2 << 14) ^ 0x4080);
    }
    let b3 = u32::from(r.u8()?);
    if b3 < 0x80 {
        return Ok(b0 ^ (b1 << 7) ^ (b2 << 14) ^ (b3 << 21) ^ 0x0020_4080);
    }
    let b4 = u32::from(r.u8()?);
    Ok(b0 ^ (b1 << 7) ^ (b2 << 14) ^ (b3 << 21) ^ (b4 << 28) ^ 0x1020_4080)
}

/// Decode a `u64` written by [`encode_u64`].
pub fn decode_u64(r: &mut WireReader<'_>) -> Result<u64> {
    let b0 = u64::from(r.u8()?);
    if b0 < 0x80 {
        return Ok(b0);
    }
    let b1 = u64::from(r.u8()?);
    if b1 < 0x80 {
        return Ok(b0 ^ (b1 << 7) ^ 0x80);
    }
    let b2 = u64::from(r.u8()?);
    if b2 < 0x80 {
        return Ok(b0 ^ (b1 << 7) ^ (b2 << 14) ^ 0x4080);
    }
    let b3 = u64::from(r.u8()?);
    if b3 < 0x80 {
        return Ok(b0 ^ (b1 << 7) ^ (b2 << 14) ^ (b3 << 21) ^ 0x0020_4080);
    }
    let b4 = u64::from(r.u8()?);
    if b4 < 0x80 {
        return Ok(b0 ^ (b1 << 7) ^ (b2 << 14) ^ (b3 << 21) ^ (b4 << 28) ^ 0x1020_4080);
    }
    let b5 = u64::from(r.u8()?);
    if b5 < 0x80 {
        return Ok(b0
            ^ (b1 << 7)
            ^ (b2 << 14)
            ^ (b3 << 21)
            ^ (b4 << 28)
            ^ (b5 << 35)
            ^ 0x08_1020_4080);
    }
    let b6 = u64::from(r.u8()?);
    if b6 < 0x80 {
        return Ok(b0
            ^ (b1 << 7)
            ^ (b2 << 14)
            ^ (b3 << 21)
            ^ (b4 << 28)
            ^ (b5 << 35)
            ^ (b6 << 42)
            ^ 0x0408_1020_4080);
    }
    let b7 = u64::from(r.u8()?);
    if b7 < 0x80 {
        return Ok(b0
            ^ (b1 << 7)
            ^ (b2 << 14)
            ^ (b3 << 21)
            ^ (b4 << 28)
            ^ (b5 << 35)
            ^ (b6 << 42)
            ^ (b7 << 49)
            ^ 0x02_0408_1020_4080);
    }
    let b8 = u64::from(r.u8()?);
    Ok(b0
        ^ (b1 << 7)
        ^ (b2 << 14)
        ^ (b3 << 21)
        ^ (b4 << 28)
        ^ (b5 << 35)
        ^ (b6 << 42)
        ^ (b7 << 49)
        ^ (b8 << 56)
        ^ 0x0102_0408_1020_4080)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip_u32(value: u32) -> usize {
        let mut buf = Vec::new();
        encode_u32(value, &mut buf);
        let mut r = WireReader::new(&buf);
        assert_eq!(decode_u32(&mut r).unwrap(), value, "value {value:#x}");
        assert!(r.is_empty());
        buf.len()
    }

    fn round_trip_u64(value: u64) -> usize {
        let mut buf = Vec::new();
        encode_u64(value, &mut buf);
        let mut r = WireReader::new(&buf);
        assert_eq!(decode_u64(&mut r).unwrap(), value, "value {value:#x}");
        assert!(r.is_empty());
        buf.len()
    }

    #[test]
    fn test_u32_boundaries() {
        assert_eq!(round_trip_u32(0), 1);
        assert_eq!(round_trip_u32(0x7F), 1);
        assert_eq!(round_trip_u32(0x80), 2);
        assert_eq!(round_trip_u32(0x3FFF), 2);
        assert_eq!(round_trip_u32(0x4000), 3);
        assert_eq!(round_trip_u32(0x1F_FFFF), 3);
        assert_eq!(round_trip_u32(0x20_0000), 4);
        assert_eq!(round_trip_u32(0xFFF_FFFF), 4);
        assert_eq!(round_trip_u32(0x1000_0000), 5);
        assert_eq!(round_trip_u32(u32::MAX), 5);
    }

    #[test]
    fn test_u64_boundaries() {
        assert_eq!(round_trip_u64(0), 1);
        assert_eq!(round_trip_u64(0x7F), 1);
        assert_eq!(round_trip_u64(0x80), 2);
        assert_eq!(round_trip_u64(1 << 28), 5);
        assert_eq!(round_trip_u64((1 << 35) - 1), 5);
        assert_eq!(round_trip_u64(1 << 35), 6);
        assert_eq!(round_trip_u64(1 << 42), 7);
        assert_eq!(round_trip_u64(1 << 49), 8);
        assert_eq!(round_trip_u64(1 << 56), 9);
        assert_eq!(round_trip_u64(u64::MAX), 9);
    }

    #[test]
    fn test_size_matches_encoding() {
        for &v in &[0u32, 0x7F, 0x80, 0x3FFF, 0x4000, 0xFFF_FFFF, u32::MAX] {
            let mut buf = Vec::new();
            encode_u32(v, &mut buf);
            assert_eq!(buf.len(), size_u32(v));
        }
    }

    #[test]
    fn test_decode_stops_at_boundary() {
        // 0xAC 0x02 == 300; trailing bytes must be untouched.
        let data = [0xAC, 0x02, 0x55];
        let mut r = WireReader::new(&data);
        assert_eq!(decode_u32(&mut r).unwrap(), 300);
        assert_eq!(r.remaining(), 1);
    }

    #[test]
    fn test_truncated_input() {
        let mut r = WireReader::new(&[0x80]);
        assert!(decode_u32(&mut r).is_err());
    }
}
