//! Compact per-measurement wire form.
//!
//! Each measurement occupies 9 to 17 bytes: a compact flag byte, the
//! runtime id, a big-endian `f32`, and a timestamp whose width depends
//! on the flag byte. With `BaseTimeOffset` set the timestamp is a 2- or
//! 4-byte delta against one of the two publisher-supplied base times;
//! otherwise it is the full 8-byte tick value. Only the full form can
//! carry leap-second bits.

use crate::error::Result;
use crate::protocol::flags::{CompactFlags, collapse_state_flags, expand_compact_flags};
use crate::ticks::Ticks;
use crate::wire::WireReader;

/// Decode/encode context shared by every measurement in a data packet.
#[derive(Debug, Clone, Copy)]
pub struct CompactContext {
    /// Whether measurements carry timestamps at all.
    pub include_time: bool,
    /// Whether offset timestamps use millisecond resolution.
    pub use_millisecond_resolution: bool,
    /// The two publisher-supplied base times.
    pub base_time_offsets: [u64; 2],
    /// Base-time slot the encoder deltas against.
    pub time_index: usize,
}

impl Default for CompactContext {
    fn default() -> Self {
        Self {
            include_time: true,
            use_millisecond_resolution: false,
            base_time_offsets: [0; 2],
            time_index: 0,
        }
    }
}

/// One compact measurement, before signal-id resolution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompactMeasurement {
    /// Publisher-assigned runtime id.
    pub runtime_id: i32,
    /// Sample value.
    pub value: f32,
    /// Sample time, zero when the stream omits timestamps.
    pub timestamp: Ticks,
    /// Expanded 32-bit state flags.
    pub flags: u32,
}

/// Decode one measurement from the packet cursor.
pub fn decode(r: &mut WireReader<'_>, ctx: &CompactContext) -> Result<CompactMeasurement> {
    let compact_flags = r.u8()?;
    let runtime_id = r.u32_be()? as i32;
    let value = r.f32_be()?;

    let timestamp = if !ctx.include_time {
        Ticks(0)
    } else if compact_flags & CompactFlags::BASE_TIME_OFFSET != 0 {
        let index = usize::from(compact_flags & CompactFlags::TIME_INDEX != 0);
        let base = ctx.base_time_offsets[index];
        if ctx.use_millisecond_resolution {
            Ticks(base + u64::from(r.u16_be()?) * Ticks::PER_MILLISECOND)
        } else {
            Ticks(base + u64::from(r.u32_be()?))
        }
    } else {
        Ticks(r.u64_be()?)
    };

    Ok(CompactMeasurement {
        runtime_id,
        value,
        timestamp,
        flags: expand_compact_flags(compact_flags),
    })
}

/// Encode one measurement, appending 9 to 17 bytes to `out`.
pub fn encode(m: &CompactMeasurement, ctx: &CompactContext, out: &mut Vec<u8>) {
    let mut compact_flags = collapse_state_flags(m.flags);
    if ctx.time_index == 1 {
        compact_flags |= CompactFlags::TIME_INDEX;
    }

    // Pick the timestamp form before the flag byte is committed. Offset
    // forms cannot carry leap-second bits, so a flagged timestamp always
    // goes out in full.
    let base = ctx.base_time_offsets[ctx.time_index];
    let offset = if ctx.include_time && !m.timestamp.is_leap_second() && base > 0 {
        m.timestamp.value().checked_sub(base)
    } else {
        None
    };

    enum TimeForm {
        None,
        Millis(u16),
        Offset(u32),
        Full(u64),
    }

    let form = if !ctx.include_time {
        TimeForm::None
    } else {
        match offset {
            Some(delta) if ctx.use_millisecond_resolution
                && delta / Ticks::PER_MILLISECOND < 65_535 =>
            {
                TimeForm::Millis((delta / Ticks::PER_MILLISECOND) as u16)
            }
            Some(delta) if !ctx.use_millisecond_resolution && delta <= u64::from(u32::MAX) => {
                TimeForm::Offset(delta as u32)
            }
            _ => TimeForm::Full(m.timestamp.0),
        }
    };

    if matches!(&form, TimeForm::Millis(_) | TimeForm::Offset(_)) {
        compact_flags |= CompactFlags::BASE_TIME_OFFSET;
    }

    out.push(compact_flags);
    out.extend_from_slice(&(m.runtime_id as u32).to_be_bytes());
    out.extend_from_slice(&m.value.to_bits().to_be_bytes());
    match form {
        TimeForm::None => {}
        TimeForm::Millis(ms) => out.extend_from_slice(&ms.to_be_bytes()),
        TimeForm::Offset(ticks) => out.extend_from_slice(&ticks.to_be_bytes()),
        TimeForm::Full(ticks) => out.extend_from_slice(&ticks.to_be_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_full_timestamp() {
        // TimeIndex flag only; full 8-byte timestamp.
        let data = [
            0x80, 0x00, 0x00, 0x00, 0x07, 0x42, 0x80, 0x00, 0x00, 0x08, 0x01, 0xD7, 0xC3, 0x32,
            0x40, 0x1F, 0x9E, 0x80,
        ];
        let ctx = CompactContext::default();
        let mut r = WireReader::new(&data);
        let m = decode(&mut r, &ctx).unwrap();

        assert_eq!(m.runtime_id, 7);
        assert_eq!(m.value, 64.0);
        assert_eq!(m.timestamp, Ticks(0x0801_D7C3_3240_1F9E));
        assert_eq!(m.flags, 0);
        assert_eq!(r.remaining(), 1);
    }

    #[test]
    fn test_decode_offset_forms() {
        let base = 0x0801_D7C3_0000_0000u64;
        let mut ctx = CompactContext {
            base_time_offsets: [base, base + 500],
            ..CompactContext::default()
        };

        // 4-byte tick offset against base[1].
        let data = [
            CompactFlags::BASE_TIME_OFFSET | CompactFlags::TIME_INDEX,
            0x00,
            0x00,
            0x00,
            0x01,
            0x3F,
            0x80,
            0x00,
            0x00, // 1.0f
            0x00,
            0x00,
            0x10,
            0x00,
        ];
        let mut r = WireReader::new(&data);
        let m = decode(&mut r, &ctx).unwrap();
        assert_eq!(m.timestamp, Ticks(base + 500 + 0x1000));

        // 2-byte millisecond offset against base[0].
        ctx.use_millisecond_resolution = true;
        let data = [
            CompactFlags::BASE_TIME_OFFSET,
            0x00,
            0x00,
            0x00,
            0x01,
            0x3F,
            0x80,
            0x00,
            0x00,
            0x00,
            0x03,
        ];
        let mut r = WireReader::new(&data);
        let m = decode(&mut r, &ctx).unwrap();
        assert_eq!(m.timestamp, Ticks(base + 3 * Ticks::PER_MILLISECOND));
    }

    #[test]
    fn test_decode_without_time() {
        let ctx = CompactContext {
            include_time: false,
            ..CompactContext::default()
        };
        let data = [0x00, 0x00, 0x00, 0x00, 0x09, 0x40, 0x00, 0x00, 0x00];
        let mut r = WireReader::new(&data);
        let m = decode(&mut r, &ctx).unwrap();
        assert_eq!(m.runtime_id, 9);
        assert_eq!(m.value, 2.0);
        assert_eq!(m.timestamp, Ticks(0));
        assert!(r.is_empty());
    }

    fn round_trip(m: CompactMeasurement, ctx: &CompactContext) -> CompactMeasurement {
        let mut buf = Vec::new();
        encode(&m, ctx, &mut buf);
        let mut r = WireReader::new(&buf);
        let back = decode(&mut r, ctx).unwrap();
        assert!(r.is_empty());
        back
    }

    #[test]
    fn test_round_trip_offset_and_full() {
        let base = Ticks::UNIX_BASE_OFFSET;
        let ctx = CompactContext {
            base_time_offsets: [base, 0],
            ..CompactContext::default()
        };

        // Within offset range.
        let m = CompactMeasurement {
            runtime_id: 3,
            value: 59.97,
            timestamp: Ticks(base + 12_345),
            flags: expand_compact_flags(CompactFlags::DATA_QUALITY),
        };
        assert_eq!(round_trip(m, &ctx), m);

        // Before the base time, offset underflows; full form used.
        let m = CompactMeasurement {
            runtime_id: 3,
            value: -1.0,
            timestamp: Ticks(base - 1),
            flags: 0,
        };
        assert_eq!(round_trip(m, &ctx), m);
    }

    #[test]
    fn test_round_trip_millisecond_resolution() {
        let base = Ticks::UNIX_BASE_OFFSET;
        let ctx = CompactContext {
            base_time_offsets: [0, base],
            time_index: 1,
            use_millisecond_resolution: true,
            ..CompactContext::default()
        };

        let m = CompactMeasurement {
            runtime_id: 11,
            value: 120.5,
            timestamp: Ticks(base + 250 * Ticks::PER_MILLISECOND),
            flags: 0,
        };
        assert_eq!(round_trip(m, &ctx), m);

        // Sub-millisecond precision is shaved off, never added.
        let m = CompactMeasurement {
            timestamp: Ticks(base + 250 * Ticks::PER_MILLISECOND + 7),
            ..m
        };
        let back = round_trip(m, &ctx);
        assert_eq!(back.timestamp, Ticks(base + 250 * Ticks::PER_MILLISECOND));
    }

    #[test]
    fn test_leap_second_forces_full_form() {
        let base = Ticks::UNIX_BASE_OFFSET;
        let ctx = CompactContext {
            base_time_offsets: [base, 0],
            ..CompactContext::default()
        };
        let m = CompactMeasurement {
            runtime_id: 1,
            value: 0.0,
            timestamp: Ticks(base + 100).set_leap_second(),
            flags: 0,
        };
        let back = round_trip(m, &ctx);
        assert!(back.timestamp.is_leap_second());
        assert_eq!(back.timestamp, m.timestamp);
    }
}
