//! TSSC stream decoder.

use super::{Code, Point, PointMetadata};
use crate::error::{Error, Result};
use crate::wire::{WireReader, varint};

/// Upper bound on point ids accepted from the wire. Runtime ids are
/// small dense integers; anything past this is a corrupt stream, not a
/// big subscription.
const MAX_POINT_ID: usize = 1 << 20;

/// Bitstream cursor over one packet.
///
/// Code words and sub-byte groups come out of an 8-bit cache refilled
/// from the byte at the current position; whole-byte operands bypass the
/// cache and read positionally. The encoder interleaves its bytes in
/// exactly the same order, so the two cursors stay aligned.
#[derive(Debug, Default)]
pub(crate) struct BitReader {
    data: Vec<u8>,
    position: usize,
    cache: u32,
    count: u32,
}

impl BitReader {
    fn load(&mut self, data: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(data);
        self.position = 0;
        self.cache = 0;
        self.count = 0;
    }

    fn is_exhausted(&self) -> bool {
        self.position >= self.data.len() && self.count == 0
    }

    pub(crate) fn read_bit(&mut self) -> Result<u32> {
        if self.count == 0 {
            if self.position >= self.data.len() {
                return Err(Error::Truncated {
                    expected: 1,
                    actual: 0,
                });
            }
            self.cache = u32::from(self.data[self.position]);
            self.position += 1;
            self.count = 8;
        }
        self.count -= 1;
        Ok((self.cache >> self.count) & 1)
    }

    pub(crate) fn read_bits4(&mut self) -> Result<u32> {
        Ok(self.read_bit()? << 3 | self.read_bit()? << 2 | self.read_bit()? << 1 | self.read_bit()?)
    }

    pub(crate) fn read_bits5(&mut self) -> Result<u32> {
        Ok(self.read_bit()? << 4
            | self.read_bit()? << 3
            | self.read_bit()? << 2
            | self.read_bit()? << 1
            | self.read_bit()?)
    }

    fn read_byte(&mut self) -> Result<u32> {
        if self.position >= self.data.len() {
            return Err(Error::Truncated {
                expected: 1,
                actual: 0,
            });
        }
        let b = self.data[self.position];
        self.position += 1;
        Ok(u32::from(b))
    }

    fn read_varint_u32(&mut self) -> Result<u32> {
        let mut r = WireReader::new(&self.data[self.position.min(self.data.len())..]);
        let v = varint::decode_u32(&mut r)?;
        self.position += r.position();
        Ok(v)
    }

    fn read_varint_u64(&mut self) -> Result<u64> {
        let mut r = WireReader::new(&self.data[self.position.min(self.data.len())..]);
        let v = varint::decode_u64(&mut r)?;
        self.position += r.position();
        Ok(v)
    }
}

impl PointMetadata {
    /// Read one code word through this point's adaptive table.
    pub(crate) fn read_code(&mut self, bits: &mut BitReader) -> Result<u32> {
        let code = match self.mode {
            1 => bits.read_bits5()?,
            2 => {
                if bits.read_bit()? == 1 {
                    self.mode21
                } else {
                    bits.read_bits5()?
                }
            }
            3 => {
                if bits.read_bit()? == 1 {
                    self.mode31
                } else if bits.read_bit()? == 1 {
                    self.mode301
                } else {
                    bits.read_bits5()?
                }
            }
            _ => {
                if bits.read_bit()? == 1 {
                    self.mode41
                } else if bits.read_bit()? == 1 {
                    self.mode401
                } else if bits.read_bit()? == 1 {
                    self.mode4001
                } else {
                    bits.read_bits5()?
                }
            }
        };
        self.update_code_statistics(code);
        Ok(code)
    }
}

/// Stateful TSSC decoder for one command-channel session.
///
/// State persists across packets; a sequence-0 packet is handled by the
/// caller replacing the whole decoder with a fresh one.
#[derive(Debug)]
pub struct Decoder {
    sequence_number: u16,
    points: Vec<Option<Box<PointMetadata>>>,
    seed: PointMetadata,
    last_point_id: Option<i32>,
    prev_timestamp1: i64,
    prev_timestamp2: i64,
    prev_time_delta1: i64,
    prev_time_delta2: i64,
    prev_time_delta3: i64,
    prev_time_delta4: i64,
    bits: BitReader,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    /// Fresh decoder expecting sequence 0.
    pub fn new() -> Self {
        Self {
            sequence_number: 0,
            points: Vec::new(),
            seed: PointMetadata::new(),
            last_point_id: None,
            prev_timestamp1: 0,
            prev_timestamp2: 0,
            prev_time_delta1: i64::MAX,
            prev_time_delta2: i64::MAX,
            prev_time_delta3: i64::MAX,
            prev_time_delta4: i64::MAX,
            bits: BitReader::default(),
        }
    }

    /// Sequence number the next packet must carry.
    pub fn sequence_number(&self) -> u16 {
        self.sequence_number
    }

    /// Account for a fully decoded packet: step the expected sequence,
    /// skipping 0 on wrap (0 is reserved for resets).
    pub fn advance_sequence(&mut self) {
        self.sequence_number = self.sequence_number.checked_add(1).unwrap_or(1);
    }

    /// Load one packet's bitstream.
    pub fn set_buffer(&mut self, data: &[u8]) {
        self.bits.load(data);
    }

    /// Decode the next measurement, or `None` at end of stream.
    pub fn try_get_measurement(&mut self) -> Result<Option<Point>> {
        if self.bits.is_exhausted() {
            return Ok(None);
        }

        let mut code = self.read_code_last()?;
        if code == Code::END_OF_STREAM {
            return Ok(None);
        }

        if code <= Code::POINT_ID_XOR32 {
            self.decode_point_id(code)?;
            code = self.read_code_last()?;
            if code < Code::TIME_DELTA1_FORWARD {
                return Err(Error::decode(format!(
                    "code {code} cannot follow a point id update"
                )));
            }
        }

        let id = self.last_point().prev_next_id1;
        self.ensure_point(id)?;

        let timestamp = if code <= Code::TIME_XOR_7BIT {
            let t = self.decode_timestamp(code)?;
            code = self.read_code_last()?;
            if code < Code::STATE_FLAGS2 {
                return Err(Error::decode(format!(
                    "code {code} cannot follow a timestamp update"
                )));
            }
            t
        } else {
            self.prev_timestamp1
        };

        let flags = if code <= Code::STATE_FLAGS_7BIT32 {
            let f = self.decode_state_flags(code, id)?;
            code = self.read_code_last()?;
            if code < Code::VALUE1 {
                return Err(Error::decode(format!(
                    "code {code} cannot follow a state flags update"
                )));
            }
            f
        } else {
            self.point(id)?.prev_sf1
        };

        let value = self.decode_value(code, id)?;
        self.last_point_id = Some(id);

        Ok(Some(Point {
            id,
            timestamp: timestamp as u64,
            flags,
            value,
        }))
    }

    fn read_code_last(&mut self) -> Result<u32> {
        let Self {
            points,
            seed,
            last_point_id,
            bits,
            ..
        } = self;
        let point = match last_point_id {
            None => seed,
            Some(id) => points
                .get_mut(*id as usize)
                .and_then(|slot| slot.as_deref_mut())
                .ok_or_else(|| Error::decode("dangling point cursor"))?,
        };
        point.read_code(bits)
    }

    fn last_point(&self) -> &PointMetadata {
        match self.last_point_id {
            None => &self.seed,
            Some(id) => self
                .points
                .get(id as usize)
                .and_then(|slot| slot.as_deref())
                .unwrap_or(&self.seed),
        }
    }

    fn last_point_mut(&mut self) -> Result<&mut PointMetadata> {
        match self.last_point_id {
            None => Ok(&mut self.seed),
            Some(id) => self
                .points
                .get_mut(id as usize)
                .and_then(|slot| slot.as_deref_mut())
                .ok_or_else(|| Error::decode("dangling point cursor")),
        }
    }

    fn point(&self, id: i32) -> Result<&PointMetadata> {
        self.points
            .get(id as usize)
            .and_then(|slot| slot.as_deref())
            .ok_or_else(|| Error::decode(format!("unknown point id {id}")))
    }

    fn point_mut(&mut self, id: i32) -> Result<&mut PointMetadata> {
        self.points
            .get_mut(id as usize)
            .and_then(|slot| slot.as_deref_mut())
            .ok_or_else(|| Error::decode(format!("unknown point id {id}")))
    }

    fn ensure_point(&mut self, id: i32) -> Result<()> {
        let index = usize::try_from(id)
            .ok()
            .filter(|&i| i <= MAX_POINT_ID)
            .ok_or_else(|| Error::decode(format!("point id {id} out of range")))?;

        if index >= self.points.len() {
            self.points.resize_with(index + 1, || None);
        }
        if self.points[index].is_none() {
            let mut point = PointMetadata::new();
            point.prev_next_id1 = id.wrapping_add(1);
            self.points[index] = Some(Box::new(point));
        }
        Ok(())
    }

    fn decode_point_id(&mut self, code: u32) -> Result<()> {
        let xor = match code {
            Code::POINT_ID_XOR4 => self.bits.read_bits4()?,
            Code::POINT_ID_XOR8 => self.bits.read_byte()?,
            Code::POINT_ID_XOR12 => {
                let nibble = self.bits.read_bits4()?;
                nibble | self.bits.read_byte()? << 4
            }
            Code::POINT_ID_XOR16 => {
                let b0 = self.bits.read_byte()?;
                b0 | self.bits.read_byte()? << 8
            }
            Code::POINT_ID_XOR20 => {
                let nibble = self.bits.read_bits4()?;
                let b0 = self.bits.read_byte()?;
                nibble | b0 << 4 | self.bits.read_byte()? << 12
            }
            Code::POINT_ID_XOR24 => {
                let b0 = self.bits.read_byte()?;
                let b1 = self.bits.read_byte()?;
                b0 | b1 << 8 | self.bits.read_byte()? << 16
            }
            Code::POINT_ID_XOR32 => {
                let b0 = self.bits.read_byte()?;
                let b1 = self.bits.read_byte()?;
                let b2 = self.bits.read_byte()?;
                b0 | b1 << 8 | b2 << 16 | self.bits.read_byte()? << 24
            }
            _ => return Err(Error::decode(format!("{code} is not a point id code"))),
        };

        let point = self.last_point_mut()?;
        point.prev_next_id1 ^= xor as i32;
        Ok(())
    }

    fn decode_timestamp(&mut self, code: u32) -> Result<i64> {
        let timestamp = match code {
            Code::TIME_DELTA1_FORWARD => self.prev_timestamp1.wrapping_add(self.prev_time_delta1),
            Code::TIME_DELTA2_FORWARD => self.prev_timestamp1.wrapping_add(self.prev_time_delta2),
            Code::TIME_DELTA3_FORWARD => self.prev_timestamp1.wrapping_add(self.prev_time_delta3),
            Code::TIME_DELTA4_FORWARD => self.prev_timestamp1.wrapping_add(self.prev_time_delta4),
            Code::TIME_DELTA1_REVERSE => self.prev_timestamp1.wrapping_sub(self.prev_time_delta1),
            Code::TIME_DELTA2_REVERSE => self.prev_timestamp1.wrapping_sub(self.prev_time_delta2),
            Code::TIME_DELTA3_REVERSE => self.prev_timestamp1.wrapping_sub(self.prev_time_delta3),
            Code::TIME_DELTA4_REVERSE => self.prev_timestamp1.wrapping_sub(self.prev_time_delta4),
            Code::TIMESTAMP2 => self.prev_timestamp2,
            Code::TIME_XOR_7BIT => self.prev_timestamp1 ^ self.bits.read_varint_u64()? as i64,
            _ => return Err(Error::decode(format!("{code} is not a timestamp code"))),
        };

        self.update_time_deltas(timestamp);
        Ok(timestamp)
    }

    /// Keep the four smallest distinct deltas seen, sorted ascending.
    fn update_time_deltas(&mut self, timestamp: i64) {
        let min_delta = self.prev_timestamp1.wrapping_sub(timestamp).wrapping_abs();

        if min_delta < self.prev_time_delta4
            && min_delta != self.prev_time_delta1
            && min_delta != self.prev_time_delta2
            && min_delta != self.prev_time_delta3
        {
            if min_delta < self.prev_time_delta1 {
                self.prev_time_delta4 = self.prev_time_delta3;
                self.prev_time_delta3 = self.prev_time_delta2;
                self.prev_time_delta2 = self.prev_time_delta1;
                self.prev_time_delta1 = min_delta;
            } else if min_delta < self.prev_time_delta2 {
                self.prev_time_delta4 = self.prev_time_delta3;
                self.prev_time_delta3 = self.prev_time_delta2;
                self.prev_time_delta2 = min_delta;
            } else if min_delta < self.prev_time_delta3 {
                self.prev_time_delta4 = self.prev_time_delta3;
                self.prev_time_delta3 = min_delta;
            } else {
                self.prev_time_delta4 = min_delta;
            }
        }

        self.prev_timestamp2 = self.prev_timestamp1;
        self.prev_timestamp1 = timestamp;
    }

    fn decode_state_flags(&mut self, code: u32, id: i32) -> Result<u32> {
        let flags = if code == Code::STATE_FLAGS2 {
            self.point(id)?.prev_sf2
        } else if code == Code::STATE_FLAGS_7BIT32 {
            self.bits.read_varint_u32()?
        } else {
            return Err(Error::decode(format!("{code} is not a state flags code")));
        };

        let point = self.point_mut(id)?;
        point.prev_sf2 = point.prev_sf1;
        point.prev_sf1 = flags;
        Ok(flags)
    }

    fn decode_value(&mut self, code: u32, id: i32) -> Result<f32> {
        let value_raw = match code {
            Code::VALUE1 => {
                return Ok(f32::from_bits(self.point(id)?.prev_v1));
            }
            Code::VALUE2 => {
                let point = self.point_mut(id)?;
                let v = point.prev_v2;
                point.prev_v2 = point.prev_v1;
                point.prev_v1 = v;
                return Ok(f32::from_bits(v));
            }
            Code::VALUE3 => {
                let point = self.point_mut(id)?;
                let v = point.prev_v3;
                point.prev_v3 = point.prev_v2;
                point.prev_v2 = point.prev_v1;
                point.prev_v1 = v;
                return Ok(f32::from_bits(v));
            }
            Code::VALUE_ZERO => 0,
            Code::VALUE_XOR4 => {
                let x = self.bits.read_bits4()?;
                x ^ self.point(id)?.prev_v1
            }
            Code::VALUE_XOR8 => {
                let x = self.bits.read_byte()?;
                x ^ self.point(id)?.prev_v1
            }
            Code::VALUE_XOR12 => {
                let nibble = self.bits.read_bits4()?;
                let x = nibble | self.bits.read_byte()? << 4;
                x ^ self.point(id)?.prev_v1
            }
            Code::VALUE_XOR16 => {
                let b0 = self.bits.read_byte()?;
                let x = b0 | self.bits.read_byte()? << 8;
                x ^ self.point(id)?.prev_v1
            }
            Code::VALUE_XOR20 => {
                let nibble = self.bits.read_bits4()?;
                let b0 = self.bits.read_byte()?;
                let x = nibble | b0 << 4 | self.bits.read_byte()? << 12;
                x ^ self.point(id)?.prev_v1
            }
            Code::VALUE_XOR24 => {
                let b0 = self.bits.read_byte()?;
                let b1 = self.bits.read_byte()?;
                let x = b0 | b1 << 8 | self.bits.read_byte()? << 16;
                x ^ self.point(id)?.prev_v1
            }
            Code::VALUE_XOR28 => {
                let nibble = self.bits.read_bits4()?;
                let b0 = self.bits.read_byte()?;
                let b1 = self.bits.read_byte()?;
                let x = nibble | b0 << 4 | b1 << 12 | self.bits.read_byte()? << 20;
                x ^ self.point(id)?.prev_v1
            }
            Code::VALUE_XOR32 => {
                let b0 = self.bits.read_byte()?;
                let b1 = self.bits.read_byte()?;
                let b2 = self.bits.read_byte()?;
                let x = b0 | b1 << 8 | b2 << 16 | self.bits.read_byte()? << 24;
                x ^ self.point(id)?.prev_v1
            }
            _ => return Err(Error::decode(format!("{code} is not a value code"))),
        };

        let point = self.point_mut(id)?;
        point.prev_v3 = point.prev_v2;
        point.prev_v2 = point.prev_v1;
        point.prev_v1 = value_raw;
        Ok(f32::from_bits(value_raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_reader_interleaving() {
        let mut bits = BitReader::default();
        // First byte feeds the bit cache; second byte is positional.
        bits.load(&[0b1010_0000, 0x42]);
        assert_eq!(bits.read_bit().unwrap(), 1);
        assert_eq!(bits.read_bit().unwrap(), 0);
        assert_eq!(bits.read_bit().unwrap(), 1);
        assert_eq!(bits.read_byte().unwrap(), 0x42);
        // Remaining cached bits are still readable.
        assert_eq!(bits.read_bits5().unwrap(), 0);
        assert!(bits.is_exhausted());
    }

    #[test]
    fn test_bit_reader_truncation() {
        let mut bits = BitReader::default();
        bits.load(&[0xFF]);
        assert_eq!(bits.read_bits5().unwrap(), 0x1F);
        assert_eq!(bits.read_bits4().unwrap(), 0x7);
        assert!(bits.read_bit().is_err());
    }

    #[test]
    fn test_fresh_decoder_expects_sequence_zero() {
        let d = Decoder::new();
        assert_eq!(d.sequence_number(), 0);
    }

    #[test]
    fn test_sequence_wrap_skips_zero() {
        let mut d = Decoder::new();
        d.sequence_number = u16::MAX;
        d.advance_sequence();
        assert_eq!(d.sequence_number(), 1);
    }

    #[test]
    fn test_empty_buffer_yields_no_points() {
        let mut d = Decoder::new();
        d.set_buffer(&[]);
        assert_eq!(d.try_get_measurement().unwrap(), None);
    }
}
