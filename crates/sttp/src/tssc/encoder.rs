//! TSSC stream encoder.
//!
//! The encoder mirrors the decoder state machine exactly: it runs the
//! same adaptive code tables over the codes it writes, so the two sides
//! never exchange table state.

use super::{Code, Point, PointMetadata};
use crate::error::{Error, Result};
use crate::wire::varint;

const MAX_POINT_ID: usize = 1 << 20;

/// Bitstream builder for one packet.
///
/// Code words accumulate in a cache that spills into reserved byte
/// slots; whole-byte operands append positionally. Reserving the slot at
/// the position where the decoder's bit cache will run dry keeps the two
/// cursors aligned.
#[derive(Debug, Default)]
pub(crate) struct BitWriter {
    data: Vec<u8>,
    slot: Option<usize>,
    cache: u32,
    count: u32,
}

impl BitWriter {
    pub(crate) fn write_bits(&mut self, code: u32, length: u32) {
        if self.slot.is_none() {
            self.slot = Some(self.data.len());
            self.data.push(0);
        }

        self.cache = (self.cache << length) | (code & ((1 << length) - 1));
        self.count += length;

        while self.count > 7 {
            self.count -= 8;
            let slot = match self.slot.take() {
                Some(s) => s,
                None => {
                    self.data.push(0);
                    self.data.len() - 1
                }
            };
            self.data[slot] = (self.cache >> self.count) as u8;
            if self.count > 0 {
                self.slot = Some(self.data.len());
                self.data.push(0);
            }
        }
    }

    fn write_byte(&mut self, value: u8) {
        self.data.push(value);
    }

    fn write_varint_u32(&mut self, value: u32) {
        varint::encode_u32(value, &mut self.data);
    }

    fn write_varint_u64(&mut self, value: u64) {
        varint::encode_u64(value, &mut self.data);
    }

    /// Pad out any partial byte and return the finished packet buffer.
    fn end(&mut self) -> Vec<u8> {
        if self.count > 0 {
            self.cache <<= 8 - self.count;
            if let Some(slot) = self.slot.take() {
                self.data[slot] = self.cache as u8;
            } else {
                self.data.push(self.cache as u8);
            }
            self.cache = 0;
            self.count = 0;
        }
        self.slot = None;
        std::mem::take(&mut self.data)
    }
}

impl PointMetadata {
    /// Write one code word through this point's adaptive table.
    pub(crate) fn write_code(&mut self, code: u32, bits: &mut BitWriter) {
        match self.mode {
            1 => bits.write_bits(code, 5),
            2 => {
                if code == self.mode21 {
                    bits.write_bits(1, 1);
                } else {
                    bits.write_bits(code, 6);
                }
            }
            3 => {
                if code == self.mode31 {
                    bits.write_bits(1, 1);
                } else if code == self.mode301 {
                    bits.write_bits(1, 2);
                } else {
                    bits.write_bits(code, 7);
                }
            }
            _ => {
                if code == self.mode41 {
                    bits.write_bits(1, 1);
                } else if code == self.mode401 {
                    bits.write_bits(1, 2);
                } else if code == self.mode4001 {
                    bits.write_bits(1, 3);
                } else {
                    bits.write_bits(code, 8);
                }
            }
        }
        self.update_code_statistics(code);
    }
}

/// Stateful TSSC encoder for one command-channel session.
#[derive(Debug)]
pub struct Encoder {
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
    bits: BitWriter,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    /// Fresh encoder producing sequence 0 first.
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
            bits: BitWriter::default(),
        }
    }

    /// Sequence number the next finished packet carries.
    pub fn sequence_number(&self) -> u16 {
        self.sequence_number
    }

    /// Account for a finished packet, skipping 0 on wrap.
    pub fn advance_sequence(&mut self) {
        self.sequence_number = self.sequence_number.checked_add(1).unwrap_or(1);
    }

    /// Compress one measurement into the current packet.
    pub fn add_measurement(&mut self, m: &Point) -> Result<()> {
        self.ensure_point(m.id)?;

        if self.last_point().prev_next_id1 != m.id {
            self.write_point_id_change(m.id)?;
        }

        let timestamp = m.timestamp as i64;
        if self.prev_timestamp1 != timestamp {
            self.write_timestamp_change(timestamp)?;
        }

        if self.point(m.id)?.prev_sf1 != m.flags {
            self.write_state_flags_change(m.id, m.flags)?;
        }

        self.write_value(m.id, m.value)?;
        self.last_point_id = Some(m.id);
        Ok(())
    }

    /// Terminate the current packet and return its bitstream.
    ///
    /// Point histories survive into the next packet; only the bitstream
    /// state resets.
    pub fn finish(&mut self) -> Result<Vec<u8>> {
        self.write_code_last(Code::END_OF_STREAM)?;
        Ok(self.bits.end())
    }

    fn write_code_last(&mut self, code: u32) -> Result<()> {
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
        point.write_code(code, bits);
        Ok(())
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

    fn write_point_id_change(&mut self, id: i32) -> Result<()> {
        let xor = (id ^ self.last_point().prev_next_id1) as u32;

        if xor < (1 << 4) {
            self.write_code_last(Code::POINT_ID_XOR4)?;
            self.bits.write_bits(xor, 4);
        } else if xor < (1 << 8) {
            self.write_code_last(Code::POINT_ID_XOR8)?;
            self.bits.write_byte(xor as u8);
        } else if xor < (1 << 12) {
            self.write_code_last(Code::POINT_ID_XOR12)?;
            self.bits.write_bits(xor & 0xF, 4);
            self.bits.write_byte((xor >> 4) as u8);
        } else if xor < (1 << 16) {
            self.write_code_last(Code::POINT_ID_XOR16)?;
            self.bits.write_byte(xor as u8);
            self.bits.write_byte((xor >> 8) as u8);
        } else if xor < (1 << 20) {
            self.write_code_last(Code::POINT_ID_XOR20)?;
            self.bits.write_bits(xor & 0xF, 4);
            self.bits.write_byte((xor >> 4) as u8);
            self.bits.write_byte((xor >> 12) as u8);
        } else if xor < (1 << 24) {
            self.write_code_last(Code::POINT_ID_XOR24)?;
            self.bits.write_byte(xor as u8);
            self.bits.write_byte((xor >> 8) as u8);
            self.bits.write_byte((xor >> 16) as u8);
        } else {
            self.write_code_last(Code::POINT_ID_XOR32)?;
            self.bits.write_byte(xor as u8);
            self.bits.write_byte((xor >> 8) as u8);
            self.bits.write_byte((xor >> 16) as u8);
            self.bits.write_byte((xor >> 24) as u8);
        }

        self.last_point_mut()?.prev_next_id1 = id;
        Ok(())
    }

    fn write_timestamp_change(&mut self, timestamp: i64) -> Result<()> {
        if self.prev_timestamp2 == timestamp {
            self.write_code_last(Code::TIMESTAMP2)?;
        } else if self.prev_timestamp1 < timestamp {
            if self.prev_timestamp1.wrapping_add(self.prev_time_delta1) == timestamp {
                self.write_code_last(Code::TIME_DELTA1_FORWARD)?;
            } else if self.prev_timestamp1.wrapping_add(self.prev_time_delta2) == timestamp {
                self.write_code_last(Code::TIME_DELTA2_FORWARD)?;
            } else if self.prev_timestamp1.wrapping_add(self.prev_time_delta3) == timestamp {
                self.write_code_last(Code::TIME_DELTA3_FORWARD)?;
            } else if self.prev_timestamp1.wrapping_add(self.prev_time_delta4) == timestamp {
                self.write_code_last(Code::TIME_DELTA4_FORWARD)?;
            } else {
                self.write_code_last(Code::TIME_XOR_7BIT)?;
                self.bits
                    .write_varint_u64((self.prev_timestamp1 ^ timestamp) as u64);
            }
        } else if self.prev_timestamp1.wrapping_sub(self.prev_time_delta1) == timestamp {
            self.write_code_last(Code::TIME_DELTA1_REVERSE)?;
        } else if self.prev_timestamp1.wrapping_sub(self.prev_time_delta2) == timestamp {
            self.write_code_last(Code::TIME_DELTA2_REVERSE)?;
        } else if self.prev_timestamp1.wrapping_sub(self.prev_time_delta3) == timestamp {
            self.write_code_last(Code::TIME_DELTA3_REVERSE)?;
        } else if self.prev_timestamp1.wrapping_sub(self.prev_time_delta4) == timestamp {
            self.write_code_last(Code::TIME_DELTA4_REVERSE)?;
        } else {
            self.write_code_last(Code::TIME_XOR_7BIT)?;
            self.bits
                .write_varint_u64((self.prev_timestamp1 ^ timestamp) as u64);
        }

        self.update_time_deltas(timestamp);
        Ok(())
    }

    /// Same 4-slot sorted window the decoder maintains.
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

    fn write_state_flags_change(&mut self, id: i32, flags: u32) -> Result<()> {
        if self.point(id)?.prev_sf2 == flags {
            self.write_code_last(Code::STATE_FLAGS2)?;
        } else {
            self.write_code_last(Code::STATE_FLAGS_7BIT32)?;
            self.bits.write_varint_u32(flags);
        }

        let point = self.point_mut(id)?;
        point.prev_sf2 = point.prev_sf1;
        point.prev_sf1 = flags;
        Ok(())
    }

    fn write_value(&mut self, id: i32, value: f32) -> Result<()> {
        let raw = value.to_bits();
        let (prev_v1, prev_v2, prev_v3) = {
            let point = self.point(id)?;
            (point.prev_v1, point.prev_v2, point.prev_v3)
        };

        if raw == prev_v1 {
            self.write_code_last(Code::VALUE1)?;
            return Ok(());
        }
        if raw == prev_v2 {
            self.write_code_last(Code::VALUE2)?;
            let point = self.point_mut(id)?;
            point.prev_v2 = point.prev_v1;
            point.prev_v1 = raw;
            return Ok(());
        }
        if raw == prev_v3 {
            self.write_code_last(Code::VALUE3)?;
            let point = self.point_mut(id)?;
            point.prev_v3 = point.prev_v2;
            point.prev_v2 = point.prev_v1;
            point.prev_v1 = raw;
            return Ok(());
        }

        if raw == 0 {
            self.write_code_last(Code::VALUE_ZERO)?;
        } else {
            let xor = raw ^ prev_v1;
            if xor < (1 << 4) {
                self.write_code_last(Code::VALUE_XOR4)?;
                self.bits.write_bits(xor, 4);
            } else if xor < (1 << 8) {
                self.write_code_last(Code::VALUE_XOR8)?;
                self.bits.write_byte(xor as u8);
            } else if xor < (1 << 12) {
                self.write_code_last(Code::VALUE_XOR12)?;
                self.bits.write_bits(xor & 0xF, 4);
                self.bits.write_byte((xor >> 4) as u8);
            } else if xor < (1 << 16) {
                self.write_code_last(Code::VALUE_XOR16)?;
                self.bits.write_byte(xor as u8);
                self.bits.write_byte((xor >> 8) as u8);
            } else if xor < (1 << 20) {
                self.write_code_last(Code::VALUE_XOR20)?;
                self.bits.write_bits(xor & 0xF, 4);
                self.bits.write_byte((xor >> 4) as u8);
                self.bits.write_byte((xor >> 12) as u8);
            } else if xor < (1 << 24) {
                self.write_code_last(Code::VALUE_XOR24)?;
                self.bits.write_byte(xor as u8);
                self.bits.write_byte((xor >> 8) as u8);
                self.bits.write_byte((xor >> 16) as u8);
            } else if xor < (1 << 28) {
                self.write_code_last(Code::VALUE_XOR28)?;
                self.bits.write_bits(xor & 0xF, 4);
                self.bits.write_byte((xor >> 4) as u8);
                self.bits.write_byte((xor >> 12) as u8);
                self.bits.write_byte((xor >> 20) as u8);
            } else {
                self.write_code_last(Code::VALUE_XOR32)?;
                self.bits.write_byte(xor as u8);
                self.bits.write_byte((xor >> 8) as u8);
                self.bits.write_byte((xor >> 16) as u8);
                self.bits.write_byte((xor >> 24) as u8);
            }
        }

        let point = self.point_mut(id)?;
        point.prev_v3 = point.prev_v2;
        point.prev_v2 = point.prev_v1;
        point.prev_v1 = raw;
        Ok(())
    }
}
