//! Time-Series Special Compression (TSSC).
//!
//! TSSC delta/XOR-encodes a stream of `(id, timestamp, flags, value)`
//! tuples against per-point history, emitting short code words from an
//! adaptive 32-entry alphabet. The encoder and decoder run the same
//! adaptation state machine over the codes they write and read, so no
//! table ever travels on the wire. The codec is stateful across packets
//! and therefore rides the TCP command channel only.
//!
//! Each packet starts with a version byte and a big-endian sequence
//! number; sequence 0 resets decoder state by replacing the decoder
//! outright.

mod decoder;
mod encoder;

pub use decoder::Decoder;
pub use encoder::Encoder;

/// TSSC stream version byte; anything else is fatal to the connection.
pub const VERSION: u8 = 0x55;

/// One decompressed measurement, before signal-id resolution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    /// Publisher-assigned runtime id.
    pub id: i32,
    /// Full-precision tick timestamp.
    pub timestamp: u64,
    /// 32-bit state flags.
    pub flags: u32,
    /// Sample value.
    pub value: f32,
}

/// The 5-bit code-word alphabet.
pub(crate) struct Code;

#[allow(dead_code)]
impl Code {
    pub const END_OF_STREAM: u32 = 0;

    pub const POINT_ID_XOR4: u32 = 1;
    pub const POINT_ID_XOR8: u32 = 2;
    pub const POINT_ID_XOR12: u32 = 3;
    pub const POINT_ID_XOR16: u32 = 4;
    pub const POINT_ID_XOR20: u32 = 5;
    pub const POINT_ID_XOR24: u32 = 6;
    pub const POINT_ID_XOR32: u32 = 7;

    pub const TIME_DELTA1_FORWARD: u32 = 8;
    pub const TIME_DELTA2_FORWARD: u32 = 9;
    pub const TIME_DELTA3_FORWARD: u32 = 10;
    pub const TIME_DELTA4_FORWARD: u32 = 11;
    pub const TIME_DELTA1_REVERSE: u32 = 12;
    pub const TIME_DELTA2_REVERSE: u32 = 13;
    pub const TIME_DELTA3_REVERSE: u32 = 14;
    pub const TIME_DELTA4_REVERSE: u32 = 15;
    pub const TIMESTAMP2: u32 = 16;
    pub const TIME_XOR_7BIT: u32 = 17;

    pub const STATE_FLAGS2: u32 = 18;
    pub const STATE_FLAGS_7BIT32: u32 = 19;

    pub const VALUE1: u32 = 20;
    pub const VALUE2: u32 = 21;
    pub const VALUE3: u32 = 22;
    pub const VALUE_ZERO: u32 = 23;
    pub const VALUE_XOR4: u32 = 24;
    pub const VALUE_XOR8: u32 = 25;
    pub const VALUE_XOR12: u32 = 26;
    pub const VALUE_XOR16: u32 = 27;
    pub const VALUE_XOR20: u32 = 28;
    pub const VALUE_XOR24: u32 = 29;
    pub const VALUE_XOR28: u32 = 30;
    pub const VALUE_XOR32: u32 = 31;
}

/// Per-point compression state.
///
/// Holds the prediction for the next point id, the two previous state
/// flags, the three previous values, and the adaptive code table this
/// point reads and writes codes with.
#[derive(Debug, Clone)]
pub(crate) struct PointMetadata {
    pub prev_next_id1: i32,
    pub prev_sf1: u32,
    pub prev_sf2: u32,
    pub prev_v1: u32,
    pub prev_v2: u32,
    pub prev_v3: u32,

    /// Active code-table mode, 1 through 4.
    pub mode: u8,
    /// Preferred code in mode 2.
    pub mode21: u32,
    /// First and second preferred codes in mode 3.
    pub mode31: u32,
    pub mode301: u32,
    /// First, second and third preferred codes in mode 4.
    pub mode41: u32,
    pub mode401: u32,
    pub mode4001: u32,

    startup_mode: u8,
    commands_sent_since_last_change: u32,
    command_stats: [u32; 32],
}

impl PointMetadata {
    /// Fresh state: mode 4 preferring the three value-reuse codes.
    pub fn new() -> Self {
        Self {
            prev_next_id1: 0,
            prev_sf1: 0,
            prev_sf2: 0,
            prev_v1: 0,
            prev_v2: 0,
            prev_v3: 0,
            mode: 4,
            mode21: 0,
            mode31: 0,
            mode301: 0,
            mode41: Code::VALUE1,
            mode401: Code::VALUE2,
            mode4001: Code::VALUE3,
            startup_mode: 0,
            commands_sent_since_last_change: 0,
            command_stats: [0; 32],
        }
    }

    /// Record one code and re-evaluate the table at the growing
    /// checkpoints (>5, >20, >100 codes since the last change).
    ///
    /// This is a pure function of the histogram, so an encoder and a
    /// decoder fed the same code sequence evolve identically.
    pub fn update_code_statistics(&mut self, code: u32) {
        self.commands_sent_since_last_change += 1;
        self.command_stats[code as usize] += 1;

        match self.startup_mode {
            0 if self.commands_sent_since_last_change > 5 => {
                self.startup_mode = 1;
                self.adapt_commands();
            }
            1 if self.commands_sent_since_last_change > 20 => {
                self.startup_mode = 2;
                self.adapt_commands();
            }
            2 if self.commands_sent_since_last_change > 100 => {
                self.adapt_commands();
            }
            _ => {}
        }
    }

    /// Replace `(mode, preferred codes)` with whichever scheme spends
    /// the fewest bits on the current histogram, then reset it.
    fn adapt_commands(&mut self) {
        let mut code1 = 0u32;
        let mut count1 = 0u32;
        let mut code2 = 1u32;
        let mut count2 = 0u32;
        let mut code3 = 2u32;
        let mut count3 = 0u32;
        let mut total = 0u32;

        for (code, slot) in self.command_stats.iter_mut().enumerate() {
            let count = *slot;
            *slot = 0;
            total += count;

            if count > count3 {
                if count > count1 {
                    code3 = code2;
                    count3 = count2;
                    code2 = code1;
                    count2 = count1;
                    code1 = code as u32;
                    count1 = count;
                } else if count > count2 {
                    code3 = code2;
                    count3 = count2;
                    code2 = code as u32;
                    count2 = count;
                } else {
                    code3 = code as u32;
                    count3 = count;
                }
            }
        }

        let mode1_size = total * 5;
        let mode2_size = count1 + (total - count1) * 6;
        let mode3_size = count1 + count2 * 2 + (total - count1 - count2) * 7;
        let mode4_size =
            count1 + count2 * 2 + count3 * 3 + (total - count1 - count2 - count3) * 8;

        let min_size = mode1_size.min(mode2_size).min(mode3_size).min(mode4_size);

        if min_size == mode1_size {
            self.mode = 1;
        } else if min_size == mode2_size {
            self.mode = 2;
            self.mode21 = code1;
        } else if min_size == mode3_size {
            self.mode = 3;
            self.mode31 = code1;
            self.mode301 = code2;
        } else {
            self.mode = 4;
            self.mode41 = code1;
            self.mode401 = code2;
            self.mode4001 = code3;
        }

        self.commands_sent_since_last_change = 0;
    }
}
