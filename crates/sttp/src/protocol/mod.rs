//! Protocol-level constants and framing.
//!
//! The command channel carries length-prefixed frames in both
//! directions; [`codes`] holds the command/response alphabets and the
//! operational-mode word bits, [`flags`] the measurement state-flag
//! vocabulary, and [`framing`] the reader/writer pair over a TCP stream.

pub mod codes;
pub mod flags;
pub mod framing;

pub use codes::{Command, Response, compression_modes, data_packet_flags, operational_encoding,
    operational_modes};
pub use flags::{CompactFlags, StateFlags, collapse_state_flags, expand_compact_flags};
pub use framing::{CommandWriter, Frame, FrameReader, MAX_PACKET_SIZE, PAYLOAD_HEADER_SIZE,
    RESPONSE_HEADER_SIZE};
