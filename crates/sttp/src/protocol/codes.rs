//! Command/response codes and the operational-mode word.

/// Subscriber-to-publisher command codes.
pub struct Command;

impl Command {
    /// Never sent; echoed by the publisher in connection-refused replies.
    pub const CONNECT: u8 = 0x00;
    /// Request a metadata refresh.
    pub const METADATA_REFRESH: u8 = 0x01;
    /// Start a subscription.
    pub const SUBSCRIBE: u8 = 0x02;
    /// Stop the active subscription.
    pub const UNSUBSCRIBE: u8 = 0x03;
    /// Ask the publisher to roll the UDP cipher keys.
    pub const ROTATE_CIPHER_KEYS: u8 = 0x04;
    /// Change the temporal processing interval.
    pub const UPDATE_PROCESSING_INTERVAL: u8 = 0x05;
    /// Negotiate protocol version, encoding and compression.
    pub const DEFINE_OPERATIONAL_MODES: u8 = 0x06;
    /// Acknowledge a notification by hash.
    pub const CONFIRM_NOTIFICATION: u8 = 0x07;
    /// Acknowledge a buffer block by sequence number.
    pub const CONFIRM_BUFFER_BLOCK: u8 = 0x08;
    /// Acknowledge receipt of a signal index cache.
    pub const CONFIRM_UPDATE_SIGNAL_INDEX_CACHE: u8 = 0x0A;
    /// First user-defined command.
    pub const USER_COMMAND_00: u8 = 0xD0;
    /// Last user-defined command.
    pub const USER_COMMAND_15: u8 = 0xDF;

    /// Human-readable name for log and error messages.
    pub fn name(code: u8) -> &'static str {
        match code {
            Self::CONNECT => "Connect",
            Self::METADATA_REFRESH => "MetadataRefresh",
            Self::SUBSCRIBE => "Subscribe",
            Self::UNSUBSCRIBE => "Unsubscribe",
            Self::ROTATE_CIPHER_KEYS => "RotateCipherKeys",
            Self::UPDATE_PROCESSING_INTERVAL => "UpdateProcessingInterval",
            Self::DEFINE_OPERATIONAL_MODES => "DefineOperationalModes",
            Self::CONFIRM_NOTIFICATION => "ConfirmNotification",
            Self::CONFIRM_BUFFER_BLOCK => "ConfirmBufferBlock",
            Self::CONFIRM_UPDATE_SIGNAL_INDEX_CACHE => "ConfirmUpdateSignalIndexCache",
            Self::USER_COMMAND_00..=Self::USER_COMMAND_15 => "UserCommand",
            _ => "UnknownCommand",
        }
    }
}

/// Publisher-to-subscriber response codes.
pub struct Response;

impl Response {
    /// The echoed command succeeded.
    pub const SUCCEEDED: u8 = 0x80;
    /// The echoed command failed.
    pub const FAILED: u8 = 0x81;
    /// A block of measurements.
    pub const DATA_PACKET: u8 = 0x82;
    /// A new signal index cache image.
    pub const UPDATE_SIGNAL_INDEX_CACHE: u8 = 0x83;
    /// New base-time offsets for compact timestamps.
    pub const UPDATE_BASE_TIMES: u8 = 0x84;
    /// New UDP cipher key/IV pairs.
    pub const UPDATE_CIPHER_KEYS: u8 = 0x85;
    /// Timestamp of the first measurement of the stream.
    pub const DATA_START_TIME: u8 = 0x86;
    /// Historical playback has finished.
    pub const PROCESSING_COMPLETE: u8 = 0x87;
    /// An opaque per-signal binary blob.
    pub const BUFFER_BLOCK: u8 = 0x88;
    /// A human-readable notification that must be confirmed.
    pub const NOTIFICATION: u8 = 0x89;
    /// The publisher configuration changed; a metadata refresh is in order.
    pub const CONFIGURATION_CHANGED: u8 = 0x8A;
    /// First user-defined response.
    pub const USER_RESPONSE_00: u8 = 0xE0;
    /// Last user-defined response.
    pub const USER_RESPONSE_15: u8 = 0xEF;
    /// Keepalive; carries no state.
    pub const NO_OP: u8 = 0xFF;

    /// Human-readable name for log and error messages.
    pub fn name(code: u8) -> &'static str {
        match code {
            Self::SUCCEEDED => "Succeeded",
            Self::FAILED => "Failed",
            Self::DATA_PACKET => "DataPacket",
            Self::UPDATE_SIGNAL_INDEX_CACHE => "UpdateSignalIndexCache",
            Self::UPDATE_BASE_TIMES => "UpdateBaseTimes",
            Self::UPDATE_CIPHER_KEYS => "UpdateCipherKeys",
            Self::DATA_START_TIME => "DataStartTime",
            Self::PROCESSING_COMPLETE => "ProcessingComplete",
            Self::BUFFER_BLOCK => "BufferBlock",
            Self::NOTIFICATION => "Notification",
            Self::CONFIGURATION_CHANGED => "ConfigurationChanged",
            Self::USER_RESPONSE_00..=Self::USER_RESPONSE_15 => "UserResponse",
            Self::NO_OP => "NoOp",
            _ => "UnknownResponse",
        }
    }
}

/// Bits of the 32-bit operational-mode word sent with
/// `DefineOperationalModes`.
pub mod operational_modes {
    /// Low five bits carry the requested protocol version.
    pub const VERSION_MASK: u32 = 0x0000_001F;
    /// Compression-mode bits; see [`super::compression_modes`].
    pub const COMPRESSION_MODE_MASK: u32 = 0x0000_00E0;
    /// String-encoding bits; see [`super::operational_encoding`].
    pub const ENCODING_MASK: u32 = 0x0000_0300;
    /// Receive metadata for signals of external origin.
    pub const RECEIVE_EXTERNAL_METADATA: u32 = 0x0200_0000;
    /// Receive metadata for signals of internal origin.
    pub const RECEIVE_INTERNAL_METADATA: u32 = 0x0400_0000;
    /// Compress data-packet payloads.
    pub const COMPRESS_PAYLOAD_DATA: u32 = 0x2000_0000;
    /// Gzip signal-index-cache images.
    pub const COMPRESS_SIGNAL_INDEX_CACHE: u32 = 0x4000_0000;
    /// Gzip metadata payloads.
    pub const COMPRESS_METADATA: u32 = 0x8000_0000;
}

/// Values for the compression-mode bits.
pub mod compression_modes {
    /// Gzip framing on cache and metadata payloads.
    pub const GZIP: u32 = 0x0000_0020;
    /// TSSC on data-packet payloads. Stateful: TCP only.
    pub const TSSC: u32 = 0x0000_0040;
}

/// Values for the string-encoding bits.
///
/// The UTF-16 encodings are deprecated and kept only so the constants
/// stay wire-compatible; negotiating them fails loudly.
pub mod operational_encoding {
    /// Little-endian UTF-16 (deprecated).
    pub const UTF16_LE: u32 = 0x0000_0000;
    /// Big-endian UTF-16 (deprecated).
    pub const UTF16_BE: u32 = 0x0000_0100;
    /// UTF-8, the only encoding this implementation speaks.
    pub const UTF8: u32 = 0x0000_0200;
}

/// Flag bits of the data-packet header byte.
pub mod data_packet_flags {
    /// Measurements use the compact wire form.
    pub const COMPACT: u8 = 0x02;
    /// Selects the odd cipher key/IV pair instead of the even one.
    pub const CIPHER_INDEX: u8 = 0x04;
    /// Payload is TSSC-compressed.
    pub const COMPRESSED: u8 = 0x08;
    /// Selects signal index cache slot 1 instead of slot 0.
    pub const CACHE_INDEX: u8 = 0x10;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_names() {
        assert_eq!(Command::name(0x06), "DefineOperationalModes");
        assert_eq!(Command::name(0xD7), "UserCommand");
        assert_eq!(Response::name(0x82), "DataPacket");
        assert_eq!(Response::name(0xFF), "NoOp");
        assert_eq!(Response::name(0x42), "UnknownResponse");
    }

    #[test]
    fn test_mode_masks_are_disjoint() {
        use operational_modes::*;
        assert_eq!(VERSION_MASK & COMPRESSION_MODE_MASK, 0);
        assert_eq!(COMPRESSION_MODE_MASK & ENCODING_MASK, 0);
        assert_eq!(
            compression_modes::GZIP & COMPRESSION_MODE_MASK,
            compression_modes::GZIP
        );
        assert_eq!(
            compression_modes::TSSC & COMPRESSION_MODE_MASK,
            compression_modes::TSSC
        );
        assert_eq!(operational_encoding::UTF8 & ENCODING_MASK, operational_encoding::UTF8);
    }
}
