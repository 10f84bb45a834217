//! Error types for subscriber operations.

use std::io;

/// Result type for subscriber operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while talking to a publisher.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error from socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Buffer ended before a field could be read.
    #[error("buffer truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes required by the field being read.
        expected: usize,
        /// Bytes actually available.
        actual: usize,
    },

    /// The peer violated the protocol; the connection must be dropped.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A payload could not be decoded; the packet is discarded.
    #[error("decode error: {0}")]
    Decode(String),

    /// A signal index cache image failed to parse.
    #[error("malformed signal index cache: {0}")]
    MalformedCache(String),

    /// A TSSC packet arrived out of sequence.
    #[error("unexpected TSSC sequence number: expected {expected}, got {actual}")]
    OutOfSequence {
        /// Sequence number the decoder was waiting for.
        expected: u16,
        /// Sequence number carried by the packet.
        actual: u16,
    },

    /// The publisher refused the connection or the negotiated modes.
    #[error("connection refused by publisher: {0}")]
    ConnectionRefused(String),

    /// An operation required an established connection.
    #[error("not connected to a publisher")]
    NotConnected,

    /// `connect` was called on a subscriber that is already connected.
    #[error("subscriber is already connected")]
    AlreadyConnected,

    /// The publisher negotiated a string encoding other than UTF-8.
    #[error("unsupported string encoding: {0:#06x}")]
    UnsupportedEncoding(u32),

    /// AES-CBC decryption of a data-channel payload failed.
    #[error("cipher error: {0}")]
    Cipher(String),

    /// Operation not supported by this implementation.
    #[error("operation not supported: {0}")]
    NotSupported(String),
}

impl Error {
    /// Shorthand for a [`Error::Protocol`] with a formatted message.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Shorthand for a [`Error::Decode`] with a formatted message.
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Check if this error must terminate the connection.
    ///
    /// Cache-level and packet-level decode failures are survivable (the
    /// offending payload is discarded); protocol violations and socket
    /// errors are not.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Io(_) | Self::Protocol(_) | Self::UnsupportedEncoding(_) => true,
            Self::Truncated { .. }
            | Self::Decode(_)
            | Self::MalformedCache(_)
            | Self::OutOfSequence { .. }
            | Self::Cipher(_) => false,
            Self::ConnectionRefused(_)
            | Self::NotConnected
            | Self::AlreadyConnected
            | Self::NotSupported(_) => false,
        }
    }

    /// Check if the publisher actively refused us.
    pub fn is_connection_refused(&self) -> bool {
        matches!(self, Self::ConnectionRefused(_))
    }

    /// Check if this is a TSSC sequence mismatch.
    pub fn is_out_of_sequence(&self) -> bool {
        matches!(self, Self::OutOfSequence { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality_classes() {
        assert!(Error::protocol("bad version byte").is_fatal());
        assert!(!Error::decode("short guid").is_fatal());
        assert!(!Error::MalformedCache("too short".into()).is_fatal());
        assert!(
            !Error::OutOfSequence {
                expected: 3,
                actual: 7
            }
            .is_fatal()
        );
    }

    #[test]
    fn test_refused_classification() {
        let err = Error::ConnectionRefused("bad credentials".into());
        assert!(err.is_connection_refused());
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("bad credentials"));
    }
}
