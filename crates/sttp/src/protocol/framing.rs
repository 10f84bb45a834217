//! Length-prefixed framing over the command channel.
//!
//! Outbound frames are `u32 payload size (BE) | u8 command | payload`,
//! where the size counts the command byte. Inbound frames are `u32
//! payload size (BE)` followed by a six-byte response header (`response
//! code`, `echoed command code`, reserved `u32`) and the payload. The
//! same layout rides inside UDP datagrams on the data channel, parsed
//! with [`Frame::parse`].

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Size of the reusable inbound buffer; larger frames grow it on demand.
pub const MAX_PACKET_SIZE: usize = 32_768;

/// Bytes of the outer length prefix.
pub const PAYLOAD_HEADER_SIZE: usize = 4;

/// Bytes of the response header inside the payload.
pub const RESPONSE_HEADER_SIZE: usize = 6;

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Response code from the publisher.
    pub response_code: u8,
    /// Command code this frame responds to, where applicable.
    pub command_code: u8,
    /// Response payload.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Parse a complete frame including the outer length prefix, as
    /// carried by a UDP datagram.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < PAYLOAD_HEADER_SIZE {
            return Err(Error::Truncated {
                expected: PAYLOAD_HEADER_SIZE,
                actual: data.len(),
            });
        }
        let declared = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        let body = &data[PAYLOAD_HEADER_SIZE..];
        if body.len() < declared {
            return Err(Error::Truncated {
                expected: declared,
                actual: body.len(),
            });
        }
        Self::parse_body(&body[..declared])
    }

    /// Parse the frame body that follows the outer length prefix.
    pub fn parse_body(data: &[u8]) -> Result<Self> {
        if data.len() < RESPONSE_HEADER_SIZE {
            return Err(Error::protocol(format!(
                "runt frame: {} bytes cannot hold a response header",
                data.len()
            )));
        }
        // Bytes 2-5 are a reserved internal payload size; ignored.
        Ok(Self {
            response_code: data[0],
            command_code: data[1],
            payload: data[RESPONSE_HEADER_SIZE..].to_vec(),
        })
    }

    /// Total bytes this frame occupied on the wire.
    pub fn wire_size(&self) -> usize {
        PAYLOAD_HEADER_SIZE + RESPONSE_HEADER_SIZE + self.payload.len()
    }
}

/// Reads framed responses from the command channel.
pub struct FrameReader<R> {
    inner: R,
    buffer: BytesMut,
    limit: Option<usize>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a stream in a frame reader with the standard reusable buffer.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buffer: BytesMut::with_capacity(MAX_PACKET_SIZE),
            limit: None,
        }
    }

    /// Cap the declared payload size of the next frames.
    ///
    /// Used before mode validation: a peer that is not an STTP publisher
    /// gets disconnected instead of being allowed to demand an arbitrary
    /// allocation.
    pub fn set_limit(&mut self, limit: Option<usize>) {
        self.limit = limit;
    }

    /// Read and decode the next frame.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        let mut header = [0u8; PAYLOAD_HEADER_SIZE];
        self.inner.read_exact(&mut header).await?;
        let payload_size = u32::from_be_bytes(header) as usize;

        if let Some(limit) = self.limit
            && payload_size > limit
        {
            return Err(Error::protocol(format!(
                "peer declared a {payload_size}-byte payload before validation (cap {limit}); not an STTP publisher"
            )));
        }

        self.buffer.clear();
        self.buffer.resize(payload_size, 0);
        self.inner.read_exact(&mut self.buffer[..]).await?;
        Frame::parse_body(&self.buffer)
    }
}

/// Writes framed commands to the command channel.
///
/// Writes are serialized by exclusive access to the writer; the buffer
/// is reused across sends and grows on demand.
pub struct CommandWriter<W> {
    inner: W,
    buffer: BytesMut,
}

impl<W: AsyncWrite + Unpin> CommandWriter<W> {
    /// Wrap a stream in a command writer.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buffer: BytesMut::with_capacity(1024),
        }
    }

    /// Send one command frame.
    pub async fn send(&mut self, command: u8, payload: &[u8]) -> Result<()> {
        self.buffer.clear();
        self.buffer
            .reserve(PAYLOAD_HEADER_SIZE + 1 + payload.len());
        self.buffer.put_u32(1 + payload.len() as u32);
        self.buffer.put_u8(command);
        self.buffer.put_slice(payload);
        self.inner.write_all(&self.buffer).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Shut down the underlying stream.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codes::{Command, Response};

    #[tokio::test]
    async fn test_command_frame_layout() {
        let (client, mut server) = tokio::io::duplex(256);
        let mut writer = CommandWriter::new(client);
        writer
            .send(Command::DEFINE_OPERATIONAL_MODES, &[0x20, 0x00, 0x02, 0x20])
            .await
            .unwrap();

        let mut buf = vec![0u8; 9];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(
            buf,
            [0x00, 0x00, 0x00, 0x05, 0x06, 0x20, 0x00, 0x02, 0x20]
        );
    }

    #[tokio::test]
    async fn test_response_round_trip() {
        let (mut client, server) = tokio::io::duplex(256);
        let mut reader = FrameReader::new(server);

        // Succeeded(DefineOperationalModes) with empty payload.
        client
            .write_all(&[0x00, 0x00, 0x00, 0x06, 0x80, 0x06, 0x00, 0x00, 0x00, 0x00])
            .await
            .unwrap();

        let frame = reader.read_frame().await.unwrap();
        assert_eq!(frame.response_code, Response::SUCCEEDED);
        assert_eq!(frame.command_code, Command::DEFINE_OPERATIONAL_MODES);
        assert!(frame.payload.is_empty());
        assert_eq!(frame.wire_size(), 10);
    }

    #[tokio::test]
    async fn test_prevalidation_cap() {
        let (mut client, server) = tokio::io::duplex(256);
        let mut reader = FrameReader::new(server);
        reader.set_limit(Some(8192));

        client
            .write_all(&[0x00, 0x01, 0x00, 0x00])
            .await
            .unwrap();

        let err = reader.read_frame().await.unwrap_err();
        assert!(err.is_fatal(), "oversized pre-validation frame must disconnect");
    }

    #[test]
    fn test_datagram_parse() {
        let datagram = [
            0x00, 0x00, 0x00, 0x08, 0x82, 0x02, 0x00, 0x00, 0x00, 0x00, 0xAB, 0xCD,
        ];
        let frame = Frame::parse(&datagram).unwrap();
        assert_eq!(frame.response_code, Response::DATA_PACKET);
        assert_eq!(frame.payload, [0xAB, 0xCD]);
    }

    #[test]
    fn test_runt_frame_rejected() {
        assert!(Frame::parse_body(&[0x80, 0x06]).is_err());
    }
}
