//! Length-prefixed packet I/O over an async byte stream.

use bytes::BytesMut;
use protocol::{FrameCodec, ProtocolError, FRAME_HEADER_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Reads framed packets from a stream.
pub struct PacketReader<R> {
    reader: R,
    codec: FrameCodec,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    /// Wrap a read half.
    pub fn new(reader: R, codec: FrameCodec) -> Self {
        Self { reader, codec }
    }

    /// Read the next packet payload.
    ///
    /// Returns `None` if the peer closed the stream between packets. A stream
    /// that ends part-way through the length header is truncated, not closed.
    pub async fn read_packet(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        let mut filled = 0;
        while filled < FRAME_HEADER_SIZE {
            let n = self.reader.read(&mut header[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(ProtocolError::Truncated {
                    field: "packet length",
                    needed: FRAME_HEADER_SIZE - filled,
                });
            }
            filled += n;
        }

        let len = self.codec.payload_len(header)?;
        let mut payload = vec![0u8; len];
        self.reader.read_exact(&mut payload).await?;
        Ok(Some(payload))
    }
}

/// Writes framed packets to a stream.
pub struct PacketWriter<W> {
    writer: W,
    codec: FrameCodec,
    buf: BytesMut,
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    /// Wrap a write half.
    pub fn new(writer: W, codec: FrameCodec) -> Self {
        Self {
            writer,
            codec,
            buf: BytesMut::new(),
        }
    }

    /// Frame and send one packet payload.
    pub async fn write_packet(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        self.buf.clear();
        self.codec.encode_into(payload, &mut self.buf)?;
        self.writer.write_all(&self.buf).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Shut down the write side.
    pub async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_packets_cross_a_duplex() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = PacketWriter::new(client, FrameCodec::new());
        let mut reader = PacketReader::new(server, FrameCodec::new());

        writer.write_packet(b"first").await.unwrap();
        writer.write_packet(b"second").await.unwrap();

        assert_eq!(reader.read_packet().await.unwrap().unwrap(), b"first");
        assert_eq!(reader.read_packet().await.unwrap().unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_clean_close_returns_none() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);

        let mut reader = PacketReader::new(server, FrameCodec::new());
        assert!(reader.read_packet().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_mid_packet_is_an_error() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&[0, 0, 0, 10, 1, 2]).await.unwrap();
        drop(client);

        let mut reader = PacketReader::new(server, FrameCodec::new());
        let err = reader.read_packet().await.unwrap_err();
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn test_close_mid_header_is_truncation() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&[0, 0]).await.unwrap();
        drop(client);

        let mut reader = PacketReader::new(server, FrameCodec::new());
        let err = reader.read_packet().await.unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Truncated {
                field: "packet length",
                needed: 2
            }
        ));
        assert!(!err.is_disconnect());
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&u32::MAX.to_be_bytes()).await.unwrap();

        let mut reader = PacketReader::new(server, FrameCodec::new());
        assert!(matches!(
            reader.read_packet().await,
            Err(ProtocolError::PacketTooLarge { .. })
        ));
    }
}
