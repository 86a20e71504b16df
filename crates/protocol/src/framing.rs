//! Frame codec for length-prefixed packets.
//!
//! # Frame Format
//!
//! Each frame consists of:
//! - 4 bytes: payload length (big-endian)
//! - N bytes: payload, whose first byte is the packet type
//!
//! This is the packet layout used by both the SSH authentication messages
//! and the SFTP subsystem, so one codec serves the whole connection.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{ProtocolError, Result};

/// Maximum payload size accepted or produced (256 KiB).
pub const MAX_PACKET_SIZE: usize = 256 * 1024;

/// Frame header size: the 4-byte length prefix.
pub const FRAME_HEADER_SIZE: usize = 4;

/// A single packet payload as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The payload data, starting with the packet type byte.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a new frame with the given payload.
    pub fn new(payload: Vec<u8>) -> Self {
        Self { payload }
    }

    /// The packet type byte, if the payload is not empty.
    pub fn packet_type(&self) -> Option<u8> {
        self.payload.first().copied()
    }
}

/// Encoder and decoder for frames.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_packet_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Create a codec enforcing [`MAX_PACKET_SIZE`].
    pub fn new() -> Self {
        Self {
            max_packet_size: MAX_PACKET_SIZE,
        }
    }

    /// Create a codec with a smaller packet limit.
    pub fn with_max_packet_size(max_packet_size: usize) -> Self {
        Self {
            max_packet_size: max_packet_size.min(MAX_PACKET_SIZE),
        }
    }

    /// The packet limit enforced by this codec.
    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Encode a frame into bytes.
    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>> {
        let mut output = BytesMut::with_capacity(FRAME_HEADER_SIZE + frame.payload.len());
        self.encode_into(&frame.payload, &mut output)?;
        Ok(output.to_vec())
    }

    /// Encode a payload, appending the frame to `output`.
    pub fn encode_into(&self, payload: &[u8], output: &mut BytesMut) -> Result<()> {
        if payload.len() > self.max_packet_size {
            return Err(ProtocolError::PacketTooLarge {
                size: payload.len(),
                max: self.max_packet_size,
            });
        }
        if payload.is_empty() {
            return Err(ProtocolError::EmptyPacket);
        }

        output.reserve(FRAME_HEADER_SIZE + payload.len());
        output.put_u32(payload.len() as u32);
        output.put_slice(payload);
        Ok(())
    }

    /// Read the declared payload length from a frame header.
    ///
    /// Fails as soon as the header announces an oversized or empty packet,
    /// before any payload is buffered.
    pub fn payload_len(&self, header: [u8; FRAME_HEADER_SIZE]) -> Result<usize> {
        let len = u32::from_be_bytes(header) as usize;
        if len > self.max_packet_size {
            return Err(ProtocolError::PacketTooLarge {
                size: len,
                max: self.max_packet_size,
            });
        }
        if len == 0 {
            return Err(ProtocolError::EmptyPacket);
        }
        Ok(len)
    }

    /// Decode a frame from the front of `data`.
    ///
    /// Returns `Ok(None)` when more bytes are needed, otherwise the frame
    /// and the number of bytes consumed.
    pub fn decode(&self, data: &[u8]) -> Result<Option<(Frame, usize)>> {
        if data.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let mut header = [0u8; FRAME_HEADER_SIZE];
        header.copy_from_slice(&data[..FRAME_HEADER_SIZE]);
        let len = self.payload_len(header)?;

        let total = FRAME_HEADER_SIZE + len;
        if data.len() < total {
            return Ok(None);
        }

        let payload = data[FRAME_HEADER_SIZE..total].to_vec();
        Ok(Some((Frame::new(payload), total)))
    }

    /// Decode a frame from a growable buffer, advancing past it.
    pub fn decode_buf(&self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        match self.decode(&buf[..])? {
            Some((frame, consumed)) => {
                buf.advance(consumed);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }
}
