//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all wire-level failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Decoding errors
    /// The input ended before a complete field could be read.
    #[error("truncated packet: needed {needed} more bytes while reading {field}")]
    Truncated {
        /// Name of the field being read.
        field: &'static str,
        /// Number of bytes that were missing.
        needed: usize,
    },

    /// A string field was not valid UTF-8.
    #[error("invalid utf-8 in field {0}")]
    InvalidUtf8(&'static str),

    /// The packet carried bytes after its last field.
    #[error("trailing data: {0} unexpected bytes after packet body")]
    TrailingData(usize),

    /// The packet type byte is not one this side accepts.
    #[error("unexpected packet type {0}")]
    UnexpectedPacketType(u8),

    /// The packet body was empty (no type byte).
    #[error("empty packet")]
    EmptyPacket,

    /// A handle did not have the fixed 4-byte width.
    #[error("malformed handle: expected 4 bytes, got {0}")]
    MalformedHandle(usize),

    /// Generic malformed-message error.
    #[error("malformed message: {0}")]
    Malformed(String),

    // Frame errors
    /// Packet exceeds maximum allowed size.
    #[error("packet too large: {size} bytes exceeds maximum of {max} bytes")]
    PacketTooLarge {
        /// Actual packet size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    // Connection errors
    /// Connection was closed unexpectedly.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Other transport I/O failure.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(err.to_string()),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed(err.to_string()),
            _ => ProtocolError::Transport(err.to_string()),
        }
    }
}

impl ProtocolError {
    /// Whether this error means the peer went away rather than misbehaved.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, ProtocolError::ConnectionClosed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncated_error_display() {
        let err = ProtocolError::Truncated {
            field: "handle",
            needed: 3,
        };
        assert_eq!(
            err.to_string(),
            "truncated packet: needed 3 more bytes while reading handle"
        );
    }

    #[test]
    fn test_packet_too_large_error_display() {
        let err = ProtocolError::PacketTooLarge {
            size: 100_000,
            max: 65536,
        };
        assert_eq!(
            err.to_string(),
            "packet too large: 100000 bytes exceeds maximum of 65536 bytes"
        );
    }

    #[test]
    fn test_malformed_handle_error_display() {
        let err = ProtocolError::MalformedHandle(7);
        assert_eq!(err.to_string(), "malformed handle: expected 4 bytes, got 7");
    }

    #[test]
    fn test_from_io_error_timeout() {
        let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        let protocol_err: ProtocolError = io_err.into();
        assert!(matches!(protocol_err, ProtocolError::Timeout(_)));
    }

    #[test]
    fn test_from_io_error_connection_closed() {
        let io_err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let protocol_err: ProtocolError = io_err.into();
        assert!(protocol_err.is_disconnect());
    }

    #[test]
    fn test_from_io_error_other() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let protocol_err: ProtocolError = io_err.into();
        assert!(matches!(protocol_err, ProtocolError::Transport(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProtocolError>();
    }
}
