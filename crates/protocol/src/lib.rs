//! # Depot Protocol Library
//!
//! Wire definitions for the Depot per-device file storage service.
//!
//! ## Overview
//!
//! A Depot connection runs over an already-secured transport and carries
//! two phases of length-prefixed packets:
//!
//! - **Authentication**: SSH user-authentication messages in which the user
//!   name is the device identifier and the password is its access token
//! - **File transfer**: SFTP version 3 packets for `OPEN`, `READ`, `WRITE`
//!   and `CLOSE`, answered with `STATUS`, `HANDLE` and `DATA`
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │    SFTP packets / Auth messages         │  messages, auth
//! ├─────────────────────────────────────────┤
//! │         SSH primitive encoding          │  wire
//! ├─────────────────────────────────────────┤
//! │              Framing                    │  u32 length prefix
//! ├─────────────────────────────────────────┤
//! │      Secured transport (terminated)     │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{ClientPacket, Frame, FrameCodec, OpenFlags, SftpRequest};
//! use protocol::messages::FileAttributes;
//!
//! let open = ClientPacket::Request(SftpRequest::Open {
//!     id: 1,
//!     filename: "notes.txt".to_string(),
//!     flags: OpenFlags::from_bits(OpenFlags::WRITE | OpenFlags::CREAT),
//!     attrs: FileAttributes::default(),
//! });
//!
//! let codec = FrameCodec::new();
//! let bytes = codec.encode(&Frame::new(open.encode())).unwrap();
//! let (frame, _) = codec.decode(&bytes).unwrap().unwrap();
//! assert_eq!(ClientPacket::decode(&frame.payload).unwrap(), open);
//! ```
//!
//! ## Modules
//!
//! - [`wire`]: SSH primitive types
//! - [`framing`]: Packet framing
//! - [`auth`]: Authentication-phase messages
//! - [`messages`]: SFTP packets
//! - [`error`]: Error types

pub mod auth;
pub mod error;
pub mod framing;
pub mod messages;
pub mod wire;

pub use auth::{AuthMessage, AuthMethod, PASSWORD_METHOD};
pub use error::{ProtocolError, Result};
pub use framing::{Frame, FrameCodec, FRAME_HEADER_SIZE, MAX_PACKET_SIZE};
pub use messages::{
    ClientPacket, HandleId, OpenFlags, SftpRequest, SftpResponse, StatusCode, HANDLE_LEN,
    SFTP_VERSION,
};
