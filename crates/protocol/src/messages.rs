//! SFTP version 3 packet definitions.
//!
//! Only the subset needed for per-device file storage is modeled in full:
//! `INIT`/`VERSION` negotiation, `OPEN`, `READ`, `WRITE`, `CLOSE` and the
//! `STATUS`, `HANDLE` and `DATA` responses. Every other request type is
//! surfaced as [`SftpRequest::Unsupported`] so the server can answer it
//! without dropping the session.
//!
//! Handles are always exactly four bytes: a big-endian `u32` chosen by the
//! server. See [`HandleId`].

use bytes::{BufMut, BytesMut};

use crate::error::{ProtocolError, Result};
use crate::wire::{put_bytes, put_string, WireReader};

/// Protocol version spoken by the server.
pub const SFTP_VERSION: u32 = 3;

/// Wire width of a handle.
pub const HANDLE_LEN: usize = 4;

/// SFTP packet type numbers.
pub mod packet_type {
    /// `SSH_FXP_INIT`.
    pub const INIT: u8 = 1;
    /// `SSH_FXP_VERSION`.
    pub const VERSION: u8 = 2;
    /// `SSH_FXP_OPEN`.
    pub const OPEN: u8 = 3;
    /// `SSH_FXP_CLOSE`.
    pub const CLOSE: u8 = 4;
    /// `SSH_FXP_READ`.
    pub const READ: u8 = 5;
    /// `SSH_FXP_WRITE`.
    pub const WRITE: u8 = 6;
    /// `SSH_FXP_STATUS`.
    pub const STATUS: u8 = 101;
    /// `SSH_FXP_HANDLE`.
    pub const HANDLE: u8 = 102;
    /// `SSH_FXP_DATA`.
    pub const DATA: u8 = 103;
}

/// A server-issued file handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u32);

impl HandleId {
    /// Wrap a raw handle number.
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    /// The raw handle number.
    pub fn value(self) -> u32 {
        self.0
    }

    /// Parse a handle as sent by the peer.
    ///
    /// Anything other than exactly [`HANDLE_LEN`] bytes is malformed.
    pub fn from_wire(raw: &[u8]) -> Result<Self> {
        let bytes: [u8; HANDLE_LEN] = raw
            .try_into()
            .map_err(|_| ProtocolError::MalformedHandle(raw.len()))?;
        Ok(Self(u32::from_be_bytes(bytes)))
    }

    /// Big-endian wire form.
    pub fn to_wire(self) -> [u8; HANDLE_LEN] {
        self.0.to_be_bytes()
    }
}

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `pflags` of an `OPEN` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags(u32);

impl OpenFlags {
    /// `SSH_FXF_READ`.
    pub const READ: u32 = 0x0000_0001;
    /// `SSH_FXF_WRITE`.
    pub const WRITE: u32 = 0x0000_0002;
    /// `SSH_FXF_APPEND`.
    pub const APPEND: u32 = 0x0000_0004;
    /// `SSH_FXF_CREAT`.
    pub const CREAT: u32 = 0x0000_0008;
    /// `SSH_FXF_TRUNC`.
    pub const TRUNC: u32 = 0x0000_0010;
    /// `SSH_FXF_EXCL`.
    pub const EXCL: u32 = 0x0000_0020;

    /// Create flags from the raw wire value.
    #[inline]
    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw wire value.
    #[inline]
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Check whether every bit of `flag` is set.
    #[inline]
    pub fn contains(self, flag: u32) -> bool {
        self.0 & flag == flag
    }

    /// Return a new flags value with `flag` added.
    #[inline]
    pub fn with(self, flag: u32) -> Self {
        Self(self.0 | flag)
    }

    /// Whether the open requests read access.
    pub fn is_read(self) -> bool {
        self.contains(Self::READ)
    }

    /// Whether the open requests write access.
    pub fn is_write(self) -> bool {
        self.contains(Self::WRITE)
    }
}

/// File attributes (`ATTRS`) as carried by `OPEN`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileAttributes {
    /// File size.
    pub size: Option<u64>,
    /// Owner and group ids.
    pub uid_gid: Option<(u32, u32)>,
    /// POSIX permission bits.
    pub permissions: Option<u32>,
    /// Access and modification times.
    pub times: Option<(u32, u32)>,
    /// Extended attribute pairs.
    pub extended: Vec<(String, String)>,
}

impl FileAttributes {
    const SIZE: u32 = 0x0000_0001;
    const UIDGID: u32 = 0x0000_0002;
    const PERMISSIONS: u32 = 0x0000_0004;
    const ACMODTIME: u32 = 0x0000_0008;
    const EXTENDED: u32 = 0x8000_0000;

    fn decode(reader: &mut WireReader<'_>) -> Result<Self> {
        let flags = reader.read_u32("attr flags")?;
        let mut attrs = FileAttributes::default();

        if flags & Self::SIZE != 0 {
            attrs.size = Some(reader.read_u64("attr size")?);
        }
        if flags & Self::UIDGID != 0 {
            attrs.uid_gid = Some((reader.read_u32("attr uid")?, reader.read_u32("attr gid")?));
        }
        if flags & Self::PERMISSIONS != 0 {
            attrs.permissions = Some(reader.read_u32("attr permissions")?);
        }
        if flags & Self::ACMODTIME != 0 {
            attrs.times = Some((
                reader.read_u32("attr atime")?,
                reader.read_u32("attr mtime")?,
            ));
        }
        if flags & Self::EXTENDED != 0 {
            let count = reader.read_u32("attr extended count")?;
            for _ in 0..count {
                let name = reader.read_string_lossy("attr extended type")?;
                let value = reader.read_string_lossy("attr extended data")?;
                attrs.extended.push((name, value));
            }
        }
        Ok(attrs)
    }

    fn encode(&self, buf: &mut BytesMut) {
        let mut flags = 0;
        if self.size.is_some() {
            flags |= Self::SIZE;
        }
        if self.uid_gid.is_some() {
            flags |= Self::UIDGID;
        }
        if self.permissions.is_some() {
            flags |= Self::PERMISSIONS;
        }
        if self.times.is_some() {
            flags |= Self::ACMODTIME;
        }
        if !self.extended.is_empty() {
            flags |= Self::EXTENDED;
        }

        buf.put_u32(flags);
        if let Some(size) = self.size {
            buf.put_u64(size);
        }
        if let Some((uid, gid)) = self.uid_gid {
            buf.put_u32(uid);
            buf.put_u32(gid);
        }
        if let Some(permissions) = self.permissions {
            buf.put_u32(permissions);
        }
        if let Some((atime, mtime)) = self.times {
            buf.put_u32(atime);
            buf.put_u32(mtime);
        }
        if !self.extended.is_empty() {
            buf.put_u32(self.extended.len() as u32);
            for (name, value) in &self.extended {
                put_string(buf, name);
                put_string(buf, value);
            }
        }
    }
}

/// Status codes of `SSH_FXP_STATUS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StatusCode {
    /// `SSH_FX_OK`.
    Ok = 0,
    /// `SSH_FX_EOF`.
    Eof = 1,
    /// `SSH_FX_NO_SUCH_FILE`.
    NoSuchFile = 2,
    /// `SSH_FX_PERMISSION_DENIED`.
    PermissionDenied = 3,
    /// `SSH_FX_FAILURE`.
    Failure = 4,
    /// `SSH_FX_BAD_MESSAGE`.
    BadMessage = 5,
    /// `SSH_FX_NO_CONNECTION`.
    NoConnection = 6,
    /// `SSH_FX_CONNECTION_LOST`.
    ConnectionLost = 7,
    /// `SSH_FX_OP_UNSUPPORTED`.
    OpUnsupported = 8,
}

impl StatusCode {
    /// Parse a wire status code.
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => StatusCode::Ok,
            1 => StatusCode::Eof,
            2 => StatusCode::NoSuchFile,
            3 => StatusCode::PermissionDenied,
            4 => StatusCode::Failure,
            5 => StatusCode::BadMessage,
            6 => StatusCode::NoConnection,
            7 => StatusCode::ConnectionLost,
            8 => StatusCode::OpUnsupported,
            _ => return None,
        })
    }

    /// Generic peer-facing text for this status.
    pub fn default_message(self) -> &'static str {
        match self {
            StatusCode::Ok => "Success",
            StatusCode::Eof => "End of file",
            StatusCode::NoSuchFile => "No such file",
            StatusCode::PermissionDenied => "Permission denied",
            StatusCode::Failure => "Failure",
            StatusCode::BadMessage => "Bad message",
            StatusCode::NoConnection => "No connection",
            StatusCode::ConnectionLost => "Connection lost",
            StatusCode::OpUnsupported => "Operation unsupported",
        }
    }
}

/// Packets a client sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientPacket {
    /// `SSH_FXP_INIT`: version negotiation.
    Init {
        /// Highest version the client supports.
        version: u32,
    },
    /// A request carrying a request id.
    Request(SftpRequest),
}

/// File-operation requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SftpRequest {
    /// `SSH_FXP_OPEN`.
    Open {
        /// Request id.
        id: u32,
        /// Requested path, relative to the session root.
        filename: String,
        /// Open flags.
        flags: OpenFlags,
        /// Initial attributes.
        attrs: FileAttributes,
    },
    /// `SSH_FXP_CLOSE`.
    Close {
        /// Request id.
        id: u32,
        /// Raw handle bytes as received.
        handle: Vec<u8>,
    },
    /// `SSH_FXP_READ`.
    Read {
        /// Request id.
        id: u32,
        /// Raw handle bytes as received.
        handle: Vec<u8>,
        /// Byte offset.
        offset: u64,
        /// Maximum number of bytes to return.
        len: u32,
    },
    /// `SSH_FXP_WRITE`.
    Write {
        /// Request id.
        id: u32,
        /// Raw handle bytes as received.
        handle: Vec<u8>,
        /// Byte offset.
        offset: u64,
        /// Bytes to write.
        data: Vec<u8>,
    },
    /// Any other request type; the body is not interpreted.
    Unsupported {
        /// Packet type byte.
        packet_type: u8,
        /// Request id.
        id: u32,
    },
}

impl SftpRequest {
    /// Request id used to correlate the response.
    pub fn id(&self) -> u32 {
        match self {
            SftpRequest::Open { id, .. }
            | SftpRequest::Close { id, .. }
            | SftpRequest::Read { id, .. }
            | SftpRequest::Write { id, .. }
            | SftpRequest::Unsupported { id, .. } => *id,
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            SftpRequest::Open { .. } => "open",
            SftpRequest::Close { .. } => "close",
            SftpRequest::Read { .. } => "read",
            SftpRequest::Write { .. } => "write",
            SftpRequest::Unsupported { .. } => "unsupported",
        }
    }
}

impl ClientPacket {
    /// Decode a client packet payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(payload);
        let kind = reader.read_u8("packet type")?;

        let packet = match kind {
            packet_type::INIT => {
                let version = reader.read_u32("version")?;
                // Extension pairs are accepted and ignored.
                reader.read_rest();
                ClientPacket::Init { version }
            }
            packet_type::OPEN => {
                let id = reader.read_u32("request id")?;
                let filename = reader.read_string_lossy("filename")?;
                let flags = OpenFlags::from_bits(reader.read_u32("pflags")?);
                let attrs = FileAttributes::decode(&mut reader)?;
                ClientPacket::Request(SftpRequest::Open {
                    id,
                    filename,
                    flags,
                    attrs,
                })
            }
            packet_type::CLOSE => {
                let id = reader.read_u32("request id")?;
                let handle = reader.read_bytes("handle")?.to_vec();
                ClientPacket::Request(SftpRequest::Close { id, handle })
            }
            packet_type::READ => {
                let id = reader.read_u32("request id")?;
                let handle = reader.read_bytes("handle")?.to_vec();
                let offset = reader.read_u64("offset")?;
                let len = reader.read_u32("length")?;
                ClientPacket::Request(SftpRequest::Read {
                    id,
                    handle,
                    offset,
                    len,
                })
            }
            packet_type::WRITE => {
                let id = reader.read_u32("request id")?;
                let handle = reader.read_bytes("handle")?.to_vec();
                let offset = reader.read_u64("offset")?;
                let data = reader.read_bytes("data")?.to_vec();
                ClientPacket::Request(SftpRequest::Write {
                    id,
                    handle,
                    offset,
                    data,
                })
            }
            packet_type::VERSION
            | packet_type::STATUS
            | packet_type::HANDLE
            | packet_type::DATA => return Err(ProtocolError::UnexpectedPacketType(kind)),
            other => {
                let id = reader.read_u32("request id")?;
                reader.read_rest();
                ClientPacket::Request(SftpRequest::Unsupported {
                    packet_type: other,
                    id,
                })
            }
        };

        reader.finish()?;
        Ok(packet)
    }

    /// Encode into a packet payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        match self {
            ClientPacket::Init { version } => {
                buf.put_u8(packet_type::INIT);
                buf.put_u32(*version);
            }
            ClientPacket::Request(SftpRequest::Open {
                id,
                filename,
                flags,
                attrs,
            }) => {
                buf.put_u8(packet_type::OPEN);
                buf.put_u32(*id);
                put_string(&mut buf, filename);
                buf.put_u32(flags.bits());
                attrs.encode(&mut buf);
            }
            ClientPacket::Request(SftpRequest::Close { id, handle }) => {
                buf.put_u8(packet_type::CLOSE);
                buf.put_u32(*id);
                put_bytes(&mut buf, handle);
            }
            ClientPacket::Request(SftpRequest::Read {
                id,
                handle,
                offset,
                len,
            }) => {
                buf.put_u8(packet_type::READ);
                buf.put_u32(*id);
                put_bytes(&mut buf, handle);
                buf.put_u64(*offset);
                buf.put_u32(*len);
            }
            ClientPacket::Request(SftpRequest::Write {
                id,
                handle,
                offset,
                data,
            }) => {
                buf.put_u8(packet_type::WRITE);
                buf.put_u32(*id);
                put_bytes(&mut buf, handle);
                buf.put_u64(*offset);
                put_bytes(&mut buf, data);
            }
            ClientPacket::Request(SftpRequest::Unsupported { packet_type, id }) => {
                buf.put_u8(*packet_type);
                buf.put_u32(*id);
            }
        }
        buf.to_vec()
    }
}

/// Packets the server sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SftpResponse {
    /// `SSH_FXP_VERSION`.
    Version {
        /// Negotiated version.
        version: u32,
    },
    /// `SSH_FXP_STATUS`.
    Status {
        /// Request id.
        id: u32,
        /// Status code.
        code: StatusCode,
        /// Human-readable message; always generic.
        message: String,
    },
    /// `SSH_FXP_HANDLE`.
    Handle {
        /// Request id.
        id: u32,
        /// The new handle.
        handle: HandleId,
    },
    /// `SSH_FXP_DATA`.
    Data {
        /// Request id.
        id: u32,
        /// Bytes read.
        data: Vec<u8>,
    },
}

impl SftpResponse {
    /// A status response with the code's generic message.
    pub fn status(id: u32, code: StatusCode) -> Self {
        SftpResponse::Status {
            id,
            code,
            message: code.default_message().to_string(),
        }
    }

    /// Shorthand for `STATUS OK`.
    pub fn ok(id: u32) -> Self {
        Self::status(id, StatusCode::Ok)
    }

    /// Shorthand for `STATUS FAILURE`.
    pub fn failure(id: u32) -> Self {
        Self::status(id, StatusCode::Failure)
    }

    /// Request id this response answers, if any.
    pub fn id(&self) -> Option<u32> {
        match self {
            SftpResponse::Version { .. } => None,
            SftpResponse::Status { id, .. }
            | SftpResponse::Handle { id, .. }
            | SftpResponse::Data { id, .. } => Some(*id),
        }
    }

    /// Status code, if this is a status response.
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            SftpResponse::Status { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Encode into a packet payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        match self {
            SftpResponse::Version { version } => {
                buf.put_u8(packet_type::VERSION);
                buf.put_u32(*version);
            }
            SftpResponse::Status { id, code, message } => {
                buf.put_u8(packet_type::STATUS);
                buf.put_u32(*id);
                buf.put_u32(*code as u32);
                put_string(&mut buf, message);
                put_string(&mut buf, "en");
            }
            SftpResponse::Handle { id, handle } => {
                buf.put_u8(packet_type::HANDLE);
                buf.put_u32(*id);
                put_bytes(&mut buf, &handle.to_wire());
            }
            SftpResponse::Data { id, data } => {
                buf.put_u8(packet_type::DATA);
                buf.put_u32(*id);
                put_bytes(&mut buf, data);
            }
        }
        buf.to_vec()
    }

    /// Decode a server packet payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(payload);
        let kind = reader.read_u8("packet type")?;

        let response = match kind {
            packet_type::VERSION => {
                let version = reader.read_u32("version")?;
                reader.read_rest();
                SftpResponse::Version { version }
            }
            packet_type::STATUS => {
                let id = reader.read_u32("request id")?;
                let raw = reader.read_u32("status code")?;
                let code = StatusCode::from_u32(raw)
                    .ok_or_else(|| ProtocolError::Malformed(format!("unknown status {raw}")))?;
                let message = reader.read_string_lossy("message")?;
                reader.read_rest();
                SftpResponse::Status { id, code, message }
            }
            packet_type::HANDLE => {
                let id = reader.read_u32("request id")?;
                let handle = HandleId::from_wire(reader.read_bytes("handle")?)?;
                SftpResponse::Handle { id, handle }
            }
            packet_type::DATA => {
                let id = reader.read_u32("request id")?;
                let data = reader.read_bytes("data")?.to_vec();
                SftpResponse::Data { id, data }
            }
            other => return Err(ProtocolError::UnexpectedPacketType(other)),
        };

        reader.finish()?;
        Ok(response)
    }
}
