//! Authentication messages exchanged before the file-transfer session.
//!
//! Layouts follow the SSH user authentication protocol (RFC 4252). The
//! transport underneath is already encrypted and its peer is already known;
//! these messages only carry the device credential:
//!
//! - `user name` is the device identifier
//! - the `password` method's password is the device access token

use std::fmt;

use bytes::{BufMut, BytesMut};

use crate::error::{ProtocolError, Result};
use crate::wire::{parse_name_list, put_bool, put_name_list, put_string, WireReader};

/// `SSH_MSG_DISCONNECT`.
pub const MSG_DISCONNECT: u8 = 1;
/// `SSH_MSG_USERAUTH_REQUEST`.
pub const MSG_USERAUTH_REQUEST: u8 = 50;
/// `SSH_MSG_USERAUTH_FAILURE`.
pub const MSG_USERAUTH_FAILURE: u8 = 51;
/// `SSH_MSG_USERAUTH_SUCCESS`.
pub const MSG_USERAUTH_SUCCESS: u8 = 52;

/// Name of the only authentication method the server accepts.
pub const PASSWORD_METHOD: &str = "password";

/// Disconnect reason codes used by the server.
pub mod disconnect_reason {
    /// `SSH_DISCONNECT_PROTOCOL_ERROR`.
    pub const PROTOCOL_ERROR: u32 = 2;
    /// `SSH_DISCONNECT_BY_APPLICATION`.
    pub const BY_APPLICATION: u32 = 11;
    /// `SSH_DISCONNECT_NO_MORE_AUTH_METHODS_AVAILABLE`.
    pub const NO_MORE_AUTH_METHODS_AVAILABLE: u32 = 14;
}

/// The method part of an authentication request.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// The `none` method, usually sent to discover the allowed methods.
    None,
    /// The `password` method.
    Password {
        /// The presented password (the device access token).
        password: String,
    },
    /// The `password` method with the change flag set. Both passwords are
    /// discarded at decode time; the request is never a valid credential.
    PasswordChange,
    /// Any other method; its method-specific fields are ignored.
    Other {
        /// The method name as sent by the peer.
        name: String,
    },
}

impl AuthMethod {
    /// Wire name of the method.
    pub fn name(&self) -> &str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Password { .. } | AuthMethod::PasswordChange => PASSWORD_METHOD,
            AuthMethod::Other { name } => name,
        }
    }
}

// Never print secrets, even at trace level.
impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::None => f.write_str("None"),
            AuthMethod::Password { .. } => f
                .debug_struct("Password")
                .field("password", &"<redacted>")
                .finish(),
            AuthMethod::PasswordChange => f.write_str("PasswordChange"),
            AuthMethod::Other { name } => f.debug_struct("Other").field("name", name).finish(),
        }
    }
}

/// Messages of the authentication phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMessage {
    /// Client request to authenticate.
    Request {
        /// User name; carries the device identifier.
        username: String,
        /// Requested service name.
        service: String,
        /// Authentication method and its data.
        method: AuthMethod,
    },
    /// Authentication failed; lists the methods that may continue.
    Failure {
        /// Methods the peer may try next.
        methods: Vec<String>,
        /// Whether the previous request partially succeeded.
        partial_success: bool,
    },
    /// Authentication succeeded.
    Success,
    /// Either side is closing the connection.
    Disconnect {
        /// Reason code.
        reason: u32,
        /// Human-readable description.
        description: String,
    },
}

impl AuthMessage {
    /// A failure that tells the peer to retry with the password method.
    pub fn password_required() -> Self {
        AuthMessage::Failure {
            methods: vec![PASSWORD_METHOD.to_string()],
            partial_success: false,
        }
    }

    /// Decode an authentication-phase packet payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(payload);
        let packet_type = reader.read_u8("packet type")?;

        let message = match packet_type {
            MSG_USERAUTH_REQUEST => {
                let username = reader.read_string_lossy("user name")?;
                let service = reader.read_string("service name")?;
                let method_name = reader.read_string("method name")?;
                let method = match method_name.as_str() {
                    "none" => AuthMethod::None,
                    PASSWORD_METHOD => {
                        let change = reader.read_bool("password change flag")?;
                        let password = reader.read_string_lossy("password")?;
                        if change {
                            reader.read_string_lossy("new password")?;
                            AuthMethod::PasswordChange
                        } else {
                            AuthMethod::Password { password }
                        }
                    }
                    _ => {
                        reader.read_rest();
                        AuthMethod::Other { name: method_name }
                    }
                };
                AuthMessage::Request {
                    username,
                    service,
                    method,
                }
            }
            MSG_USERAUTH_FAILURE => {
                let methods = parse_name_list(&reader.read_string("methods")?);
                let partial_success = reader.read_bool("partial success")?;
                AuthMessage::Failure {
                    methods,
                    partial_success,
                }
            }
            MSG_USERAUTH_SUCCESS => AuthMessage::Success,
            MSG_DISCONNECT => {
                let reason = reader.read_u32("reason code")?;
                let description = reader.read_string_lossy("description")?;
                // Language tag is optional in practice.
                reader.read_rest();
                AuthMessage::Disconnect {
                    reason,
                    description,
                }
            }
            other => return Err(ProtocolError::UnexpectedPacketType(other)),
        };

        reader.finish()?;
        Ok(message)
    }

    /// Encode into a packet payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        match self {
            AuthMessage::Request {
                username,
                service,
                method,
            } => {
                buf.put_u8(MSG_USERAUTH_REQUEST);
                put_string(&mut buf, username);
                put_string(&mut buf, service);
                put_string(&mut buf, method.name());
                match method {
                    AuthMethod::Password { password } => {
                        put_bool(&mut buf, false);
                        put_string(&mut buf, password);
                    }
                    AuthMethod::PasswordChange => {
                        put_bool(&mut buf, true);
                        put_string(&mut buf, "");
                        put_string(&mut buf, "");
                    }
                    AuthMethod::None | AuthMethod::Other { .. } => {}
                }
            }
            AuthMessage::Failure {
                methods,
                partial_success,
            } => {
                buf.put_u8(MSG_USERAUTH_FAILURE);
                put_name_list(&mut buf, methods);
                put_bool(&mut buf, *partial_success);
            }
            AuthMessage::Success => buf.put_u8(MSG_USERAUTH_SUCCESS),
            AuthMessage::Disconnect {
                reason,
                description,
            } => {
                buf.put_u8(MSG_DISCONNECT);
                buf.put_u32(*reason);
                put_string(&mut buf, description);
                put_string(&mut buf, "");
            }
        }
        buf.to_vec()
    }
}
