//! Authentication exchange.
//!
//! Only the `password` method is offered. Any other method, and any request
//! to change the password, is answered with a failure naming `password`, up
//! to a retry limit. The first password attempt is final: a wrong credential
//! disconnects the peer.

use protocol::auth::disconnect_reason;
use protocol::{AuthMessage, AuthMethod, ProtocolError};
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

use super::transport::{PacketReader, PacketWriter};
use super::EngineError;
use crate::devices::{CredentialVerifier, DeviceDirectory};
use crate::session::{ConnectionState, StateMachine};

/// Peer-facing text for every rejected credential.
const REJECTED: &str = "Authentication failed";

/// Run the authentication exchange up to credential verification.
///
/// On success the connection is left in `Authenticating`; the caller prepares
/// the device root, sends `USERAUTH_SUCCESS` and moves to `Ready`.
pub async fn authenticate<R, W, D>(
    reader: &mut PacketReader<R>,
    writer: &mut PacketWriter<W>,
    verifier: &CredentialVerifier<D>,
    state: &mut StateMachine,
    max_retries: u32,
) -> Result<Uuid, EngineError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    D: DeviceDirectory,
{
    let mut retries = 0u32;

    loop {
        let payload = reader.read_packet().await?.ok_or_else(|| {
            ProtocolError::ConnectionClosed("peer closed during authentication".to_string())
        })?;

        let message = match AuthMessage::decode(&payload) {
            Ok(message) => message,
            Err(e) => {
                disconnect(writer, disconnect_reason::PROTOCOL_ERROR, "Protocol error").await;
                return Err(e.into());
            }
        };

        let (username, method) = match message {
            AuthMessage::Request {
                username, method, ..
            } => (username, method),
            AuthMessage::Disconnect { reason, .. } => {
                return Err(ProtocolError::ConnectionClosed(format!(
                    "peer disconnected during authentication (reason {reason})"
                ))
                .into());
            }
            AuthMessage::Failure { .. } | AuthMessage::Success => {
                disconnect(writer, disconnect_reason::PROTOCOL_ERROR, "Protocol error").await;
                return Err(ProtocolError::Malformed(
                    "server-side authentication message from peer".to_string(),
                )
                .into());
            }
        };

        if state.state() == ConnectionState::Unauthenticated {
            state.transition(ConnectionState::Authenticating)?;
        }

        match method {
            AuthMethod::Password { password } => {
                return match verifier.verify(&username, &password).await {
                    Some(device_id) => Ok(device_id),
                    None => {
                        disconnect(
                            writer,
                            disconnect_reason::NO_MORE_AUTH_METHODS_AVAILABLE,
                            REJECTED,
                        )
                        .await;
                        Err(EngineError::AuthenticationRejected)
                    }
                };
            }
            other => {
                retries += 1;
                tracing::debug!(method = other.name(), retries, "Rejecting non-password method");
                if retries > max_retries {
                    disconnect(
                        writer,
                        disconnect_reason::NO_MORE_AUTH_METHODS_AVAILABLE,
                        REJECTED,
                    )
                    .await;
                    return Err(EngineError::AuthenticationRejected);
                }
                writer
                    .write_packet(&AuthMessage::password_required().encode())
                    .await?;
            }
        }
    }
}

/// Best-effort disconnect notice; the connection is closing either way.
pub(crate) async fn disconnect<W: AsyncWrite + Unpin>(
    writer: &mut PacketWriter<W>,
    reason: u32,
    description: &str,
) {
    let message = AuthMessage::Disconnect {
        reason,
        description: description.to_string(),
    };
    if let Err(e) = writer.write_packet(&message.encode()).await {
        tracing::trace!(error = %e, "Failed to send disconnect");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::MemoryDirectory;
    use protocol::FrameCodec;
    use std::sync::Arc;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    struct Harness {
        server_reader: PacketReader<ReadHalf<DuplexStream>>,
        server_writer: PacketWriter<WriteHalf<DuplexStream>>,
        client_reader: PacketReader<ReadHalf<DuplexStream>>,
        client_writer: PacketWriter<WriteHalf<DuplexStream>>,
    }

    fn harness() -> Harness {
        let (client, server) = tokio::io::duplex(4096);
        let (sr, sw) = tokio::io::split(server);
        let (cr, cw) = tokio::io::split(client);
        Harness {
            server_reader: PacketReader::new(sr, FrameCodec::new()),
            server_writer: PacketWriter::new(sw, FrameCodec::new()),
            client_reader: PacketReader::new(cr, FrameCodec::new()),
            client_writer: PacketWriter::new(cw, FrameCodec::new()),
        }
    }

    fn request(username: &str, method: AuthMethod) -> Vec<u8> {
        AuthMessage::Request {
            username: username.to_string(),
            service: "ssh-connection".to_string(),
            method,
        }
        .encode()
    }

    fn password(value: &str) -> AuthMethod {
        AuthMethod::Password {
            password: value.to_string(),
        }
    }

    async fn next_message(reader: &mut PacketReader<ReadHalf<DuplexStream>>) -> AuthMessage {
        let payload = reader.read_packet().await.unwrap().unwrap();
        AuthMessage::decode(&payload).unwrap()
    }

    #[tokio::test]
    async fn test_none_method_then_password_succeeds() {
        let directory = Arc::new(MemoryDirectory::new());
        let credential = directory.register("tablet").unwrap();
        let verifier = CredentialVerifier::new(directory);
        let mut h = harness();
        let mut state = StateMachine::new();

        let user = credential.device_id.to_string();
        h.client_writer
            .write_packet(&request(&user, AuthMethod::None))
            .await
            .unwrap();
        h.client_writer
            .write_packet(&request(&user, password(&credential.access_token.to_string())))
            .await
            .unwrap();

        let result = authenticate(
            &mut h.server_reader,
            &mut h.server_writer,
            &verifier,
            &mut state,
            3,
        )
        .await
        .unwrap();

        assert_eq!(result, credential.device_id);
        assert_eq!(state.state(), ConnectionState::Authenticating);
        assert_eq!(
            next_message(&mut h.client_reader).await,
            AuthMessage::password_required()
        );
    }

    #[tokio::test]
    async fn test_password_change_is_rejected_not_verified() {
        let directory = Arc::new(MemoryDirectory::new());
        let credential = directory.register("tablet").unwrap();
        let verifier = CredentialVerifier::new(directory);
        let mut h = harness();
        let mut state = StateMachine::new();

        let user = credential.device_id.to_string();
        h.client_writer
            .write_packet(&request(&user, AuthMethod::PasswordChange))
            .await
            .unwrap();
        h.client_writer
            .write_packet(&request(&user, password(&credential.access_token.to_string())))
            .await
            .unwrap();

        let result = authenticate(
            &mut h.server_reader,
            &mut h.server_writer,
            &verifier,
            &mut state,
            3,
        )
        .await
        .unwrap();

        // The change request only earned a retry; the plain attempt authenticated.
        assert_eq!(result, credential.device_id);
        assert_eq!(
            next_message(&mut h.client_reader).await,
            AuthMessage::password_required()
        );
    }

    #[tokio::test]
    async fn test_wrong_token_disconnects() {
        let directory = Arc::new(MemoryDirectory::new());
        let credential = directory.register("tablet").unwrap();
        let verifier = CredentialVerifier::new(directory);
        let mut h = harness();
        let mut state = StateMachine::new();

        h.client_writer
            .write_packet(&request(
                &credential.device_id.to_string(),
                password(&Uuid::new_v4().to_string()),
            ))
            .await
            .unwrap();

        let err = authenticate(
            &mut h.server_reader,
            &mut h.server_writer,
            &verifier,
            &mut state,
            3,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::AuthenticationRejected));

        match next_message(&mut h.client_reader).await {
            AuthMessage::Disconnect {
                reason,
                description,
            } => {
                assert_eq!(reason, disconnect_reason::NO_MORE_AUTH_METHODS_AVAILABLE);
                assert_eq!(description, REJECTED);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_device_looks_like_wrong_token() {
        let verifier = CredentialVerifier::new(Arc::new(MemoryDirectory::new()));
        let mut h = harness();
        let mut state = StateMachine::new();

        h.client_writer
            .write_packet(&request("not-a-uuid", password("whatever")))
            .await
            .unwrap();

        let err = authenticate(
            &mut h.server_reader,
            &mut h.server_writer,
            &verifier,
            &mut state,
            3,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::AuthenticationRejected));
        assert!(matches!(
            next_message(&mut h.client_reader).await,
            AuthMessage::Disconnect { description, .. } if description == REJECTED
        ));
    }

    #[tokio::test]
    async fn test_retry_limit() {
        let verifier = CredentialVerifier::new(Arc::new(MemoryDirectory::new()));
        let mut h = harness();
        let mut state = StateMachine::new();

        for _ in 0..3 {
            h.client_writer
                .write_packet(&request(
                    "dev",
                    AuthMethod::Other {
                        name: "publickey".to_string(),
                    },
                ))
                .await
                .unwrap();
        }

        let err = authenticate(
            &mut h.server_reader,
            &mut h.server_writer,
            &verifier,
            &mut state,
            2,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::AuthenticationRejected));

        assert_eq!(
            next_message(&mut h.client_reader).await,
            AuthMessage::password_required()
        );
        assert_eq!(
            next_message(&mut h.client_reader).await,
            AuthMessage::password_required()
        );
        assert!(matches!(
            next_message(&mut h.client_reader).await,
            AuthMessage::Disconnect { .. }
        ));
    }

    #[tokio::test]
    async fn test_garbage_is_protocol_error() {
        let verifier = CredentialVerifier::new(Arc::new(MemoryDirectory::new()));
        let mut h = harness();
        let mut state = StateMachine::new();

        h.client_writer.write_packet(&[0xEE, 1, 2]).await.unwrap();

        let err = authenticate(
            &mut h.server_reader,
            &mut h.server_writer,
            &verifier,
            &mut state,
            3,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::Protocol(_)));
        assert_eq!(state.state(), ConnectionState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_peer_close_is_disconnect() {
        let verifier = CredentialVerifier::new(Arc::new(MemoryDirectory::new()));
        let h = harness();
        let Harness {
            mut server_reader,
            mut server_writer,
            client_reader,
            client_writer,
        } = h;
        drop(client_reader);
        drop(client_writer);
        let mut state = StateMachine::new();

        let err = authenticate(
            &mut server_reader,
            &mut server_writer,
            &verifier,
            &mut state,
            3,
        )
        .await
        .unwrap_err();
        assert!(err.is_disconnect());
    }
}
