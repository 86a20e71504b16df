//! Per-connection driver.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use protocol::auth::disconnect_reason;
use protocol::{
    AuthMessage, ClientPacket, FrameCodec, ProtocolError, SftpResponse, SFTP_VERSION,
};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::auth::{authenticate, disconnect};
use super::transport::{PacketReader, PacketWriter};
use super::{EngineContext, EngineError};
use crate::devices::DeviceDirectory;
use crate::files::ensure_device_root;
use crate::server::ServerEvent;
use crate::session::{ConnectionState, Session, StateMachine};

/// What happened on a connection that authenticated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSummary {
    /// The authenticated device.
    pub device_id: Uuid,
    /// File requests answered.
    pub requests: u64,
    /// Handles still open when the connection ended.
    pub handles_closed: usize,
}

/// How the request loop ended.
enum LoopExit {
    /// Peer closed the stream between packets.
    PeerClosed,
    /// Server shutdown or writer failure.
    Cancelled,
    /// Fatal protocol error.
    Failed(EngineError),
}

/// Serve one connection until it closes.
///
/// Returns an error if authentication or negotiation fails or the peer
/// violates the protocol. Every handle the session opened is closed before
/// this returns, whatever the outcome.
pub async fn serve_connection<S, D>(
    stream: S,
    context: Arc<EngineContext<D>>,
    peer: String,
    shutdown: CancellationToken,
) -> Result<ConnectionSummary, EngineError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    D: DeviceDirectory,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let codec = FrameCodec::new();
    let mut reader = PacketReader::new(read_half, codec.clone());
    let mut writer = PacketWriter::new(write_half, codec);
    let mut state = StateMachine::new();

    let handshake = tokio::time::timeout(
        context.settings.handshake_timeout,
        handshake(&mut reader, &mut writer, &context, &mut state),
    );
    let session = tokio::select! {
        _ = shutdown.cancelled() => {
            state.close();
            return Err(ProtocolError::ConnectionClosed("server shutting down".to_string()).into());
        }
        result = handshake => match result {
            Ok(Ok(session)) => Arc::new(session),
            Ok(Err(e)) => {
                state.close();
                if matches!(e, EngineError::AuthenticationRejected) {
                    tracing::info!(peer = %peer, "Authentication rejected");
                    context.emit(ServerEvent::AuthenticationRejected { peer });
                }
                return Err(e);
            }
            Err(_) => {
                state.close();
                disconnect(&mut writer, disconnect_reason::BY_APPLICATION, "Timeout").await;
                return Err(EngineError::HandshakeTimeout);
            }
        },
    };

    let device_id = session.device_id();
    tracing::info!(device_id = %device_id, peer = %peer, "Device connected");
    context.emit(ServerEvent::DeviceConnected {
        device_id,
        peer: peer.clone(),
    });

    let requests = Arc::new(AtomicU64::new(0));
    let exit = request_loop(
        &mut reader,
        writer,
        Arc::clone(&session),
        &context,
        &requests,
        &shutdown,
    )
    .await;

    let handles_closed = session.teardown().await;
    state.close();

    let reason = match &exit {
        LoopExit::PeerClosed => "peer closed connection".to_string(),
        LoopExit::Cancelled => "connection cancelled".to_string(),
        LoopExit::Failed(e) => e.to_string(),
    };
    tracing::info!(
        device_id = %device_id,
        requests = requests.load(Ordering::Relaxed),
        handles_closed,
        reason = %reason,
        "Device disconnected"
    );
    context.emit(ServerEvent::DeviceDisconnected { device_id, reason });

    match exit {
        LoopExit::Failed(e) if !e.is_disconnect() => Err(e),
        _ => Ok(ConnectionSummary {
            device_id,
            requests: requests.load(Ordering::Relaxed),
            handles_closed,
        }),
    }
}

/// Authenticate, prepare storage and negotiate the SFTP version.
async fn handshake<R, W, D>(
    reader: &mut PacketReader<R>,
    writer: &mut PacketWriter<W>,
    context: &EngineContext<D>,
    state: &mut StateMachine,
) -> Result<Session, EngineError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    D: DeviceDirectory,
{
    let device_id = authenticate(
        reader,
        writer,
        &context.verifier,
        state,
        context.settings.max_auth_retries,
    )
    .await?;

    let root = match ensure_device_root(&context.settings.storage_root, &device_id).await {
        Ok(root) => root,
        Err(e) => {
            tracing::error!(device_id = %device_id, error = %e, "Failed to prepare device storage");
            disconnect(writer, disconnect_reason::BY_APPLICATION, "Service unavailable").await;
            return Err(e.into());
        }
    };

    state.transition(ConnectionState::Ready)?;
    writer.write_packet(&AuthMessage::Success.encode()).await?;

    let payload = reader.read_packet().await?.ok_or_else(|| {
        ProtocolError::ConnectionClosed("peer closed before version negotiation".to_string())
    })?;
    match ClientPacket::decode(&payload)? {
        ClientPacket::Init { version } => {
            tracing::debug!(device_id = %device_id, client_version = version, "Negotiated SFTP");
        }
        ClientPacket::Request(request) => {
            return Err(ProtocolError::Malformed(format!(
                "{} request before INIT",
                request.kind()
            ))
            .into());
        }
    }
    writer
        .write_packet(
            &SftpResponse::Version {
                version: SFTP_VERSION,
            }
            .encode(),
        )
        .await?;

    Ok(Session::new(device_id, root, context.settings.limits))
}

/// Read requests and dispatch them concurrently until the connection ends.
async fn request_loop<R, W, D>(
    reader: &mut PacketReader<ReadHalf<R>>,
    writer: PacketWriter<WriteHalf<W>>,
    session: Arc<Session>,
    context: &EngineContext<D>,
    requests: &Arc<AtomicU64>,
    shutdown: &CancellationToken,
) -> LoopExit
where
    R: AsyncRead,
    W: AsyncWrite + Send + 'static,
    D: DeviceDirectory,
{
    let limit = context.settings.max_inflight_requests;
    let permits = Arc::new(Semaphore::new(limit));
    let (tx, rx) = mpsc::channel::<SftpResponse>(limit);
    let cancel = shutdown.child_token();
    let writer_task = tokio::spawn(write_responses(writer, rx, cancel.clone()));
    let mut tasks = JoinSet::new();

    let exit = loop {
        // Reap finished requests so the set does not grow.
        while tasks.try_join_next().is_some() {}

        let payload = tokio::select! {
            _ = cancel.cancelled() => break LoopExit::Cancelled,
            result = reader.read_packet() => match result {
                Ok(Some(payload)) => payload,
                Ok(None) => break LoopExit::PeerClosed,
                Err(e) => break LoopExit::Failed(e.into()),
            },
        };

        let request = match ClientPacket::decode(&payload) {
            Ok(ClientPacket::Request(request)) => request,
            Ok(ClientPacket::Init { .. }) => {
                break LoopExit::Failed(
                    ProtocolError::Malformed("repeated INIT".to_string()).into(),
                )
            }
            Err(e) => break LoopExit::Failed(e.into()),
        };

        let permit = tokio::select! {
            _ = cancel.cancelled() => break LoopExit::Cancelled,
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break LoopExit::Cancelled,
            },
        };

        tracing::trace!(
            device_id = %session.device_id(),
            request_id = request.id(),
            request = request.kind(),
            "Dispatching request"
        );

        let session = Arc::clone(&session);
        let tx = tx.clone();
        let requests = Arc::clone(requests);
        tasks.spawn(async move {
            let response = session.dispatch(request).await;
            requests.fetch_add(1, Ordering::Relaxed);
            // The writer is gone only if the connection is already closing.
            let _ = tx.send(response).await;
            drop(permit);
        });
    };

    match exit {
        // Let accepted requests finish and answer before closing.
        LoopExit::PeerClosed => while tasks.join_next().await.is_some() {},
        _ => tasks.shutdown().await,
    }

    drop(tx);
    if let Err(e) = writer_task.await {
        tracing::warn!(error = %e, "Response writer task failed");
    }

    exit
}

/// Send responses in completion order.
async fn write_responses<W: AsyncWrite>(
    mut writer: PacketWriter<WriteHalf<W>>,
    mut rx: mpsc::Receiver<SftpResponse>,
    cancel: CancellationToken,
) {
    while let Some(response) = rx.recv().await {
        if let Err(e) = writer.write_packet(&response.encode()).await {
            tracing::debug!(error = %e, "Failed to write response");
            cancel.cancel();
            return;
        }
    }
    let _ = writer.shutdown().await;
}
