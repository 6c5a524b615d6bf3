//! Bridge runtime: the client socket, the per-connection lifecycle and
//! shutdown cleanup.

use std::fmt;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::bridge::Bridge;
use crate::dispatch::dispatch;
use crate::error::{BridgeError, ProtocolError};
use crate::janitor::{SocketJanitor, remove_socket_file};
use crate::monitors::{MonitorKind, supervise};
use crate::protocol::{OutboundMessage, decode_line};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Connecting,
    Enumerating,
    SendingConfig,
    Ready,
    Running,
    Closed,
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionPhase::Connecting => "connecting",
            ConnectionPhase::Enumerating => "enumerating",
            ConnectionPhase::SendingConfig => "sending-config",
            ConnectionPhase::Ready => "ready",
            ConnectionPhase::Running => "running",
            ConnectionPhase::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Current phase of one connection; every transition is logged.
struct PhaseTracker<'a> {
    conn_id: &'a str,
    phase: ConnectionPhase,
}

impl<'a> PhaseTracker<'a> {
    fn new(conn_id: &'a str) -> Self {
        info!(conn_id = %conn_id, "Connection phase: {}", ConnectionPhase::Connecting);
        Self {
            conn_id,
            phase: ConnectionPhase::Connecting,
        }
    }

    fn advance(&mut self, next: ConnectionPhase) {
        info!(conn_id = %self.conn_id, "Connection phase: {} -> {}", self.phase, next);
        self.phase = next;
    }
}

/// Listens on the bridge socket and serves one client at a time.
pub struct BridgeServer {
    bridge: Bridge,
    janitor: SocketJanitor,
    listener: UnixListener,
    socket_path: PathBuf,
}

impl BridgeServer {
    /// Bind the configured socket path, replacing any stale file there.
    pub fn bind(bridge: Bridge, janitor: SocketJanitor) -> Result<Self, BridgeError> {
        let socket_path = bridge.config().socket_path.clone();
        let listen_err = |source| BridgeError::Listen {
            path: socket_path.clone(),
            source,
        };

        remove_socket_file(&socket_path).map_err(listen_err)?;
        let listener = UnixListener::bind(&socket_path).map_err(listen_err)?;
        janitor.track(&socket_path);
        info!("Bridge listening on {}", socket_path.display());

        Ok(Self {
            bridge,
            janitor,
            listener,
            socket_path,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept clients until `shutdown` fires, then tear everything down:
    /// connections, capture channels and every socket file.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut connections = JoinSet::new();
        loop {
            let stream = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        warn!("Failed to accept client connection: {}", e);
                        continue;
                    }
                },
            };

            while connections.try_join_next().is_some() {}

            let conn_id = uuid::Uuid::new_v4().to_string();
            let bridge = self.bridge.clone();
            let cancel = shutdown.child_token();
            connections.spawn(handle_connection(bridge, stream, conn_id, cancel));
        }

        info!("Shutting down bridge");
        while connections.join_next().await.is_some() {}
        self.bridge.channels().detach_all().await;
        self.janitor.cleanup();
        info!("Shutdown complete");
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// Drive one client connection from accept to close.
///
/// The connection becomes the bridge's only writer, replacing and cancelling
/// any previous one. Capture channels outlive it.
pub async fn handle_connection(
    bridge: Bridge,
    stream: UnixStream,
    conn_id: String,
    cancel: CancellationToken,
) {
    let mut phase = PhaseTracker::new(&conn_id);
    let (read_half, write_half) = stream.into_split();

    let (tx, rx) = mpsc::channel(bridge.config().send_queue_capacity);
    if let Some(previous) = bridge.client().attach(&conn_id, tx, cancel.clone()).await {
        info!(conn_id = %conn_id, "New client replaces the previous connection");
        previous.cancel();
    }
    let writer = tokio::spawn(write_loop(write_half, rx, cancel.clone(), conn_id.clone()));

    match run_connection(&bridge, read_half, &cancel, &mut phase).await {
        Ok(()) => info!(conn_id = %conn_id, "Client disconnected"),
        Err(e) => warn!(conn_id = %conn_id, "Connection ended: {}", e),
    }

    phase.advance(ConnectionPhase::Closed);
    cancel.cancel();
    bridge.client().detach(&conn_id).await;
    if let Err(e) = writer.await {
        warn!(conn_id = %conn_id, "Writer task failed: {}", e);
    }
}

async fn run_connection(
    bridge: &Bridge,
    read_half: OwnedReadHalf,
    cancel: &CancellationToken,
    phase: &mut PhaseTracker<'_>,
) -> Result<(), BridgeError> {
    tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        result = send_initial_state(bridge, phase) => result?,
    }

    phase.advance(ConnectionPhase::Running);
    let mut tasks = JoinSet::new();
    for kind in MonitorKind::ALL {
        tasks.spawn(supervise(bridge.clone(), kind, cancel.clone()));
    }
    tasks.spawn(read_loop(
        bridge.clone(),
        read_half,
        cancel.clone(),
        phase.conn_id.to_string(),
    ));

    // Monitors only stop on cancellation or a connection-level failure, and
    // the reader stops when the client goes away, so the first task to
    // finish ends the connection.
    let first = tasks.join_next().await;
    cancel.cancel();
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            warn!(conn_id = %phase.conn_id, "Connection task panicked: {}", e);
        }
    }

    match first {
        Some(Ok(result)) => result,
        Some(Err(e)) => {
            error!(conn_id = %phase.conn_id, "Connection task panicked: {}", e);
            Ok(())
        }
        None => Ok(()),
    }
}

async fn send_initial_state(
    bridge: &Bridge,
    phase: &mut PhaseTracker<'_>,
) -> Result<(), BridgeError> {
    phase.advance(ConnectionPhase::Enumerating);
    if let Err(e) = bridge.enumerate_and_send().await {
        bridge.report("Initial enumeration failed", e).await?;
    }

    phase.advance(ConnectionPhase::SendingConfig);
    if let Err(e) = bridge.send_config().await {
        bridge.report("Sending config failed", e).await?;
    }

    phase.advance(ConnectionPhase::Ready);
    bridge.client().send(OutboundMessage::Ready).await;
    Ok(())
}

/// Read newline-delimited commands and dispatch them in order.
async fn read_loop(
    bridge: Bridge,
    read_half: OwnedReadHalf,
    cancel: CancellationToken,
    conn_id: String,
) -> Result<(), BridgeError> {
    let mut reader = BufReader::new(read_half);
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = reader.read_until(b'\n', &mut line) => read,
        };
        if read.map_err(BridgeError::Connection)? == 0 {
            debug!(conn_id = %conn_id, "Client closed its end");
            return Ok(());
        }

        let trimmed = line.trim_ascii();
        if trimmed.is_empty() {
            continue;
        }

        let msg = match decode_line(trimmed) {
            Ok(msg) => msg,
            Err(ProtocolError::UnknownType(kind)) => {
                warn!(conn_id = %conn_id, "Ignoring unknown message type: {}", kind);
                continue;
            }
            Err(e) => {
                warn!(conn_id = %conn_id, "Dropping malformed line: {}", e);
                continue;
            }
        };

        debug!(conn_id = %conn_id, "Received {}", msg.kind());
        dispatch(&bridge, msg).await?;
    }
}

/// Drain the outbound queue into the socket. A write failure cancels the
/// connection.
async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
    conn_id: String,
) {
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = rx.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };
        trace!(conn_id = %conn_id, "Writing {} bytes", line.len());
        if let Err(e) = write_half.write_all(line.as_bytes()).await {
            warn!(conn_id = %conn_id, "Client write failed: {}", e);
            cancel.cancel();
            break;
        }
    }
    let _ = write_half.shutdown().await;
}
