//! Per-session capture channels.
//!
//! Each attached session gets its own Unix socket. The host runs the capture
//! launcher as a coprocess of the session; the launcher connects back to the
//! socket and from then on the socket carries raw terminal output one way and
//! keystrokes the other.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixListener;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::client::ClientLink;
use crate::config::CaptureConfig;
use crate::error::{CoprocessError, HostError};
use crate::host::{Host, SessionId};
use crate::janitor::{SocketJanitor, remove_socket_file};
use crate::protocol::OutboundMessage;

type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

/// Best-effort termination of a capture process left over for a session.
/// Implementations may fail silently; callers retry regardless.
#[async_trait]
pub trait Reaper: Send + Sync {
    async fn terminate(&self, pattern: &str);
}

/// Matches capture processes by command line with `pkill -f`.
pub struct PkillReaper;

#[async_trait]
impl Reaper for PkillReaper {
    async fn terminate(&self, pattern: &str) {
        match tokio::process::Command::new("pkill")
            .arg("-f")
            .arg(pattern)
            .status()
            .await
        {
            // pkill exits 1 when nothing matched, which is fine here.
            Ok(status) => debug!("pkill -f {:?} exited with {}", pattern, status),
            Err(e) => warn!("Failed to run pkill for {:?}: {}", pattern, e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    /// Socket listening and the host accepted the launch.
    Attached,
    /// A channel already exists for this session; nothing was done.
    AlreadyAttached,
    /// The launch failed even after the retry; the socket was torn down.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// No connected capture for the session.
    NoChannel,
    /// The write failed and the writer was dropped.
    Dropped,
}

struct Channel {
    generation: u64,
    socket_path: PathBuf,
    accept_task: JoinHandle<()>,
    writer: Option<SharedWriter>,
}

struct Inner {
    channels: Mutex<HashMap<SessionId, Channel>>,
    next_generation: AtomicU64,
    config: CaptureConfig,
    client: ClientLink,
    janitor: SocketJanitor,
    reaper: Arc<dyn Reaper>,
}

/// Owns every capture channel, keyed by session id. At most one channel
/// exists per session.
#[derive(Clone)]
pub struct CoprocessManager {
    inner: Arc<Inner>,
}

impl CoprocessManager {
    pub fn new(
        config: CaptureConfig,
        client: ClientLink,
        janitor: SocketJanitor,
        reaper: Arc<dyn Reaper>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                channels: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                config,
                client,
                janitor,
                reaper,
            }),
        }
    }

    pub fn socket_path_for(&self, session_id: &str) -> PathBuf {
        capture_socket_path(
            &self.inner.config.socket_dir,
            &self.inner.config.socket_prefix,
            session_id,
        )
    }

    /// Command line handed to the host: `<launcher> <session_id> <socket>`.
    pub fn capture_command(&self, session_id: &str, socket_path: &Path) -> String {
        format!(
            "{} {} {}",
            shell_quote(&self.inner.config.launcher.to_string_lossy()),
            shell_quote(session_id),
            shell_quote(&socket_path.to_string_lossy())
        )
    }

    /// Pattern matching a running capture for `session_id` in `pkill -f`.
    pub fn reaper_pattern(&self, session_id: &str) -> String {
        let launcher = self
            .inner
            .config
            .launcher
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.inner.config.launcher.to_string_lossy().into_owned());
        format!("{} {}", regex_escape(&launcher), regex_escape(session_id))
    }

    /// Whether a channel exists for the session, connected or not.
    pub async fn contains(&self, session_id: &str) -> bool {
        self.inner.channels.lock().await.contains_key(session_id)
    }

    /// Whether a capture process is connected and accepting input.
    pub async fn has_active(&self, session_id: &str) -> bool {
        self.inner
            .channels
            .lock()
            .await
            .get(session_id)
            .is_some_and(|c| c.writer.is_some())
    }

    pub async fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.inner.channels.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Start capturing a session.
    ///
    /// The socket is bound before the host is asked to launch the capture, so
    /// the launcher never races a missing listener. If the host reports a
    /// capture already running, the stale process is reaped and the launch is
    /// retried once after the settle delay.
    pub async fn attach(
        &self,
        host: &dyn Host,
        session_id: &str,
    ) -> Result<AttachOutcome, CoprocessError> {
        let socket_path = {
            let mut channels = self.inner.channels.lock().await;
            if channels.contains_key(session_id) {
                return Ok(AttachOutcome::AlreadyAttached);
            }

            let socket_path = self.socket_path_for(session_id);
            if let Err(e) = remove_socket_file(&socket_path) {
                warn!("Failed to remove stale socket {}: {}", socket_path.display(), e);
            }
            let listener =
                UnixListener::bind(&socket_path).map_err(|source| CoprocessError::Bind {
                    path: socket_path.clone(),
                    source,
                })?;
            self.inner.janitor.track(&socket_path);
            debug!(session_id = %session_id, "Capture socket listening at {}", socket_path.display());

            let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
            let accept_task = tokio::spawn(self.clone().accept_loop(
                session_id.to_string(),
                generation,
                listener,
            ));
            channels.insert(
                session_id.to_string(),
                Channel {
                    generation,
                    socket_path: socket_path.clone(),
                    accept_task,
                    writer: None,
                },
            );
            socket_path
        };

        let command = self.capture_command(session_id, &socket_path);
        match self.launch(host, session_id, &command).await {
            Ok(true) => {
                info!(session_id = %session_id, "Started capture");
                Ok(AttachOutcome::Attached)
            }
            Ok(false) => {
                warn!(session_id = %session_id, "Capture still refused after retry, giving up");
                self.abandon(session_id).await;
                Ok(AttachOutcome::Failed)
            }
            Err(e) => {
                error!(session_id = %session_id, "Failed to start capture: {}", e);
                self.abandon(session_id).await;
                Ok(AttachOutcome::Failed)
            }
        }
    }

    async fn launch(&self, host: &dyn Host, session_id: &str, command: &str) -> Result<bool, HostError> {
        if host.run_coprocess(session_id, command).await? {
            return Ok(true);
        }

        warn!(session_id = %session_id, "A capture is already running, terminating it and retrying");
        self.inner
            .reaper
            .terminate(&self.reaper_pattern(session_id))
            .await;
        tokio::time::sleep(self.inner.config.settle_delay).await;
        host.run_coprocess(session_id, command).await
    }

    /// Tear down a channel whose launch failed.
    async fn abandon(&self, session_id: &str) {
        if let Err(e) = self.detach(session_id).await {
            warn!(session_id = %session_id, "Failed to clean up after failed capture: {}", e);
        }
    }

    /// Serve the capture connection for one channel. When the capture goes
    /// away the channel is removed, so the next enumeration or new-session
    /// event launches a fresh capture.
    async fn accept_loop(self, session_id: SessionId, generation: u64, listener: UnixListener) {
        let stream = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(e) => {
                warn!(session_id = %session_id, "Capture socket accept failed: {}", e);
                self.release(&session_id, generation).await;
                return;
            }
        };
        drop(listener);
        info!(session_id = %session_id, "Capture connected");

        let (mut reader, writer) = stream.into_split();
        if !self.set_writer(&session_id, Arc::new(Mutex::new(writer))).await {
            return;
        }

        self.pump(&session_id, &mut reader).await;
        info!(session_id = %session_id, "Capture data handler ended");
        self.release(&session_id, generation).await;
    }

    /// Remove the channel for a capture that ended, unless it was already
    /// detached or replaced by a newer attach.
    async fn release(&self, session_id: &str, generation: u64) {
        let channel = {
            let mut channels = self.inner.channels.lock().await;
            match channels.get(session_id) {
                Some(channel) if channel.generation == generation => channels.remove(session_id),
                _ => None,
            }
        };
        let Some(channel) = channel else {
            return;
        };

        if let Err(e) = self.close(channel).await {
            warn!(session_id = %session_id, "Failed to clean up ended capture: {}", e);
        } else {
            info!(session_id = %session_id, "Capture ended, channel released");
        }
    }

    async fn pump(&self, session_id: &str, reader: &mut OwnedReadHalf) {
        let mut buf = vec![0u8; self.inner.config.read_chunk_bytes];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    info!(session_id = %session_id, "Capture closed the stream");
                    return;
                }
                Ok(n) => self.forward(session_id, &buf[..n]).await,
                Err(e) if is_disconnect(&e) => {
                    info!(session_id = %session_id, "Capture disconnected: {}", e);
                    return;
                }
                Err(e) => {
                    error!(session_id = %session_id, "Capture read failed: {}", e);
                    return;
                }
            }
        }
    }

    /// Emit captured bytes to the client as `terminal_data`.
    pub async fn forward(&self, session_id: &str, bytes: &[u8]) {
        trace!(session_id = %session_id, bytes = bytes.len(), "Forwarding captured output");
        self.inner
            .client
            .send(OutboundMessage::terminal_data(session_id, bytes))
            .await;
    }

    async fn set_writer(&self, session_id: &str, writer: SharedWriter) -> bool {
        match self.inner.channels.lock().await.get_mut(session_id) {
            Some(channel) => {
                channel.writer = Some(writer);
                true
            }
            None => false,
        }
    }

    /// Drop the writer, unless a newer connection already replaced it.
    async fn clear_writer(&self, session_id: &str, writer: &SharedWriter) {
        if let Some(channel) = self.inner.channels.lock().await.get_mut(session_id) {
            if channel
                .writer
                .as_ref()
                .is_some_and(|w| Arc::ptr_eq(w, writer))
            {
                channel.writer = None;
            }
        }
    }

    /// Deliver keystrokes to the session's capture process.
    ///
    /// A failed write drops the writer so later input for the session goes
    /// through the host instead.
    pub async fn write(&self, session_id: &str, bytes: &[u8]) -> WriteOutcome {
        let writer = {
            let channels = self.inner.channels.lock().await;
            match channels.get(session_id).and_then(|c| c.writer.clone()) {
                Some(writer) => writer,
                None => return WriteOutcome::NoChannel,
            }
        };

        let result = {
            let mut w = writer.lock().await;
            match w.write_all(bytes).await {
                Ok(()) => w.flush().await,
                Err(e) => Err(e),
            }
        };

        match result {
            Ok(()) => WriteOutcome::Written,
            Err(e) => {
                warn!(session_id = %session_id, "Capture write failed (disconnected): {}", e);
                self.clear_writer(session_id, &writer).await;
                WriteOutcome::Dropped
            }
        }
    }

    /// Close a session's capture and delete its socket file.
    ///
    /// Detaching a session without a channel does nothing and returns
    /// `Ok(false)`.
    pub async fn detach(&self, session_id: &str) -> Result<bool, CoprocessError> {
        let Some(channel) = self.inner.channels.lock().await.remove(session_id) else {
            return Ok(false);
        };

        channel.accept_task.abort();
        self.close(channel).await?;
        info!(session_id = %session_id, "Detached capture");
        Ok(true)
    }

    async fn close(&self, channel: Channel) -> Result<(), CoprocessError> {
        if let Some(writer) = channel.writer {
            let _ = writer.lock().await.shutdown().await;
        }

        self.inner.janitor.forget(&channel.socket_path);
        remove_socket_file(&channel.socket_path).map_err(|source| CoprocessError::Cleanup {
            path: channel.socket_path,
            source,
        })
    }

    /// Detach every channel, e.g. at shutdown.
    pub async fn detach_all(&self) {
        for session_id in self.session_ids().await {
            if let Err(e) = self.detach(&session_id).await {
                warn!(session_id = %session_id, "Failed to detach capture: {}", e);
            }
        }
    }
}

/// `<dir>/<prefix><session id>.sock`, with characters that are awkward in
/// file names or shell words replaced by `-`.
pub fn capture_socket_path(dir: &Path, prefix: &str, session_id: &str) -> PathBuf {
    let safe: String = session_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    dir.join(format!("{prefix}{safe}.sock"))
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionAborted
    )
}

fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

fn regex_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if r"\.^$|?*+()[]{}".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
