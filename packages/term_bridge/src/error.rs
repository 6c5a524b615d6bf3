use std::path::PathBuf;

/// Failures of a host capability call.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("host is unavailable: {0}")]
    Unavailable(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("tab not found: {0}")]
    TabNotFound(String),

    #[error("host command `{command}` failed: {message}")]
    Command { command: String, message: String },

    #[error("host event stream closed")]
    Disconnected,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Malformed inbound lines. Logged and dropped, never surfaced to the peer.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("message is not a JSON object")]
    NotAnObject,

    #[error("message has no type")]
    MissingType,

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("malformed {kind} message: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid base64 payload: {0}")]
    InvalidPayload(#[from] base64::DecodeError),
}

#[derive(Debug, thiserror::Error)]
pub enum CoprocessError {
    #[error("failed to listen on capture socket {path:?}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to remove capture socket {path:?}: {source}")]
    Cleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A capture channel that could not be torn down while closing a tab.
#[derive(Debug)]
pub struct TeardownFailure {
    pub session_id: String,
    pub error: CoprocessError,
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Host(#[from] HostError),

    #[error(transparent)]
    Coprocess(#[from] CoprocessError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("failed to tear down {} capture channel(s): {}", .0.len(), describe_failures(.0))]
    Teardown(Vec<TeardownFailure>),

    #[error("client connection lost: {0}")]
    Connection(#[source] std::io::Error),

    #[error("failed to listen on bridge socket {path:?}: {source}")]
    Listen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl BridgeError {
    /// Whether this failure ends the client connection rather than a single
    /// operation or monitor.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            BridgeError::Connection(_)
                | BridgeError::Host(HostError::Disconnected)
                | BridgeError::Host(HostError::Unavailable(_))
        )
    }
}

fn describe_failures(failures: &[TeardownFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.session_id, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Fatal startup problems with the capture launcher artifact.
#[derive(Debug, thiserror::Error)]
pub enum LauncherError {
    #[error("capture launcher not found: {0:?}")]
    NotFound(PathBuf),

    #[error("capture launcher is not executable: {0:?}")]
    NotExecutable(PathBuf),
}
