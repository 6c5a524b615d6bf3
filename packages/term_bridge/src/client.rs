use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::protocol::{OutboundMessage, encode_line};

struct Attached {
    conn_id: String,
    tx: mpsc::Sender<String>,
    cancel: CancellationToken,
}

/// The single outbound path to the remote client.
///
/// Holds the writer queue of whichever connection is current. Sends made
/// while nobody is attached are dropped, not queued.
#[derive(Clone, Default)]
pub struct ClientLink {
    current: Arc<RwLock<Option<Attached>>>,
}

impl ClientLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `conn_id` the current writer. Returns the cancellation token of
    /// the connection it replaces, if any.
    pub async fn attach(
        &self,
        conn_id: &str,
        tx: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Option<CancellationToken> {
        let previous = self.current.write().await.replace(Attached {
            conn_id: conn_id.to_string(),
            tx,
            cancel,
        });
        previous.map(|p| p.cancel)
    }

    /// Clear the writer, but only if it still belongs to `conn_id`. A newer
    /// connection that already replaced it is left alone.
    pub async fn detach(&self, conn_id: &str) -> bool {
        let mut current = self.current.write().await;
        if current.as_ref().is_some_and(|c| c.conn_id == conn_id) {
            *current = None;
            true
        } else {
            false
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.current.read().await.is_some()
    }

    /// Queue a message for the current client. Returns false when it was
    /// dropped.
    pub async fn send(&self, msg: OutboundMessage) -> bool {
        let tx = match self.current.read().await.as_ref() {
            Some(attached) => attached.tx.clone(),
            None => {
                debug!("No client attached, dropping {}", msg.kind());
                return false;
            }
        };

        let line = match encode_line(&msg) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to encode {} message: {}", msg.kind(), e);
                return false;
            }
        };

        if tx.send(line).await.is_err() {
            debug!("Client writer closed, dropping {}", msg.kind());
            return false;
        }
        true
    }
}
