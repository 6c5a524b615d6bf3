use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::host::{SessionId, SessionInfo};

/// Sessions the bridge currently knows about.
///
/// Holds copies of host descriptors for correlation only; the host owns the
/// sessions themselves. Cloning shares the same table.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<SessionId, SessionInfo>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a session. Returns true when it was not known before.
    pub async fn record(&self, info: SessionInfo) -> bool {
        self.sessions
            .write()
            .await
            .insert(info.id.clone(), info)
            .is_none()
    }

    pub async fn get(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    pub async fn remove(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions.write().await.remove(session_id)
    }

    /// Sorted ids, for diagnostics.
    pub async fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Remove a session and run `teardown` while still holding the table's
    /// write lock, so readers never see the session half forgotten.
    pub async fn remove_with<F, Fut, T>(&self, session_id: &str, teardown: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let mut sessions = self.sessions.write().await;
        sessions.remove(session_id);
        teardown().await
    }
}
