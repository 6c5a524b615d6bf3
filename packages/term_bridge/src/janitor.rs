use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

/// Tracks every socket file the bridge creates so they can be removed on
/// shutdown, whichever way it happens.
///
/// Clones share one set. Cleanup runs when [`SocketJanitor::cleanup`] is
/// called or when the last clone is dropped.
#[derive(Clone, Default)]
pub struct SocketJanitor {
    inner: Arc<JanitorInner>,
}

#[derive(Default)]
struct JanitorInner {
    paths: Mutex<HashSet<PathBuf>>,
}

impl SocketJanitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, path: &Path) {
        self.inner.lock().insert(path.to_path_buf());
    }

    /// Stop tracking a path whose file was already dealt with.
    pub fn forget(&self, path: &Path) {
        self.inner.lock().remove(path);
    }

    pub fn tracked(&self) -> Vec<PathBuf> {
        let mut paths: Vec<_> = self.inner.lock().iter().cloned().collect();
        paths.sort();
        paths
    }

    /// Remove every tracked socket file.
    pub fn cleanup(&self) {
        self.inner.cleanup();
    }
}

impl JanitorInner {
    fn lock(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        self.paths.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cleanup(&self) {
        let paths: Vec<PathBuf> = self.lock().drain().collect();
        for path in paths {
            match remove_socket_file(&path) {
                Ok(()) => debug!("Removed socket {}", path.display()),
                Err(e) => warn!("Failed to remove socket {}: {}", path.display(), e),
            }
        }
    }
}

impl Drop for JanitorInner {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Unlink a socket file. A file that is already gone is not an error.
pub fn remove_socket_file(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
