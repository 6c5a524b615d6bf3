use std::time::Duration;

use screen_render::ScreenSnapshot;
use tracing::debug;

use crate::error::HostError;
use crate::host::Host;

/// Read a session's screen, preferring the styled snapshot.
///
/// The styled read gets at most `fresh_wait`; when it times out or fails the
/// plain text snapshot is used instead. A lost host connection is never
/// masked by the fallback.
pub async fn capture_screen(
    host: &dyn Host,
    session_id: &str,
    fresh_wait: Duration,
) -> Result<Option<ScreenSnapshot>, HostError> {
    match tokio::time::timeout(fresh_wait, host.styled_screen(session_id)).await {
        Ok(Ok(Some(snapshot))) => return Ok(Some(snapshot)),
        Ok(Ok(None)) => debug!(session_id = %session_id, "No styled screen, using plain text"),
        Ok(Err(HostError::Disconnected)) => return Err(HostError::Disconnected),
        Ok(Err(e)) => debug!(session_id = %session_id, "Styled screen failed ({}), using plain text", e),
        Err(_) => debug!(
            session_id = %session_id,
            "Styled screen took longer than {:?}, using plain text",
            fresh_wait
        ),
    }
    host.screen(session_id).await
}
