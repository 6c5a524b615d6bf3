//! Inbound command dispatch.
//!
//! One handler per inbound message type. Handlers return `BridgeError`s;
//! [`dispatch`] turns the recoverable ones into `error` messages for the
//! client and hands connection-level ones back to the reader loop.

use tracing::{debug, info, warn};

use crate::bridge::Bridge;
use crate::coprocess::WriteOutcome;
use crate::error::{BridgeError, TeardownFailure};
use crate::protocol::{InboundMessage, decode_payload};

pub async fn dispatch(bridge: &Bridge, msg: InboundMessage) -> Result<(), BridgeError> {
    let kind = msg.kind();
    debug!("Dispatching {}", kind);

    let result = match msg {
        InboundMessage::TerminalInput { session_id, data } => {
            handle_terminal_input(bridge, session_id, &data).await
        }
        InboundMessage::TerminalResize {
            session_id,
            cols,
            rows,
        } => {
            handle_terminal_resize(session_id, cols, rows);
            Ok(())
        }
        InboundMessage::TabSwitch { tab_id } => switch_tab(bridge, &tab_id).await,
        InboundMessage::TabCreate => create_tab(bridge).await,
        InboundMessage::TabClose { tab_id } => close_tab(bridge, &tab_id).await,
        InboundMessage::RequestScreenRefresh { session_id } => {
            refresh_screen(bridge, session_id).await
        }
        InboundMessage::ResendInitialState => {
            info!("Client asked for initial state");
            bridge.resend_initial_state().await
        }
    };

    match result {
        Ok(()) => Ok(()),
        Err(e) => bridge.report(&format!("{kind} failed"), e).await,
    }
}

/// Keystrokes go to the session's capture process when one is connected,
/// otherwise straight to the host as text.
async fn handle_terminal_input(
    bridge: &Bridge,
    session_id: Option<String>,
    data: &str,
) -> Result<(), BridgeError> {
    let Some(session_id) = session_id else {
        debug!("Ignoring terminal_input without session_id");
        return Ok(());
    };

    let bytes = match decode_payload(data) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(session_id = %session_id, "Dropping terminal_input: {}", e);
            return Ok(());
        }
    };

    match bridge.channels().write(&session_id, &bytes).await {
        WriteOutcome::Written => Ok(()),
        // The keystrokes may have been partially delivered; re-sending them
        // through the host could duplicate input.
        WriteOutcome::Dropped => Ok(()),
        WriteOutcome::NoChannel => send_text_fallback(bridge, &session_id, &bytes).await,
    }
}

async fn send_text_fallback(
    bridge: &Bridge,
    session_id: &str,
    bytes: &[u8],
) -> Result<(), BridgeError> {
    if !bridge.registry().contains(session_id).await {
        match bridge.host().session(session_id).await? {
            Some(info) => {
                bridge.registry().record(info).await;
            }
            None => {
                warn!(session_id = %session_id, "Input for unknown session dropped");
                return Ok(());
            }
        }
    }

    let text = String::from_utf8_lossy(bytes);
    bridge.host().send_text(session_id, &text).await?;
    debug!(session_id = %session_id, "Sent {} byte(s) through host", bytes.len());
    Ok(())
}

/// Sizing belongs to the host's window layout; remote resizes are only logged.
fn handle_terminal_resize(session_id: Option<String>, cols: Option<u16>, rows: Option<u16>) {
    let (Some(session_id), Some(cols), Some(rows)) = (session_id, cols, rows) else {
        return;
    };
    debug!(
        session_id = %session_id,
        "Resize request {}x{} (informational)",
        cols,
        rows
    );
}

/// Select a tab. Clients sometimes send a session id in `tab_id`, so an
/// unmatched id is tried as a session before giving up.
async fn switch_tab(bridge: &Bridge, tab_id: &str) -> Result<(), BridgeError> {
    let layout = bridge.host().layout().await?;

    if let Some(tab) = layout.find_tab(tab_id) {
        bridge.host().select_tab(&tab.id).await?;
        info!("Switched to tab {}", tab.id);
        if let Some(session_id) = &tab.current_session {
            bridge.send_session_screen(session_id).await?;
        }
        return Ok(());
    }

    if bridge.host().session(tab_id).await?.is_some() {
        bridge.host().activate_session(tab_id).await?;
        info!(session_id = %tab_id, "Activated session via tab switch");
        bridge.send_session_screen(tab_id).await?;
        return Ok(());
    }

    warn!(
        "Tab/session {} not found. Available tabs: {:?}",
        tab_id,
        layout.tab_ids()
    );
    Ok(())
}

async fn create_tab(bridge: &Bridge) -> Result<(), BridgeError> {
    let layout = bridge.host().layout().await?;
    let Some(window_id) = layout.current_window else {
        warn!("No current window to create tab in");
        return Ok(());
    };
    let tab_id = bridge.host().create_tab(&window_id).await?;
    info!("Created tab {} in window {}", tab_id, window_id);
    Ok(())
}

/// Tear down every capture in the tab, forget its sessions, then close it.
///
/// A failed teardown does not stop the others or the close; all failures are
/// returned together afterwards.
async fn close_tab(bridge: &Bridge, tab_id: &str) -> Result<(), BridgeError> {
    let layout = bridge.host().layout().await?;
    let Some(tab) = layout.find_tab(tab_id) else {
        warn!("Tab {} not found for close", tab_id);
        return Ok(());
    };

    let mut failures = Vec::new();
    for session in &tab.sessions {
        if let Err(error) = bridge.forget_session(&session.id).await {
            warn!(session_id = %session.id, "Capture teardown failed: {}", error);
            failures.push(TeardownFailure {
                session_id: session.id.clone(),
                error,
            });
        }
    }

    bridge.host().close_tab(&tab.id).await?;
    info!("Closed tab {}", tab.id);

    if failures.is_empty() {
        Ok(())
    } else {
        Err(BridgeError::Teardown(failures))
    }
}

async fn refresh_screen(bridge: &Bridge, session_id: Option<String>) -> Result<(), BridgeError> {
    let session_id = match session_id.filter(|id| !id.is_empty()) {
        Some(id) => id,
        None => match bridge.active_session().await? {
            Some(id) => id,
            None => {
                debug!("Screen refresh requested with no active session");
                return Ok(());
            }
        },
    };
    info!(session_id = %session_id, "Screen refresh requested");
    bridge.send_session_screen(&session_id).await
}
