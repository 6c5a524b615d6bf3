//! Long-running reactions to host notifications.
//!
//! Each monitor owns one host subscription for the lifetime of a client
//! connection. [`supervise`] restarts a monitor after recoverable failures
//! and hands connection-level ones back so the connection can be torn down.

use std::fmt;

use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bridge::Bridge;
use crate::coprocess::AttachOutcome;
use crate::error::{BridgeError, HostError};
use crate::host::FocusUpdate;
use crate::protocol::OutboundMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorKind {
    Focus,
    Layout,
    NewSession,
}

impl MonitorKind {
    pub const ALL: [MonitorKind; 3] = [
        MonitorKind::Focus,
        MonitorKind::Layout,
        MonitorKind::NewSession,
    ];
}

impl fmt::Display for MonitorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MonitorKind::Focus => "focus",
            MonitorKind::Layout => "layout",
            MonitorKind::NewSession => "new-session",
        };
        f.write_str(name)
    }
}

/// Run one monitor until `cancel` fires or it fails at the connection level.
///
/// Other failures are logged, reported to the client and followed by a
/// restart after the configured delay.
pub async fn supervise(
    bridge: Bridge,
    kind: MonitorKind,
    cancel: CancellationToken,
) -> Result<(), BridgeError> {
    let restart_delay = bridge.config().monitor_restart_delay;
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = run(&bridge, kind) => result,
        };

        let err = match result {
            Ok(()) => {
                info!("{} monitor finished", kind);
                return Ok(());
            }
            Err(e) if e.is_connection_level() => {
                warn!("{} monitor lost the host: {}", kind, e);
                return Err(e);
            }
            Err(e) => e,
        };

        error!("{} monitor failed: {}", kind, err);
        bridge
            .client()
            .send(OutboundMessage::error(format!("{kind} monitor failed: {err}")))
            .await;

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(restart_delay) => {}
        }
        info!("Restarting {} monitor", kind);
    }
}

async fn run(bridge: &Bridge, kind: MonitorKind) -> Result<(), BridgeError> {
    match kind {
        MonitorKind::Focus => monitor_focus(bridge).await,
        MonitorKind::Layout => monitor_layout(bridge).await,
        MonitorKind::NewSession => monitor_new_sessions(bridge).await,
    }
}

/// Announce tab switches and send the newly active session's screen.
async fn monitor_focus(bridge: &Bridge) -> Result<(), BridgeError> {
    let mut updates = bridge.host().subscribe_focus().await?;
    debug!("Focus monitor subscribed");
    loop {
        let update = match updates.recv().await {
            Ok(update) => update,
            Err(RecvError::Lagged(missed)) => {
                warn!("Focus monitor missed {} update(s)", missed);
                continue;
            }
            Err(RecvError::Closed) => return Err(HostError::Disconnected.into()),
        };

        let FocusUpdate::TabSelected { tab_id } = update else {
            debug!("Ignoring focus update {:?}", update);
            continue;
        };
        if let Err(e) = on_tab_selected(bridge, tab_id).await {
            bridge.report("Focus update failed", e).await?;
        }
    }
}

async fn on_tab_selected(bridge: &Bridge, tab_id: String) -> Result<(), BridgeError> {
    info!("Tab focus changed: {}", tab_id);
    let session_id = bridge.active_session().await?;
    bridge
        .client()
        .send(OutboundMessage::TabSwitched {
            tab_id,
            session_id: session_id.clone(),
        })
        .await;

    if let Some(session_id) = session_id {
        bridge.send_session_screen(&session_id).await?;
    }
    Ok(())
}

/// Re-enumerate on every layout change. A lagged receiver re-enumerates too,
/// since the result is the same whatever was missed.
async fn monitor_layout(bridge: &Bridge) -> Result<(), BridgeError> {
    let mut updates = bridge.host().subscribe_layout().await?;
    debug!("Layout monitor subscribed");
    loop {
        match updates.recv().await {
            Ok(_) => info!("Layout changed, re-enumerating sessions"),
            Err(RecvError::Lagged(missed)) => {
                info!("Layout changed ({} updates coalesced), re-enumerating", missed)
            }
            Err(RecvError::Closed) => return Err(HostError::Disconnected.into()),
        }
        if let Err(e) = bridge.enumerate_and_send().await {
            bridge.report("Re-enumeration failed", e).await?;
        }
    }
}

/// Attach a capture as soon as a session appears, ahead of the next full
/// enumeration.
async fn monitor_new_sessions(bridge: &Bridge) -> Result<(), BridgeError> {
    let mut updates = bridge.host().subscribe_new_sessions().await?;
    debug!("New-session monitor subscribed");
    loop {
        let session_id = match updates.recv().await {
            Ok(session_id) => session_id,
            Err(RecvError::Lagged(missed)) => {
                warn!("New-session monitor missed {} session(s)", missed);
                continue;
            }
            Err(RecvError::Closed) => return Err(HostError::Disconnected.into()),
        };
        if let Err(e) = on_new_session(bridge, &session_id).await {
            bridge.report("New session handling failed", e).await?;
        }
    }
}

async fn on_new_session(bridge: &Bridge, session_id: &str) -> Result<(), BridgeError> {
    let Some(info) = bridge.host().session(session_id).await? else {
        warn!(session_id = %session_id, "New session vanished before it could be attached");
        return Ok(());
    };
    info!(session_id = %session_id, "New session created");
    bridge.registry().record(info).await;

    match bridge.channels().attach(bridge.host(), session_id).await? {
        AttachOutcome::Attached => info!(session_id = %session_id, "Capture attached to new session"),
        AttachOutcome::AlreadyAttached => debug!(session_id = %session_id, "New session already captured"),
        AttachOutcome::Failed => warn!(session_id = %session_id, "New session left without capture"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{FakeHost, layout, test_bridge, wait_until};
    use std::sync::Arc;

    fn spawn_monitor(
        bridge: &Bridge,
        kind: MonitorKind,
    ) -> (
        tokio::task::JoinHandle<Result<(), BridgeError>>,
        CancellationToken,
    ) {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(supervise(bridge.clone(), kind, cancel.clone()));
        (handle, cancel)
    }

    async fn wait_subscribed(host: &FakeHost, index: usize) {
        wait_until(|| async move { host.subscribers()[index] > 0 }).await;
    }

    #[tokio::test]
    async fn test_focus_change_sends_tab_switched_then_screen() {
        let host = Arc::new(FakeHost::new(layout([("t1", vec!["a"]), ("t2", vec!["b"])])));
        let (bridge, mut client, _dir) = test_bridge(host.clone()).await;
        let (handle, cancel) = spawn_monitor(&bridge, MonitorKind::Focus);
        wait_subscribed(&host, 0).await;

        let mut moved = layout([("t2", vec!["b"]), ("t1", vec!["a"])]);
        moved.windows[0].current_tab = Some("t2".into());
        host.set_layout(moved);
        host.emit_focus(FocusUpdate::TabSelected {
            tab_id: "t2".into(),
        });

        assert_eq!(
            client.next().await,
            OutboundMessage::TabSwitched {
                tab_id: "t2".into(),
                session_id: Some("b".into()),
            }
        );
        match client.next().await {
            OutboundMessage::InitialTerminalData { session_id, .. } => assert_eq!(session_id, "b"),
            other => panic!("expected screen, got {other:?}"),
        }

        cancel.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_focus_change_to_empty_tab_sends_null_session() {
        let host = Arc::new(FakeHost::single("a"));
        let (bridge, mut client, _dir) = test_bridge(host.clone()).await;
        let (_handle, cancel) = spawn_monitor(&bridge, MonitorKind::Focus);
        wait_subscribed(&host, 0).await;

        host.set_layout(layout([("t9", vec![])]));
        host.emit_focus(FocusUpdate::TabSelected {
            tab_id: "t9".into(),
        });

        assert_eq!(
            client.next().await,
            OutboundMessage::TabSwitched {
                tab_id: "t9".into(),
                session_id: None,
            }
        );
        client.assert_quiet().await;
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_other_focus_updates_are_ignored() {
        let host = Arc::new(FakeHost::single("a"));
        let (bridge, mut client, _dir) = test_bridge(host.clone()).await;
        let (_handle, cancel) = spawn_monitor(&bridge, MonitorKind::Focus);
        wait_subscribed(&host, 0).await;

        host.emit_focus(FocusUpdate::WindowFocused {
            window_id: "w1".into(),
        });
        client.assert_quiet().await;
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_layout_change_reenumerates() {
        let host = Arc::new(FakeHost::single("a"));
        let (bridge, mut client, _dir) = test_bridge(host.clone()).await;
        let (_handle, cancel) = spawn_monitor(&bridge, MonitorKind::Layout);
        wait_subscribed(&host, 1).await;

        host.set_layout(layout([("t1", vec!["a", "b"])]));
        host.emit_layout();

        match client.next_event().await {
            OutboundMessage::Sessions { sessions } => {
                let ids: Vec<_> = sessions.iter().map(|s| s.session_id.as_str()).collect();
                assert_eq!(ids, vec!["a", "b"]);
            }
            other => panic!("expected sessions, got {other:?}"),
        }
        assert!(bridge.channels().contains("b").await);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_new_session_is_attached_immediately() {
        let host = Arc::new(FakeHost::single("a"));
        let (bridge, _client, _dir) = test_bridge(host.clone()).await;
        let (_handle, cancel) = spawn_monitor(&bridge, MonitorKind::NewSession);
        wait_subscribed(&host, 2).await;

        host.set_layout(layout([("t1", vec!["a"]), ("t2", vec!["n"])]));
        host.emit_new_session("n");

        let b = &bridge;
        wait_until(|| async move { b.channels().contains("n").await }).await;
        assert!(bridge.registry().contains("n").await);
        assert_eq!(host.coprocess_launches("n"), 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_failed_subscription_is_reported_and_retried() {
        let host = Arc::new(FakeHost::single("a"));
        host.fail("subscribe_layout");
        let (bridge, mut client, _dir) = test_bridge(host.clone()).await;
        let (handle, cancel) = spawn_monitor(&bridge, MonitorKind::Layout);

        match client.next().await {
            OutboundMessage::Error { message } => {
                assert!(message.starts_with("layout monitor failed"))
            }
            other => panic!("expected error, got {other:?}"),
        }

        host.recover("subscribe_layout");
        wait_subscribed(&host, 1).await;
        assert!(!handle.is_finished());

        cancel.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_closed_stream_ends_supervision() {
        let host = Arc::new(FakeHost::single("a"));
        let (bridge, _client, _dir) = test_bridge(host.clone()).await;
        let (handle, _cancel) = spawn_monitor(&bridge, MonitorKind::Focus);
        wait_subscribed(&host, 0).await;

        host.disconnect();
        let err = handle.await.unwrap().unwrap_err();
        assert!(err.is_connection_level());
    }
}
