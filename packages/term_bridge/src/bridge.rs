use std::collections::HashSet;
use std::sync::Arc;

use screen_render::render_snapshot;
use tracing::{error, info, warn};

use crate::client::ClientLink;
use crate::config::BridgeConfig;
use crate::coprocess::{CoprocessManager, Reaper};
use crate::error::{BridgeError, CoprocessError};
use crate::host::{Host, SessionId};
use crate::janitor::SocketJanitor;
use crate::protocol::{OutboundMessage, SessionEntry};
use crate::registry::SessionRegistry;
use crate::screen::capture_screen;

/// State shared by every connection: the host handle, the session registry,
/// the capture channels and the outbound client link.
///
/// Lives for the whole process; connections come and go around it.
#[derive(Clone)]
pub struct Bridge {
    host: Arc<dyn Host>,
    registry: SessionRegistry,
    channels: CoprocessManager,
    client: ClientLink,
    config: Arc<BridgeConfig>,
}

impl Bridge {
    pub fn new(
        host: Arc<dyn Host>,
        config: Arc<BridgeConfig>,
        janitor: SocketJanitor,
        reaper: Arc<dyn Reaper>,
    ) -> Self {
        let client = ClientLink::new();
        let channels =
            CoprocessManager::new(config.capture.clone(), client.clone(), janitor, reaper);
        Self {
            host,
            registry: SessionRegistry::new(),
            channels,
            client,
            config,
        }
    }

    pub fn host(&self) -> &dyn Host {
        self.host.as_ref()
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn channels(&self) -> &CoprocessManager {
        &self.channels
    }

    pub fn client(&self) -> &ClientLink {
        &self.client
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub async fn active_session(&self) -> Result<Option<SessionId>, BridgeError> {
        Ok(self.host.layout().await?.active_session)
    }

    /// Walk every window, tab and session, record them, attach captures for
    /// new sessions, drop the ones that disappeared, then send one `sessions`
    /// message followed by the active session's screen.
    pub async fn enumerate_and_send(&self) -> Result<(), BridgeError> {
        let layout = self.host.layout().await?;
        let active = layout.active_session.clone();

        let mut seen: HashSet<SessionId> = HashSet::new();
        let mut entries = Vec::new();
        for session in layout.sessions() {
            if !seen.insert(session.id.clone()) {
                continue;
            }
            self.registry.record(session.clone()).await;
            if let Err(e) = self.channels.attach(self.host(), &session.id).await {
                warn!(session_id = %session.id, "Could not attach capture: {}", e);
            }
            entries.push(SessionEntry {
                session_id: session.id.clone(),
                tab_id: session.tab_id.clone(),
                title: session.title.clone(),
                is_active: active.as_deref() == Some(session.id.as_str()),
            });
        }

        self.prune(&seen).await;

        info!("Enumerated {} session(s)", entries.len());
        self.client
            .send(OutboundMessage::Sessions { sessions: entries })
            .await;

        if let Some(session_id) = active {
            if let Err(e) = self.send_session_screen(&session_id).await {
                self.report("Failed to send active screen", e).await?;
            }
        }
        Ok(())
    }

    /// Forget sessions that are no longer in the host layout and close their
    /// captures.
    async fn prune(&self, live: &HashSet<SessionId>) {
        let mut gone: Vec<SessionId> = self
            .registry
            .ids()
            .await
            .into_iter()
            .chain(self.channels.session_ids().await)
            .filter(|id| !live.contains(id))
            .collect();
        gone.sort();
        gone.dedup();

        for session_id in gone {
            info!(session_id = %session_id, "Session vanished from host");
            if let Err(e) = self.forget_session(&session_id).await {
                warn!(session_id = %session_id, "Failed to detach vanished session: {}", e);
            }
        }
    }

    /// Drop a session from the registry and close its capture in one step.
    pub async fn forget_session(&self, session_id: &str) -> Result<bool, CoprocessError> {
        self.registry
            .remove_with(session_id, || self.channels.detach(session_id))
            .await
    }

    /// Render a session's screen and send it as `initial_terminal_data`.
    ///
    /// Sessions missing from the registry are looked up on the host first;
    /// unknown ones are logged and skipped.
    pub async fn send_session_screen(&self, session_id: &str) -> Result<(), BridgeError> {
        if !self.registry.contains(session_id).await {
            match self.host.session(session_id).await? {
                Some(info) => {
                    self.registry.record(info).await;
                }
                None => {
                    warn!(
                        session_id = %session_id,
                        "Session not found for screen capture. Known sessions: {:?}",
                        self.registry.ids().await
                    );
                    return Ok(());
                }
            }
        }

        let Some(snapshot) = capture_screen(self.host(), session_id, self.config.fresh_wait).await?
        else {
            warn!(session_id = %session_id, "Session has no screen to send");
            return Ok(());
        };

        let rendered = render_snapshot(&snapshot);
        info!(
            session_id = %session_id,
            "Sending screen ({} lines, {} bytes)",
            snapshot.line_count(),
            rendered.len()
        );
        self.client
            .send(OutboundMessage::initial_terminal_data(session_id, &rendered))
            .await;
        Ok(())
    }

    /// Send the active session's profile as a `config` message.
    pub async fn send_config(&self) -> Result<(), BridgeError> {
        let Some(session_id) = self.active_session().await? else {
            warn!("No active session to read config from");
            return Ok(());
        };

        match self.host.profile(&session_id).await {
            Ok(profile) => {
                let config = self.config.profile_defaults.resolve(&profile);
                self.client.send(OutboundMessage::Config(config)).await;
                info!(session_id = %session_id, "Sent profile config");
                Ok(())
            }
            Err(e) => {
                let err = BridgeError::from(e);
                if err.is_connection_level() {
                    return Err(err);
                }
                error!("Failed to read config: {}", err);
                self.client
                    .send(OutboundMessage::error(format!("Failed to read config: {err}")))
                    .await;
                Ok(())
            }
        }
    }

    /// Full state for a (re)connected client: `sessions` (plus the active
    /// screen), `config`, then `ready`.
    pub async fn resend_initial_state(&self) -> Result<(), BridgeError> {
        self.enumerate_and_send().await?;
        self.send_config().await?;
        self.client.send(OutboundMessage::Ready).await;
        info!("Sent initial state");
        Ok(())
    }

    /// Handle a failed operation: connection-level errors are returned for
    /// the caller to act on, anything else is logged and sent to the client.
    pub async fn report(&self, context: &str, err: BridgeError) -> Result<(), BridgeError> {
        if err.is_connection_level() {
            return Err(err);
        }
        error!("{}: {}", context, err);
        self.client
            .send(OutboundMessage::error(format!("{context}: {err}")))
            .await;
        Ok(())
    }
}
