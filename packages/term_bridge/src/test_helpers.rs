//! Shared fixtures for unit tests: a scripted in-memory host and a client
//! harness that captures outbound lines.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use screen_render::ScreenSnapshot;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::bridge::Bridge;
use crate::client::ClientLink;
use crate::config::{BridgeConfig, CaptureConfig, CliOverrides, FileConfig};
use crate::coprocess::Reaper;
use crate::error::HostError;
use crate::host::{
    FocusUpdate, Host, HostLayout, LayoutUpdate, ProfileSnapshot, SessionId, SessionInfo,
    TabId, TabInfo, WindowInfo,
};
use crate::janitor::SocketJanitor;
use crate::protocol::OutboundMessage;

pub const TEST_CONN_ID: &str = "test-client";

/// Layout with one window `w1`. The first tab is current, each tab's first
/// session is its current session, and the first tab's current session is
/// active.
pub fn layout<'a>(tabs: impl IntoIterator<Item = (&'a str, Vec<&'a str>)>) -> HostLayout {
    let tabs: Vec<TabInfo> = tabs
        .into_iter()
        .map(|(tab_id, sessions)| TabInfo {
            id: tab_id.to_string(),
            current_session: sessions.first().map(|s| s.to_string()),
            sessions: sessions
                .into_iter()
                .map(|id| SessionInfo {
                    id: id.to_string(),
                    tab_id: tab_id.to_string(),
                    title: format!("{id} title"),
                })
                .collect(),
        })
        .collect();
    let current_tab = tabs.first().map(|t| t.id.clone());
    let active_session = tabs.first().and_then(|t| t.current_session.clone());
    HostLayout {
        windows: vec![WindowInfo {
            id: "w1".into(),
            tabs,
            current_tab,
        }],
        current_window: Some("w1".into()),
        active_session,
    }
}

/// Every mutating call the fake host received, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    SendText { session_id: String, text: String },
    RunCoprocess { session_id: String, command: String },
    SelectTab { tab_id: String },
    ActivateSession { session_id: String },
    CreateTab { window_id: String },
    CloseTab { tab_id: String },
}

struct FakeState {
    layout: HostLayout,
    screens: HashMap<SessionId, ScreenSnapshot>,
    styled: HashMap<SessionId, ScreenSnapshot>,
    styled_delay: Duration,
    coprocess_script: VecDeque<bool>,
    profile: ProfileSnapshot,
    failing: HashSet<&'static str>,
    disconnected: bool,
    calls: Vec<HostCall>,
    next_tab: usize,
}

struct Streams {
    focus: broadcast::Sender<FocusUpdate>,
    layout: broadcast::Sender<LayoutUpdate>,
    new_sessions: broadcast::Sender<SessionId>,
}

/// In-memory [`Host`] driven by the test.
pub struct FakeHost {
    state: Mutex<FakeState>,
    streams: Mutex<Option<Streams>>,
}

impl FakeHost {
    pub fn new(layout: HostLayout) -> Self {
        Self {
            state: Mutex::new(FakeState {
                layout,
                screens: HashMap::new(),
                styled: HashMap::new(),
                styled_delay: Duration::ZERO,
                coprocess_script: VecDeque::new(),
                profile: ProfileSnapshot::default(),
                failing: HashSet::new(),
                disconnected: false,
                calls: Vec::new(),
                next_tab: 100,
            }),
            streams: Mutex::new(Some(Streams {
                focus: broadcast::channel(64).0,
                layout: broadcast::channel(64).0,
                new_sessions: broadcast::channel(64).0,
            })),
        }
    }

    /// One window, one tab `t1`, one active session.
    pub fn single(session_id: &str) -> Self {
        Self::new(layout([("t1", vec![session_id])]))
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn set_layout(&self, layout: HostLayout) {
        self.state().layout = layout;
    }

    pub fn set_screen(&self, session_id: &str, snapshot: ScreenSnapshot) {
        self.state().screens.insert(session_id.into(), snapshot);
    }

    pub fn set_styled_screen(&self, session_id: &str, snapshot: ScreenSnapshot) {
        self.state().styled.insert(session_id.into(), snapshot);
    }

    pub fn set_styled_delay(&self, delay: Duration) {
        self.state().styled_delay = delay;
    }

    pub fn set_profile(&self, profile: ProfileSnapshot) {
        self.state().profile = profile;
    }

    /// Queue results for successive `run_coprocess` calls; once exhausted
    /// every launch succeeds.
    pub fn script_coprocess(&self, results: impl IntoIterator<Item = bool>) {
        self.state().coprocess_script.extend(results);
    }

    /// Make the named operation fail with a command error.
    pub fn fail(&self, op: &'static str) {
        self.state().failing.insert(op);
    }

    pub fn recover(&self, op: &'static str) {
        self.state().failing.remove(op);
    }

    /// Close every notification stream and fail every call with
    /// `Disconnected`.
    pub fn disconnect(&self) {
        self.state().disconnected = true;
        self.streams.lock().unwrap().take();
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.state().calls.clone()
    }

    pub fn coprocess_launches(&self, session_id: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, HostCall::RunCoprocess { session_id: s, .. } if s == session_id))
            .count()
    }

    pub fn sent_text(&self, session_id: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                HostCall::SendText { session_id: s, text } if s == session_id => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn emit_focus(&self, update: FocusUpdate) {
        if let Some(streams) = self.streams.lock().unwrap().as_ref() {
            let _ = streams.focus.send(update);
        }
    }

    pub fn emit_layout(&self) {
        if let Some(streams) = self.streams.lock().unwrap().as_ref() {
            let _ = streams.layout.send(LayoutUpdate);
        }
    }

    pub fn emit_new_session(&self, session_id: &str) {
        if let Some(streams) = self.streams.lock().unwrap().as_ref() {
            let _ = streams.new_sessions.send(session_id.to_string());
        }
    }

    /// Live receivers on the focus, layout and new-session streams.
    pub fn subscribers(&self) -> [usize; 3] {
        self.streams.lock().unwrap().as_ref().map_or([0; 3], |s| {
            [
                s.focus.receiver_count(),
                s.layout.receiver_count(),
                s.new_sessions.receiver_count(),
            ]
        })
    }

    fn check(&self, op: &'static str) -> Result<(), HostError> {
        let state = self.state();
        if state.disconnected {
            return Err(HostError::Disconnected);
        }
        if state.failing.contains(op) {
            return Err(HostError::Command {
                command: op.to_string(),
                message: "scripted failure".to_string(),
            });
        }
        Ok(())
    }

    fn record(&self, call: HostCall) {
        self.state().calls.push(call);
    }
}

#[async_trait]
impl Host for FakeHost {
    async fn probe(&self) -> Result<(), HostError> {
        if self.state().disconnected {
            return Err(HostError::Unavailable("fake host disconnected".into()));
        }
        Ok(())
    }

    async fn layout(&self) -> Result<HostLayout, HostError> {
        self.check("layout")?;
        Ok(self.state().layout.clone())
    }

    async fn session(&self, session_id: &str) -> Result<Option<SessionInfo>, HostError> {
        self.check("session")?;
        Ok(self.state().layout.find_session(session_id).cloned())
    }

    async fn subscribe_focus(&self) -> Result<broadcast::Receiver<FocusUpdate>, HostError> {
        self.check("subscribe_focus")?;
        let streams = self.streams.lock().unwrap();
        let streams = streams.as_ref().ok_or(HostError::Disconnected)?;
        Ok(streams.focus.subscribe())
    }

    async fn subscribe_layout(&self) -> Result<broadcast::Receiver<LayoutUpdate>, HostError> {
        self.check("subscribe_layout")?;
        let streams = self.streams.lock().unwrap();
        let streams = streams.as_ref().ok_or(HostError::Disconnected)?;
        Ok(streams.layout.subscribe())
    }

    async fn subscribe_new_sessions(&self) -> Result<broadcast::Receiver<SessionId>, HostError> {
        self.check("subscribe_new_sessions")?;
        let streams = self.streams.lock().unwrap();
        let streams = streams.as_ref().ok_or(HostError::Disconnected)?;
        Ok(streams.new_sessions.subscribe())
    }

    async fn screen(&self, session_id: &str) -> Result<Option<ScreenSnapshot>, HostError> {
        self.check("screen")?;
        let state = self.state();
        if let Some(snapshot) = state.screens.get(session_id) {
            return Ok(Some(snapshot.clone()));
        }
        Ok(state
            .layout
            .find_session(session_id)
            .map(|s| ScreenSnapshot::plain([format!("{}$", s.id)])))
    }

    async fn styled_screen(&self, session_id: &str) -> Result<Option<ScreenSnapshot>, HostError> {
        self.check("styled_screen")?;
        let delay = self.state().styled_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(self.state().styled.get(session_id).cloned())
    }

    async fn send_text(&self, session_id: &str, text: &str) -> Result<(), HostError> {
        self.check("send_text")?;
        self.record(HostCall::SendText {
            session_id: session_id.into(),
            text: text.into(),
        });
        Ok(())
    }

    async fn run_coprocess(&self, session_id: &str, command: &str) -> Result<bool, HostError> {
        self.check("run_coprocess")?;
        self.record(HostCall::RunCoprocess {
            session_id: session_id.into(),
            command: command.into(),
        });
        Ok(self.state().coprocess_script.pop_front().unwrap_or(true))
    }

    async fn select_tab(&self, tab_id: &str) -> Result<(), HostError> {
        self.check("select_tab")?;
        self.record(HostCall::SelectTab {
            tab_id: tab_id.into(),
        });
        let mut state = self.state();
        let current = state
            .layout
            .find_tab(tab_id)
            .ok_or_else(|| HostError::TabNotFound(tab_id.into()))?
            .current_session
            .clone();
        state.layout.active_session = current;
        Ok(())
    }

    async fn activate_session(&self, session_id: &str) -> Result<(), HostError> {
        self.check("activate_session")?;
        self.record(HostCall::ActivateSession {
            session_id: session_id.into(),
        });
        self.state().layout.active_session = Some(session_id.into());
        Ok(())
    }

    async fn create_tab(&self, window_id: &str) -> Result<TabId, HostError> {
        self.check("create_tab")?;
        self.record(HostCall::CreateTab {
            window_id: window_id.into(),
        });
        let mut state = self.state();
        state.next_tab += 1;
        let tab_id = format!("t{}", state.next_tab);
        let window = state
            .layout
            .windows
            .iter_mut()
            .find(|w| w.id == window_id)
            .ok_or_else(|| HostError::Unavailable(format!("no window {window_id}")))?;
        window.tabs.push(TabInfo {
            id: tab_id.clone(),
            sessions: Vec::new(),
            current_session: None,
        });
        Ok(tab_id)
    }

    async fn close_tab(&self, tab_id: &str) -> Result<(), HostError> {
        self.check("close_tab")?;
        self.record(HostCall::CloseTab {
            tab_id: tab_id.into(),
        });
        let mut state = self.state();
        for window in &mut state.layout.windows {
            window.tabs.retain(|t| t.id != tab_id);
        }
        Ok(())
    }

    async fn profile(&self, _session_id: &str) -> Result<ProfileSnapshot, HostError> {
        self.check("profile")?;
        Ok(self.state().profile.clone())
    }
}

/// Reaper that only remembers what it was asked to kill.
#[derive(Default)]
pub struct RecordingReaper {
    patterns: Mutex<Vec<String>>,
}

impl RecordingReaper {
    pub fn patterns(&self) -> Vec<String> {
        self.patterns.lock().unwrap().clone()
    }
}

#[async_trait]
impl Reaper for RecordingReaper {
    async fn terminate(&self, pattern: &str) {
        self.patterns.lock().unwrap().push(pattern.to_string());
    }
}

pub fn capture_config(socket_dir: &Path) -> CaptureConfig {
    CaptureConfig {
        launcher: "/usr/local/bin/term-bridge-capture".into(),
        socket_dir: socket_dir.to_path_buf(),
        socket_prefix: "cap-".into(),
        settle_delay: Duration::ZERO,
        read_chunk_bytes: 64 * 1024,
    }
}

pub fn bridge_config(dir: &Path) -> BridgeConfig {
    let mut config = BridgeConfig::from_file(&FileConfig::default(), &CliOverrides::default());
    config.socket_path = dir.join("bridge.sock");
    config.capture = capture_config(dir);
    config.fresh_wait = Duration::from_millis(50);
    config.monitor_restart_delay = Duration::from_millis(10);
    config
}

/// Bridge over `host` with its client link already attached to a
/// [`TestClient`]. The temp dir holds the capture sockets.
pub async fn test_bridge(host: Arc<FakeHost>) -> (Bridge, TestClient, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let bridge = Bridge::new(
        host,
        Arc::new(bridge_config(dir.path())),
        SocketJanitor::new(),
        Arc::new(RecordingReaper::default()),
    );
    let client = TestClient::attach_to(bridge.client().clone()).await;
    (bridge, client, dir)
}

/// Receiving end of a [`ClientLink`].
pub struct TestClient {
    pub link: ClientLink,
    pub rx: mpsc::Receiver<String>,
    pub cancel: CancellationToken,
}

impl TestClient {
    pub async fn attach() -> Self {
        Self::attach_to(ClientLink::new()).await
    }

    pub async fn attach_to(link: ClientLink) -> Self {
        let (tx, rx) = mpsc::channel(1024);
        let cancel = CancellationToken::new();
        link.attach(TEST_CONN_ID, tx, cancel.clone()).await;
        Self { link, rx, cancel }
    }

    pub async fn next(&mut self) -> OutboundMessage {
        let line = tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("client link closed");
        assert!(line.ends_with('\n'));
        serde_json::from_str(&line).unwrap()
    }

    /// Next message that is not raw captured output.
    pub async fn next_event(&mut self) -> OutboundMessage {
        loop {
            let msg = self.next().await;
            if !matches!(msg, OutboundMessage::TerminalData { .. }) {
                return msg;
            }
        }
    }

    /// Everything already queued.
    pub fn drain(&mut self) -> Vec<OutboundMessage> {
        let mut out = Vec::new();
        while let Ok(line) = self.rx.try_recv() {
            out.push(serde_json::from_str(&line).unwrap());
        }
        out
    }

    pub async fn assert_quiet(&mut self) {
        if let Ok(Some(line)) =
            tokio::time::timeout(Duration::from_millis(50), self.rx.recv()).await
        {
            panic!("unexpected message: {line}");
        }
    }
}

pub async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
