//! [`Host`] backed by a tmux server.
//!
//! tmux sessions play the role of host windows, tmux windows are tabs and
//! panes are terminal sessions. tmux has no push notifications outside
//! control mode, so a poller diffs the layout at a fixed interval and feeds
//! the broadcast streams.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use screen_render::ScreenSnapshot;
use tokio::process::Command;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{
    FocusUpdate, Host, HostLayout, LayoutUpdate, ProfileSnapshot, SessionId, SessionInfo, TabId,
    TabInfo, WindowInfo,
};
use crate::config::TmuxConfig;
use crate::error::HostError;

const PANE_FORMAT: &str = "#{session_id}\t#{window_id}\t#{window_active}\t#{pane_id}\t#{pane_active}\t#{window_name}\t#{pane_title}";
const FOCUS_FORMAT: &str = "#{session_id}\t#{window_id}\t#{pane_id}";
const STREAM_CAPACITY: usize = 256;

/// Runs tmux commands against one server.
#[derive(Clone, Debug)]
struct Tmux {
    binary: String,
    socket_name: Option<String>,
}

impl Tmux {
    async fn run(&self, args: &[&str]) -> Result<String, HostError> {
        let mut cmd = Command::new(&self.binary);
        if let Some(name) = &self.socket_name {
            cmd.arg("-L").arg(name);
        }
        trace!("tmux {}", args.join(" "));

        let output = cmd.args(args).output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                HostError::Unavailable(format!("{} not found", self.binary))
            } else {
                HostError::Io(e)
            }
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(args.first().copied().unwrap_or(""), stderr.trim()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn layout(&self) -> Result<HostLayout, HostError> {
        let panes = self.run(&["list-panes", "-a", "-F", PANE_FORMAT]).await?;
        let rows: Vec<PaneRow> = panes.lines().filter_map(parse_pane_row).collect();

        // No attached client is not an error: tmux then has no focus to report.
        let focus = match self.run(&["display-message", "-p", FOCUS_FORMAT]).await {
            Ok(out) => out.lines().next().and_then(parse_focus),
            Err(e) => {
                debug!("No tmux focus available: {}", e);
                None
            }
        };
        Ok(build_layout(&rows, focus.as_ref()))
    }

    /// `display-message -p` against one target.
    async fn query(&self, target: &str, format: &str) -> Result<String, HostError> {
        let out = self
            .run(&["display-message", "-p", "-t", target, format])
            .await?;
        Ok(out.trim_end_matches('\n').to_string())
    }
}

/// Map tmux's stderr onto the host error taxonomy.
fn classify_failure(command: &str, stderr: &str) -> HostError {
    if stderr.contains("no server running") || stderr.contains("error connecting to") {
        return HostError::Unavailable(stderr.to_string());
    }
    HostError::Command {
        command: command.to_string(),
        message: stderr.to_string(),
    }
}

fn is_missing_target(err: &HostError) -> bool {
    matches!(err, HostError::Command { message, .. }
        if message.contains("can't find") || message.contains("not found"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PaneRow {
    window_id: String,
    tab_id: String,
    tab_active: bool,
    pane_id: String,
    pane_active: bool,
    tab_name: String,
    title: String,
}

fn parse_pane_row(line: &str) -> Option<PaneRow> {
    let mut fields = line.splitn(7, '\t');
    let row = PaneRow {
        window_id: fields.next()?.to_string(),
        tab_id: fields.next()?.to_string(),
        tab_active: fields.next()? == "1",
        pane_id: fields.next()?.to_string(),
        pane_active: fields.next()? == "1",
        tab_name: fields.next()?.to_string(),
        title: fields.next().unwrap_or("").to_string(),
    };
    (!row.pane_id.is_empty()).then_some(row)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Focus {
    window_id: String,
    tab_id: String,
    pane_id: String,
}

fn parse_focus(line: &str) -> Option<Focus> {
    let mut fields = line.split('\t');
    Some(Focus {
        window_id: fields.next().filter(|s| !s.is_empty())?.to_string(),
        tab_id: fields.next()?.to_string(),
        pane_id: fields.next()?.to_string(),
    })
}

/// Group pane rows into windows and tabs, keeping tmux's order.
fn build_layout(rows: &[PaneRow], focus: Option<&Focus>) -> HostLayout {
    let mut windows: Vec<WindowInfo> = Vec::new();
    for row in rows {
        let window = match windows.iter_mut().position(|w| w.id == row.window_id) {
            Some(i) => &mut windows[i],
            None => {
                windows.push(WindowInfo {
                    id: row.window_id.clone(),
                    tabs: Vec::new(),
                    current_tab: None,
                });
                let last = windows.len() - 1;
                &mut windows[last]
            }
        };
        if row.tab_active {
            window.current_tab = Some(row.tab_id.clone());
        }

        let tab = match window.tabs.iter_mut().position(|t| t.id == row.tab_id) {
            Some(i) => &mut window.tabs[i],
            None => {
                window.tabs.push(TabInfo {
                    id: row.tab_id.clone(),
                    sessions: Vec::new(),
                    current_session: None,
                });
                let last = window.tabs.len() - 1;
                &mut window.tabs[last]
            }
        };
        if row.pane_active {
            tab.current_session = Some(row.pane_id.clone());
        }

        let title = if row.title.is_empty() {
            row.tab_name.clone()
        } else {
            row.title.clone()
        };
        tab.sessions.push(SessionInfo {
            id: row.pane_id.clone(),
            tab_id: row.tab_id.clone(),
            title,
        });
    }

    let current_window = focus
        .map(|f| f.window_id.clone())
        .filter(|id| windows.iter().any(|w| &w.id == id))
        .or_else(|| windows.first().map(|w| w.id.clone()));

    let active_session = current_window
        .as_deref()
        .and_then(|id| windows.iter().find(|w| w.id == id))
        .and_then(|w| {
            let tab_id = w.current_tab.as_deref()?;
            w.tabs.iter().find(|t| t.id == tab_id)
        })
        .and_then(|t| t.current_session.clone());

    HostLayout {
        windows,
        current_window,
        active_session,
    }
}

fn current_tab(layout: &HostLayout) -> Option<&TabId> {
    let window_id = layout.current_window.as_deref()?;
    layout
        .windows
        .iter()
        .find(|w| w.id == window_id)?
        .current_tab
        .as_ref()
}

/// Tab and session ids in order; titles and focus are not structure.
fn structure(layout: &HostLayout) -> Vec<(&str, Vec<&str>)> {
    layout
        .tabs()
        .map(|t| {
            (
                t.id.as_str(),
                t.sessions.iter().map(|s| s.id.as_str()).collect(),
            )
        })
        .collect()
}

#[derive(Debug, Default, PartialEq, Eq)]
struct LayoutDiff {
    layout_changed: bool,
    new_sessions: Vec<SessionId>,
    focus: Vec<FocusUpdate>,
}

fn diff_layouts(prev: &HostLayout, next: &HostLayout) -> LayoutDiff {
    let known: HashSet<&str> = prev.sessions().map(|s| s.id.as_str()).collect();
    let new_sessions = next
        .sessions()
        .filter(|s| !known.contains(s.id.as_str()))
        .map(|s| s.id.clone())
        .collect();

    let mut focus = Vec::new();
    if next.current_window != prev.current_window {
        if let Some(window_id) = &next.current_window {
            focus.push(FocusUpdate::WindowFocused {
                window_id: window_id.clone(),
            });
        }
    }
    let next_tab = current_tab(next);
    if next_tab != current_tab(prev) {
        if let Some(tab_id) = next_tab {
            focus.push(FocusUpdate::TabSelected {
                tab_id: tab_id.clone(),
            });
        }
    } else if next.active_session != prev.active_session {
        if let Some(session_id) = &next.active_session {
            focus.push(FocusUpdate::SessionActivated {
                session_id: session_id.clone(),
            });
        }
    }

    LayoutDiff {
        layout_changed: structure(prev) != structure(next),
        new_sessions,
        focus,
    }
}

/// Lines of a `capture-pane -p` dump.
fn capture_lines(output: &str) -> Vec<&str> {
    output.strip_suffix('\n').unwrap_or(output).split('\n').collect()
}

/// Replay `capture-pane -p -e` output through a terminal of the pane's size.
fn replay_styled(output: &str, cols: u16, rows: u16) -> ScreenSnapshot {
    let mut parser = vt100::Parser::new(rows.max(1), cols.max(1), 0);
    for (i, line) in capture_lines(output).into_iter().enumerate() {
        if i > 0 {
            parser.process(b"\r\n");
        }
        parser.process(line.as_bytes());
    }
    ScreenSnapshot::from_vt100(parser.screen())
}

fn parse_size(out: &str) -> Option<(u16, u16)> {
    let (cols, rows) = out.trim().split_once('\t')?;
    Some((cols.parse().ok()?, rows.parse().ok()?))
}

struct Streams {
    focus: broadcast::Sender<FocusUpdate>,
    layout: broadcast::Sender<LayoutUpdate>,
    new_sessions: broadcast::Sender<SessionId>,
}

type SharedStreams = Arc<Mutex<Option<Streams>>>;

fn lock_streams(streams: &SharedStreams) -> MutexGuard<'_, Option<Streams>> {
    streams.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct TmuxHost {
    tmux: Tmux,
    streams: SharedStreams,
    poller: CancellationToken,
}

impl TmuxHost {
    /// Create the host and start its layout poller. Must be called from
    /// within a tokio runtime.
    pub fn start(config: &TmuxConfig) -> Self {
        let tmux = Tmux {
            binary: config.binary.clone(),
            socket_name: config.socket_name.clone(),
        };
        let streams: SharedStreams = Arc::new(Mutex::new(Some(Streams {
            focus: broadcast::channel(STREAM_CAPACITY).0,
            layout: broadcast::channel(STREAM_CAPACITY).0,
            new_sessions: broadcast::channel(STREAM_CAPACITY).0,
        })));
        let poller = CancellationToken::new();

        tokio::spawn(poll_layout(
            tmux.clone(),
            streams.clone(),
            config.poll_interval,
            poller.clone(),
        ));

        Self {
            tmux,
            streams,
            poller,
        }
    }

    async fn pane_tab(&self, session_id: &str) -> Result<TabId, HostError> {
        self.tmux
            .layout()
            .await?
            .find_session(session_id)
            .map(|s| s.tab_id.clone())
            .ok_or_else(|| HostError::SessionNotFound(session_id.to_string()))
    }

    fn subscribe<T>(
        &self,
        pick: impl FnOnce(&Streams) -> broadcast::Receiver<T>,
    ) -> Result<broadcast::Receiver<T>, HostError> {
        lock_streams(&self.streams)
            .as_ref()
            .map(pick)
            .ok_or(HostError::Disconnected)
    }
}

impl Drop for TmuxHost {
    fn drop(&mut self) {
        self.poller.cancel();
    }
}

/// Diff the layout every `interval` and publish what changed. Nothing is
/// published for the first poll. Losing the server closes every stream.
async fn poll_layout(
    tmux: Tmux,
    streams: SharedStreams,
    interval: std::time::Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut previous: Option<HostLayout> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let layout = match tmux.layout().await {
            Ok(layout) => layout,
            Err(HostError::Unavailable(reason)) => {
                warn!("tmux server went away: {}", reason);
                lock_streams(&streams).take();
                return;
            }
            Err(e) => {
                warn!("tmux layout poll failed: {}", e);
                continue;
            }
        };

        if let Some(prev) = &previous {
            let diff = diff_layouts(prev, &layout);
            if let Some(streams) = lock_streams(&streams).as_ref() {
                for session_id in diff.new_sessions {
                    debug!(session_id = %session_id, "tmux pane appeared");
                    let _ = streams.new_sessions.send(session_id);
                }
                if diff.layout_changed {
                    let _ = streams.layout.send(LayoutUpdate);
                }
                for update in diff.focus {
                    debug!("tmux focus: {:?}", update);
                    let _ = streams.focus.send(update);
                }
            }
        }
        previous = Some(layout);
    }
}

#[async_trait]
impl Host for TmuxHost {
    async fn probe(&self) -> Result<(), HostError> {
        let out = self
            .tmux
            .run(&["list-sessions", "-F", "#{session_id}"])
            .await?;
        info!("Connected to tmux ({} session(s))", out.lines().count());
        Ok(())
    }

    async fn layout(&self) -> Result<HostLayout, HostError> {
        self.tmux.layout().await
    }

    async fn session(&self, session_id: &str) -> Result<Option<SessionInfo>, HostError> {
        Ok(self.tmux.layout().await?.find_session(session_id).cloned())
    }

    async fn subscribe_focus(&self) -> Result<broadcast::Receiver<FocusUpdate>, HostError> {
        self.subscribe(|s| s.focus.subscribe())
    }

    async fn subscribe_layout(&self) -> Result<broadcast::Receiver<LayoutUpdate>, HostError> {
        self.subscribe(|s| s.layout.subscribe())
    }

    async fn subscribe_new_sessions(&self) -> Result<broadcast::Receiver<SessionId>, HostError> {
        self.subscribe(|s| s.new_sessions.subscribe())
    }

    async fn screen(&self, session_id: &str) -> Result<Option<ScreenSnapshot>, HostError> {
        match self
            .tmux
            .run(&["capture-pane", "-p", "-t", session_id])
            .await
        {
            Ok(out) => Ok(Some(ScreenSnapshot::plain(capture_lines(&out)))),
            Err(e) if is_missing_target(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn styled_screen(&self, session_id: &str) -> Result<Option<ScreenSnapshot>, HostError> {
        let size = match self
            .tmux
            .query(session_id, "#{pane_width}\t#{pane_height}")
            .await
        {
            Ok(out) => out,
            Err(e) if is_missing_target(&e) => return Ok(None),
            Err(e) => return Err(e),
        };
        let Some((cols, rows)) = parse_size(&size) else {
            return Ok(None);
        };

        let out = self
            .tmux
            .run(&["capture-pane", "-p", "-e", "-t", session_id])
            .await?;
        Ok(Some(replay_styled(&out, cols, rows)))
    }

    async fn send_text(&self, session_id: &str, text: &str) -> Result<(), HostError> {
        self.tmux
            .run(&["send-keys", "-t", session_id, "-l", "--", text])
            .await
            .map_err(|e| {
                if is_missing_target(&e) {
                    HostError::SessionNotFound(session_id.to_string())
                } else {
                    e
                }
            })?;
        Ok(())
    }

    async fn run_coprocess(&self, session_id: &str, command: &str) -> Result<bool, HostError> {
        let piped = self
            .tmux
            .query(session_id, "#{pane_pipe}")
            .await
            .map_err(|e| {
                if is_missing_target(&e) {
                    HostError::SessionNotFound(session_id.to_string())
                } else {
                    e
                }
            })?;
        if piped == "1" {
            return Ok(false);
        }

        self.tmux
            .run(&["pipe-pane", "-I", "-O", "-o", "-t", session_id, command])
            .await?;
        Ok(true)
    }

    async fn select_tab(&self, tab_id: &str) -> Result<(), HostError> {
        match self.tmux.run(&["select-window", "-t", tab_id]).await {
            Err(e) if is_missing_target(&e) => Err(HostError::TabNotFound(tab_id.to_string())),
            other => other.map(|_| ()),
        }
    }

    async fn activate_session(&self, session_id: &str) -> Result<(), HostError> {
        let tab_id = self.pane_tab(session_id).await?;
        self.tmux.run(&["select-window", "-t", &tab_id]).await?;
        self.tmux.run(&["select-pane", "-t", session_id]).await?;
        Ok(())
    }

    async fn create_tab(&self, window_id: &str) -> Result<TabId, HostError> {
        let target = format!("{window_id}:");
        let out = self
            .tmux
            .run(&["new-window", "-P", "-F", "#{window_id}", "-t", &target])
            .await?;
        Ok(out.trim().to_string())
    }

    async fn close_tab(&self, tab_id: &str) -> Result<(), HostError> {
        match self.tmux.run(&["kill-window", "-t", tab_id]).await {
            Err(e) if is_missing_target(&e) => Err(HostError::TabNotFound(tab_id.to_string())),
            other => other.map(|_| ()),
        }
    }

    /// tmux panes carry no appearance profile.
    async fn profile(&self, _session_id: &str) -> Result<ProfileSnapshot, HostError> {
        Ok(ProfileSnapshot::default())
    }
}
