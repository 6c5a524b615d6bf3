//! Capability surface of the terminal host.
//!
//! The bridge never owns host objects. Everything it learns about windows,
//! tabs and sessions comes back as plain descriptors, and every mutation goes
//! through a [`Host`] call.

pub mod tmux;

use async_trait::async_trait;
use screen_render::ScreenSnapshot;
use tokio::sync::broadcast;

use crate::error::HostError;

pub type SessionId = String;
pub type TabId = String;
pub type WindowId = String;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub tab_id: TabId,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabInfo {
    pub id: TabId,
    pub sessions: Vec<SessionInfo>,
    pub current_session: Option<SessionId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowInfo {
    pub id: WindowId,
    pub tabs: Vec<TabInfo>,
    pub current_tab: Option<TabId>,
}

/// Point-in-time view of every window, tab and session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostLayout {
    pub windows: Vec<WindowInfo>,
    pub current_window: Option<WindowId>,
    /// Current session of the current tab of the current window.
    pub active_session: Option<SessionId>,
}

impl HostLayout {
    pub fn tabs(&self) -> impl Iterator<Item = &TabInfo> {
        self.windows.iter().flat_map(|w| w.tabs.iter())
    }

    pub fn sessions(&self) -> impl Iterator<Item = &SessionInfo> {
        self.tabs().flat_map(|t| t.sessions.iter())
    }

    pub fn find_tab(&self, tab_id: &str) -> Option<&TabInfo> {
        self.tabs().find(|t| t.id == tab_id)
    }

    pub fn find_session(&self, session_id: &str) -> Option<&SessionInfo> {
        self.sessions().find(|s| s.id == session_id)
    }

    pub fn tab_ids(&self) -> Vec<TabId> {
        self.tabs().map(|t| t.id.clone()).collect()
    }
}

/// Focus-change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FocusUpdate {
    /// A tab became selected in its window.
    TabSelected { tab_id: TabId },
    /// Keyboard focus moved to another session without a tab change.
    SessionActivated { session_id: SessionId },
    /// Another window became current.
    WindowFocused { window_id: WindowId },
}

/// Tabs or splits were added or removed somewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutUpdate;

/// Color components in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostColor {
    pub red: f64,
    pub green: f64,
    pub blue: f64,
}

impl HostColor {
    pub fn to_hex(&self) -> String {
        fn channel(v: f64) -> u8 {
            (v.clamp(0.0, 1.0) * 255.0) as u8
        }
        format!(
            "#{:02x}{:02x}{:02x}",
            channel(self.red),
            channel(self.green),
            channel(self.blue)
        )
    }
}

/// Profile fields the host could read for a session. `None` means the host
/// does not know the value; the config layer substitutes its defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileSnapshot {
    pub normal_font: Option<String>,
    pub cursor_type: Option<String>,
    pub blinking_cursor: Option<bool>,
    pub unlimited_scrollback: Option<bool>,
    pub scrollback_lines: Option<u64>,
    pub foreground_color: Option<HostColor>,
    pub background_color: Option<HostColor>,
    pub cursor_color: Option<HostColor>,
    pub selection_color: Option<HostColor>,
    pub ansi_colors: [Option<HostColor>; 16],
}

/// Everything the bridge needs from a terminal host.
///
/// Subscriptions hand out broadcast receivers; a receiver reporting `Closed`
/// means the host connection is gone and is treated as a connection-level
/// failure.
#[async_trait]
pub trait Host: Send + Sync {
    /// Check that the host can be reached at all.
    async fn probe(&self) -> Result<(), HostError>;

    async fn layout(&self) -> Result<HostLayout, HostError>;

    /// Direct lookup, used when the registry does not know a session yet.
    async fn session(&self, session_id: &str) -> Result<Option<SessionInfo>, HostError>;

    async fn subscribe_focus(&self) -> Result<broadcast::Receiver<FocusUpdate>, HostError>;
    async fn subscribe_layout(&self) -> Result<broadcast::Receiver<LayoutUpdate>, HostError>;
    async fn subscribe_new_sessions(&self) -> Result<broadcast::Receiver<SessionId>, HostError>;

    /// Visible screen as plain text. `Ok(None)` when the session is gone.
    async fn screen(&self, session_id: &str) -> Result<Option<ScreenSnapshot>, HostError>;

    /// Visible screen with per-cell style. May be slow; callers bound it with
    /// a timeout and fall back to [`Host::screen`].
    async fn styled_screen(&self, session_id: &str) -> Result<Option<ScreenSnapshot>, HostError>;

    async fn send_text(&self, session_id: &str, text: &str) -> Result<(), HostError>;

    /// Launch `command` as the capture coprocess of a session.
    ///
    /// Returns `Ok(false)` when the host refuses because a coprocess is
    /// already running for that session.
    async fn run_coprocess(&self, session_id: &str, command: &str) -> Result<bool, HostError>;

    async fn select_tab(&self, tab_id: &str) -> Result<(), HostError>;
    async fn activate_session(&self, session_id: &str) -> Result<(), HostError>;
    async fn create_tab(&self, window_id: &str) -> Result<TabId, HostError>;
    async fn close_tab(&self, tab_id: &str) -> Result<(), HostError>;

    async fn profile(&self, session_id: &str) -> Result<ProfileSnapshot, HostError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> HostLayout {
        let s = |id: &str, tab: &str| SessionInfo {
            id: id.into(),
            tab_id: tab.into(),
            title: format!("title {id}"),
        };
        HostLayout {
            windows: vec![WindowInfo {
                id: "w1".into(),
                tabs: vec![
                    TabInfo {
                        id: "t1".into(),
                        sessions: vec![s("a", "t1"), s("b", "t1")],
                        current_session: Some("b".into()),
                    },
                    TabInfo {
                        id: "t2".into(),
                        sessions: vec![s("c", "t2")],
                        current_session: Some("c".into()),
                    },
                ],
                current_tab: Some("t1".into()),
            }],
            current_window: Some("w1".into()),
            active_session: Some("b".into()),
        }
    }

    #[test]
    fn test_layout_lookups() {
        let layout = layout();
        assert_eq!(layout.tab_ids(), vec!["t1".to_string(), "t2".to_string()]);
        assert_eq!(layout.sessions().count(), 3);
        assert_eq!(layout.find_tab("t2").unwrap().sessions.len(), 1);
        assert_eq!(layout.find_session("c").unwrap().tab_id, "t2");
        assert!(layout.find_tab("c").is_none());
        assert!(layout.find_session("t1").is_none());
    }

    #[test]
    fn test_color_to_hex() {
        let white = HostColor {
            red: 1.0,
            green: 1.0,
            blue: 1.0,
        };
        assert_eq!(white.to_hex(), "#ffffff");

        let mixed = HostColor {
            red: 0.5,
            green: 0.0,
            blue: 2.0,
        };
        assert_eq!(mixed.to_hex(), "#7f00ff");
    }
}
