use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::LauncherError;
use crate::host::{HostColor, ProfileSnapshot};
use crate::protocol::TerminalConfig;

// =============================================================================
// File config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [capture]
//                    settle_delay_ms = 250
//
//   env var:         TERM_BRIDGE_CAPTURE__SETTLE_DELAY_MS=250

pub const ENV_PREFIX: &str = "TERM_BRIDGE_";
pub const LAUNCHER_NAME: &str = "term-bridge-capture";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub bridge: BridgeFileConfig,
    #[serde(default)]
    pub capture: CaptureFileConfig,
    #[serde(default)]
    pub screen: ScreenFileConfig,
    #[serde(default)]
    pub monitors: MonitorsFileConfig,
    #[serde(default)]
    pub tmux: TmuxFileConfig,
    #[serde(default)]
    pub profile_defaults: ProfileDefaults,
}

/// Client-facing socket (lives under `[bridge]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BridgeFileConfig {
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    #[serde(default = "default_send_queue_capacity")]
    pub send_queue_capacity: usize,
    #[serde(default = "default_read_chunk_bytes")]
    pub read_chunk_bytes: usize,
}

impl Default for BridgeFileConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            send_queue_capacity: default_send_queue_capacity(),
            read_chunk_bytes: default_read_chunk_bytes(),
        }
    }
}

/// Capture coprocesses (lives under `[capture]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CaptureFileConfig {
    /// Defaults to `term-bridge-capture` next to the running executable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launcher: Option<PathBuf>,
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,
    #[serde(default = "default_socket_prefix")]
    pub socket_prefix: String,
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
}

impl Default for CaptureFileConfig {
    fn default() -> Self {
        Self {
            launcher: None,
            socket_dir: default_socket_dir(),
            socket_prefix: default_socket_prefix(),
            settle_delay_ms: default_settle_delay_ms(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScreenFileConfig {
    #[serde(default = "default_fresh_wait_ms")]
    pub fresh_wait_ms: u64,
}

impl Default for ScreenFileConfig {
    fn default() -> Self {
        Self {
            fresh_wait_ms: default_fresh_wait_ms(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonitorsFileConfig {
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
}

impl Default for MonitorsFileConfig {
    fn default() -> Self {
        Self {
            restart_delay_ms: default_restart_delay_ms(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TmuxFileConfig {
    #[serde(default = "default_tmux_binary")]
    pub binary: String,
    /// Passed as `tmux -L <name>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_name: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for TmuxFileConfig {
    fn default() -> Self {
        Self {
            binary: default_tmux_binary(),
            socket_name: None,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Values used for profile fields the host cannot report
/// (lives under `[profile_defaults]`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProfileDefaults {
    #[serde(default = "default_font")]
    pub font: String,
    #[serde(default = "default_cursor_type")]
    pub cursor_type: String,
    #[serde(default)]
    pub cursor_blink: bool,
    /// Scrollback reported when the profile is unlimited or unknown.
    #[serde(default = "default_unlimited_scrollback")]
    pub unlimited_scrollback: u64,
    #[serde(default = "default_color")]
    pub color: String,
}

impl Default for ProfileDefaults {
    fn default() -> Self {
        Self {
            font: default_font(),
            cursor_type: default_cursor_type(),
            cursor_blink: false,
            unlimited_scrollback: default_unlimited_scrollback(),
            color: default_color(),
        }
    }
}

impl ProfileDefaults {
    /// Build the client's terminal config, one field at a time, falling back
    /// to this table wherever the profile has no value.
    pub fn resolve(&self, profile: &ProfileSnapshot) -> TerminalConfig {
        let color = |c: &Option<HostColor>| {
            c.as_ref()
                .map(HostColor::to_hex)
                .unwrap_or_else(|| self.color.clone())
        };

        let scrollback = match (profile.unlimited_scrollback, profile.scrollback_lines) {
            (Some(false), Some(lines)) => lines,
            _ => self.unlimited_scrollback,
        };

        TerminalConfig {
            font: profile
                .normal_font
                .clone()
                .unwrap_or_else(|| self.font.clone()),
            cursor_type: profile
                .cursor_type
                .clone()
                .unwrap_or_else(|| self.cursor_type.clone()),
            cursor_blink: profile.blinking_cursor.unwrap_or(self.cursor_blink),
            scrollback,
            foreground: color(&profile.foreground_color),
            background: color(&profile.background_color),
            cursor: color(&profile.cursor_color),
            selection_color: color(&profile.selection_color),
            ansi_colors: profile.ansi_colors.iter().map(color).collect(),
        }
    }
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/tmp/term-bridge.sock")
}
fn default_send_queue_capacity() -> usize {
    1024
}
fn default_read_chunk_bytes() -> usize {
    64 * 1024
}
fn default_socket_dir() -> PathBuf {
    PathBuf::from("/tmp")
}
fn default_socket_prefix() -> String {
    "term-bridge-capture-".to_string()
}
fn default_settle_delay_ms() -> u64 {
    500
}
fn default_fresh_wait_ms() -> u64 {
    100
}
fn default_restart_delay_ms() -> u64 {
    1000
}
fn default_tmux_binary() -> String {
    "tmux".to_string()
}
fn default_poll_interval_ms() -> u64 {
    250
}
fn default_font() -> String {
    "Monaco 12".to_string()
}
fn default_cursor_type() -> String {
    "CURSOR_TYPE_BLOCK".to_string()
}
fn default_unlimited_scrollback() -> u64 {
    100_000
}
fn default_color() -> String {
    "#ffffff".to_string()
}

/// Build a figment that layers: defaults → config.toml → TERM_BRIDGE_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `TERM_BRIDGE_TMUX__SOCKET_NAME=work`  →  `tmux.socket_name = "work"`
pub fn load_config(config_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_dir.join("config.toml")))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
}

/// `--config-dir`, or `~/.term-bridge`.
pub fn resolve_config_dir(custom: Option<PathBuf>) -> Result<PathBuf> {
    match custom {
        Some(dir) => Ok(dir),
        None => Ok(dirs::home_dir()
            .context("Could not find home directory")?
            .join(".term-bridge")),
    }
}

/// Flags that sit above every file/env layer.
#[derive(Clone, Debug, Default)]
pub struct CliOverrides {
    pub socket_path: Option<PathBuf>,
    pub launcher: Option<PathBuf>,
    pub tmux_socket: Option<String>,
}

// =============================================================================
// Runtime config structs (derived from FileConfig)
// =============================================================================

#[derive(Clone, Debug)]
pub struct CaptureConfig {
    pub launcher: PathBuf,
    pub socket_dir: PathBuf,
    pub socket_prefix: String,
    /// Wait between killing a stale capture and retrying the launch.
    pub settle_delay: Duration,
    pub read_chunk_bytes: usize,
}

#[derive(Clone, Debug)]
pub struct TmuxConfig {
    pub binary: String,
    pub socket_name: Option<String>,
    pub poll_interval: Duration,
}

#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub socket_path: PathBuf,
    pub send_queue_capacity: usize,
    pub capture: CaptureConfig,
    /// Bound on the styled screen read before falling back to plain text.
    pub fresh_wait: Duration,
    pub monitor_restart_delay: Duration,
    pub tmux: TmuxConfig,
    pub profile_defaults: ProfileDefaults,
}

impl BridgeConfig {
    pub fn from_file(fc: &FileConfig, overrides: &CliOverrides) -> Self {
        let launcher = overrides
            .launcher
            .clone()
            .or_else(|| fc.capture.launcher.clone())
            .unwrap_or_else(default_launcher);

        Self {
            socket_path: overrides
                .socket_path
                .clone()
                .unwrap_or_else(|| fc.bridge.socket_path.clone()),
            send_queue_capacity: fc.bridge.send_queue_capacity.max(1),
            capture: CaptureConfig {
                launcher,
                socket_dir: fc.capture.socket_dir.clone(),
                socket_prefix: fc.capture.socket_prefix.clone(),
                settle_delay: Duration::from_millis(fc.capture.settle_delay_ms),
                read_chunk_bytes: fc.bridge.read_chunk_bytes.max(1),
            },
            fresh_wait: Duration::from_millis(fc.screen.fresh_wait_ms),
            monitor_restart_delay: Duration::from_millis(fc.monitors.restart_delay_ms),
            tmux: TmuxConfig {
                binary: fc.tmux.binary.clone(),
                socket_name: overrides
                    .tmux_socket
                    .clone()
                    .or_else(|| fc.tmux.socket_name.clone()),
                poll_interval: Duration::from_millis(fc.tmux.poll_interval_ms.max(10)),
            },
            profile_defaults: fc.profile_defaults.clone(),
        }
    }

    /// Load every layer and apply the CLI overrides.
    pub fn load(config_dir: &Path, overrides: &CliOverrides) -> Result<Self> {
        Ok(Self::from_file(&extract_file_config(config_dir)?, overrides))
    }
}

pub fn extract_file_config(config_dir: &Path) -> Result<FileConfig> {
    load_config(config_dir)
        .extract()
        .with_context(|| format!("Invalid configuration in {}", config_dir.display()))
}

/// The merged file/env configuration as TOML, for `--print-config`.
pub fn render_file_config(fc: &FileConfig) -> Result<String> {
    toml::to_string_pretty(fc).context("Failed to serialize configuration")
}

fn default_launcher() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(LAUNCHER_NAME)))
        .unwrap_or_else(|| PathBuf::from(LAUNCHER_NAME))
}

/// The launcher must exist, be a regular file and be executable.
pub fn check_launcher(path: &Path) -> Result<(), LauncherError> {
    let meta =
        std::fs::metadata(path).map_err(|_| LauncherError::NotFound(path.to_path_buf()))?;
    if !meta.is_file() {
        return Err(LauncherError::NotExecutable(path.to_path_buf()));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o111 == 0 {
            return Err(LauncherError::NotExecutable(path.to_path_buf()));
        }
    }

    Ok(())
}
