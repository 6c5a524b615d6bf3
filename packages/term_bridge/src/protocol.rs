//! Line-delimited JSON protocol spoken with the remote client.
//!
//! Every message is a single JSON object terminated by `\n`, discriminated by
//! its `type` field. Binary payloads (captured output, keystrokes, rendered
//! screens) always travel base64-encoded inside a string field.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// One entry of a `sessions` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEntry {
    pub session_id: String,
    pub tab_id: String,
    pub title: String,
    pub is_active: bool,
}

/// Terminal appearance sent in a `config` message. Field names follow the
/// client's camelCase convention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalConfig {
    pub font: String,
    pub cursor_type: String,
    pub cursor_blink: bool,
    pub scrollback: u64,
    pub foreground: String,
    pub background: String,
    pub cursor: String,
    pub selection_color: String,
    /// Always 16 `#rrggbb` entries.
    pub ansi_colors: Vec<String>,
}

/// Messages sent from the bridge to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Sessions {
        sessions: Vec<SessionEntry>,
    },
    /// Raw captured output, base64.
    TerminalData {
        session_id: String,
        data: String,
    },
    /// Full-redraw render of a session's screen, base64.
    InitialTerminalData {
        session_id: String,
        data: String,
    },
    TabSwitched {
        tab_id: String,
        session_id: Option<String>,
    },
    Config(TerminalConfig),
    Ready,
    Error {
        message: String,
    },
}

impl OutboundMessage {
    pub fn terminal_data(session_id: impl Into<String>, bytes: &[u8]) -> Self {
        OutboundMessage::TerminalData {
            session_id: session_id.into(),
            data: encode_payload(bytes),
        }
    }

    pub fn initial_terminal_data(session_id: impl Into<String>, bytes: &[u8]) -> Self {
        OutboundMessage::InitialTerminalData {
            session_id: session_id.into(),
            data: encode_payload(bytes),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        OutboundMessage::Error {
            message: message.into(),
        }
    }

    /// Wire name of this message, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::Sessions { .. } => "sessions",
            OutboundMessage::TerminalData { .. } => "terminal_data",
            OutboundMessage::InitialTerminalData { .. } => "initial_terminal_data",
            OutboundMessage::TabSwitched { .. } => "tab_switched",
            OutboundMessage::Config(_) => "config",
            OutboundMessage::Ready => "ready",
            OutboundMessage::Error { .. } => "error",
        }
    }
}

/// Messages sent from the client to the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// Keystrokes, base64. A missing `data` counts as empty input.
    TerminalInput {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default)]
        data: String,
    },
    TerminalResize {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cols: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<u16>,
    },
    /// `tab_id` may also carry a session id; the dispatcher handles both.
    TabSwitch {
        tab_id: String,
    },
    TabCreate,
    TabClose {
        tab_id: String,
    },
    RequestScreenRefresh {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    ResendInitialState,
}

impl InboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::TerminalInput { .. } => "terminal_input",
            InboundMessage::TerminalResize { .. } => "terminal_resize",
            InboundMessage::TabSwitch { .. } => "tab_switch",
            InboundMessage::TabCreate => "tab_create",
            InboundMessage::TabClose { .. } => "tab_close",
            InboundMessage::RequestScreenRefresh { .. } => "request_screen_refresh",
            InboundMessage::ResendInitialState => "resend_initial_state",
        }
    }
}

const INBOUND_KINDS: &[&str] = &[
    "terminal_input",
    "terminal_resize",
    "tab_switch",
    "tab_create",
    "tab_close",
    "request_screen_refresh",
    "resend_initial_state",
];

/// Decode one inbound line (without its trailing newline).
///
/// Unknown types are reported separately from malformed payloads so the
/// caller can log them differently; neither is ever fatal.
pub fn decode_line(line: &[u8]) -> Result<InboundMessage, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_slice(line).map_err(ProtocolError::InvalidJson)?;
    let kind = value
        .as_object()
        .ok_or(ProtocolError::NotAnObject)?
        .get("type")
        .and_then(serde_json::Value::as_str)
        .ok_or(ProtocolError::MissingType)?
        .to_string();

    if !INBOUND_KINDS.contains(&kind.as_str()) {
        return Err(ProtocolError::UnknownType(kind));
    }
    serde_json::from_value(value).map_err(|source| ProtocolError::Malformed { kind, source })
}

/// Serialize a message as one newline-terminated line. serde_json escapes
/// control characters, so the only raw `\n` is the terminator.
pub fn encode_line(msg: &OutboundMessage) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    Ok(line)
}

pub fn encode_payload(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

pub fn decode_payload(data: &str) -> Result<Vec<u8>, ProtocolError> {
    Ok(BASE64.decode(data)?)
}
