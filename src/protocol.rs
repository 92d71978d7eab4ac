//! Protocol types for client-daemon IPC.
//!
//! One newline-terminated JSON request per connection, answered by one JSON
//! reply. Every reply carries `success`; failures carry `error` instead of the
//! command-specific fields.

use crate::connection::ConnectionState;
use crate::registry::SessionStatus;
use crate::response::Response;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Session used when a request names none.
pub const DEFAULT_SESSION: &str = "default";

/// Every command the daemon understands.
pub const COMMANDS: [&str; 12] = [
    "connect",
    "send",
    "send_raw",
    "read",
    "peek",
    "batch",
    "status",
    "disconnect",
    "repeat",
    "trigger",
    "triggers",
    "shutdown",
];

/// A request from client to daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Target session. `status` without a session reports every session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,

    #[serde(flatten)]
    pub op: Operation,
}

impl Request {
    /// A request against the named session.
    pub fn new(session: impl Into<String>, op: Operation) -> Self {
        Self {
            session: Some(session.into()),
            op,
        }
    }

    /// A request with no session field.
    #[must_use]
    pub const fn global(op: Operation) -> Self {
        Self { session: None, op }
    }

    /// The target session, falling back to [`DEFAULT_SESSION`].
    #[must_use]
    pub fn session_name(&self) -> &str {
        self.session.as_deref().unwrap_or(DEFAULT_SESSION)
    }

    /// Parse one request line.
    ///
    /// An unrecognized `command` is reported by name rather than as a serde
    /// error.
    pub fn parse(line: &str) -> Result<Self, String> {
        let value: serde_json::Value =
            serde_json::from_str(line).map_err(|e| format!("invalid JSON: {e}"))?;

        match value.get("command") {
            Some(serde_json::Value::String(command)) if !COMMANDS.contains(&command.as_str()) => {
                return Err(format!("unknown command: {command}"));
            }
            None => return Err("missing command".to_string()),
            _ => {}
        }

        serde_json::from_value(value).map_err(|e| format!("invalid request: {e}"))
    }
}

/// Operations, tagged by the `command` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Operation {
    /// Open (or reopen) a session.
    Connect(ConnectArgs),

    /// Send a line and wait for a prompt.
    Send {
        text: String,
        #[serde(default = "default_send_wait")]
        wait_time: f64,
    },

    /// Write text as-is, without waiting.
    SendRaw { text: String },

    /// Drain whatever is available.
    Read,

    /// Short readiness-polled read.
    Peek {
        #[serde(default = "default_peek_wait")]
        max_wait: f64,
    },

    /// Send several lines in order.
    Batch {
        #[serde(default)]
        commands: Vec<String>,
        #[serde(default = "default_batch_wait")]
        wait_time: f64,
        /// Skip the settle delay between write and first read.
        #[serde(default)]
        fast: bool,
    },

    Status,

    Disconnect,

    /// Set the repeat command; empty or `off` clears it.
    Repeat {
        #[serde(default)]
        text: String,
    },

    /// Add, remove, or clear pattern triggers.
    Trigger {
        #[serde(default)]
        pattern: String,
        #[serde(default)]
        text: String,
        #[serde(default)]
        action: TriggerAction,
    },

    /// List triggers and the repeat command.
    Triggers,

    Shutdown,
}

impl Operation {
    /// The wire name of this operation.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Connect(_) => "connect",
            Self::Send { .. } => "send",
            Self::SendRaw { .. } => "send_raw",
            Self::Read => "read",
            Self::Peek { .. } => "peek",
            Self::Batch { .. } => "batch",
            Self::Status => "status",
            Self::Disconnect => "disconnect",
            Self::Repeat { .. } => "repeat",
            Self::Trigger { .. } => "trigger",
            Self::Triggers => "triggers",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Fields of a `connect` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectArgs {
    pub host: String,
    pub port: u16,
    /// `(pattern, text)` pairs run in order after connecting.
    #[serde(default)]
    pub login_steps: Vec<(String, String)>,
    /// Connect timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub timeout: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_patterns: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_patterns: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_patterns: Option<Vec<String>>,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
}

impl ConnectArgs {
    /// Defaults for everything but the address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            login_steps: Vec::new(),
            timeout: default_connect_timeout(),
            success_patterns: None,
            failure_patterns: None,
            prompt_patterns: None,
            auto_reconnect: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerAction {
    #[default]
    Add,
    Remove,
    Clear,
}

const fn default_connect_timeout() -> f64 {
    15.0
}

const fn default_send_wait() -> f64 {
    5.0
}

const fn default_peek_wait() -> f64 {
    0.1
}

const fn default_batch_wait() -> f64 {
    2.0
}

const fn default_true() -> bool {
    true
}

/// Convert a seconds field, using `fallback` for negative or non-finite values.
#[must_use]
pub fn seconds(value: f64, fallback: Duration) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(fallback)
}

/// A reply from daemon to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub success: bool,
    #[serde(flatten)]
    pub body: ReplyBody,
}

impl Reply {
    #[must_use]
    pub const fn ok(body: ReplyBody) -> Self {
        Self {
            success: true,
            body,
        }
    }

    /// Create an error reply.
    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            body: ReplyBody::Error { error: msg.into() },
        }
    }

    /// A successful reply carrying only a message.
    pub fn message(msg: impl Into<String>) -> Self {
        Self::ok(ReplyBody::Message {
            message: msg.into(),
        })
    }

    /// The error text, if this is a failure.
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        match &self.body {
            ReplyBody::Error { error } => Some(error),
            _ => None,
        }
    }
}

/// Command-specific reply fields.
///
/// Untagged: variants are tried in order, so ones with more fields come
/// before ones whose fields are a subset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReplyBody {
    Error {
        error: String,
    },
    Send {
        raw: String,
        clean: String,
        lines: Vec<String>,
        prompt_detected: bool,
    },
    Peek {
        raw: String,
        clean: String,
        has_data: bool,
    },
    Read {
        raw: String,
        clean: String,
    },
    Batch {
        results: Vec<BatchItem>,
        count: usize,
    },
    Triggers {
        triggers: Vec<TriggerInfo>,
        repeat: Option<String>,
    },
    Sessions {
        sessions: BTreeMap<String, SessionStatus>,
    },
    Status(SessionStatus),
    Connected {
        state: ConnectionState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Message {
        message: String,
    },
    Empty {},
}

impl ReplyBody {
    #[must_use]
    pub fn send(response: &Response) -> Self {
        Self::Send {
            raw: response.raw().to_string(),
            clean: response.clean().to_string(),
            lines: response.lines().to_vec(),
            prompt_detected: response.prompt_detected(),
        }
    }

    #[must_use]
    pub fn read(response: &Response) -> Self {
        Self::Read {
            raw: response.raw().to_string(),
            clean: response.clean().to_string(),
        }
    }

    #[must_use]
    pub fn peek(response: &Response) -> Self {
        Self::Peek {
            raw: response.raw().to_string(),
            clean: response.clean().to_string(),
            has_data: !response.is_empty(),
        }
    }
}

/// One command's outcome within a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItem {
    pub command: String,
    pub raw: String,
    pub clean: String,
    pub prompt_detected: bool,
}

impl BatchItem {
    #[must_use]
    pub fn new(command: &str, response: &Response) -> Self {
        Self {
            command: command.to_string(),
            raw: response.raw().to_string(),
            clean: response.clean().to_string(),
            prompt_detected: response.prompt_detected(),
        }
    }
}

/// A registered trigger as listed by `triggers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerInfo {
    pub pattern: String,
    pub command: String,
}
