//! Append-only log of request/reply traffic.
//!
//! Enabled by pointing `MUDPROD_LOG` at a file.

use crate::protocol::{Operation, Reply, ReplyBody, Request};
use chrono::Local;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// Environment variable naming the I/O log file.
pub const LOG_ENV: &str = "MUDPROD_LOG";

const RULE: &str = "============================================================";

pub struct IoLog {
    path: PathBuf,
}

impl IoLog {
    #[must_use]
    pub const fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Read the log path from the environment; unset or empty disables it.
    #[must_use]
    pub fn from_env() -> Option<Self> {
        std::env::var_os(LOG_ENV)
            .filter(|v| !v.is_empty())
            .map(|v| Self::new(PathBuf::from(v)))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn request(&self, request: &Request) {
        let direction = format!(
            ">>> {} [{}]",
            request.op.name().to_uppercase(),
            request.session_name()
        );
        self.append(&direction, &describe_request(&request.op)).await;
    }

    pub async fn reply(&self, command: &str, reply: &Reply) {
        let direction = format!("<<< {}", command.to_uppercase());
        self.append(&direction, &describe_reply(reply)).await;
    }

    /// Write one framed block. Failures are logged and otherwise ignored.
    async fn append(&self, direction: &str, text: &str) {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        let block = format!("\n{RULE}\n[{timestamp}] {direction}\n{RULE}\n{text}\n");

        let result = async {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            file.write_all(block.as_bytes()).await?;
            file.flush().await
        }
        .await;

        if let Err(e) = result {
            warn!(path = %self.path.display(), error = %e, "could not write I/O log");
        }
    }
}

fn describe_request(op: &Operation) -> String {
    match op {
        Operation::Connect(args) => format!("{}:{}", args.host, args.port),
        Operation::Send { text, .. } | Operation::SendRaw { text } | Operation::Repeat { text } => {
            text.clone()
        }
        Operation::Batch { commands, .. } => commands.join("\n"),
        Operation::Trigger {
            pattern,
            text,
            action,
        } => format!("{action:?} '{pattern}' -> '{text}'"),
        _ => String::new(),
    }
}

fn describe_reply(reply: &Reply) -> String {
    match &reply.body {
        ReplyBody::Error { error } => format!("error: {error}"),
        ReplyBody::Send { clean, .. } | ReplyBody::Read { clean, .. } | ReplyBody::Peek { clean, .. } => {
            clean.clone()
        }
        ReplyBody::Batch { results, .. } => results
            .iter()
            .map(|item| format!("> {}\n{}", item.command, item.clean))
            .collect::<Vec<_>>()
            .join("\n"),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}
