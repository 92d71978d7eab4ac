//! Client for communicating with the mudprod daemon.
//!
//! Each request opens a fresh Unix socket connection, writes one JSON line,
//! and reads one JSON reply.

#![allow(unsafe_code)] // getuid() call

use crate::protocol::{ConnectArgs, Operation, Reply, Request, TriggerAction};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::{debug, warn};

/// Errors that can occur in the client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to server: {0}")]
    Connect(#[source] std::io::Error),

    #[error("failed to send request: {0}")]
    Send(#[source] std::io::Error),

    #[error("failed to receive response: {0}")]
    Receive(#[source] std::io::Error),

    #[error("failed to serialize request: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("failed to deserialize response: {0}")]
    Deserialize(#[source] serde_json::Error),

    #[error("server did not start in time")]
    ServerTimeout,

    #[error("connection lost")]
    ConnectionLost,
}

/// Get the default socket path for the mudprod daemon.
#[must_use]
pub fn default_socket_path() -> PathBuf {
    if let Some(runtime_dir) = dirs::runtime_dir() {
        runtime_dir.join("mudprod.sock")
    } else {
        // Fallback to /tmp/mudprod-$UID.sock
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/mudprod-{uid}.sock"))
    }
}

/// PID file that belongs next to `socket_path`.
#[must_use]
pub fn default_pid_path(socket_path: &Path) -> PathBuf {
    socket_path.with_extension("pid")
}

/// Background daemon log that belongs next to `socket_path`.
#[must_use]
pub fn default_log_path(socket_path: &Path) -> PathBuf {
    let stem = socket_path
        .file_stem()
        .map_or_else(|| "mudprod".into(), |s| s.to_string_lossy());
    socket_path.with_file_name(format!("{stem}-server.log"))
}

/// Client for the mudprod daemon.
#[derive(Debug, Clone)]
pub struct Client {
    socket_path: PathBuf,
}

impl Client {
    /// Create a new client that will connect to the given socket path.
    #[must_use]
    pub const fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    /// Create a client with the default socket path.
    #[must_use]
    pub fn with_default_path() -> Self {
        Self::new(default_socket_path())
    }

    /// Get the socket path.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Whether a daemon is accepting connections.
    pub async fn is_server_running(&self) -> bool {
        crate::server::is_server_running(&self.socket_path).await
    }

    /// Poll until the daemon accepts connections.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<(), ClientError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut attempts = 0u32;
        while tokio::time::Instant::now() < deadline {
            if self.is_server_running().await {
                debug!("server ready after {} attempts", attempts + 1);
                return Ok(());
            }
            attempts += 1;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Err(ClientError::ServerTimeout)
    }

    /// Send a request to the daemon and wait for its reply.
    pub async fn request(&self, request: &Request) -> Result<Reply, ClientError> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(ClientError::Connect)?;
        let mut stream = BufReader::new(stream);

        let mut json = serde_json::to_string(request).map_err(ClientError::Serialize)?;
        json.push('\n');

        stream
            .get_mut()
            .write_all(json.as_bytes())
            .await
            .map_err(ClientError::Send)?;

        let mut line = String::new();
        let n = stream
            .read_line(&mut line)
            .await
            .map_err(ClientError::Receive)?;

        if n == 0 {
            return Err(ClientError::ConnectionLost);
        }

        let reply: Reply = serde_json::from_str(&line).map_err(ClientError::Deserialize)?;

        if let Some(error) = reply.error_message() {
            warn!("server returned error: {}", error);
        }

        Ok(reply)
    }

    async fn call(&self, session: &str, op: Operation) -> Result<Reply, ClientError> {
        self.request(&Request::new(session, op)).await
    }

    /// Open a session.
    pub async fn connect(&self, session: &str, args: ConnectArgs) -> Result<Reply, ClientError> {
        self.call(session, Operation::Connect(args)).await
    }

    /// Send a command and wait for its response.
    pub async fn send(&self, session: &str, text: &str, wait: Duration) -> Result<Reply, ClientError> {
        self.call(
            session,
            Operation::Send {
                text: text.to_string(),
                wait_time: wait.as_secs_f64(),
            },
        )
        .await
    }

    pub async fn send_raw(&self, session: &str, text: &str) -> Result<Reply, ClientError> {
        self.call(
            session,
            Operation::SendRaw {
                text: text.to_string(),
            },
        )
        .await
    }

    pub async fn read(&self, session: &str) -> Result<Reply, ClientError> {
        self.call(session, Operation::Read).await
    }

    pub async fn peek(&self, session: &str, max_wait: Duration) -> Result<Reply, ClientError> {
        self.call(
            session,
            Operation::Peek {
                max_wait: max_wait.as_secs_f64(),
            },
        )
        .await
    }

    pub async fn batch(
        &self,
        session: &str,
        commands: Vec<String>,
        wait: Duration,
        fast: bool,
    ) -> Result<Reply, ClientError> {
        self.call(
            session,
            Operation::Batch {
                commands,
                wait_time: wait.as_secs_f64(),
                fast,
            },
        )
        .await
    }

    /// Status of one session, or of all sessions when `session` is `None`.
    pub async fn status(&self, session: Option<&str>) -> Result<Reply, ClientError> {
        let request = session.map_or_else(
            || Request::global(Operation::Status),
            |name| Request::new(name, Operation::Status),
        );
        self.request(&request).await
    }

    pub async fn disconnect(&self, session: &str) -> Result<Reply, ClientError> {
        self.call(session, Operation::Disconnect).await
    }

    pub async fn repeat(&self, session: &str, text: &str) -> Result<Reply, ClientError> {
        self.call(
            session,
            Operation::Repeat {
                text: text.to_string(),
            },
        )
        .await
    }

    pub async fn trigger(
        &self,
        session: &str,
        pattern: &str,
        text: &str,
        action: TriggerAction,
    ) -> Result<Reply, ClientError> {
        self.call(
            session,
            Operation::Trigger {
                pattern: pattern.to_string(),
                text: text.to_string(),
                action,
            },
        )
        .await
    }

    pub async fn triggers(&self, session: &str) -> Result<Reply, ClientError> {
        self.call(session, Operation::Triggers).await
    }

    pub async fn shutdown(&self) -> Result<Reply, ClientError> {
        self.request(&Request::global(Operation::Shutdown)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sibling_paths() {
        let socket = PathBuf::from("/run/user/1000/mudprod.sock");
        assert_eq!(
            default_pid_path(&socket),
            PathBuf::from("/run/user/1000/mudprod.pid")
        );
        assert_eq!(
            default_log_path(&socket),
            PathBuf::from("/run/user/1000/mudprod-server.log")
        );

        let socket = PathBuf::from("/tmp/mudprod-1000.sock");
        assert_eq!(
            default_log_path(&socket),
            PathBuf::from("/tmp/mudprod-1000-server.log")
        );
    }

    #[tokio::test]
    async fn test_request_without_server() {
        let dir = tempfile::tempdir().expect("tempdir");
        let client = Client::new(dir.path().join("none.sock"));
        assert!(!client.is_server_running().await);
        assert!(matches!(
            client.read("default").await,
            Err(ClientError::Connect(_))
        ));
        assert!(matches!(
            client.wait_until_ready(Duration::from_millis(250)).await,
            Err(ClientError::ServerTimeout)
        ));
    }
}
