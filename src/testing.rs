//! Test framework for game-session scenarios.
//!
//! [`ScriptedServer`] stands in for a game server: it plays a fixed script
//! over TCP and records everything the client writes. [`TestHarness`] runs
//! a daemon on a private socket so scenarios can drive it like the CLI does.
//!
//! ```ignore
//! let game = ScriptedServer::start(vec![
//!     Step::send("Welcome!\n"),
//!     Step::expect("look"),
//!     Step::send("A dusty room.\n> "),
//! ]).await?;
//!
//! let harness = TestHarness::new().await?;
//! let session = harness.connect("default", game.port()).await?;
//! let output = session.send("look").await?;
//! assert!(output.contains("dusty"));
//! ```

use crate::client::Client;
use crate::protocol::{ConnectArgs, Reply, ReplyBody, TriggerAction};
use crate::server::{Daemon, Server, ServerError};
use parking_lot::Mutex;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::debug;

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

const POLL: Duration = Duration::from_millis(50);
const STARTUP: Duration = Duration::from_secs(5);

/// Errors from the test framework.
#[derive(Debug, Error)]
pub enum TestError {
    #[error("timeout waiting for condition")]
    Timeout,

    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("server replied with error: {0}")]
    Rejected(String),

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// One action of a scripted game server.
#[derive(Debug, Clone)]
pub enum Step {
    /// Write text to the client.
    Send(String),
    /// Read lines until one equals this, ignoring the line ending.
    Expect(String),
    /// Do nothing for a while.
    Pause(Duration),
    /// Hang up.
    Close,
}

impl Step {
    #[must_use]
    pub fn send(text: impl Into<String>) -> Self {
        Self::Send(text.into())
    }

    #[must_use]
    pub fn expect(line: impl Into<String>) -> Self {
        Self::Expect(line.into())
    }
}

/// A one-connection TCP server that plays a script.
///
/// Once the script runs out the server keeps the connection open and keeps
/// recording until the client hangs up.
pub struct ScriptedServer {
    port: u16,
    received: Arc<Mutex<Vec<u8>>>,
    task: JoinHandle<()>,
}

impl ScriptedServer {
    /// Bind an ephemeral port on 127.0.0.1 and wait for one client.
    pub async fn start(steps: Vec<Step>) -> Result<Self, TestError> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let received = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&received);
        let task = tokio::spawn(async move {
            let Ok((stream, _addr)) = listener.accept().await else {
                return;
            };
            if let Err(e) = play(stream, steps, &log).await {
                debug!(error = %e, "scripted server stopped");
            }
        });

        Ok(Self {
            port,
            received,
            task,
        })
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Everything the client has written so far.
    #[must_use]
    pub fn received(&self) -> String {
        String::from_utf8_lossy(&self.received.lock()).into_owned()
    }

    /// Wait until the client has written `needle`.
    pub async fn wait_for_received(
        &self,
        needle: &str,
        timeout_duration: Duration,
    ) -> Result<String, TestError> {
        let deadline = Instant::now() + timeout_duration;
        loop {
            let received = self.received();
            if received.contains(needle) {
                return Ok(received);
            }
            if Instant::now() >= deadline {
                return Err(TestError::Timeout);
            }
            sleep(POLL).await;
        }
    }
}

impl Drop for ScriptedServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn play(stream: TcpStream, steps: Vec<Step>, log: &Mutex<Vec<u8>>) -> io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let mut line = Vec::new();

    for step in steps {
        match step {
            Step::Send(text) => write.write_all(text.as_bytes()).await?,
            Step::Expect(expected) => loop {
                line.clear();
                if reader.read_until(b'\n', &mut line).await? == 0 {
                    return Ok(());
                }
                log.lock().extend_from_slice(&line);
                if String::from_utf8_lossy(&line).trim_end() == expected {
                    break;
                }
            },
            Step::Pause(duration) => sleep(duration).await,
            Step::Close => {
                write.shutdown().await?;
                return Ok(());
            }
        }
    }

    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Ok(());
        }
        log.lock().extend_from_slice(&line);
    }
}

/// Runs a daemon on a unique socket for the duration of a test.
pub struct TestHarness {
    socket_path: PathBuf,
    client: Client,
    server: Option<JoinHandle<Result<(), ServerError>>>,
}

impl TestHarness {
    /// Start a daemon with background watchers enabled.
    pub async fn new() -> Result<Self, TestError> {
        Self::with_daemon(Daemon::new(true).with_io_log(None)).await
    }

    pub async fn with_daemon(daemon: Daemon) -> Result<Self, TestError> {
        let socket_path = Self::unique_socket_path();

        let server = Server::new(socket_path.clone(), daemon);
        let server = tokio::spawn(async move { server.run().await });

        let client = Client::new(socket_path.clone());
        client
            .wait_until_ready(STARTUP)
            .await
            .map_err(|e| TestError::RequestFailed(e.to_string()))?;

        Ok(Self {
            socket_path,
            client,
            server: Some(server),
        })
    }

    fn unique_socket_path() -> PathBuf {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let pid = std::process::id();
        std::env::temp_dir().join(format!("mudprod-test-{pid}-{id}.sock"))
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    #[must_use]
    pub const fn client(&self) -> &Client {
        &self.client
    }

    /// Connect `session` to a game server on localhost.
    pub async fn connect(&self, session: &str, port: u16) -> Result<SessionHandle, TestError> {
        self.connect_with(session, ConnectArgs::new("127.0.0.1", port))
            .await
    }

    pub async fn connect_with(
        &self,
        session: &str,
        args: ConnectArgs,
    ) -> Result<SessionHandle, TestError> {
        let reply = self
            .client
            .connect(session, args)
            .await
            .map_err(|e| TestError::RequestFailed(e.to_string()))?;
        match accept(reply)? {
            ReplyBody::Connected { .. } => Ok(self.session(session)),
            other => Err(TestError::UnexpectedReply(format!("{other:?}"))),
        }
    }

    /// Handle for a session that may or may not exist yet.
    #[must_use]
    pub fn session(&self, name: &str) -> SessionHandle {
        SessionHandle {
            name: name.to_string(),
            client: self.client.clone(),
        }
    }

    /// Ask the daemon to stop and wait for it to exit.
    pub async fn shutdown(mut self) -> Result<(), TestError> {
        self.client
            .shutdown()
            .await
            .map_err(|e| TestError::RequestFailed(e.to_string()))?;
        let Some(server) = self.server.take() else {
            return Ok(());
        };
        match tokio::time::timeout(STARTUP, server).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(TestError::RequestFailed(e.to_string())),
            Ok(Err(e)) => Err(TestError::RequestFailed(e.to_string())),
            Err(_) => Err(TestError::Timeout),
        }
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        if let Some(server) = self.server.take() {
            server.abort();
        }
        std::fs::remove_file(&self.socket_path).ok();
    }
}

/// Handle for driving one daemon session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    name: String,
    client: Client,
}

impl SessionHandle {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send a command and return its normalized output.
    pub async fn send(&self, text: &str) -> Result<String, TestError> {
        self.send_with_wait(text, Duration::from_secs(2)).await
    }

    pub async fn send_with_wait(&self, text: &str, wait: Duration) -> Result<String, TestError> {
        let reply = self
            .client
            .send(&self.name, text, wait)
            .await
            .map_err(|e| TestError::RequestFailed(e.to_string()))?;
        match accept(reply)? {
            ReplyBody::Send { clean, .. } => Ok(clean),
            other => Err(TestError::UnexpectedReply(format!("{other:?}"))),
        }
    }

    /// Write a line without waiting for output.
    pub async fn send_line(&self, text: &str) -> Result<(), TestError> {
        let reply = self
            .client
            .send_raw(&self.name, &format!("{text}\n"))
            .await
            .map_err(|e| TestError::RequestFailed(e.to_string()))?;
        accept(reply).map(|_| ())
    }

    /// Whatever output is buffered right now.
    pub async fn read(&self) -> Result<String, TestError> {
        let reply = self
            .client
            .read(&self.name)
            .await
            .map_err(|e| TestError::RequestFailed(e.to_string()))?;
        match accept(reply)? {
            ReplyBody::Read { clean, .. } => Ok(clean),
            other => Err(TestError::UnexpectedReply(format!("{other:?}"))),
        }
    }

    /// Read repeatedly until the accumulated output contains `needle`.
    pub async fn wait_for_content(
        &self,
        needle: &str,
        timeout_duration: Duration,
    ) -> Result<String, TestError> {
        let deadline = Instant::now() + timeout_duration;
        let mut output = String::new();
        loop {
            output.push_str(&self.read().await?);
            if output.contains(needle) {
                return Ok(output);
            }
            if Instant::now() >= deadline {
                return Err(TestError::Timeout);
            }
            sleep(POLL).await;
        }
    }

    pub async fn trigger(&self, pattern: &str, command: &str) -> Result<String, TestError> {
        self.message(
            self.client
                .trigger(&self.name, pattern, command, TriggerAction::Add)
                .await,
        )
    }

    pub async fn repeat(&self, command: &str) -> Result<String, TestError> {
        self.message(self.client.repeat(&self.name, command).await)
    }

    pub async fn disconnect(&self) -> Result<String, TestError> {
        self.message(self.client.disconnect(&self.name).await)
    }

    fn message(
        &self,
        reply: Result<Reply, crate::client::ClientError>,
    ) -> Result<String, TestError> {
        let reply = reply.map_err(|e| TestError::RequestFailed(e.to_string()))?;
        match accept(reply)? {
            ReplyBody::Message { message } => Ok(message),
            other => Err(TestError::UnexpectedReply(format!(
                "{other:?} for session {}",
                self.name
            ))),
        }
    }
}

fn accept(reply: Reply) -> Result<ReplyBody, TestError> {
    if reply.success {
        Ok(reply.body)
    } else {
        Err(TestError::Rejected(
            reply.error_message().unwrap_or("request failed").to_string(),
        ))
    }
}
