//! Connection engine.
//!
//! Drives exactly one remote text session over TCP: connect, login handshake,
//! command send with prompt-terminated reads, and non-blocking drains.
//!
//! Public operations never return socket errors. Failure is reported as
//! `false` or an empty [`Response`], and a peer close or reset moves the
//! connection to [`ConnectionState::Disconnected`].

mod backlog;
mod login;
mod prompt;

pub use backlog::Backlog;
pub use login::{
    DEFAULT_FAILURE_PATTERNS, DEFAULT_SUCCESS_PATTERNS, LoginOutcome, LoginPlan, LoginStep,
};
pub use prompt::{DEFAULT_END_CHARS, DEFAULT_PATTERNS, PromptRule};

use crate::normalize::normalize;
use crate::response::Response;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, error, info, warn};

/// Connect timeout, also the per-step bound during login.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default budget for `send_command`.
pub const DEFAULT_COMMAND_WAIT: Duration = Duration::from_secs(5);
/// Pause after each login step and before reading a command response.
pub const SETTLE_DELAY: Duration = Duration::from_millis(300);
/// Sleep between drains in every bounded wait.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Readiness poll quantum used by `peek`.
pub const PEEK_QUANTUM: Duration = Duration::from_millis(50);
/// Grace period for the greeting banner after connecting.
pub const BANNER_GRACE: Duration = Duration::from_millis(500);
pub const READ_CHUNK_SIZE: usize = 4096;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Authenticating,
    InGame,
}

/// One persistent connection to a game server.
pub struct Connection {
    host: String,
    port: u16,
    timeout: Duration,
    prompt: PromptRule,
    auto_reconnect: bool,
    stream: Option<TcpStream>,
    state: watch::Sender<ConnectionState>,
    /// Kept so a dropped connection can replay the same handshake.
    login_plan: Option<LoginPlan>,
    /// Read by a background poll, not yet delivered to a caller.
    unread: Backlog,
    /// Read off the socket, not yet handed to trigger inspection.
    uninspected: Backlog,
}

impl Connection {
    /// Create a disconnected engine with default settings.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            host: host.into(),
            port,
            timeout: DEFAULT_TIMEOUT,
            prompt: PromptRule::default(),
            auto_reconnect: false,
            stream: None,
            state,
            login_plan: None,
            unread: Backlog::default(),
            uninspected: Backlog::default(),
        }
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_prompt(mut self, prompt: PromptRule) -> Self {
        self.prompt = prompt;
        self
    }

    #[must_use]
    pub const fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Store a login plan without running it; the next reconnect replays it.
    #[must_use]
    pub fn with_login(mut self, plan: LoginPlan) -> Self {
        self.login_plan = Some(plan);
        self
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state changes without holding the connection.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.stream.is_some() && self.state() != ConnectionState::Disconnected
    }

    #[must_use]
    pub fn is_in_game(&self) -> bool {
        self.state() == ConnectionState::InGame
    }

    #[must_use]
    pub fn login_plan(&self) -> Option<&LoginPlan> {
        self.login_plan.as_ref()
    }

    #[must_use]
    pub const fn prompt(&self) -> &PromptRule {
        &self.prompt
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(host = %self.host, port = self.port, ?previous, ?state, "state change");
        }
    }

    /// Open the connection and discard the greeting banner.
    pub async fn connect(&mut self) -> bool {
        self.stream = None;
        self.set_state(ConnectionState::Disconnected);

        let stream = match timeout(
            self.timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                error!(host = %self.host, port = self.port, error = %e, "connection failed");
                return false;
            }
            Err(_) => {
                error!(host = %self.host, port = self.port, timeout = ?self.timeout, "connection timed out");
                return false;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "could not set TCP_NODELAY");
        }

        self.stream = Some(stream);
        self.set_state(ConnectionState::Connected);

        sleep(BANNER_GRACE).await;
        let banner = self.recv();
        self.unread = Backlog::default();
        self.uninspected = Backlog::default();
        debug!(greeting = %preview(&banner), "greeting");

        info!(host = %self.host, port = self.port, "connected");
        self.is_connected()
    }

    /// Close the connection. Safe to call when already disconnected.
    pub async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            info!(host = %self.host, port = self.port, "disconnected");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Disconnect, connect, and replay the stored login plan if any.
    pub async fn reconnect(&mut self) -> bool {
        info!(host = %self.host, port = self.port, "attempting reconnect");
        self.disconnect().await;

        if !self.connect().await {
            return false;
        }

        let Some(plan) = self.login_plan.clone() else {
            return true;
        };
        self.login(&plan).await
    }

    /// The single gate every socket-using operation passes through.
    pub async fn ensure_connected(&mut self) -> bool {
        if self.is_connected() {
            return true;
        }
        if self.auto_reconnect {
            return self.reconnect().await;
        }
        false
    }

    /// Run the login handshake.
    ///
    /// A step whose pattern never shows up is logged and the payload is sent
    /// anyway: some servers push text without waiting for a prompt. Output with
    /// neither a failure nor a success match counts as logged in.
    pub async fn login(&mut self, plan: &LoginPlan) -> bool {
        self.login_plan = Some(plan.clone());
        if !self.is_connected() {
            error!(host = %self.host, port = self.port, "cannot log in: not connected");
            return false;
        }
        self.set_state(ConnectionState::Authenticating);

        for step in &plan.steps {
            let (found, _) = self.wait_for(&step.expect, self.timeout).await;
            if !found {
                warn!(pattern = %step.expect, "did not see expected prompt");
            }
            if !self.send_raw(&format!("{}\n", step.send)).await {
                error!(host = %self.host, port = self.port, "login failed: connection lost");
                self.leave_authenticating();
                return false;
            }
            sleep(SETTLE_DELAY).await;
        }

        sleep(SETTLE_DELAY * 2).await;
        let clean = normalize(&self.drain());
        // The login transcript is not game output; triggers never see it.
        self.uninspected = Backlog::default();

        match plan.classify(&clean) {
            LoginOutcome::Rejected => {
                error!(host = %self.host, port = self.port, output = %preview(clean.as_bytes()), "login rejected");
                self.leave_authenticating();
                false
            }
            LoginOutcome::Accepted => {
                self.set_state(ConnectionState::InGame);
                info!(host = %self.host, port = self.port, "login successful");
                true
            }
            LoginOutcome::Unrecognized if self.is_connected() => {
                self.set_state(ConnectionState::InGame);
                info!(host = %self.host, port = self.port, "login completed (no explicit success pattern)");
                true
            }
            LoginOutcome::Unrecognized => {
                error!(host = %self.host, port = self.port, "login failed: connection lost");
                false
            }
        }
    }

    fn leave_authenticating(&self) {
        if self.stream.is_some() {
            self.set_state(ConnectionState::Connected);
        } else {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// Send a line and collect output until a prompt or `wait` elapses.
    pub async fn send_command(&mut self, text: &str, wait: Option<Duration>) -> Response {
        self.send_command_with(text, wait.unwrap_or(DEFAULT_COMMAND_WAIT), SETTLE_DELAY * 2)
            .await
    }

    /// [`send_command`](Self::send_command) with an explicit settle delay
    /// between the write and the first read.
    pub async fn send_command_with(&mut self, text: &str, wait: Duration, settle: Duration) -> Response {
        if !self.ensure_connected().await {
            error!(host = %self.host, port = self.port, "not connected and could not reconnect");
            return Response::empty();
        }

        // Output from before the write is returned too, but its prompt
        // belongs to an earlier command and must not end the wait.
        let mut output = self.drain();

        let start = Instant::now();
        if !self.send_raw(&format!("{text}\n")).await {
            return Response::new(&output, false);
        }
        sleep(settle.min(wait)).await;

        loop {
            let chunk = self.recv();
            if !chunk.is_empty() {
                output.extend_from_slice(&chunk);
                if self.prompt.detect(&normalize(&output)) {
                    break;
                }
            }
            if self.stream.is_none() || start.elapsed() >= wait {
                break;
            }
            sleep(POLL_INTERVAL).await;
        }

        let prompt_detected = self.prompt.detect(&normalize(&output));
        Response::new(&output, prompt_detected)
    }

    /// Write without waiting for a response.
    pub async fn send_raw(&mut self, data: &str) -> bool {
        let Some(stream) = self.stream.as_mut() else {
            warn!(host = %self.host, port = self.port, "send on a closed connection");
            return false;
        };

        match stream.write_all(data.as_bytes()).await {
            Ok(()) => {
                debug!(?data, "sent");
                true
            }
            Err(e) => {
                warn!(host = %self.host, port = self.port, error = %e, "write failed");
                self.stream = None;
                self.set_state(ConnectionState::Disconnected);
                false
            }
        }
    }

    /// Everything available right now, without waiting.
    pub fn read_available(&mut self) -> Response {
        let data = self.drain();
        let prompt_detected = self.prompt.detect(&normalize(&data));
        Response::new(&data, prompt_detected)
    }

    /// Wait up to `timeout` for `pattern` in the normalized output.
    ///
    /// Matching is case-insensitive. Returns whether it was found and
    /// everything read meanwhile.
    pub async fn wait_for_pattern(
        &mut self,
        pattern: &str,
        timeout: Duration,
        is_regex: bool,
    ) -> (bool, String) {
        let source = if is_regex {
            pattern.to_string()
        } else {
            regex::escape(pattern)
        };
        match RegexBuilder::new(&source).case_insensitive(true).build() {
            Ok(re) => self.wait_for(&re, timeout).await,
            Err(e) => {
                warn!(%pattern, error = %e, "invalid pattern");
                (false, String::new())
            }
        }
    }

    async fn wait_for(&mut self, re: &Regex, timeout: Duration) -> (bool, String) {
        let deadline = Instant::now() + timeout;
        let mut output = Vec::new();

        loop {
            output.extend_from_slice(&self.drain());
            if re.is_match(&normalize(&output)) {
                return (true, String::from_utf8_lossy(&output).into_owned());
            }
            if self.stream.is_none() || Instant::now() >= deadline {
                return (false, String::from_utf8_lossy(&output).into_owned());
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Wait briefly for output using readiness polling.
    ///
    /// Returns as soon as data has arrived and no more is immediately
    /// pending, or when `max_wait` elapses.
    pub async fn peek(&mut self, max_wait: Duration) -> Response {
        let start = Instant::now();
        let mut data = self.unread.take();

        loop {
            let elapsed = start.elapsed();
            if elapsed >= max_wait {
                break;
            }
            let Some(stream) = self.stream.as_ref() else {
                break;
            };

            let quantum = PEEK_QUANTUM.min(max_wait.saturating_sub(elapsed));
            let ready = matches!(timeout(quantum, stream.readable()).await, Ok(Ok(())));
            if ready {
                data.extend_from_slice(&self.recv());
            } else if !data.is_empty() {
                break;
            }
        }

        let prompt_detected = self.prompt.detect(&normalize(&data));
        Response::new(&data, prompt_detected)
    }

    /// Read pending socket data into the unread backlog.
    ///
    /// Used by background watchers; the bytes are delivered to the next
    /// foreground read. Returns the number of new bytes.
    pub fn poll_background(&mut self) -> usize {
        let data = self.recv();
        self.unread.append(&data);
        data.len()
    }

    /// Bytes received since the last call, for trigger inspection.
    pub fn take_uninspected(&mut self) -> Vec<u8> {
        self.uninspected.take()
    }

    /// Unread backlog followed by whatever the socket has now.
    fn drain(&mut self) -> Vec<u8> {
        let mut data = self.unread.take();
        data.extend_from_slice(&self.recv());
        data
    }

    /// Non-blocking socket drain.
    ///
    /// A zero-length read or a reset closes the connection. Other errors are
    /// logged and treated as "no data".
    fn recv(&mut self) -> Vec<u8> {
        let Some(stream) = self.stream.as_ref() else {
            return Vec::new();
        };

        let mut data = Vec::new();
        let mut buf = [0u8; READ_CHUNK_SIZE];
        let closed = loop {
            match stream.try_read(&mut buf) {
                Ok(0) => {
                    info!(host = %self.host, port = self.port, "server closed connection");
                    break true;
                }
                Ok(n) => data.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break false,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                    info!(host = %self.host, port = self.port, "connection reset by server");
                    break true;
                }
                Err(e) => {
                    debug!(error = %e, "read error");
                    break false;
                }
            }
        };

        if closed {
            self.stream = None;
            self.set_state(ConnectionState::Disconnected);
        }
        if !data.is_empty() {
            debug!(bytes = data.len(), "read");
            self.uninspected.append(&data);
        }
        data
    }
}

/// Connect, optionally log in, run one command, disconnect.
///
/// Returns the normalized output of the command.
pub async fn quick_connect(
    host: &str,
    port: u16,
    command: &str,
    login: Option<&LoginPlan>,
) -> Result<String, String> {
    let mut conn = Connection::new(host, port);
    if !conn.connect().await {
        return Err(format!("could not connect to {host}:{port}"));
    }
    if let Some(plan) = login {
        if !conn.login(plan).await {
            conn.disconnect().await;
            return Err(format!("login to {host}:{port} failed"));
        }
    }
    let response = conn.send_command(command, None).await;
    conn.disconnect().await;
    Ok(response.clean().to_string())
}

/// First 200 characters of output, for log lines.
fn preview(data: &[u8]) -> String {
    String::from_utf8_lossy(data).chars().take(200).collect()
}
