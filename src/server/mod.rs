//! The mudprod daemon.
//!
//! Owns the session registry and the automation policy, and listens on a
//! Unix socket for one JSON request per connection.

// Handlers are long but each is a flat sequence of checks
#![allow(clippy::too_many_lines)]
// Holding a session's I/O lock for the whole request is the point
#![allow(clippy::significant_drop_tightening)]

mod automation;
mod iolog;

pub use automation::{
    Automation, RECOVERY_MARKER, Trigger, TriggerSet, WATCH_IDLE_INTERVAL, WATCH_INTERVAL,
};
pub use iolog::{IoLog, LOG_ENV};

use crate::connection::{
    DEFAULT_COMMAND_WAIT, DEFAULT_END_CHARS, LoginPlan, POLL_INTERVAL, PromptRule, SETTLE_DELAY,
};
use crate::protocol::{
    BatchItem, ConnectArgs, Operation, Reply, ReplyBody, Request, TriggerAction, seconds,
};
use crate::registry::{Registry, RegistryError, Session, SessionConfig};
#[cfg(unix)]
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{SignalKind, signal};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// How often the accept loop rechecks the running flag.
pub const ACCEPT_POLL: Duration = Duration::from_secs(1);
/// How long a client gets to send its request line.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const BATCH_WAIT: Duration = Duration::from_secs(2);
const PEEK_WAIT: Duration = Duration::from_millis(100);

/// Errors that can occur in the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind socket: {0}")]
    Bind(#[source] std::io::Error),

    #[error("a server is already listening on {0}")]
    AlreadyRunning(PathBuf),

    #[error("failed to write PID file: {0}")]
    PidFile(#[source] std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}

/// Daemon state shared by every request handler.
pub struct Daemon {
    registry: Registry,
    automation: Automation,
    running: AtomicBool,
    io_log: Option<IoLog>,
}

impl Daemon {
    /// Create a daemon. The I/O log is taken from `MUDPROD_LOG`.
    #[must_use]
    pub fn new(watch_enabled: bool) -> Self {
        Self {
            registry: Registry::new(),
            automation: Automation::new(watch_enabled),
            running: AtomicBool::new(true),
            io_log: IoLog::from_env(),
        }
    }

    #[must_use]
    pub fn with_io_log(mut self, io_log: Option<IoLog>) -> Self {
        self.io_log = io_log;
        self
    }

    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    #[must_use]
    pub const fn automation(&self) -> &Automation {
        &self.automation
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask the accept loop to exit.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Stop watchers and close every session.
    pub async fn close_all(&self) -> usize {
        self.automation.stop_all();
        self.registry.close_all().await
    }

    /// Handle one request.
    pub async fn handle(&self, request: Request) -> Reply {
        if let Some(log) = &self.io_log {
            log.request(&request).await;
        }

        let command = request.op.name();
        let name = request.session_name().to_string();
        info!(session = %name, command, "request");

        let reply = match request.op {
            Operation::Connect(args) => self.connect(&name, &args).await,
            Operation::Send { text, wait_time } => self.send(&name, &text, wait_time).await,
            Operation::SendRaw { text } => self.send_raw(&name, &text).await,
            Operation::Read => self.read(&name).await,
            Operation::Peek { max_wait } => self.peek(&name, max_wait).await,
            Operation::Batch {
                commands,
                wait_time,
                fast,
            } => self.batch(&name, &commands, wait_time, fast).await,
            Operation::Status => match request.session {
                Some(_) => match self.session(&name).await {
                    Ok(session) => Reply::ok(ReplyBody::Status(session.status())),
                    Err(reply) => reply,
                },
                None => Reply::ok(ReplyBody::Sessions {
                    sessions: self.registry.status().await,
                }),
            },
            Operation::Disconnect => self.disconnect(&name).await,
            Operation::Repeat { text } => self.repeat(&name, text).await,
            Operation::Trigger {
                pattern,
                text,
                action,
            } => self.trigger(&name, &pattern, &text, action).await,
            Operation::Triggers => {
                let (triggers, repeat) = self.automation.listing(&name);
                Reply::ok(ReplyBody::Triggers { triggers, repeat })
            }
            Operation::Shutdown => {
                info!("shutdown requested");
                self.stop();
                Reply::message("Server shutting down")
            }
        };

        if let Some(error) = reply.error_message() {
            debug!(session = %name, command, %error, "request failed");
        }
        if let Some(log) = &self.io_log {
            log.reply(command, &reply).await;
        }
        reply
    }

    async fn session(&self, name: &str) -> Result<Session, Reply> {
        self.registry
            .get(name)
            .await
            .ok_or_else(|| Reply::error(RegistryError::NotFound(name.to_string()).to_string()))
    }

    async fn connect(&self, name: &str, args: &ConnectArgs) -> Reply {
        if args.host.is_empty() || args.port == 0 {
            return Reply::error("host and port required");
        }

        let session = if let Some(session) = self.registry.get(name).await {
            if session.is_connected() {
                return Reply::ok(ReplyBody::Connected {
                    state: session.state(),
                    message: Some("already connected".to_string()),
                });
            }
            session.lock().await.reconnect().await;
            session
        } else {
            let config = match session_config(args) {
                Ok(config) => config,
                Err(e) => return Reply::error(format!("invalid pattern: {e}")),
            };
            match self.registry.create(name, config, true).await {
                Ok(session) => session,
                Err(e) => return Reply::error(e.to_string()),
            }
        };

        self.automation.sync_watcher(&session);

        let state = session.state();
        if session.is_connected() {
            Reply::ok(ReplyBody::Connected {
                state,
                message: None,
            })
        } else {
            Reply::error(format!(
                "could not connect to {}:{} (state {state:?})",
                args.host, args.port
            ))
        }
    }

    async fn send(&self, name: &str, text: &str, wait_time: f64) -> Reply {
        let session = match self.session(name).await {
            Ok(session) => session,
            Err(reply) => return reply,
        };

        let mut conn = session.lock().await;
        if !conn.is_connected() && !conn.reconnect().await {
            return Reply::error("not connected");
        }

        let response = conn
            .send_command(text, Some(seconds(wait_time, DEFAULT_COMMAND_WAIT)))
            .await;
        self.automation.inspect(name, &mut conn).await;

        Reply::ok(ReplyBody::send(&response))
    }

    async fn send_raw(&self, name: &str, text: &str) -> Reply {
        let session = match self.session(name).await {
            Ok(session) => session,
            Err(reply) => return reply,
        };

        if session.lock().await.send_raw(text).await {
            Reply::ok(ReplyBody::Empty {})
        } else {
            Reply::error("not connected")
        }
    }

    async fn read(&self, name: &str) -> Reply {
        let session = match self.session(name).await {
            Ok(session) => session,
            Err(reply) => return reply,
        };

        let mut conn = session.lock().await;
        let response = conn.read_available();
        self.automation.inspect(name, &mut conn).await;

        Reply::ok(ReplyBody::read(&response))
    }

    async fn peek(&self, name: &str, max_wait: f64) -> Reply {
        let session = match self.session(name).await {
            Ok(session) => session,
            Err(reply) => return reply,
        };

        let mut conn = session.lock().await;
        if !conn.is_connected() {
            return Reply::error("not connected");
        }
        let response = conn.peek(seconds(max_wait, PEEK_WAIT)).await;
        self.automation.inspect(name, &mut conn).await;

        Reply::ok(ReplyBody::peek(&response))
    }

    async fn batch(&self, name: &str, commands: &[String], wait_time: f64, fast: bool) -> Reply {
        if commands.is_empty() {
            return Reply::error("no commands provided");
        }
        let session = match self.session(name).await {
            Ok(session) => session,
            Err(reply) => return reply,
        };

        let mut conn = session.lock().await;
        if !conn.is_connected() && !conn.reconnect().await {
            return Reply::error("not connected");
        }

        let wait = seconds(wait_time, BATCH_WAIT);
        let settle = if fast { POLL_INTERVAL } else { SETTLE_DELAY * 2 };
        let mut results = Vec::with_capacity(commands.len());
        for command in commands {
            let response = conn.send_command_with(command, wait, settle).await;
            self.automation.inspect(name, &mut conn).await;
            results.push(BatchItem::new(command, &response));
            if !conn.is_connected() {
                warn!(session = %name, %command, "connection lost during batch");
                break;
            }
        }

        let count = results.len();
        Reply::ok(ReplyBody::Batch { results, count })
    }

    async fn disconnect(&self, name: &str) -> Reply {
        self.automation.forget(name);
        if self.registry.close(name).await {
            Reply::message(format!("Session '{name}' closed"))
        } else {
            Reply::error(RegistryError::NotFound(name.to_string()).to_string())
        }
    }

    async fn repeat(&self, name: &str, text: String) -> Reply {
        if text.is_empty() || text.eq_ignore_ascii_case("off") {
            self.automation.set_repeat(name, None);
            self.sync_watcher(name).await;
            return Reply::message("Repeat disabled");
        }

        let session = match self.session(name).await {
            Ok(session) => session,
            Err(reply) => return reply,
        };
        let message = format!("Will repeat '{text}' on balance recovery");
        self.automation.set_repeat(name, Some(text));
        self.automation.sync_watcher(&session);
        Reply::message(message)
    }

    async fn trigger(&self, name: &str, pattern: &str, text: &str, action: TriggerAction) -> Reply {
        let reply = match action {
            TriggerAction::Clear => {
                self.automation.clear_triggers(name);
                Reply::message("All triggers cleared")
            }
            TriggerAction::Remove => {
                self.automation.remove_trigger(name, pattern);
                Reply::message(format!("Trigger for '{pattern}' removed"))
            }
            TriggerAction::Add => {
                if pattern.is_empty() || text.is_empty() {
                    return Reply::error("pattern and text required");
                }
                if let Err(e) = self.automation.add_trigger(name, pattern, text) {
                    return Reply::error(format!("invalid pattern: {e}"));
                }
                Reply::message(format!("Trigger added: '{pattern}' -> '{text}'"))
            }
        };
        self.sync_watcher(name).await;
        reply
    }

    async fn sync_watcher(&self, name: &str) {
        if let Some(session) = self.registry.get(name).await {
            self.automation.sync_watcher(&session);
        }
    }
}

/// Build a session config from a `connect` request.
fn session_config(args: &ConnectArgs) -> Result<SessionConfig, regex::Error> {
    let mut config = SessionConfig::new(args.host.clone(), args.port)
        .with_timeout(seconds(args.timeout, CONNECT_TIMEOUT))
        .with_auto_reconnect(args.auto_reconnect);

    if let Some(patterns) = &args.prompt_patterns {
        config = config.with_prompt(PromptRule::new(patterns, DEFAULT_END_CHARS)?);
    }

    if !args.login_steps.is_empty() {
        let mut plan = LoginPlan::new(
            args.login_steps
                .iter()
                .map(|(pattern, text)| (pattern.as_str(), text.as_str())),
        )?;
        if let Some(patterns) = &args.success_patterns {
            plan = plan.with_success(patterns)?;
        }
        if let Some(patterns) = &args.failure_patterns {
            plan = plan.with_failure(patterns)?;
        }
        config = config.with_login(plan);
    }

    Ok(config)
}

/// The daemon's socket listener.
pub struct Server {
    socket_path: PathBuf,
    pid_path: Option<PathBuf>,
    daemon: Arc<Daemon>,
}

impl Server {
    /// Create a server that will listen on the given socket path.
    #[must_use]
    pub fn new(socket_path: PathBuf, daemon: Daemon) -> Self {
        Self {
            socket_path,
            pid_path: None,
            daemon: Arc::new(daemon),
        }
    }

    /// Write the process ID here while running.
    #[must_use]
    pub fn with_pid_file(mut self, path: PathBuf) -> Self {
        self.pid_path = Some(path);
        self
    }

    #[must_use]
    pub const fn daemon(&self) -> &Arc<Daemon> {
        &self.daemon
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Run until shutdown is requested or a termination signal arrives.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind().await?;

        if let Some(pid_path) = &self.pid_path {
            if let Err(e) = std::fs::write(pid_path, format!("{}\n", std::process::id())) {
                std::fs::remove_file(&self.socket_path).ok();
                return Err(ServerError::PidFile(e));
            }
        }

        let signals = self.watch_signals()?;
        info!(socket = %self.socket_path.display(), "server listening");

        while self.daemon.is_running() {
            match timeout(ACCEPT_POLL, listener.accept()).await {
                Err(_) => {}
                Ok(Ok((stream, _addr))) => {
                    debug!("accepted connection");
                    if let Err(e) = handle_connection(&self.daemon, stream).await {
                        warn!(error = %e, "connection error");
                    }
                }
                Ok(Err(e)) => error!(error = %e, "accept error"),
            }
        }

        signals.abort();
        let closed = self.daemon.close_all().await;
        std::fs::remove_file(&self.socket_path).ok();
        if let Some(pid_path) = &self.pid_path {
            std::fs::remove_file(pid_path).ok();
        }
        info!(sessions = closed, "server stopped");
        Ok(())
    }

    async fn bind(&self) -> Result<UnixListener, ServerError> {
        if self.socket_path.exists() {
            // Don't follow symlinks
            let metadata =
                std::fs::symlink_metadata(&self.socket_path).map_err(ServerError::Io)?;

            if metadata.file_type().is_symlink() {
                return Err(ServerError::Bind(std::io::Error::other(
                    "socket path is a symlink - possible security attack",
                )));
            }

            if is_server_running(&self.socket_path).await {
                return Err(ServerError::AlreadyRunning(self.socket_path.clone()));
            }

            if metadata.file_type().is_socket() || metadata.file_type().is_file() {
                debug!(socket = %self.socket_path.display(), "removing stale socket");
                std::fs::remove_file(&self.socket_path).ok();
            }
        }

        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(ServerError::Io)?;
        }

        let listener = UnixListener::bind(&self.socket_path).map_err(ServerError::Bind)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.socket_path, perms).map_err(ServerError::Io)?;
        }

        Ok(listener)
    }

    /// SIGTERM and SIGINT flip the running flag.
    fn watch_signals(&self) -> Result<tokio::task::JoinHandle<()>, ServerError> {
        let mut terminate = signal(SignalKind::terminate()).map_err(ServerError::Io)?;
        let mut interrupt = signal(SignalKind::interrupt()).map_err(ServerError::Io)?;
        let daemon = Arc::clone(&self.daemon);

        Ok(tokio::spawn(async move {
            tokio::select! {
                _ = terminate.recv() => info!("received SIGTERM, shutting down"),
                _ = interrupt.recv() => info!("received SIGINT, shutting down"),
            }
            daemon.stop();
        }))
    }
}

/// Read one request, answer it, close.
async fn handle_connection(daemon: &Arc<Daemon>, stream: UnixStream) -> Result<(), ServerError> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    let Ok(result) = timeout(REQUEST_TIMEOUT, reader.read_line(&mut line)).await else {
        warn!("client sent no request in time");
        return Ok(());
    };
    let n = result.map_err(ServerError::Io)?;
    if n == 0 {
        debug!("client disconnected without a request");
        return Ok(());
    }

    let reply = match Request::parse(&line) {
        Ok(request) => dispatch(daemon, request).await,
        Err(e) => {
            warn!(error = %e, "rejected request");
            Reply::error(e)
        }
    };

    let mut json = serde_json::to_string(&reply).map_err(|e| ServerError::Io(e.into()))?;
    json.push('\n');
    writer
        .write_all(json.as_bytes())
        .await
        .map_err(ServerError::Io)?;
    writer.shutdown().await.ok();
    Ok(())
}

/// Run a request on its own task so a panicking handler becomes an error
/// reply instead of taking down the accept loop.
async fn dispatch(daemon: &Arc<Daemon>, request: Request) -> Reply {
    let daemon = Arc::clone(daemon);
    match tokio::spawn(async move { daemon.handle(request).await }).await {
        Ok(reply) => reply,
        Err(e) => {
            error!(error = %e, "request handler failed");
            Reply::error(format!("internal error: {e}"))
        }
    }
}

/// Check if a server is running by trying to connect.
pub async fn is_server_running(socket_path: &Path) -> bool {
    UnixStream::connect(socket_path).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use crate::protocol::ConnectArgs;

    fn request(session: &str, op: Operation) -> Request {
        Request::new(session, op)
    }

    #[tokio::test]
    async fn test_missing_session() {
        let daemon = Daemon::new(false).with_io_log(None);
        let reply = daemon
            .handle(request(
                "ghost",
                Operation::Send {
                    text: "look".into(),
                    wait_time: 1.0,
                },
            ))
            .await;
        assert!(!reply.success);
        assert_eq!(reply.error_message(), Some("session not found: ghost"));

        let reply = daemon.handle(request("ghost", Operation::Disconnect)).await;
        assert!(!reply.success);
    }

    #[tokio::test]
    async fn test_batch_requires_commands() {
        let daemon = Daemon::new(false).with_io_log(None);
        let reply = daemon
            .handle(request(
                "main",
                Operation::Batch {
                    commands: Vec::new(),
                    wait_time: 1.0,
                    fast: false,
                },
            ))
            .await;
        assert_eq!(reply.error_message(), Some("no commands provided"));
    }

    #[tokio::test]
    async fn test_trigger_validation() {
        let daemon = Daemon::new(false).with_io_log(None);
        let add = |pattern: &str, text: &str| {
            request(
                "main",
                Operation::Trigger {
                    pattern: pattern.into(),
                    text: text.into(),
                    action: TriggerAction::Add,
                },
            )
        };

        let reply = daemon.handle(add("", "attack")).await;
        assert_eq!(reply.error_message(), Some("pattern and text required"));

        let reply = daemon.handle(add("(", "attack")).await;
        assert!(reply.error_message().is_some_and(|e| e.starts_with("invalid pattern")));

        let reply = daemon.handle(add("recovered", "attack")).await;
        assert!(reply.success);

        let reply = daemon.handle(request("main", Operation::Triggers)).await;
        match reply.body {
            ReplyBody::Triggers { triggers, repeat } => {
                assert_eq!(triggers.len(), 1);
                assert_eq!(triggers[0].command, "attack");
                assert!(repeat.is_none());
            }
            other => panic!("expected triggers, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_repeat_off_without_session() {
        let daemon = Daemon::new(false).with_io_log(None);
        let reply = daemon
            .handle(request("main", Operation::Repeat { text: "OFF".into() }))
            .await;
        assert!(reply.success);

        let reply = daemon
            .handle(request("main", Operation::Repeat { text: "kick".into() }))
            .await;
        assert_eq!(reply.error_message(), Some("session not found: main"));
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let daemon = Daemon::new(false).with_io_log(None);
        let mut args = ConnectArgs::new("127.0.0.1", port);
        args.timeout = 1.0;
        let reply = daemon.handle(request("main", Operation::Connect(args))).await;
        assert!(!reply.success);
        assert!(
            reply
                .error_message()
                .is_some_and(|e| e.starts_with("could not connect"))
        );

        // Still registered so the caller can retry.
        let reply = daemon.handle(Request::global(Operation::Status)).await;
        match reply.body {
            ReplyBody::Sessions { sessions } => {
                assert_eq!(sessions["main"].state, ConnectionState::Disconnected);
            }
            other => panic!("expected sessions, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_shutdown_flips_running() {
        let daemon = Daemon::new(false).with_io_log(None);
        assert!(daemon.is_running());
        let reply = daemon.handle(Request::global(Operation::Shutdown)).await;
        assert!(reply.success);
        assert!(!daemon.is_running());
    }
}
