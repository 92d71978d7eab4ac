//! Session registry.
//!
//! A named pool of connections. The map is guarded by one registry-wide lock;
//! each session carries its own I/O lock so a slow command on one session
//! never blocks registry operations on the others.

use crate::connection::{
    Connection, ConnectionState, DEFAULT_TIMEOUT, LoginPlan, PromptRule,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard, watch};
use tracing::{info, warn};

/// Errors from registry operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("session already exists: {0}")]
    AlreadyExists(String),

    #[error("session not found: {0}")]
    NotFound(String),
}

/// How to build and log in a session's connection.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    pub login: Option<LoginPlan>,
    pub prompt: PromptRule,
    pub auto_reconnect: bool,
    pub timeout: Duration,
}

impl SessionConfig {
    /// Defaults: no login, default prompt rule, auto-reconnect on.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            login: None,
            prompt: PromptRule::default(),
            auto_reconnect: true,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_login(mut self, plan: LoginPlan) -> Self {
        self.login = Some(plan);
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

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Read-only snapshot of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub connected: bool,
    pub in_game: bool,
    pub state: ConnectionState,
    pub host: String,
    pub port: u16,
}

/// Handle to a registered session.
///
/// Cheap to clone. Status reads go through a state watch and never wait on
/// the connection lock.
#[derive(Clone)]
pub struct Session {
    name: String,
    host: String,
    port: u16,
    conn: Arc<Mutex<Connection>>,
    state: watch::Receiver<ConnectionState>,
}

impl Session {
    fn new(name: String, conn: Connection) -> Self {
        let state = conn.subscribe_state();
        Self {
            name,
            host: conn.host().to_string(),
            port: conn.port(),
            conn: Arc::new(Mutex::new(conn)),
            state,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() != ConnectionState::Disconnected
    }

    #[must_use]
    pub fn is_in_game(&self) -> bool {
        self.state() == ConnectionState::InGame
    }

    /// Take the session's I/O lock.
    pub async fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        let state = self.state();
        SessionStatus {
            connected: state != ConnectionState::Disconnected,
            in_game: state == ConnectionState::InGame,
            state,
            host: self.host.clone(),
            port: self.port,
        }
    }

    /// Connect and run the configured login, if any.
    async fn open(&self) -> bool {
        let mut conn = self.lock().await;
        if !conn.connect().await {
            warn!(session = %self.name, "initial connect failed");
            return false;
        }
        let plan = conn.login_plan().cloned();
        let Some(plan) = plan else {
            return true;
        };
        let ok = conn.login(&plan).await;
        if !ok {
            warn!(session = %self.name, "initial login failed");
        }
        ok
    }
}

/// Named pool of sessions.
#[derive(Default)]
pub struct Registry {
    sessions: Mutex<HashMap<String, Session>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session, connecting and logging in if `autoconnect`.
    ///
    /// Connection failures are logged; the session stays registered so the
    /// caller can retry.
    pub async fn create(
        &self,
        name: &str,
        config: SessionConfig,
        autoconnect: bool,
    ) -> Result<Session, RegistryError> {
        let SessionConfig {
            host,
            port,
            login,
            prompt,
            auto_reconnect,
            timeout,
        } = config;

        let session = {
            let mut sessions = self.sessions.lock().await;
            if sessions.contains_key(name) {
                return Err(RegistryError::AlreadyExists(name.to_string()));
            }
            let mut conn = Connection::new(host, port)
                .with_timeout(timeout)
                .with_prompt(prompt)
                .with_auto_reconnect(auto_reconnect);
            if let Some(plan) = login {
                conn = conn.with_login(plan);
            }
            let session = Session::new(name.to_string(), conn);
            sessions.insert(name.to_string(), session.clone());
            session
        };
        info!(session = %name, host = %session.host, port = session.port, "session created");

        if autoconnect {
            session.open().await;
        }

        Ok(session)
    }

    /// Look up a session by name.
    pub async fn get(&self, name: &str) -> Option<Session> {
        self.sessions.lock().await.get(name).cloned()
    }

    /// Return the named session, reconnecting it if needed, or create it.
    pub async fn get_or_create(&self, name: &str, config: SessionConfig) -> Session {
        loop {
            if let Some(session) = self.get(name).await {
                if !session.is_connected() {
                    session.lock().await.reconnect().await;
                }
                return session;
            }
            // A concurrent create for the same name sends us back to the lookup.
            if let Ok(session) = self.create(name, config.clone(), true).await {
                return session;
            }
        }
    }

    /// Remove and disconnect a session. Returns whether it existed.
    pub async fn close(&self, name: &str) -> bool {
        let removed = self.sessions.lock().await.remove(name);
        match removed {
            Some(session) => {
                session.lock().await.disconnect().await;
                info!(session = %name, "session closed");
                true
            }
            None => false,
        }
    }

    /// Close every session. Returns how many were closed.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<Session> = self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        for session in &drained {
            session.lock().await.disconnect().await;
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "closed all sessions");
        }
        drained.len()
    }

    /// Status of every session, keyed by name.
    pub async fn status(&self) -> BTreeMap<String, SessionStatus> {
        self.sessions
            .lock()
            .await
            .iter()
            .map(|(name, session)| (name.clone(), session.status()))
            .collect()
    }

    /// Session names, sorted.
    pub async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.sessions.lock().await.contains_key(name)
    }

    /// Reconnect every disconnected session. Returns the result per name.
    pub async fn ensure_all_connected(&self) -> BTreeMap<String, bool> {
        let sessions: Vec<Session> = self.sessions.lock().await.values().cloned().collect();
        let mut results = BTreeMap::new();
        for session in sessions {
            let ok = session.lock().await.ensure_connected().await;
            results.insert(session.name.clone(), ok);
        }
        results
    }
}
