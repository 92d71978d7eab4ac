//! Triggers, repeat commands, and background watchers.

use crate::connection::Connection;
use crate::protocol::TriggerInfo;
use crate::registry::Session;
use parking_lot::Mutex;
use regex::{Regex, RegexBuilder};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Text that fires the repeat command.
pub const RECOVERY_MARKER: &str = "You have recovered balance";

/// Watcher poll interval while the session is connected.
pub const WATCH_INTERVAL: Duration = Duration::from_millis(100);
/// Watcher poll interval while the session is disconnected.
pub const WATCH_IDLE_INTERVAL: Duration = Duration::from_millis(500);

/// A pattern that sends a command when it matches incoming text.
#[derive(Debug, Clone)]
pub struct Trigger {
    pub pattern: String,
    regex: Regex,
    pub command: String,
}

impl Trigger {
    /// Compile `pattern` case-insensitively.
    pub fn new(pattern: &str, command: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: pattern.to_string(),
            regex: RegexBuilder::new(pattern).case_insensitive(true).build()?,
            command: command.to_string(),
        })
    }
}

/// Per-session automation policy.
#[derive(Debug, Clone, Default)]
pub struct TriggerSet {
    triggers: Vec<Trigger>,
    repeat: Option<String>,
}

impl TriggerSet {
    pub fn push(&mut self, trigger: Trigger) {
        self.triggers.push(trigger);
    }

    /// Remove every trigger with this pattern. Returns how many went.
    pub fn remove(&mut self, pattern: &str) -> usize {
        let before = self.triggers.len();
        self.triggers.retain(|t| t.pattern != pattern);
        before - self.triggers.len()
    }

    pub fn clear_triggers(&mut self) {
        self.triggers.clear();
    }

    pub fn set_repeat(&mut self, command: Option<String>) {
        self.repeat = command;
    }

    #[must_use]
    pub fn repeat(&self) -> Option<&str> {
        self.repeat.as_deref()
    }

    #[must_use]
    pub fn triggers(&self) -> &[Trigger] {
        &self.triggers
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.triggers.is_empty() && self.repeat.is_none()
    }

    /// Commands to send in response to `raw`, in firing order.
    ///
    /// The repeat command comes first, then every matching trigger in
    /// registration order.
    #[must_use]
    pub fn evaluate(&self, raw: &str) -> Vec<String> {
        let mut commands = Vec::new();
        if let Some(repeat) = &self.repeat {
            if raw.contains(RECOVERY_MARKER) {
                commands.push(repeat.clone());
            }
        }
        commands.extend(
            self.triggers
                .iter()
                .filter(|t| t.regex.is_match(raw))
                .map(|t| t.command.clone()),
        );
        commands
    }
}

type SharedSets = Arc<Mutex<HashMap<String, TriggerSet>>>;

/// A running background watcher.
struct Watcher {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Trigger sets for every session plus their watchers.
pub struct Automation {
    sets: SharedSets,
    watchers: Mutex<HashMap<String, Watcher>>,
    watch_enabled: bool,
}

impl Automation {
    /// `watch_enabled` controls whether background watchers are started.
    #[must_use]
    pub fn new(watch_enabled: bool) -> Self {
        Self {
            sets: Arc::new(Mutex::new(HashMap::new())),
            watchers: Mutex::new(HashMap::new()),
            watch_enabled,
        }
    }

    pub fn add_trigger(&self, name: &str, pattern: &str, command: &str) -> Result<(), regex::Error> {
        let trigger = Trigger::new(pattern, command)?;
        self.sets.lock().entry(name.to_string()).or_default().push(trigger);
        info!(session = %name, %pattern, %command, "trigger added");
        Ok(())
    }

    pub fn remove_trigger(&self, name: &str, pattern: &str) -> usize {
        let mut sets = self.sets.lock();
        let removed = sets.get_mut(name).map_or(0, |set| set.remove(pattern));
        prune(&mut sets, name);
        removed
    }

    pub fn clear_triggers(&self, name: &str) {
        let mut sets = self.sets.lock();
        if let Some(set) = sets.get_mut(name) {
            set.clear_triggers();
        }
        prune(&mut sets, name);
    }

    pub fn set_repeat(&self, name: &str, command: Option<String>) {
        let mut sets = self.sets.lock();
        sets.entry(name.to_string()).or_default().set_repeat(command);
        prune(&mut sets, name);
    }

    /// Triggers and repeat command for a session.
    #[must_use]
    pub fn listing(&self, name: &str) -> (Vec<TriggerInfo>, Option<String>) {
        let sets = self.sets.lock();
        sets.get(name).map_or_else(
            || (Vec::new(), None),
            |set| {
                let triggers = set
                    .triggers()
                    .iter()
                    .map(|t| TriggerInfo {
                        pattern: t.pattern.clone(),
                        command: t.command.clone(),
                    })
                    .collect();
                (triggers, set.repeat().map(str::to_string))
            },
        )
    }

    /// Whether a session has any automation configured.
    #[must_use]
    pub fn is_active(&self, name: &str) -> bool {
        self.sets.lock().get(name).is_some_and(|set| !set.is_empty())
    }

    /// Start or stop the session's watcher to match its trigger set.
    pub fn sync_watcher(&self, session: &Session) {
        let name = session.name();
        let active = self.watch_enabled && self.is_active(name);
        let mut watchers = self.watchers.lock();

        if !active {
            if let Some(watcher) = watchers.remove(name) {
                stop(name, watcher);
            }
            return;
        }

        if watchers.get(name).is_some_and(|w| !w.task.is_finished()) {
            return;
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run_watcher(
            session.clone(),
            Arc::clone(&self.sets),
            stop_rx,
        ));
        watchers.insert(
            name.to_string(),
            Watcher {
                stop: stop_tx,
                task,
            },
        );
        debug!(session = %name, "watcher started");
    }

    /// Drop all automation for a session and stop its watcher.
    pub fn forget(&self, name: &str) {
        self.sets.lock().remove(name);
        if let Some(watcher) = self.watchers.lock().remove(name) {
            stop(name, watcher);
        }
    }

    /// Stop every watcher.
    pub fn stop_all(&self) {
        for (name, watcher) in self.watchers.lock().drain() {
            stop(&name, watcher);
        }
    }

    /// Run trigger evaluation over everything the connection received since
    /// the last inspection. Returns the number of commands sent.
    pub async fn inspect(&self, name: &str, conn: &mut Connection) -> usize {
        inspect(&self.sets, name, conn).await
    }
}

impl Drop for Automation {
    fn drop(&mut self) {
        self.stop_all();
    }
}

fn prune(sets: &mut HashMap<String, TriggerSet>, name: &str) {
    if sets.get(name).is_some_and(TriggerSet::is_empty) {
        sets.remove(name);
    }
}

fn stop(name: &str, watcher: Watcher) {
    // An error means the task already exited.
    let _ = watcher.stop.send(());
    debug!(session = %name, "watcher stopped");
}

async fn inspect(sets: &SharedSets, name: &str, conn: &mut Connection) -> usize {
    let data = conn.take_uninspected();
    if data.is_empty() {
        return 0;
    }

    let commands = {
        let sets = sets.lock();
        match sets.get(name) {
            Some(set) => set.evaluate(&String::from_utf8_lossy(&data)),
            None => return 0,
        }
    };

    let mut sent = 0;
    for command in &commands {
        if conn.send_raw(&format!("{command}\n")).await {
            info!(session = %name, %command, "trigger fired");
            sent += 1;
        } else {
            warn!(session = %name, %command, "trigger could not be sent");
        }
    }
    sent
}

/// Drain the session at idle so triggers fire between client requests.
///
/// Output read here stays in the connection's unread backlog for the next
/// foreground read.
async fn run_watcher(session: Session, sets: SharedSets, mut stop: oneshot::Receiver<()>) {
    let name = session.name().to_string();
    loop {
        let interval = if session.is_connected() {
            WATCH_INTERVAL
        } else {
            WATCH_IDLE_INTERVAL
        };
        tokio::select! {
            _ = &mut stop => break,
            () = sleep(interval) => {}
        }
        if !session.is_connected() {
            continue;
        }

        let mut conn = tokio::select! {
            _ = &mut stop => break,
            conn = session.lock() => conn,
        };
        if conn.poll_background() > 0 {
            inspect(&sets, &name, &mut conn).await;
        }
    }
    debug!(session = %name, "watcher exited");
}
