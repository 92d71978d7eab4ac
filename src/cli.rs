//! Command-line interface for mudprod.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Parse a `PATTERN=TEXT` login step.
///
/// Splits at the first `=`, so the text may itself contain `=`.
pub fn parse_login_step(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((pattern, text)) if !pattern.is_empty() => Ok((pattern.to_string(), text.to_string())),
        Some(_) => Err("login step pattern is empty".to_string()),
        None => Err(format!("expected PATTERN=TEXT, got '{s}'")),
    }
}

/// Persistent MUD session daemon.
#[derive(Debug, Parser)]
#[command(name = "mudprod", version, about)]
pub struct Cli {
    /// Path to the Unix socket.
    #[arg(long, env = "MUDPROD_SOCKET", global = true)]
    pub socket: Option<PathBuf>,

    /// Path to the daemon's PID file.
    #[arg(long, env = "MUDPROD_PID", global = true)]
    pub pid_file: Option<PathBuf>,

    /// Session to operate on.
    #[arg(
        long,
        short,
        env = "MUDPROD_SESSION",
        default_value = "default",
        global = true
    )]
    pub session: String,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the daemon in the background.
    Start {
        /// Where the daemon's stdout/stderr go.
        #[arg(long)]
        log_file: Option<PathBuf>,

        /// Disable background watchers.
        #[arg(long)]
        no_watch: bool,
    },

    /// Stop the daemon and disconnect every session.
    Stop,

    /// Run the daemon in the foreground.
    Server {
        /// Disable background watchers.
        #[arg(long)]
        no_watch: bool,
    },

    /// Connect the session to a game server.
    Connect {
        host: String,

        port: u16,

        /// Login step, repeatable, run in order.
        #[arg(long = "step", value_name = "PATTERN=TEXT", value_parser = parse_login_step)]
        steps: Vec<(String, String)>,

        /// Connect timeout in seconds.
        #[arg(long, default_value = "15")]
        timeout: f64,

        /// Pattern that marks a successful login (replaces the defaults).
        #[arg(long = "success", value_name = "REGEX")]
        success: Vec<String>,

        /// Pattern that marks a failed login (replaces the defaults).
        #[arg(long = "failure", value_name = "REGEX")]
        failure: Vec<String>,

        /// Prompt pattern (replaces the default patterns).
        #[arg(long = "prompt", value_name = "REGEX")]
        prompt: Vec<String>,

        /// Don't reconnect automatically when the connection drops.
        #[arg(long)]
        no_reconnect: bool,
    },

    /// Send a command and print the response.
    Send {
        /// Seconds to wait for a prompt.
        #[arg(long, short, default_value = "5")]
        wait: f64,

        /// Command text (joined with spaces).
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        text: Vec<String>,
    },

    /// Send a line without waiting for a response.
    Raw {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        text: Vec<String>,
    },

    /// Print whatever output is available.
    Read,

    /// Wait briefly for output and print it.
    Peek {
        /// Seconds to wait for data.
        #[arg(long, default_value = "0.1")]
        max_wait: f64,
    },

    /// Send several commands in order.
    Batch {
        /// Seconds to wait per command.
        #[arg(long, short, default_value = "2")]
        wait: f64,

        /// Shorten the delay between each write and its first read.
        #[arg(long)]
        fast: bool,

        #[arg(required = true)]
        commands: Vec<String>,
    },

    /// Show session status (all sessions unless one is named).
    Status {
        name: Option<String>,

        /// Output in JSON format (for piping to jq).
        #[arg(long)]
        json: bool,
    },

    /// Close the session.
    Disconnect,

    /// Repeat a command whenever balance is recovered ("off" disables).
    Repeat {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        text: Vec<String>,
    },

    /// Add a trigger, or `trigger clear` to remove them all.
    Trigger {
        /// Remove triggers with this pattern instead of adding one.
        #[arg(long)]
        remove: bool,

        /// Regex matched case-insensitively against incoming text.
        pattern: String,

        /// Command to send when the pattern matches.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// List triggers and the repeat command.
    Triggers {
        /// Output in JSON format (for piping to jq).
        #[arg(long)]
        json: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_login_step() {
        assert_eq!(
            parse_login_step("name:=bob"),
            Ok(("name:".to_string(), "bob".to_string()))
        );
        assert_eq!(
            parse_login_step("password:=a=b"),
            Ok(("password:".to_string(), "a=b".to_string()))
        );
        assert_eq!(
            parse_login_step("continue="),
            Ok(("continue".to_string(), String::new()))
        );
        assert!(parse_login_step("=bob").is_err());
        assert!(parse_login_step("bob").is_err());
    }

    #[test]
    fn test_connect_args() {
        let cli = Cli::try_parse_from([
            "mudprod",
            "-s",
            "alt",
            "connect",
            "localhost",
            "4000",
            "--step",
            "name:=bob",
            "--step",
            "password:=secret",
        ])
        .expect("valid args");
        assert_eq!(cli.session, "alt");
        match cli.command {
            Command::Connect {
                host, port, steps, ..
            } => {
                assert_eq!(host, "localhost");
                assert_eq!(port, 4000);
                assert_eq!(steps.len(), 2);
                assert_eq!(steps[1].1, "secret");
            }
            other => panic!("expected connect, got {other:?}"),
        }
    }

    #[test]
    fn test_send_joins_words() {
        let cli = Cli::try_parse_from(["mudprod", "send", "get", "sword", "from", "bag"])
            .expect("valid args");
        match cli.command {
            Command::Send { text, wait } => {
                assert_eq!(text.join(" "), "get sword from bag");
                assert!((wait - 5.0).abs() < f64::EPSILON);
            }
            other => panic!("expected send, got {other:?}"),
        }
    }
}
