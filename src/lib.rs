//! mudprod: persistent MUD session engine
//!
//! A user-scoped daemon that keeps telnet-style game connections open across
//! short-lived CLI invocations, with triggers and repeat commands that keep
//! running between requests.

// Error documentation is deferred - the errors are self-explanatory from types
#![allow(clippy::missing_errors_doc)]

pub mod assertions;
pub mod cli;
pub mod client;
pub mod connection;
pub mod daemonize;
pub mod normalize;
pub mod protocol;
pub mod registry;
pub mod response;
pub mod server;
pub mod testing;

pub use assertions::{
    AssertionError, Pattern, assert_contains, assert_line_count, assert_matches,
    assert_not_contains, assert_prompt,
};
pub use cli::{Cli, Command, parse_login_step};
pub use client::{Client, ClientError, default_log_path, default_pid_path, default_socket_path};
pub use connection::{
    Connection, ConnectionState, LoginOutcome, LoginPlan, PromptRule, quick_connect,
};
pub use daemonize::{DaemonizeError, Detached, daemonize};
pub use normalize::normalize;
pub use protocol::{ConnectArgs, Operation, Reply, ReplyBody, Request, TriggerAction};
pub use registry::{Registry, RegistryError, Session, SessionConfig, SessionStatus};
pub use response::Response;
pub use server::{Daemon, Server, ServerError};
pub use testing::{ScriptedServer, SessionHandle, Step, TestError, TestHarness};
