//! Detach the daemon from the launching process.
//!
//! # Safety
//!
//! This module uses unsafe code for fork, dup2, and `_exit`. It must run
//! before any threads exist, in particular before the tokio runtime starts.

#![allow(unsafe_code)]

use nix::sys::wait::waitpid;
use nix::unistd::{ForkResult, fork, setsid};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use thiserror::Error;

/// Errors that can occur while detaching.
#[derive(Debug, Error)]
pub enum DaemonizeError {
    #[error("failed to fork: {0}")]
    Fork(#[source] nix::Error),

    #[error("failed to create session: {0}")]
    Setsid(#[source] nix::Error),

    #[error("failed to open log file: {0}")]
    LogFile(#[source] std::io::Error),

    #[error("failed to redirect standard streams: {0}")]
    Redirect(#[source] std::io::Error),
}

/// Which side of the detach this process is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detached {
    /// The launching process; the daemon is now running elsewhere.
    Parent,
    /// The detached daemon process.
    Daemon,
}

/// Double-fork into a new session with stdout/stderr appended to `log_path`.
///
/// The intermediate process becomes a session leader and exits at once, so
/// the daemon is reparented and can never reacquire a controlling terminal.
pub fn daemonize(log_path: &Path) -> Result<Detached, DaemonizeError> {
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .map_err(DaemonizeError::LogFile)?;
    let null = File::open("/dev/null").map_err(DaemonizeError::Redirect)?;

    match unsafe { fork() }.map_err(DaemonizeError::Fork)? {
        ForkResult::Parent { child } => {
            // Reap the intermediate process; it exits right after its fork.
            waitpid(child, None).map_err(DaemonizeError::Fork)?;
            return Ok(Detached::Parent);
        }
        ForkResult::Child => {}
    }

    setsid().map_err(DaemonizeError::Setsid)?;

    match unsafe { fork() }.map_err(DaemonizeError::Fork)? {
        ForkResult::Parent { .. } => unsafe { libc::_exit(0) },
        ForkResult::Child => {}
    }

    // nix's dup2 API is awkward for this use case
    for (fd, target) in [
        (null.as_raw_fd(), libc::STDIN_FILENO),
        (log.as_raw_fd(), libc::STDOUT_FILENO),
        (log.as_raw_fd(), libc::STDERR_FILENO),
    ] {
        if unsafe { libc::dup2(fd, target) } < 0 {
            return Err(DaemonizeError::Redirect(std::io::Error::last_os_error()));
        }
    }

    Ok(Detached::Daemon)
}
