//! Process primitives — signal-0 aliveness and forced termination by PID.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::deadline::{DeadlineError, do_within};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to read pidfile {path}: {source}")]
    PidFile { path: PathBuf, source: io::Error },

    #[error("pidfile {path} does not hold a valid pid: {content:?}")]
    InvalidPid { path: PathBuf, content: String },

    #[error("no process with pid {0}")]
    NoSuchProcess(i32),

    #[error("failed to signal pid {pid}: {source}")]
    Signal { pid: i32, source: io::Error },

    #[error("pid {pid} still present after kill: {source}")]
    StillRunning { pid: i32, source: DeadlineError },
}

pub type ProcessResult<T> = Result<T, ProcessError>;

/// Interval between process table checks while waiting for an exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Read a pid from a pidfile. Surrounding whitespace is ignored.
pub fn read_pidfile(path: &Path) -> ProcessResult<i32> {
    let content = std::fs::read_to_string(path).map_err(|source| ProcessError::PidFile {
        path: path.to_path_buf(),
        source,
    })?;
    match content.trim().parse::<i32>() {
        Ok(pid) if pid > 0 => Ok(pid),
        _ => Err(ProcessError::InvalidPid {
            path: path.to_path_buf(),
            content,
        }),
    }
}

/// Whether signal 0 can be delivered to `pid`.
///
/// Any delivery failure, including a permission error, counts as not running.
pub fn is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // SAFETY: kill(2) with signal 0 performs permission and existence checks only.
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Send SIGKILL to `pid`. A missing process is an error.
pub fn kill(pid: i32) -> ProcessResult<()> {
    if pid <= 0 {
        return Err(ProcessError::NoSuchProcess(pid));
    }
    // SAFETY: pid is positive, so only that single process is signalled.
    let rc = unsafe { libc::kill(pid, libc::SIGKILL) };
    if rc == 0 {
        debug!(pid, "sent SIGKILL");
        return Ok(());
    }
    let source = io::Error::last_os_error();
    if source.raw_os_error() == Some(libc::ESRCH) {
        Err(ProcessError::NoSuchProcess(pid))
    } else {
        Err(ProcessError::Signal { pid, source })
    }
}

/// Wait until `pid` disappears from the process table.
pub async fn wait_for_exit(pid: i32, timeout: Duration) -> ProcessResult<()> {
    do_within(timeout, move |terminate| async move {
        while is_alive(pid) && !terminate.is_terminated() {
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    })
    .await
    .map_err(|source| ProcessError::StillRunning { pid, source })
}

/// SIGKILL `pid` and wait for it to leave the process table.
pub async fn kill_and_wait(pid: i32, timeout: Duration) -> ProcessResult<()> {
    kill(pid)?;
    wait_for_exit(pid, timeout).await
}
