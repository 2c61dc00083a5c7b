//! PID file handling for the keep-core-alive mode.
//!
//! When the application exits while leaving the core running, the core's
//! pid is recorded so the next startup can terminate the orphan before
//! spawning a fresh instance.

use std::path::Path;

use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};

/// Record the running core's pid.
///
/// # Errors
/// Fails when the file cannot be written.
pub async fn write(path: &Path, pid: u32) -> EngineResult<()> {
    tokio::fs::write(path, pid.to_string())
        .await
        .map_err(|error| EngineError::io("write_pid_file", path, error))
}

/// Remove the pid record, ignoring a file that is already gone.
///
/// # Errors
/// Fails when the file exists but cannot be removed.
pub async fn remove(path: &Path) -> EngineResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(EngineError::io("remove_pid_file", path, error)),
    }
}

/// Kill any orphaned core recorded in the pid file, then clear it.
///
/// A missing or unparseable file is not an error; an orphan that already
/// exited is not either.
///
/// # Errors
/// Fails when the file cannot be read or cleared.
pub async fn kill_stale(path: &Path) -> EngineResult<()> {
    let recorded = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(error) => return Err(EngineError::io("read_pid_file", path, error)),
    };

    match recorded.trim().parse::<u32>() {
        Ok(pid) if pid != std::process::id() => {
            debug!(%pid, "terminating orphaned core from previous run");
            terminate(pid);
        }
        Ok(_) => {}
        Err(_) => warn!(path = %path.display(), "discarding unparseable pid file"),
    }
    remove(path).await
}

#[cfg(unix)]
fn terminate(pid: u32) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        warn!(%pid, "pid out of range, skipping termination");
        return;
    };
    match kill(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) => {}
        Err(nix::errno::Errno::ESRCH) => debug!(%pid, "orphaned core already gone"),
        Err(error) => warn!(%pid, %error, "failed to terminate orphaned core"),
    }
}

#[cfg(windows)]
fn terminate(pid: u32) {
    match std::process::Command::new("taskkill")
        .args(["/F", "/PID", &pid.to_string()])
        .output()
    {
        Ok(_) => {}
        Err(error) => warn!(%pid, %error, "failed to terminate orphaned core"),
    }
}
