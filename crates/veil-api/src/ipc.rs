//! IPC endpoint addressing for the core's control plane.

use std::fmt;
use std::path::PathBuf;

/// Transport address of the core's control API.
///
/// Recomputed from platform, session identity, and the current process id on
/// every core start; never cached across restarts, so two concurrently
/// running instances can never collide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpcEndpoint {
    /// A unix domain socket path.
    Unix(PathBuf),
    /// A Windows named pipe (`\\.\pipe\...`).
    Pipe(String),
}

impl IpcEndpoint {
    /// The CLI flag value handed to the core for this endpoint.
    #[must_use]
    pub fn flag_value(&self) -> String {
        match self {
            Self::Unix(path) => path.display().to_string(),
            Self::Pipe(name) => name.clone(),
        }
    }
}

impl fmt::Display for IpcEndpoint {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(formatter, "unix://{}", path.display()),
            Self::Pipe(name) => write!(formatter, "pipe://{name}"),
        }
    }
}
