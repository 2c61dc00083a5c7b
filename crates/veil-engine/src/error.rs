//! Error types for the core process supervisor.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for supervisor operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The core's config-check mode rejected the synthesized file.
    ///
    /// Carries the profile id and the raw validator output so the user can
    /// see exactly which document broke and why.
    #[error("config validation failed for profile {id}")]
    Validation {
        /// Profile the rejected config was derived from.
        id: String,
        /// Combined stdout/stderr of the validator run.
        output: String,
    },
    /// The core rejected TUN for lack of privileges; TUN has been disabled
    /// in the controlled config and the start was aborted.
    #[error("core lacks permission for TUN")]
    TunPermission {
        /// Raw core output that triggered the rejection.
        reason: String,
    },
    /// The core could not bind its control listener.
    #[error("core control listener failed to bind")]
    ListenError {
        /// Raw core output line.
        line: String,
    },
    /// The core exited before signalling readiness.
    #[error("core exited during startup")]
    ExitedEarly {
        /// Exit code when the OS reported one.
        code: Option<i32>,
    },
    /// The core produced no readiness signal within the allowed window.
    #[error("core did not become ready in time")]
    ReadinessTimeout,
    /// Restart attempts were exhausted without a successful start.
    #[error("restart failed after {attempts} attempts")]
    RetryExhausted {
        /// Attempts made before giving up.
        attempts: u32,
    },
    /// Spawning or signalling the core process failed.
    #[error("process operation failed")]
    Process {
        /// Operation identifier.
        operation: &'static str,
        /// Underlying IO error.
        source: io::Error,
    },
    /// Filesystem operation failed.
    #[error("io operation failed")]
    Io {
        /// Operation identifier.
        operation: &'static str,
        /// Path involved in the failure when known.
        path: Option<PathBuf>,
        /// Source IO error.
        source: io::Error,
    },
    /// Configuration synthesis or store access failed.
    #[error(transparent)]
    Config(#[from] veil_config::ConfigError),
    /// The supervisor task is gone; the process is shutting down.
    #[error("core supervisor closed")]
    SupervisorClosed {
        /// Operation that was attempted.
        operation: &'static str,
    },
}

impl EngineError {
    pub(crate) fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: Some(path.into()),
            source,
        }
    }
}

/// Convenience alias for supervisor results.
pub type EngineResult<T> = Result<T, EngineError>;
