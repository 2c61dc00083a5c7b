//! Application-level errors for bootstrap and shutdown.

use thiserror::Error;

/// Result alias for application operations.
pub type AppResult<T> = Result<T, AppError>;

/// Application-level error type.
#[derive(Debug, Error)]
pub enum AppError {
    /// No usable data directory could be resolved for this user.
    #[error("no data directory available")]
    MissingDataDir,
    /// Installing the tracing subscriber failed.
    #[error("logging initialisation failed")]
    Logging {
        /// Source subscriber error.
        source: tracing_subscriber::util::TryInitError,
    },
    /// Configuration store operations failed.
    #[error("configuration operation failed")]
    Config {
        /// Operation identifier.
        operation: &'static str,
        /// Source configuration error.
        source: veil_config::ConfigError,
    },
    /// Core supervisor operations failed.
    #[error("core supervisor operation failed")]
    Engine {
        /// Operation identifier.
        operation: &'static str,
        /// Source supervisor error.
        source: veil_engine::EngineError,
    },
    /// Waiting for the shutdown signal failed.
    #[error("signal handling failed")]
    Signal {
        /// Source IO error.
        source: std::io::Error,
    },
}

impl AppError {
    pub(crate) const fn config(operation: &'static str, source: veil_config::ConfigError) -> Self {
        Self::Config { operation, source }
    }

    pub(crate) const fn engine(operation: &'static str, source: veil_engine::EngineError) -> Self {
        Self::Engine { operation, source }
    }
}
