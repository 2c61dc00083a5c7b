//! Error types for configuration stores and the synthesis pipeline.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No profile is currently selected.
    #[error("no current profile selected")]
    NoCurrentProfile,
    /// A profile referenced by id does not exist.
    #[error("unknown profile")]
    UnknownProfile {
        /// Identifier the caller asked for.
        id: String,
    },
    /// A profile body failed to parse as YAML.
    ///
    /// Surfaced with the offending profile id so the user can act on it; a
    /// broken profile must never silently produce an empty runtime config.
    #[error("profile is not valid YAML")]
    InvalidProfileYaml {
        /// Identifier of the offending profile.
        id: String,
        /// Underlying YAML parse error.
        source: serde_yaml::Error,
    },
    /// A profile body contains HTML, the signature of a failed
    /// subscription fetch that stored an error page instead of YAML.
    #[error("profile contains HTML instead of YAML")]
    HtmlProfilePayload {
        /// Identifier of the offending profile.
        id: String,
    },
    /// A profile parsed, but its top level is not a mapping.
    #[error("profile document is not a mapping")]
    ProfileNotMapping {
        /// Identifier of the offending profile.
        id: String,
    },
    /// Serialization of a document or index failed.
    #[error("yaml serialization failed")]
    Serialize {
        /// Operation identifier.
        operation: &'static str,
        /// Underlying YAML error.
        source: serde_yaml::Error,
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
    /// The store's writer task is gone; the process is shutting down.
    #[error("configuration store closed")]
    StoreClosed {
        /// Operation that was attempted.
        operation: &'static str,
    },
}

impl ConfigError {
    pub(crate) fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: Some(path.into()),
            source,
        }
    }
}

/// Convenience alias for configuration results.
pub type ConfigResult<T> = Result<T, ConfigError>;
