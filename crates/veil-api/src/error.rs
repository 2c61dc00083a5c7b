//! Error types for the control-plane client.

use thiserror::Error;

/// Primary error type for control-plane operations.
#[derive(Debug, Error)]
pub enum ApiError {
    /// No IPC endpoint is available; the core is not running yet.
    ///
    /// Callers during startup treat this as retryable and log at debug,
    /// unlike the transport and status variants below.
    #[error("core control plane is not ready")]
    NotReady,
    /// Dialing the IPC endpoint or driving the connection failed.
    #[error("transport failure")]
    Transport {
        /// Operation identifier.
        operation: &'static str,
        /// Underlying IO error.
        source: std::io::Error,
    },
    /// The HTTP exchange itself failed mid-flight.
    #[error("http exchange failed")]
    Http {
        /// Operation identifier.
        operation: &'static str,
        /// Underlying hyper error.
        source: hyper::Error,
    },
    /// The WebSocket handshake for a streaming subscription failed.
    #[error("stream handshake failed")]
    StreamHandshake {
        /// Stream path the handshake targeted.
        path: String,
        /// Underlying tungstenite error.
        source: tokio_tungstenite::tungstenite::Error,
    },
    /// The core answered with a non-success status.
    #[error("core rejected the request with status {status}")]
    Status {
        /// Operation identifier.
        operation: &'static str,
        /// HTTP status code.
        status: u16,
        /// Raw response body for diagnosis.
        body: String,
    },
    /// The response payload was not the JSON shape the caller expected.
    #[error("response payload could not be decoded")]
    Decode {
        /// Operation identifier.
        operation: &'static str,
        /// Underlying JSON error.
        source: serde_json::Error,
    },
    /// A request could not even be constructed.
    #[error("malformed request")]
    Request {
        /// Operation identifier.
        operation: &'static str,
        /// Underlying http error.
        source: hyper::http::Error,
    },
}

impl ApiError {
    /// True for failures worth retrying quietly during core startup.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NotReady | Self::Transport { .. } | Self::Http { .. }
        )
    }
}

/// Convenience alias for control-plane results.
pub type ApiResult<T> = Result<T, ApiError>;
