//! Lazily rebuilt HTTP client for the core's control plane.
//!
//! The client is bound to whatever IPC endpoint the supervisor currently
//! advertises. Each request dials a fresh connection over the IPC stream
//! (unix socket or named pipe); the cached endpoint only tracks address
//! changes so rebuilds are observable in the logs.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, header};
use hyper_util::rt::TokioIo;
use percent_encoding::{AsciiSet, CONTROLS, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{ApiError, ApiResult};
use crate::ipc::IpcEndpoint;
use crate::transport;

/// Characters escaped inside a path segment.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'/')
    .add(b'%');

/// Provides the control-plane endpoint of the currently running core.
///
/// Implemented by the process supervisor; `None` means no core is running.
#[async_trait]
pub trait EndpointSource: Send + Sync {
    /// Endpoint of the running core, if any.
    async fn current(&self) -> Option<IpcEndpoint>;
}

/// Version payload reported by the core.
#[derive(Debug, Clone, Deserialize)]
pub struct CoreVersion {
    /// Version string.
    pub version: String,
    /// Whether the core is a meta build.
    #[serde(default)]
    pub meta: bool,
}

/// Control-plane client over the current IPC endpoint.
pub struct ApiClient {
    source: Arc<dyn EndpointSource>,
    cached: Mutex<Option<IpcEndpoint>>,
}

impl ApiClient {
    /// Build a client resolving endpoints from the given source.
    #[must_use]
    pub fn new(source: Arc<dyn EndpointSource>) -> Self {
        Self {
            source,
            cached: Mutex::new(None),
        }
    }

    /// Drop the cached endpoint so the next request re-resolves it.
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }

    async fn endpoint(&self) -> ApiResult<IpcEndpoint> {
        let current = self.source.current().await.ok_or(ApiError::NotReady)?;
        let mut cached = self.cached.lock().await;
        if cached.as_ref() != Some(&current) {
            debug!(endpoint = %current, "binding control-plane client to new endpoint");
            *cached = Some(current.clone());
        }
        Ok(current)
    }

    /// Core version, also used as the readiness probe after a start.
    ///
    /// # Errors
    /// Fails when no core is running, the transport drops, or the payload
    /// does not decode.
    pub async fn version(&self) -> ApiResult<CoreVersion> {
        let value = self.request("version", Method::GET, "/version", None).await?;
        serde_json::from_value(value).map_err(|source| ApiError::Decode {
            operation: "version",
            source,
        })
    }

    /// Patch the running core's configuration in place.
    ///
    /// # Errors
    /// Fails when no core is running or the core rejects the patch.
    pub async fn patch_config(&self, patch: Value) -> ApiResult<()> {
        self.request("patch_config", Method::PATCH, "/configs", Some(patch))
            .await
            .map(|_| ())
    }

    /// Ask the core to reload its configuration from a file on disk.
    ///
    /// # Errors
    /// Fails when no core is running or the core cannot read the file.
    pub async fn reload_config(&self, path: &str) -> ApiResult<()> {
        self.request(
            "reload_config",
            Method::PUT,
            "/configs?force=true",
            Some(json!({ "path": path })),
        )
        .await
        .map(|_| ())
    }

    /// All proxies and groups.
    ///
    /// # Errors
    /// Fails when no core is running or the request fails.
    pub async fn proxies(&self) -> ApiResult<Value> {
        self.request("proxies", Method::GET, "/proxies", None).await
    }

    /// All proxy providers.
    ///
    /// # Errors
    /// Fails when no core is running or the request fails.
    pub async fn proxy_providers(&self) -> ApiResult<Value> {
        self.request("proxy_providers", Method::GET, "/providers/proxies", None)
            .await
    }

    /// Select a proxy inside a group.
    ///
    /// # Errors
    /// Fails when the group or proxy is unknown, or no core is running.
    pub async fn select_proxy(&self, group: &str, name: &str) -> ApiResult<()> {
        let path = format!("/proxies/{}", encode_segment(group));
        self.request(
            "select_proxy",
            Method::PUT,
            &path,
            Some(json!({ "name": name })),
        )
        .await
        .map(|_| ())
    }

    /// Trigger a provider health check.
    ///
    /// # Errors
    /// Fails when the provider is unknown or no core is running.
    pub async fn provider_healthcheck(&self, name: &str) -> ApiResult<()> {
        let path = format!("/providers/proxies/{}/healthcheck", encode_segment(name));
        self.request("provider_healthcheck", Method::GET, &path, None)
            .await
            .map(|_| ())
    }

    /// Re-fetch a provider's subscription.
    ///
    /// # Errors
    /// Fails when the provider is unknown, the fetch fails, or no core is
    /// running.
    pub async fn update_provider(&self, name: &str) -> ApiResult<()> {
        let path = format!("/providers/proxies/{}", encode_segment(name));
        self.request("update_provider", Method::PUT, &path, None)
            .await
            .map(|_| ())
    }

    /// Measure a proxy's delay against a test URL.
    ///
    /// # Errors
    /// Fails when the proxy is unknown, the measurement times out, or no
    /// core is running.
    pub async fn proxy_delay(&self, name: &str, url: &str, timeout_ms: u32) -> ApiResult<Value> {
        let path = format!(
            "/proxies/{}/delay?timeout={timeout_ms}&url={}",
            encode_segment(name),
            utf8_percent_encode(url, NON_ALPHANUMERIC),
        );
        self.request("proxy_delay", Method::GET, &path, None).await
    }

    /// Current connection table.
    ///
    /// # Errors
    /// Fails when no core is running or the request fails.
    pub async fn connections(&self) -> ApiResult<Value> {
        self.request("connections", Method::GET, "/connections", None)
            .await
    }

    /// Close one connection by id.
    ///
    /// # Errors
    /// Fails when no core is running or the request fails.
    pub async fn close_connection(&self, id: &str) -> ApiResult<()> {
        let path = format!("/connections/{}", encode_segment(id));
        self.request("close_connection", Method::DELETE, &path, None)
            .await
            .map(|_| ())
    }

    /// Close every tracked connection.
    ///
    /// # Errors
    /// Fails when no core is running or the request fails.
    pub async fn close_all_connections(&self) -> ApiResult<()> {
        self.request("close_all_connections", Method::DELETE, "/connections", None)
            .await
            .map(|_| ())
    }

    /// Raw GET passthrough for core-specific endpoints (Smart weights,
    /// cache inspection) that have no stable schema.
    ///
    /// # Errors
    /// Fails when no core is running or the request fails.
    pub async fn get(&self, path: &str) -> ApiResult<Value> {
        self.request("get", Method::GET, path, None).await
    }

    /// Raw POST passthrough, see [`ApiClient::get`].
    ///
    /// # Errors
    /// Fails when no core is running or the request fails.
    pub async fn post(&self, path: &str, body: Value) -> ApiResult<Value> {
        self.request("post", Method::POST, path, Some(body)).await
    }

    async fn request(
        &self,
        operation: &'static str,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> ApiResult<Value> {
        let endpoint = self.endpoint().await?;
        let stream = transport::connect(&endpoint)
            .await
            .map_err(|source| ApiError::Transport { operation, source })?;

        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|source| ApiError::Http { operation, source })?;
        tokio::spawn(async move {
            if let Err(error) = connection.await {
                debug!(%error, "control-plane connection closed with error");
            }
        });

        let payload = body
            .as_ref()
            .map_or_else(Bytes::new, |value| Bytes::from(value.to_string()));
        let request = Request::builder()
            .method(method)
            .uri(path)
            .header(header::HOST, "veil")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(payload))
            .map_err(|source| ApiError::Request { operation, source })?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|source| ApiError::Http { operation, source })?;
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|source| ApiError::Http { operation, source })?
            .to_bytes();

        if !status.is_success() {
            return Err(ApiError::Status {
                operation,
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|source| ApiError::Decode { operation, source })
    }
}

fn encode_segment(segment: &str) -> String {
    utf8_percent_encode(segment, SEGMENT).to_string()
}
