#![forbid(unsafe_code)]
#![deny(
    warnings,
    dead_code,
    unused,
    unused_imports,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]

//! Control-plane client for the supervised proxy core.
//!
//! Layout: `ipc.rs` (endpoint addressing), `transport.rs` (unix socket and
//! named pipe byte streams), `client.rs` (REST client rebuilt on endpoint
//! changes), `stream.rs` (the four telemetry subscriptions with retry
//! budgets).

pub mod client;
pub mod error;
pub mod ipc;
pub mod stream;
pub mod transport;

pub use client::{ApiClient, CoreVersion, EndpointSource};
pub use error::{ApiError, ApiResult};
pub use ipc::IpcEndpoint;
pub use stream::{FrameSource, FrameStream, RETRY_BUDGET, StreamKind, StreamSupervisor, WsFrameSource};
pub use transport::IpcStream;
