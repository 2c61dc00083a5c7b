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

//! Lifecycle supervisor for the external proxy core.
//!
//! Layout: `platform.rs` (per-OS IPC addressing and process tweaks),
//! `validate.rs` (config check runs), `pidfile.rs` (orphan cleanup for the
//! keep-alive mode), `supervisor.rs` (the spawn/ready/crash state machine).

pub mod error;
pub mod pidfile;
pub mod platform;
pub mod supervisor;
pub mod validate;

pub use error::{EngineError, EngineResult};
pub use platform::{Platform, detect};
pub use supervisor::{CoreManager, CoreManagerOptions};
