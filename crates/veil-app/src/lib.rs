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

//! Application bootstrap wiring for the veil desktop manager.
//!
//! Layout: `logging.rs` (tracing subscriber setup), `bootstrap.rs`
//! (store/supervisor wiring and the shutdown path).

pub mod bootstrap;
pub mod error;
pub mod logging;

pub use bootstrap::run_app;
pub use error::{AppError, AppResult};
