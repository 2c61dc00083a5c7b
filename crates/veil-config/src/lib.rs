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

//! Configuration synthesis for the supervised proxy core.
//!
//! Layout: `model.rs` (profiles, overrides, rule documents, controlled
//! settings), `store.rs` (single-writer persistent stores), `rules.rs`
//! (positional rule-patch algebra), `override_engine.rs` (sandboxed script
//! and YAML-patch execution), `synthesize.rs` (the pipeline producing the
//! runtime document handed to the core).

pub mod error;
mod merge;
pub mod model;
pub mod override_engine;
pub mod paths;
pub mod rules;
pub mod store;
pub mod synthesize;

pub use error::{ConfigError, ConfigResult};
pub use model::{
    AppSettings, ControlledConfig, OverrideItem, OverrideKind, OverrideScope, ProfileIndex,
    ProfileMeta, RuleDocument,
};
pub use override_engine::OverrideEngine;
pub use paths::VeilDirs;
pub use store::ConfigStore;
pub use synthesize::{ConfigSynthesizer, RuntimeConfig};
