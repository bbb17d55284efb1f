//! Trellis – a cooperative activity execution runtime
//!
//! This crate executes trees of activities with:
//! - A single-threaded work loop per workflow instance, driven by ready work items
//! - Bookmarks and bookmark scopes for resumption by the host
//! - Fault propagation with handlers, cancellation and abort
//! - Runtime transactions and no-persist zones
//! - Durable snapshots of the whole instance tree in a filesystem store
//! - A tokio host, a synchronous invoker and a CLI
//! - A library of built-in activities

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Runtime core: definitions, executor, persistence and hosts
pub mod runtime;

/// Built-in activities
pub mod activities;

// Re-export key types for convenience
pub use runtime::{Runtime, RuntimeConfig};

/// Current version of the Trellis runtime
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
