//! Ensemble – an actor runtime driven by interpreted behaviors
//!
//! This crate implements a small actor kernel with:
//! - Per-actor persisted inboxes with validated, FIFO delivery
//! - Two behavior interpreters: state machines and flat event-handler processes
//! - Shared action execution with batched context writes and guarded blocks
//! - Request/reply (`ask`) correlation with timeouts
//! - A schema-validated tool registry for user-supplied functions

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Runtime core modules implementing the actor kernel
pub mod runtime;

// Re-export key types for convenience
pub use runtime::{Runtime, RuntimeConfig};

/// Current version of the Ensemble runtime
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
