//! Bridge Relayer - Library interface
//!
//! Watches the source bridge for initiated transfers, attests them and
//! completes them on the destination vault. Modules are public so the
//! integration tests can drive the reconciliation loop in-process.

pub mod api;
pub mod config;
pub mod contracts;
pub mod db;
pub mod hash;
pub mod metrics;
pub mod relayer;
pub mod signer;
pub mod types;
pub mod watchers;
pub mod writers;

// Chain doubles (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{CompletionMode, Config};
pub use relayer::{Relayer, RelayerSettings, TickReport};
