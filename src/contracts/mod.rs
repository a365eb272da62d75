//! Contract ABI definitions for the bridge contracts

pub mod bridge_vault;

pub use bridge_vault::{BridgeVault, SourceBridge};
