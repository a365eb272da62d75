//! Destination-chain writers
//!
//! `DestinationClient` covers every read and write the relayer makes against
//! the destination vault. `EvmDestination` talks to a real chain; the
//! in-process `testing::SimulatedVault` implements the same trait.

use alloy::primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use eyre::Result;
use thiserror::Error;

pub mod evm;
pub mod retry;

pub use evm::EvmDestination;
pub use retry::{classify_error, with_retry, ErrorClass, RetryConfig};

use crate::types::TransferStatus;

/// A transfer as the destination contract reports it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationTransfer {
    pub source_user: Address,
    pub original_amount: U256,
    pub bridged_amount: U256,
    pub source_timestamp: u64,
    /// `None` when the contract has no record of the transfer
    pub status: Option<TransferStatus>,
}

/// Result of checking a submitted transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationResult {
    /// No receipt yet
    Pending,
    /// Mined, waiting for more confirmations
    WaitingConfirmations(u64),
    /// Mined with enough confirmations and succeeded
    Confirmed,
    /// Mined and reverted
    Failed,
}

/// A rejected or failed submission
#[derive(Debug, Clone, Error)]
#[error("{class} submission error: {message}")]
pub struct SubmitError {
    pub class: ErrorClass,
    pub message: String,
}

impl SubmitError {
    /// Build from an RPC or revert message, classifying it
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            class: classify_error(&message),
            message,
        }
    }
}

#[async_trait]
pub trait DestinationClient: Send + Sync {
    /// Address of the destination contract (part of the attested hash)
    fn contract_address(&self) -> Address;

    async fn get_transfer(&self, transfer_id: &B256) -> Result<DestinationTransfer>;

    async fn can_refund(&self, transfer_id: &B256) -> Result<bool>;

    async fn refund_time(&self, transfer_id: &B256) -> Result<u64>;

    async fn min_signatures(&self) -> Result<usize>;

    /// Send `complete(transferId, signatures, signers)`; returns the tx hash once accepted
    async fn complete(
        &self,
        transfer_id: &B256,
        signatures: Vec<Bytes>,
        signers: Vec<Address>,
    ) -> std::result::Result<B256, SubmitError>;

    /// Send the owner-only `payout(transferId, user, amount)`
    async fn payout(
        &self,
        transfer_id: &B256,
        user: &Address,
        amount: &U256,
    ) -> std::result::Result<B256, SubmitError>;

    async fn check_submission(&self, tx_hash: &B256) -> Result<ConfirmationResult>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_error_classifies() {
        let err = SubmitError::classify("execution reverted: transfer not pending");
        assert_eq!(err.class, ErrorClass::AlreadyDone);
        assert_eq!(
            err.to_string(),
            "already_done submission error: execution reverted: transfer not pending"
        );
        assert_eq!(
            SubmitError::classify("nonce too low").class,
            ErrorClass::Infrastructure
        );
    }
}
