//! Common types for the relayer
//!
//! The on-chain transfer status, the relay state derived from a stored record,
//! and the typed events decoded from chain logs.

use alloy::primitives::{Address, Bytes, B256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Transfer status as recorded by the destination contract
///
/// Transitions are monotonic: Pending -> Completed or Pending -> Refunded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Completed,
    Refunded,
}

impl TransferStatus {
    /// Get the status as a lowercase string
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Completed => "completed",
            TransferStatus::Refunded => "refunded",
        }
    }

    /// Whether the status can no longer change
    pub fn is_final(&self) -> bool {
        !matches!(self, TransferStatus::Pending)
    }

    /// Decode the contract's uint8 status (0 = none, 1 = pending, 2 = completed, 3 = refunded)
    pub fn from_contract(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(TransferStatus::Pending),
            2 => Some(TransferStatus::Completed),
            3 => Some(TransferStatus::Refunded),
            _ => None,
        }
    }

    /// Resolve a write against the stored status; a final status always wins
    pub fn merge(stored: TransferStatus, incoming: TransferStatus) -> TransferStatus {
        if stored.is_final() {
            stored
        } else {
            incoming
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TransferStatus {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransferStatus::Pending),
            "completed" => Ok(TransferStatus::Completed),
            "refunded" => Ok(TransferStatus::Refunded),
            other => Err(eyre::eyre!("unknown transfer status: {}", other)),
        }
    }
}

/// One signer's contribution to an attestation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerSignature {
    pub signer: Address,
    /// 65-byte recoverable signature (r || s || v)
    pub signature: Bytes,
}

/// Where a transfer sits in the relay pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    ObservedUnsigned,
    ObservedSigned,
    Submitted,
    Completed,
    Refunded,
    NeedsOperator,
}

impl RelayState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayState::ObservedUnsigned => "observed_unsigned",
            RelayState::ObservedSigned => "observed_signed",
            RelayState::Submitted => "submitted",
            RelayState::Completed => "completed",
            RelayState::Refunded => "refunded",
            RelayState::NeedsOperator => "needs_operator",
        }
    }
}

/// A transfer as the relayer stores it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub transfer_id: B256,
    pub source_user: Address,
    pub original_amount: U256,
    pub bridged_amount: U256,
    pub source_timestamp: u64,
    pub source_block_number: u64,
    pub source_tx_hash: Option<B256>,
    pub status: TransferStatus,
    /// Empty until signing has occurred
    pub attestation: Vec<SignerSignature>,
    /// Last completion transaction sent by the relayer
    pub submission_tx_hash: Option<B256>,
    pub submitted_at: Option<DateTime<Utc>>,
    /// Completion or refund transaction observed on the destination chain
    pub destination_tx_hash: Option<B256>,
    pub needs_operator: bool,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub retry_after: Option<DateTime<Utc>>,
}

impl TransferRecord {
    /// A freshly observed transfer
    pub fn observed(event: &TransferInitiated) -> Self {
        Self {
            transfer_id: event.transfer_id,
            source_user: event.user,
            original_amount: event.original_amount,
            bridged_amount: event.bridged_amount,
            source_timestamp: event.timestamp,
            source_block_number: event.block_number,
            source_tx_hash: event.tx_hash,
            status: TransferStatus::Pending,
            attestation: Vec::new(),
            submission_tx_hash: None,
            submitted_at: None,
            destination_tx_hash: None,
            needs_operator: false,
            attempts: 0,
            last_error: None,
            retry_after: None,
        }
    }

    pub fn relay_state(&self) -> RelayState {
        match self.status {
            TransferStatus::Completed => RelayState::Completed,
            TransferStatus::Refunded => RelayState::Refunded,
            TransferStatus::Pending if self.needs_operator => RelayState::NeedsOperator,
            TransferStatus::Pending if self.submission_tx_hash.is_some() => RelayState::Submitted,
            TransferStatus::Pending if !self.attestation.is_empty() => RelayState::ObservedSigned,
            TransferStatus::Pending => RelayState::ObservedUnsigned,
        }
    }

    /// Signatures and signers in the argument order `complete()` expects
    pub fn attestation_arrays(&self) -> (Vec<Bytes>, Vec<Address>) {
        self.attestation
            .iter()
            .map(|s| (s.signature.clone(), s.signer))
            .unzip()
    }

    pub fn is_ready_for_retry(&self, now: DateTime<Utc>) -> bool {
        match self.retry_after {
            Some(at) => now >= at,
            None => true,
        }
    }
}

/// TransferInitiated event emitted by the source contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferInitiated {
    pub transfer_id: B256,
    pub user: Address,
    pub original_amount: U256,
    pub bridged_amount: U256,
    pub timestamp: u64,
    pub block_number: u64,
    pub tx_hash: Option<B256>,
    pub log_index: u64,
}

/// TransferCompleted / TransferRefunded events emitted by the destination contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSettled {
    pub transfer_id: B256,
    pub user: Address,
    pub amount: U256,
    pub block_number: u64,
    pub tx_hash: Option<B256>,
    pub log_index: u64,
}

/// Bridge events in on-chain emission order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BridgeEvent {
    Initiated(TransferInitiated),
    Completed(TransferSettled),
    Refunded(TransferSettled),
}

impl BridgeEvent {
    pub fn transfer_id(&self) -> B256 {
        match self {
            BridgeEvent::Initiated(e) => e.transfer_id,
            BridgeEvent::Completed(e) | BridgeEvent::Refunded(e) => e.transfer_id,
        }
    }

    /// (block_number, log_index) ordering key
    pub fn position(&self) -> (u64, u64) {
        match self {
            BridgeEvent::Initiated(e) => (e.block_number, e.log_index),
            BridgeEvent::Completed(e) | BridgeEvent::Refunded(e) => (e.block_number, e.log_index),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BridgeEvent::Initiated(_) => "initiated",
            BridgeEvent::Completed(_) => "completed",
            BridgeEvent::Refunded(_) => "refunded",
        }
    }
}
