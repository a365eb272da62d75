use alloy::primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use eyre::{eyre, Result, WrapErr};
use serde::Serialize;
use sqlx::types::Json;
use sqlx::FromRow;
use std::str::FromStr;

use crate::types::{SignerSignature, TransferRecord, TransferStatus};

// Note: amounts are stored as NUMERIC(78,0). Inserts cast text to NUMERIC
// ($n::NUMERIC) and reads cast back (amount::TEXT), so rows carry them as String.

/// Row of the `transfers` table
#[derive(Debug, Clone, FromRow)]
pub struct TransferRow {
    pub transfer_id: Vec<u8>,
    pub source_user: String,
    pub original_amount: String,
    pub bridged_amount: String,
    pub source_timestamp: i64,
    pub source_block_number: i64,
    pub source_tx_hash: Option<String>,
    pub status: TransferStatus,
    pub attestation: Json<Vec<SignerSignature>>,
    pub submission_tx_hash: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub destination_tx_hash: Option<String>,
    pub needs_operator: bool,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub retry_after: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn parse_hash(field: &str, value: &Option<String>) -> Result<Option<B256>> {
    value
        .as_deref()
        .map(|s| B256::from_str(s).wrap_err_with(|| format!("Invalid {} in row: {}", field, s)))
        .transpose()
}

impl TryFrom<TransferRow> for TransferRecord {
    type Error = eyre::Report;

    fn try_from(row: TransferRow) -> Result<Self> {
        let transfer_id: [u8; 32] = row
            .transfer_id
            .as_slice()
            .try_into()
            .map_err(|_| eyre!("transfer_id must be 32 bytes, got {}", row.transfer_id.len()))?;

        Ok(TransferRecord {
            transfer_id: B256::from(transfer_id),
            source_user: Address::from_str(&row.source_user)
                .wrap_err_with(|| format!("Invalid source_user in row: {}", row.source_user))?,
            original_amount: U256::from_str(&row.original_amount)
                .wrap_err("Invalid original_amount in row")?,
            bridged_amount: U256::from_str(&row.bridged_amount)
                .wrap_err("Invalid bridged_amount in row")?,
            source_timestamp: row.source_timestamp as u64,
            source_block_number: row.source_block_number as u64,
            source_tx_hash: parse_hash("source_tx_hash", &row.source_tx_hash)?,
            status: row.status,
            attestation: row.attestation.0,
            submission_tx_hash: parse_hash("submission_tx_hash", &row.submission_tx_hash)?,
            submitted_at: row.submitted_at,
            destination_tx_hash: parse_hash("destination_tx_hash", &row.destination_tx_hash)?,
            needs_operator: row.needs_operator,
            attempts: row.attempts.max(0) as u32,
            last_error: row.last_error,
            retry_after: row.retry_after,
        })
    }
}

/// Parameters for inserting or upserting a transfer row
#[derive(Debug, Clone)]
pub struct TransferParams {
    pub transfer_id: Vec<u8>,
    pub source_user: String,
    pub original_amount: String,
    pub bridged_amount: String,
    pub source_timestamp: i64,
    pub source_block_number: i64,
    pub source_tx_hash: Option<String>,
    pub status: TransferStatus,
    pub attestation: Json<Vec<SignerSignature>>,
    pub submission_tx_hash: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub destination_tx_hash: Option<String>,
    pub needs_operator: bool,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub retry_after: Option<DateTime<Utc>>,
}

fn hash_to_string(hash: &Option<B256>) -> Option<String> {
    hash.map(|h| format!("0x{:x}", h))
}

impl From<&TransferRecord> for TransferParams {
    fn from(record: &TransferRecord) -> Self {
        Self {
            transfer_id: record.transfer_id.to_vec(),
            source_user: format!("0x{:x}", record.source_user),
            original_amount: record.original_amount.to_string(),
            bridged_amount: record.bridged_amount.to_string(),
            source_timestamp: record.source_timestamp as i64,
            source_block_number: record.source_block_number as i64,
            source_tx_hash: hash_to_string(&record.source_tx_hash),
            status: record.status,
            attestation: Json(record.attestation.clone()),
            submission_tx_hash: hash_to_string(&record.submission_tx_hash),
            submitted_at: record.submitted_at,
            destination_tx_hash: hash_to_string(&record.destination_tx_hash),
            needs_operator: record.needs_operator,
            attempts: record.attempts as i32,
            last_error: record.last_error.clone(),
            retry_after: record.retry_after,
        }
    }
}

/// Transfer counts for the status endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub completed: i64,
    pub refunded: i64,
    pub needs_operator: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransferInitiated;
    use alloy::primitives::Bytes;

    fn record() -> TransferRecord {
        let mut record = TransferRecord::observed(&TransferInitiated {
            transfer_id: B256::repeat_byte(0xaa),
            user: Address::repeat_byte(0x0b),
            original_amount: U256::from(10u64).pow(U256::from(30u64)),
            bridged_amount: U256::from(10u64).pow(U256::from(29u64)),
            timestamp: 1_700_000_000,
            block_number: 100,
            tx_hash: Some(B256::repeat_byte(0x0c)),
            log_index: 3,
        });
        record.attestation.push(SignerSignature {
            signer: Address::repeat_byte(0x0d),
            signature: Bytes::from(vec![7u8; 65]),
        });
        record
    }

    #[test]
    fn test_params_then_row_preserves_record() {
        let record = record();
        let params = TransferParams::from(&record);
        assert_eq!(params.source_user, format!("0x{}", "0b".repeat(20)));
        assert_eq!(params.original_amount, format!("1{}", "0".repeat(30)));

        let now = Utc::now();
        let row = TransferRow {
            transfer_id: params.transfer_id,
            source_user: params.source_user,
            original_amount: params.original_amount,
            bridged_amount: params.bridged_amount,
            source_timestamp: params.source_timestamp,
            source_block_number: params.source_block_number,
            source_tx_hash: params.source_tx_hash,
            status: params.status,
            attestation: params.attestation,
            submission_tx_hash: params.submission_tx_hash,
            submitted_at: params.submitted_at,
            destination_tx_hash: params.destination_tx_hash,
            needs_operator: params.needs_operator,
            attempts: params.attempts,
            last_error: params.last_error,
            retry_after: params.retry_after,
            created_at: now,
            updated_at: now,
        };
        assert_eq!(TransferRecord::try_from(row).unwrap(), record);
    }

    #[test]
    fn test_bad_row_rejected() {
        let params = TransferParams::from(&record());
        let now = Utc::now();
        let row = TransferRow {
            transfer_id: vec![1, 2, 3],
            source_user: params.source_user,
            original_amount: params.original_amount,
            bridged_amount: params.bridged_amount,
            source_timestamp: 0,
            source_block_number: 0,
            source_tx_hash: None,
            status: TransferStatus::Pending,
            attestation: Json(vec![]),
            submission_tx_hash: None,
            submitted_at: None,
            destination_tx_hash: None,
            needs_operator: false,
            attempts: 0,
            last_error: None,
            retry_after: None,
            created_at: now,
            updated_at: now,
        };
        assert!(TransferRecord::try_from(row).is_err());
    }
}
