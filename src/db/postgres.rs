use std::time::Duration;

use alloy::primitives::B256;
use async_trait::async_trait;
use eyre::{Result, WrapErr};
use sqlx::postgres::PgPool;
use tracing::error;

use super::models::{StatusCounts, TransferParams, TransferRow};
use super::TransferStore;
use crate::hash::bytes32_to_hex;
use crate::types::{TransferRecord, TransferStatus};

/// Cast amounts to TEXT since sqlx can't decode NUMERIC into String
const TRANSFER_SELECT: &str = r#"transfer_id, source_user, original_amount::TEXT AS original_amount,
    bridged_amount::TEXT AS bridged_amount, source_timestamp, source_block_number, source_tx_hash,
    status, attestation, submission_tx_hash, submitted_at, destination_tx_hash, needs_operator,
    attempts, last_error, retry_after, created_at, updated_at"#;

/// Postgres-backed transfer store
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TransferStore for PgStore {
    async fn get_checkpoint(&self, chain: &str) -> Result<Option<u64>> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"SELECT last_processed_block FROM chain_checkpoints WHERE chain = $1"#,
        )
        .bind(chain)
        .fetch_optional(&self.pool)
        .await
        .wrap_err_with(|| format!("Failed to get checkpoint for {}", chain))?;

        Ok(row.map(|r| r.0.max(0) as u64))
    }

    async fn set_checkpoint(&self, chain: &str, block: u64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO chain_checkpoints (chain, last_processed_block)
            VALUES ($1, $2)
            ON CONFLICT (chain) DO UPDATE SET
                last_processed_block = GREATEST(chain_checkpoints.last_processed_block, EXCLUDED.last_processed_block),
                updated_at = NOW()
            "#,
        )
        .bind(chain)
        .bind(block as i64)
        .execute(&self.pool)
        .await
        .wrap_err_with(|| format!("Failed to update checkpoint for {}", chain))?;

        Ok(())
    }

    async fn insert_transfer_if_absent(&self, record: &TransferRecord) -> Result<bool> {
        let p = TransferParams::from(record);
        let result = sqlx::query(
            r#"
            INSERT INTO transfers (transfer_id, source_user, original_amount, bridged_amount,
                source_timestamp, source_block_number, source_tx_hash, status, attestation)
            VALUES ($1, $2, $3::NUMERIC, $4::NUMERIC, $5, $6, $7, $8, $9)
            ON CONFLICT (transfer_id) DO NOTHING
            "#,
        )
        .bind(&p.transfer_id)
        .bind(&p.source_user)
        .bind(&p.original_amount)
        .bind(&p.bridged_amount)
        .bind(p.source_timestamp)
        .bind(p.source_block_number)
        .bind(&p.source_tx_hash)
        .bind(p.status)
        .bind(&p.attestation)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("SQL error inserting transfer: {:?}", e);
            e
        })
        .wrap_err_with(|| {
            format!(
                "Failed to insert transfer {}",
                bytes32_to_hex(&record.transfer_id.0)
            )
        })?;

        Ok(result.rows_affected() == 1)
    }

    async fn upsert_transfer(&self, record: &TransferRecord) -> Result<()> {
        let p = TransferParams::from(record);
        sqlx::query(
            r#"
            INSERT INTO transfers (transfer_id, source_user, original_amount, bridged_amount,
                source_timestamp, source_block_number, source_tx_hash, status, attestation,
                submission_tx_hash, submitted_at, destination_tx_hash, needs_operator,
                attempts, last_error, retry_after)
            VALUES ($1, $2, $3::NUMERIC, $4::NUMERIC, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                $14, $15, $16)
            ON CONFLICT (transfer_id) DO UPDATE SET
                status = EXCLUDED.status,
                attestation = EXCLUDED.attestation,
                submission_tx_hash = EXCLUDED.submission_tx_hash,
                submitted_at = EXCLUDED.submitted_at,
                destination_tx_hash = COALESCE(EXCLUDED.destination_tx_hash, transfers.destination_tx_hash),
                needs_operator = EXCLUDED.needs_operator,
                attempts = EXCLUDED.attempts,
                last_error = EXCLUDED.last_error,
                retry_after = EXCLUDED.retry_after,
                updated_at = NOW()
            WHERE transfers.status = 'pending'
            "#,
        )
        .bind(&p.transfer_id)
        .bind(&p.source_user)
        .bind(&p.original_amount)
        .bind(&p.bridged_amount)
        .bind(p.source_timestamp)
        .bind(p.source_block_number)
        .bind(&p.source_tx_hash)
        .bind(p.status)
        .bind(&p.attestation)
        .bind(&p.submission_tx_hash)
        .bind(p.submitted_at)
        .bind(&p.destination_tx_hash)
        .bind(p.needs_operator)
        .bind(p.attempts)
        .bind(&p.last_error)
        .bind(p.retry_after)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("SQL error upserting transfer: {:?}", e);
            e
        })
        .wrap_err_with(|| {
            format!(
                "Failed to upsert transfer {}",
                bytes32_to_hex(&record.transfer_id.0)
            )
        })?;

        Ok(())
    }

    async fn get_transfer(&self, transfer_id: &B256) -> Result<Option<TransferRecord>> {
        let query = format!("SELECT {} FROM transfers WHERE transfer_id = $1", TRANSFER_SELECT);
        let row = sqlx::query_as::<_, TransferRow>(&query)
            .bind(transfer_id.as_slice())
            .fetch_optional(&self.pool)
            .await
            .wrap_err("Failed to get transfer")?;

        row.map(TransferRecord::try_from).transpose()
    }

    async fn get_transfers_by_status(&self, status: TransferStatus) -> Result<Vec<TransferRecord>> {
        let query = format!(
            "SELECT {} FROM transfers WHERE status = $1 ORDER BY source_block_number, created_at",
            TRANSFER_SELECT
        );
        let rows = sqlx::query_as::<_, TransferRow>(&query)
            .bind(status)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("SQL error getting {} transfers: {:?}", status, e);
                e
            })
            .wrap_err_with(|| format!("Failed to get {} transfers", status))?;

        rows.into_iter().map(TransferRecord::try_from).collect()
    }

    async fn mark_settled(
        &self,
        transfer_id: &B256,
        status: TransferStatus,
        destination_tx_hash: Option<B256>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE transfers
            SET status = $2,
                destination_tx_hash = COALESCE($3, destination_tx_hash),
                retry_after = NULL,
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE transfer_id = $1 AND status = 'pending'
            "#,
        )
        .bind(transfer_id.as_slice())
        .bind(status)
        .bind(destination_tx_hash.map(|h| format!("0x{:x}", h)))
        .execute(&self.pool)
        .await
        .wrap_err_with(|| {
            format!(
                "Failed to mark transfer {} {}",
                bytes32_to_hex(&transfer_id.0),
                status
            )
        })?;

        Ok(result.rows_affected() == 1)
    }

    async fn try_acquire_lease(
        &self,
        transfer_id: &B256,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE transfers
            SET lease_owner = $2,
                lease_expires_at = NOW() + make_interval(secs => $3)
            WHERE transfer_id = $1
              AND (lease_owner IS NULL OR lease_owner = $2 OR lease_expires_at < NOW())
            "#,
        )
        .bind(transfer_id.as_slice())
        .bind(owner)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await
        .wrap_err("Failed to acquire transfer lease")?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_lease(&self, transfer_id: &B256, owner: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE transfers SET lease_owner = NULL, lease_expires_at = NULL
            WHERE transfer_id = $1 AND lease_owner = $2
            "#,
        )
        .bind(transfer_id.as_slice())
        .bind(owner)
        .execute(&self.pool)
        .await
        .wrap_err("Failed to release transfer lease")?;

        Ok(())
    }

    async fn count_by_status(&self) -> Result<StatusCounts> {
        let row: (i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending'),
                COUNT(*) FILTER (WHERE status = 'completed'),
                COUNT(*) FILTER (WHERE status = 'refunded'),
                COUNT(*) FILTER (WHERE status = 'pending' AND needs_operator)
            FROM transfers
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .wrap_err("Failed to count transfers")?;

        Ok(StatusCounts {
            pending: row.0,
            completed: row.1,
            refunded: row.2,
            needs_operator: row.3,
        })
    }
}
