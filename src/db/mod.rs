//! Persistence for transfers and scan checkpoints
//!
//! `TransferStore` is the seam the relayer loop talks to. `PgStore` backs it
//! with Postgres; `MemoryStore` keeps everything in process for tests and
//! dry runs.

use std::time::Duration;

use alloy::primitives::B256;
use async_trait::async_trait;
use eyre::{Result, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions};

pub mod memory;
pub mod models;
pub mod postgres;

pub use memory::MemoryStore;
pub use models::*;
pub use postgres::PgStore;

use crate::types::{TransferRecord, TransferStatus};

/// Durable state shared by every relayer instance
///
/// Writes are idempotent. A transfer id maps to at most one record, and a
/// record whose status has left `Pending` is never modified again.
#[async_trait]
pub trait TransferStore: Send + Sync {
    /// Last fully processed block for a chain
    async fn get_checkpoint(&self, chain: &str) -> Result<Option<u64>>;

    /// Advance a chain's checkpoint; never moves it backwards
    async fn set_checkpoint(&self, chain: &str, block: u64) -> Result<()>;

    /// Insert a newly observed transfer. Returns false if the id is already known.
    async fn insert_transfer_if_absent(&self, record: &TransferRecord) -> Result<bool>;

    /// Insert or update a transfer; mutable fields are last-write-wins
    /// while the stored status is `Pending`
    async fn upsert_transfer(&self, record: &TransferRecord) -> Result<()>;

    async fn get_transfer(&self, transfer_id: &B256) -> Result<Option<TransferRecord>>;

    /// Transfers with the given status, oldest source block first
    async fn get_transfers_by_status(&self, status: TransferStatus) -> Result<Vec<TransferRecord>>;

    /// Move a pending transfer to a final status. Returns false if the
    /// transfer is unknown or already settled.
    async fn mark_settled(
        &self,
        transfer_id: &B256,
        status: TransferStatus,
        destination_tx_hash: Option<B256>,
    ) -> Result<bool>;

    /// Take an exclusive, expiring claim on a transfer for `owner`
    async fn try_acquire_lease(&self, transfer_id: &B256, owner: &str, ttl: Duration)
        -> Result<bool>;

    async fn release_lease(&self, transfer_id: &B256, owner: &str) -> Result<()>;

    async fn count_by_status(&self) -> Result<StatusCounts>;
}

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}
