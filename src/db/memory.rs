use std::collections::HashMap;
use std::time::Duration;

use alloy::primitives::B256;
use async_trait::async_trait;
use eyre::Result;
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::models::StatusCounts;
use super::TransferStore;
use crate::types::{TransferRecord, TransferStatus};

struct Lease {
    owner: String,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    transfers: HashMap<B256, TransferRecord>,
    checkpoints: HashMap<String, u64>,
    leases: HashMap<B256, Lease>,
}

/// In-process store with the same guarantees as `PgStore`
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored transfer, oldest source block first
    pub async fn all_transfers(&self) -> Vec<TransferRecord> {
        let inner = self.inner.read().await;
        let mut records: Vec<_> = inner.transfers.values().cloned().collect();
        records.sort_by_key(|r| (r.source_block_number, r.transfer_id));
        records
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.transfers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl TransferStore for MemoryStore {
    async fn get_checkpoint(&self, chain: &str) -> Result<Option<u64>> {
        Ok(self.inner.read().await.checkpoints.get(chain).copied())
    }

    async fn set_checkpoint(&self, chain: &str, block: u64) -> Result<()> {
        let mut inner = self.inner.write().await;
        let entry = inner.checkpoints.entry(chain.to_string()).or_insert(block);
        *entry = (*entry).max(block);
        Ok(())
    }

    async fn insert_transfer_if_absent(&self, record: &TransferRecord) -> Result<bool> {
        let mut inner = self.inner.write().await;
        if inner.transfers.contains_key(&record.transfer_id) {
            return Ok(false);
        }
        inner.transfers.insert(record.transfer_id, record.clone());
        Ok(true)
    }

    async fn upsert_transfer(&self, record: &TransferRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.transfers.get_mut(&record.transfer_id) {
            Some(stored) if stored.status.is_final() => {}
            Some(stored) => {
                // Identity fields are fixed at first observation
                stored.status = record.status;
                stored.attestation = record.attestation.clone();
                stored.submission_tx_hash = record.submission_tx_hash;
                stored.submitted_at = record.submitted_at;
                stored.destination_tx_hash =
                    record.destination_tx_hash.or(stored.destination_tx_hash);
                stored.needs_operator = record.needs_operator;
                stored.attempts = record.attempts;
                stored.last_error = record.last_error.clone();
                stored.retry_after = record.retry_after;
            }
            None => {
                inner.transfers.insert(record.transfer_id, record.clone());
            }
        }
        Ok(())
    }

    async fn get_transfer(&self, transfer_id: &B256) -> Result<Option<TransferRecord>> {
        Ok(self.inner.read().await.transfers.get(transfer_id).cloned())
    }

    async fn get_transfers_by_status(&self, status: TransferStatus) -> Result<Vec<TransferRecord>> {
        Ok(self
            .all_transfers()
            .await
            .into_iter()
            .filter(|r| r.status == status)
            .collect())
    }

    async fn mark_settled(
        &self,
        transfer_id: &B256,
        status: TransferStatus,
        destination_tx_hash: Option<B256>,
    ) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let settled = match inner.transfers.get_mut(transfer_id) {
            Some(stored) if !stored.status.is_final() => {
                stored.status = status;
                stored.destination_tx_hash = destination_tx_hash.or(stored.destination_tx_hash);
                stored.retry_after = None;
                true
            }
            _ => false,
        };
        if settled {
            inner.leases.remove(transfer_id);
        }
        Ok(settled)
    }

    async fn try_acquire_lease(
        &self,
        transfer_id: &B256,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let mut inner = self.inner.write().await;
        if !inner.transfers.contains_key(transfer_id) {
            return Ok(false);
        }
        let now = Instant::now();
        let available = match inner.leases.get(transfer_id) {
            None => true,
            Some(lease) => lease.owner == owner || lease.expires_at < now,
        };
        if available {
            inner.leases.insert(
                *transfer_id,
                Lease {
                    owner: owner.to_string(),
                    expires_at: now + ttl,
                },
            );
        }
        Ok(available)
    }

    async fn release_lease(&self, transfer_id: &B256, owner: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner
            .leases
            .get(transfer_id)
            .is_some_and(|lease| lease.owner == owner)
        {
            inner.leases.remove(transfer_id);
        }
        Ok(())
    }

    async fn count_by_status(&self) -> Result<StatusCounts> {
        let inner = self.inner.read().await;
        let mut counts = StatusCounts::default();
        for record in inner.transfers.values() {
            match record.status {
                TransferStatus::Pending => {
                    counts.pending += 1;
                    if record.needs_operator {
                        counts.needs_operator += 1;
                    }
                }
                TransferStatus::Completed => counts.completed += 1,
                TransferStatus::Refunded => counts.refunded += 1,
            }
        }
        Ok(counts)
    }
}
