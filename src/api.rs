//! Health & Status API endpoints
//!
//! - GET /health  - liveness plus instance id and uptime
//! - GET /metrics - Prometheus metrics
//! - GET /status  - transfer counts and chain checkpoints
//! - GET /pending - pending transfers, stuck ones first

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use eyre::Result;
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use tracing::{info, warn};

use crate::db::{StatusCounts, TransferStore};
use crate::hash::bytes32_to_hex;
use crate::types::TransferStatus;

/// Entries returned by /pending
const PENDING_LIMIT: usize = 50;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TransferStore>,
    pub chains: Vec<String>,
    pub instance_id: String,
    pub started_at: Instant,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub instance_id: String,
    pub uptime_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct ChainCheckpoint {
    pub chain: String,
    pub last_processed_block: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub transfers: StatusCounts,
    pub checkpoints: Vec<ChainCheckpoint>,
}

#[derive(Debug, Serialize)]
pub struct PendingTransferInfo {
    pub transfer_id: String,
    pub source_user: String,
    pub bridged_amount: String,
    pub state: String,
    pub attempts: u32,
    pub last_error: Option<String>,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        instance_id: state.instance_id.clone(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let (mut status, transfers) = match state.store.count_by_status().await {
        Ok(counts) => ("ok", counts),
        Err(e) => {
            warn!(error = %e, "Failed to count transfers for /status");
            ("degraded", StatusCounts::default())
        }
    };

    let mut checkpoints = Vec::with_capacity(state.chains.len());
    for chain in &state.chains {
        let last_processed_block = match state.store.get_checkpoint(chain).await {
            Ok(block) => block,
            Err(e) => {
                warn!(chain = %chain, error = %e, "Failed to read checkpoint for /status");
                status = "degraded";
                None
            }
        };
        checkpoints.push(ChainCheckpoint {
            chain: chain.clone(),
            last_processed_block,
        });
    }

    Json(StatusResponse {
        status: status.to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        transfers,
        checkpoints,
    })
}

async fn pending(
    State(state): State<AppState>,
) -> Result<Json<Vec<PendingTransferInfo>>, (StatusCode, &'static str)> {
    let mut records = match state
        .store
        .get_transfers_by_status(TransferStatus::Pending)
        .await
    {
        Ok(records) => records,
        Err(e) => {
            warn!(error = %e, "Failed to load transfers for /pending");
            return Err((StatusCode::SERVICE_UNAVAILABLE, "store unavailable"));
        }
    };
    records.sort_by_key(|r| !r.needs_operator);

    Ok(Json(
        records
            .into_iter()
            .take(PENDING_LIMIT)
            .map(|r| PendingTransferInfo {
                transfer_id: bytes32_to_hex(&r.transfer_id.0),
                source_user: format!("{}", r.source_user),
                bridged_amount: r.bridged_amount.to_string(),
                state: r.relay_state().as_str().to_string(),
                attempts: r.attempts,
                last_error: r.last_error,
            })
            .collect(),
    ))
}

async fn prometheus_metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response();
    }

    ([(header::CONTENT_TYPE, encoder.format_type().to_string())], buffer).into_response()
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/pending", get(pending))
        .route("/metrics", get(prometheus_metrics))
        .with_state(state)
}

/// Start the API server
pub async fn start_api_server(addr: SocketAddr, state: AppState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server started");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::types::{TransferInitiated, TransferRecord};
    use alloy::primitives::{Address, B256, U256};
    use async_trait::async_trait;
    use std::time::Duration;

    /// Store whose every call fails, as when Postgres is down
    struct UnreachableStore;

    #[async_trait]
    impl TransferStore for UnreachableStore {
        async fn get_checkpoint(&self, _chain: &str) -> Result<Option<u64>> {
            Err(eyre::eyre!("connection refused"))
        }
        async fn set_checkpoint(&self, _chain: &str, _block: u64) -> Result<()> {
            Err(eyre::eyre!("connection refused"))
        }
        async fn insert_transfer_if_absent(&self, _record: &TransferRecord) -> Result<bool> {
            Err(eyre::eyre!("connection refused"))
        }
        async fn upsert_transfer(&self, _record: &TransferRecord) -> Result<()> {
            Err(eyre::eyre!("connection refused"))
        }
        async fn get_transfer(&self, _transfer_id: &B256) -> Result<Option<TransferRecord>> {
            Err(eyre::eyre!("connection refused"))
        }
        async fn get_transfers_by_status(
            &self,
            _status: TransferStatus,
        ) -> Result<Vec<TransferRecord>> {
            Err(eyre::eyre!("connection refused"))
        }
        async fn mark_settled(
            &self,
            _transfer_id: &B256,
            _status: TransferStatus,
            _destination_tx_hash: Option<B256>,
        ) -> Result<bool> {
            Err(eyre::eyre!("connection refused"))
        }
        async fn try_acquire_lease(
            &self,
            _transfer_id: &B256,
            _owner: &str,
            _ttl: Duration,
        ) -> Result<bool> {
            Err(eyre::eyre!("connection refused"))
        }
        async fn release_lease(&self, _transfer_id: &B256, _owner: &str) -> Result<()> {
            Err(eyre::eyre!("connection refused"))
        }
        async fn count_by_status(&self) -> Result<StatusCounts> {
            Err(eyre::eyre!("connection refused"))
        }
    }

    fn unreachable_state() -> AppState {
        AppState {
            store: Arc::new(UnreachableStore),
            chains: vec!["source".into()],
            instance_id: "relayer-test".into(),
            started_at: Instant::now(),
        }
    }

    fn record(id: u8, needs_operator: bool) -> TransferRecord {
        let mut record = TransferRecord::observed(&TransferInitiated {
            transfer_id: B256::repeat_byte(id),
            user: Address::repeat_byte(0x01),
            original_amount: U256::from(10u64),
            bridged_amount: U256::from(10u64),
            timestamp: 0,
            block_number: id as u64,
            tx_hash: None,
            log_index: 0,
        });
        record.needs_operator = needs_operator;
        record
    }

    async fn state() -> AppState {
        let store = Arc::new(MemoryStore::new());
        store.upsert_transfer(&record(1, false)).await.unwrap();
        store.upsert_transfer(&record(2, true)).await.unwrap();
        store.set_checkpoint("source", 42).await.unwrap();
        AppState {
            store,
            chains: vec!["source".into(), "destination".into()],
            instance_id: "relayer-test".into(),
            started_at: Instant::now(),
        }
    }

    #[tokio::test]
    async fn test_status_reports_counts_and_checkpoints() {
        let Json(body) = status(State(state().await)).await;
        assert_eq!(body.status, "ok");
        assert_eq!(body.transfers.pending, 2);
        assert_eq!(body.transfers.needs_operator, 1);
        assert_eq!(body.checkpoints[0].last_processed_block, Some(42));
        assert_eq!(body.checkpoints[1].last_processed_block, None);
    }

    #[tokio::test]
    async fn test_pending_lists_stuck_first() {
        let Json(body) = pending(State(state().await)).await.unwrap();
        assert_eq!(body.len(), 2);
        assert_eq!(body[0].state, "needs_operator");
        assert_eq!(body[1].state, "observed_unsigned");
    }

    #[tokio::test]
    async fn test_status_degraded_when_store_unreachable() {
        let Json(body) = status(State(unreachable_state())).await;
        assert_eq!(body.status, "degraded");
        assert_eq!(body.checkpoints[0].last_processed_block, None);
    }

    #[tokio::test]
    async fn test_pending_reports_store_failure() {
        let err = pending(State(unreachable_state())).await.unwrap_err();
        assert_eq!(err.0, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_health() {
        let Json(body) = health(State(state().await)).await;
        assert_eq!(body.status, "healthy");
        assert_eq!(body.instance_id, "relayer-test");
    }
}
