//! Chain watchers
//!
//! An `EventSource` answers two questions about one chain: how high is the
//! head, and which bridge events were emitted in a block range. `ChainPoller`
//! turns that into checkpoint-relative batches with a confirmation depth
//! and bounded log queries. It never touches the store; the relayer persists
//! a batch and only then advances the checkpoint.

use std::sync::Arc;

use async_trait::async_trait;
use eyre::{Result, WrapErr};
use tracing::debug;

pub mod evm;

pub use evm::EvmEventSource;

use crate::config::ChainConfig;
use crate::types::BridgeEvent;

/// Number of `max_block_range` chunks scanned in one poll
const MAX_CHUNKS_PER_POLL: u64 = 10;

#[async_trait]
pub trait EventSource: Send + Sync {
    async fn head_block(&self) -> Result<u64>;

    /// Bridge events emitted in `from_block..=to_block`
    async fn fetch_events(&self, from_block: u64, to_block: u64) -> Result<Vec<BridgeEvent>>;
}

/// Poller settings for one chain
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub chain: String,
    pub confirmations: u64,
    pub max_block_range: u64,
    pub initial_backfill_blocks: u64,
}

impl From<&ChainConfig> for PollerConfig {
    fn from(config: &ChainConfig) -> Self {
        Self {
            chain: config.name.clone(),
            confirmations: config.confirmations,
            max_block_range: config.max_block_range,
            initial_backfill_blocks: config.initial_backfill_blocks,
        }
    }
}

/// Events from one poll, ordered by (block_number, log_index)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollBatch {
    pub chain: String,
    pub from_block: u64,
    /// Last block covered; the next checkpoint once the batch is persisted
    pub to_block: u64,
    pub head_block: u64,
    pub events: Vec<BridgeEvent>,
}

pub struct ChainPoller {
    source: Arc<dyn EventSource>,
    config: PollerConfig,
}

impl ChainPoller {
    pub fn new(source: Arc<dyn EventSource>, config: PollerConfig) -> Self {
        Self { source, config }
    }

    pub fn chain(&self) -> &str {
        &self.config.chain
    }

    /// Fetch events after `checkpoint`, up to the confirmed head
    ///
    /// Returns `None` when there is nothing new. Any RPC error fails the
    /// whole poll so the caller keeps its checkpoint.
    pub async fn poll(&self, checkpoint: Option<u64>) -> Result<Option<PollBatch>> {
        let head_block = self
            .source
            .head_block()
            .await
            .wrap_err_with(|| format!("Failed to get head block for {}", self.config.chain))?;
        let safe_head = head_block.saturating_sub(self.config.confirmations);

        let from_block = match checkpoint {
            Some(last) => last + 1,
            None => safe_head.saturating_sub(self.config.initial_backfill_blocks),
        };
        if from_block > safe_head {
            return Ok(None);
        }

        let range = self.config.max_block_range.max(1);
        let to_block = safe_head.min(from_block + range * MAX_CHUNKS_PER_POLL - 1);

        let mut events = Vec::new();
        let mut chunk_from = from_block;
        while chunk_from <= to_block {
            let chunk_to = to_block.min(chunk_from + range - 1);
            let chunk = self
                .source
                .fetch_events(chunk_from, chunk_to)
                .await
                .wrap_err_with(|| {
                    format!(
                        "Failed to get {} events from block {} to {}",
                        self.config.chain, chunk_from, chunk_to
                    )
                })?;
            events.extend(chunk);
            chunk_from = chunk_to + 1;
        }

        events.sort_by_key(|e| e.position());

        debug!(
            chain = %self.config.chain,
            from_block,
            to_block,
            head_block,
            events = events.len(),
            "Polled block range"
        );

        Ok(Some(PollBatch {
            chain: self.config.chain.clone(),
            from_block,
            to_block,
            head_block,
            events,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedChain;
    use crate::types::TransferInitiated;
    use alloy::primitives::{Address, B256, U256};

    fn initiated(id: u8, block: u64, log_index: u64) -> BridgeEvent {
        BridgeEvent::Initiated(TransferInitiated {
            transfer_id: B256::repeat_byte(id),
            user: Address::repeat_byte(0x01),
            original_amount: U256::from(100u64),
            bridged_amount: U256::from(100u64),
            timestamp: 0,
            block_number: block,
            tx_hash: None,
            log_index,
        })
    }

    fn config(confirmations: u64, max_block_range: u64) -> PollerConfig {
        PollerConfig {
            chain: "source".into(),
            confirmations,
            max_block_range,
            initial_backfill_blocks: 50,
        }
    }

    #[tokio::test]
    async fn test_poll_respects_confirmations() {
        let chain = Arc::new(ScriptedChain::new());
        chain.set_head(105);
        chain.push_event(initiated(1, 100, 0));
        chain.push_event(initiated(2, 104, 0));
        let poller = ChainPoller::new(chain.clone(), config(2, 1000));

        let batch = poller.poll(Some(90)).await.unwrap().unwrap();
        assert_eq!((batch.from_block, batch.to_block), (91, 103));
        assert_eq!(batch.events.len(), 1);
        assert_eq!(batch.events[0].transfer_id(), B256::repeat_byte(1));

        assert!(poller.poll(Some(103)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_poll_orders_events_across_chunks() {
        let chain = Arc::new(ScriptedChain::new());
        chain.set_head(40);
        chain.push_event(initiated(3, 35, 1));
        chain.push_event(initiated(2, 35, 0));
        chain.push_event(initiated(1, 12, 4));
        let poller = ChainPoller::new(chain.clone(), config(0, 10));

        let batch = poller.poll(Some(0)).await.unwrap().unwrap();
        assert_eq!(batch.to_block, 40);
        let ids: Vec<u8> = batch.events.iter().map(|e| e.transfer_id().0[0]).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        // 1..=40 in chunks of 10
        assert_eq!(
            chain.fetched_ranges(),
            vec![(1, 10), (11, 20), (21, 30), (31, 40)]
        );
    }

    #[tokio::test]
    async fn test_first_poll_backfills() {
        let chain = Arc::new(ScriptedChain::new());
        chain.set_head(500);
        chain.push_event(initiated(1, 420, 0));
        chain.push_event(initiated(2, 460, 0));
        let poller = ChainPoller::new(chain, config(0, 1000));

        let batch = poller.poll(None).await.unwrap().unwrap();
        assert_eq!(batch.from_block, 450);
        assert_eq!(batch.events.len(), 1);
    }

    #[tokio::test]
    async fn test_poll_caps_range_per_call() {
        let chain = Arc::new(ScriptedChain::new());
        chain.set_head(10_000);
        let poller = ChainPoller::new(chain, config(0, 100));

        let batch = poller.poll(Some(0)).await.unwrap().unwrap();
        assert_eq!((batch.from_block, batch.to_block), (1, 1000));
    }

    #[tokio::test]
    async fn test_rpc_failure_returns_error() {
        let chain = Arc::new(ScriptedChain::new());
        chain.set_head(100);
        chain.fail_next_fetches(1);
        let poller = ChainPoller::new(chain.clone(), config(0, 1000));

        assert!(poller.poll(Some(50)).await.is_err());
        assert!(poller.poll(Some(50)).await.unwrap().is_some());
    }
}
