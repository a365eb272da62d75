//! EVM Event Source - reads bridge logs over JSON-RPC
//!
//! One instance per chain. The source chain yields `TransferInitiated`,
//! the destination chain `TransferCompleted` and `TransferRefunded`.

use alloy::primitives::Address;
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::{Filter, Log};
use alloy::sol_types::SolEvent;
use alloy::transports::http::{Client, Http};
use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use tracing::{info, warn};

use super::EventSource;
use crate::config::ChainConfig;
use crate::contracts::{BridgeVault, SourceBridge};
use crate::types::{BridgeEvent, TransferInitiated, TransferSettled};
use crate::writers::retry::{with_retry, RetryConfig};

pub struct EvmEventSource {
    provider: RootProvider<Http<Client>>,
    chain: String,
    bridge_address: Address,
    retry: RetryConfig,
}

impl EvmEventSource {
    pub fn new(config: &ChainConfig) -> Result<Self> {
        let provider =
            ProviderBuilder::new().on_http(config.rpc_url.parse().wrap_err("Invalid RPC URL")?);
        let bridge_address: Address = config
            .bridge_address
            .parse()
            .wrap_err_with(|| format!("Invalid {} bridge address", config.name))?;

        info!(
            chain = %config.name,
            chain_id = config.chain_id,
            bridge = %bridge_address,
            "EVM event source initialized"
        );

        Ok(Self {
            provider,
            chain: config.name.clone(),
            bridge_address,
            retry: RetryConfig::default(),
        })
    }
}

#[async_trait]
impl EventSource for EvmEventSource {
    async fn head_block(&self) -> Result<u64> {
        let provider = &self.provider;
        with_retry(&self.retry, move |_| async move {
            provider
                .get_block_number()
                .await
                .map_err(|e| eyre!("get_block_number failed: {}", e))
        })
        .await
    }

    async fn fetch_events(&self, from_block: u64, to_block: u64) -> Result<Vec<BridgeEvent>> {
        let filter = Filter::new()
            .address(self.bridge_address)
            .from_block(from_block)
            .to_block(to_block);
        let provider = &self.provider;
        let filter = &filter;

        let logs = with_retry(&self.retry, move |_| async move {
            provider
                .get_logs(filter)
                .await
                .map_err(|e| eyre!("get_logs failed: {}", e))
        })
        .await?;

        let mut events = Vec::new();
        for log in &logs {
            match decode_bridge_log(log) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(e) => warn!(
                    chain = %self.chain,
                    block = ?log.block_number,
                    tx = ?log.transaction_hash,
                    error = %e,
                    "Skipping malformed bridge log"
                ),
            }
        }
        Ok(events)
    }
}

/// Decode a bridge log into a typed event
///
/// Returns `Ok(None)` for topics the relayer does not track.
pub fn decode_bridge_log(log: &Log) -> Result<Option<BridgeEvent>> {
    let Some(topic0) = log.topic0().copied() else {
        return Ok(None);
    };

    let block_number = log
        .block_number
        .ok_or_else(|| eyre!("log has no block number"))?;
    let log_index = log.log_index.unwrap_or_default();
    let tx_hash = log.transaction_hash;

    if topic0 == SourceBridge::TransferInitiated::SIGNATURE_HASH {
        let decoded = SourceBridge::TransferInitiated::decode_log(&log.inner, true)
            .map_err(|e| eyre!("TransferInitiated decode failed: {}", e))?
            .data;
        if decoded.bridgedAmount > decoded.originalAmount {
            return Err(eyre!(
                "bridged amount {} exceeds original amount {}",
                decoded.bridgedAmount,
                decoded.originalAmount
            ));
        }
        return Ok(Some(BridgeEvent::Initiated(TransferInitiated {
            transfer_id: decoded.transferId,
            user: decoded.user,
            original_amount: decoded.originalAmount,
            bridged_amount: decoded.bridgedAmount,
            timestamp: decoded.timestamp.saturating_to::<u64>(),
            block_number,
            tx_hash,
            log_index,
        })));
    }

    if topic0 == BridgeVault::TransferCompleted::SIGNATURE_HASH {
        let decoded = BridgeVault::TransferCompleted::decode_log(&log.inner, true)
            .map_err(|e| eyre!("TransferCompleted decode failed: {}", e))?
            .data;
        return Ok(Some(BridgeEvent::Completed(TransferSettled {
            transfer_id: decoded.transferId,
            user: decoded.user,
            amount: decoded.amount,
            block_number,
            tx_hash,
            log_index,
        })));
    }

    if topic0 == BridgeVault::TransferRefunded::SIGNATURE_HASH {
        let decoded = BridgeVault::TransferRefunded::decode_log(&log.inner, true)
            .map_err(|e| eyre!("TransferRefunded decode failed: {}", e))?
            .data;
        return Ok(Some(BridgeEvent::Refunded(TransferSettled {
            transfer_id: decoded.transferId,
            user: decoded.user,
            amount: decoded.amount,
            block_number,
            tx_hash,
            log_index,
        })));
    }

    Ok(None)
}
