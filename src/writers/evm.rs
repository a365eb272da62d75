//! EVM Destination - reads and writes the destination vault
//!
//! Reads go through a plain HTTP provider wrapped in bounded retry. Writes
//! build a wallet provider from the submitter key and return as soon as the
//! node accepts the transaction; receipts are checked on later ticks.

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::signers::local::PrivateKeySigner;
use alloy::transports::http::{Client, Http};
use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use tracing::{debug, info, warn};

use super::retry::{with_retry, RetryConfig};
use super::{ConfirmationResult, DestinationClient, DestinationTransfer, SubmitError};
use crate::config::ChainConfig;
use crate::contracts::BridgeVault;
use crate::hash::bytes32_to_hex;
use crate::types::TransferStatus;

pub struct EvmDestination {
    provider: RootProvider<Http<Client>>,
    rpc_url: String,
    bridge_address: Address,
    submitter: PrivateKeySigner,
    confirmations: u64,
    retry: RetryConfig,
}

impl EvmDestination {
    pub fn new(config: &ChainConfig, submitter_key: &str) -> Result<Self> {
        let provider =
            ProviderBuilder::new().on_http(config.rpc_url.parse().wrap_err("Invalid RPC URL")?);
        let bridge_address: Address = config
            .bridge_address
            .parse()
            .wrap_err("Invalid destination bridge address")?;
        let submitter: PrivateKeySigner = submitter_key
            .parse()
            .wrap_err("Invalid submitter private key")?;

        info!(
            chain = %config.name,
            bridge = %bridge_address,
            submitter = %submitter.address(),
            "Destination client initialized"
        );

        Ok(Self {
            provider,
            rpc_url: config.rpc_url.clone(),
            bridge_address,
            submitter,
            confirmations: config.confirmations.max(1),
            retry: RetryConfig::default(),
        })
    }

    pub fn submitter_address(&self) -> Address {
        self.submitter.address()
    }

    fn submit_error(action: &str, e: impl std::fmt::Display) -> SubmitError {
        SubmitError::classify(format!("{} failed: {}", action, e))
    }

    fn url_error<E: std::fmt::Display>(e: E) -> SubmitError {
        Self::submit_error("parse RPC URL", e)
    }
}

#[async_trait]
impl DestinationClient for EvmDestination {
    fn contract_address(&self) -> Address {
        self.bridge_address
    }

    async fn get_transfer(&self, transfer_id: &B256) -> Result<DestinationTransfer> {
        let contract = BridgeVault::new(self.bridge_address, &self.provider);
        let contract = &contract;
        let id = *transfer_id;

        let ret = with_retry(&self.retry, move |_| async move {
            contract
                .getTransfer(id)
                .call()
                .await
                .map_err(|e| eyre!("getTransfer failed: {}", e))
        })
        .await
        .wrap_err_with(|| format!("Failed to read transfer {}", bytes32_to_hex(&id.0)))?;

        Ok(DestinationTransfer {
            source_user: ret.sourceUser,
            original_amount: ret.originalAmount,
            bridged_amount: ret.bridgedAmount,
            source_timestamp: ret.sourceTimestamp.saturating_to::<u64>(),
            status: TransferStatus::from_contract(ret.status),
        })
    }

    async fn can_refund(&self, transfer_id: &B256) -> Result<bool> {
        let contract = BridgeVault::new(self.bridge_address, &self.provider);
        let contract = &contract;
        let id = *transfer_id;

        let ret = with_retry(&self.retry, move |_| async move {
            contract
                .canRefund(id)
                .call()
                .await
                .map_err(|e| eyre!("canRefund failed: {}", e))
        })
        .await?;

        Ok(ret._0)
    }

    async fn refund_time(&self, transfer_id: &B256) -> Result<u64> {
        let contract = BridgeVault::new(self.bridge_address, &self.provider);
        let contract = &contract;
        let id = *transfer_id;

        let ret = with_retry(&self.retry, move |_| async move {
            contract
                .getRefundTime(id)
                .call()
                .await
                .map_err(|e| eyre!("getRefundTime failed: {}", e))
        })
        .await?;

        Ok(ret._0.saturating_to::<u64>())
    }

    async fn min_signatures(&self) -> Result<usize> {
        let contract = BridgeVault::new(self.bridge_address, &self.provider);
        let contract = &contract;

        let ret = with_retry(&self.retry, move |_| async move {
            contract
                .minSignatures()
                .call()
                .await
                .map_err(|e| eyre!("minSignatures failed: {}", e))
        })
        .await?;

        Ok(ret._0.saturating_to::<usize>())
    }

    async fn complete(
        &self,
        transfer_id: &B256,
        signatures: Vec<Bytes>,
        signers: Vec<Address>,
    ) -> std::result::Result<B256, SubmitError> {
        let wallet = EthereumWallet::from(self.submitter.clone());
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(wallet)
            .on_http(self.rpc_url.parse().map_err(Self::url_error)?);
        let contract = BridgeVault::new(self.bridge_address, &provider);

        debug!(
            transfer_id = %bytes32_to_hex(&transfer_id.0),
            signers = signers.len(),
            "Submitting complete"
        );

        let pending_tx = contract
            .complete(*transfer_id, signatures, signers)
            .send()
            .await
            .map_err(|e| Self::submit_error("complete", e))?;

        let tx_hash = *pending_tx.tx_hash();
        info!(
            transfer_id = %bytes32_to_hex(&transfer_id.0),
            tx_hash = %tx_hash,
            "complete transaction sent"
        );
        Ok(tx_hash)
    }

    async fn payout(
        &self,
        transfer_id: &B256,
        user: &Address,
        amount: &U256,
    ) -> std::result::Result<B256, SubmitError> {
        let wallet = EthereumWallet::from(self.submitter.clone());
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(wallet)
            .on_http(self.rpc_url.parse().map_err(Self::url_error)?);
        let contract = BridgeVault::new(self.bridge_address, &provider);

        debug!(
            transfer_id = %bytes32_to_hex(&transfer_id.0),
            user = %user,
            amount = %amount,
            "Submitting payout"
        );

        let pending_tx = contract
            .payout(*transfer_id, *user, *amount)
            .send()
            .await
            .map_err(|e| Self::submit_error("payout", e))?;

        let tx_hash = *pending_tx.tx_hash();
        info!(
            transfer_id = %bytes32_to_hex(&transfer_id.0),
            tx_hash = %tx_hash,
            "payout transaction sent"
        );
        Ok(tx_hash)
    }

    async fn check_submission(&self, tx_hash: &B256) -> Result<ConfirmationResult> {
        let receipt = self
            .provider
            .get_transaction_receipt(*tx_hash)
            .await
            .wrap_err_with(|| format!("Failed to get receipt for {}", tx_hash))?;

        let Some(receipt) = receipt else {
            return Ok(ConfirmationResult::Pending);
        };

        if !receipt.status() {
            warn!(tx_hash = %tx_hash, "Submission reverted");
            return Ok(ConfirmationResult::Failed);
        }

        let Some(mined_at) = receipt.block_number else {
            return Ok(ConfirmationResult::Pending);
        };

        let head = self
            .provider
            .get_block_number()
            .await
            .wrap_err("Failed to get block number")?;
        let confirmations = head.saturating_sub(mined_at) + 1;

        if confirmations >= self.confirmations {
            Ok(ConfirmationResult::Confirmed)
        } else {
            Ok(ConfirmationResult::WaitingConfirmations(
                self.confirmations - confirmations,
            ))
        }
    }
}
