//! In-process chain doubles
//!
//! `ScriptedChain` is an `EventSource` whose head and logs are set by the
//! caller. `SimulatedVault` models the destination vault closely enough to
//! drive the relayer end to end: it recovers signers from real signatures,
//! enforces the allow-list and `minSignatures`, only completes Pending
//! transfers and keeps the refund clock. Like a single submitter key, it
//! rejects a send that overlaps another one still in flight.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use alloy::primitives::{keccak256, Address, Bytes, B256, U256};
use async_trait::async_trait;
use eyre::{eyre, Result};

use crate::hash::compute_message_hash;
use crate::signer::recover_signer;
use crate::types::{BridgeEvent, TransferInitiated, TransferStatus};
use crate::watchers::EventSource;
use crate::writers::{ConfirmationResult, DestinationClient, DestinationTransfer, SubmitError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct ChainState {
    head: u64,
    events: Vec<BridgeEvent>,
    fetched: Vec<(u64, u64)>,
    failing_heads: u32,
    failing_fetches: u32,
}

/// Event source driven by the test
#[derive(Default)]
pub struct ScriptedChain {
    state: Mutex<ChainState>,
}

impl ScriptedChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_head(&self, head: u64) {
        lock(&self.state).head = head;
    }

    pub fn head(&self) -> u64 {
        lock(&self.state).head
    }

    /// Add an event; the head moves up to its block if needed
    pub fn push_event(&self, event: BridgeEvent) {
        let mut state = lock(&self.state);
        let (block, _) = event.position();
        state.head = state.head.max(block);
        state.events.push(event);
    }

    /// Every range passed to `fetch_events`, in call order
    pub fn fetched_ranges(&self) -> Vec<(u64, u64)> {
        lock(&self.state).fetched.clone()
    }

    pub fn fail_next_heads(&self, count: u32) {
        lock(&self.state).failing_heads = count;
    }

    pub fn fail_next_fetches(&self, count: u32) {
        lock(&self.state).failing_fetches = count;
    }
}

#[async_trait]
impl EventSource for ScriptedChain {
    async fn head_block(&self) -> Result<u64> {
        let mut state = lock(&self.state);
        if state.failing_heads > 0 {
            state.failing_heads -= 1;
            return Err(eyre!("connection refused"));
        }
        Ok(state.head)
    }

    async fn fetch_events(&self, from_block: u64, to_block: u64) -> Result<Vec<BridgeEvent>> {
        let mut state = lock(&self.state);
        if state.failing_fetches > 0 {
            state.failing_fetches -= 1;
            return Err(eyre!("request timed out"));
        }
        state.fetched.push((from_block, to_block));
        Ok(state
            .events
            .iter()
            .filter(|e| {
                let (block, _) = e.position();
                block >= from_block && block <= to_block
            })
            .cloned()
            .collect())
    }
}

#[derive(Debug, Clone)]
struct VaultTransfer {
    source_user: Address,
    original_amount: U256,
    bridged_amount: U256,
    source_timestamp: u64,
    status: TransferStatus,
}

enum VaultCall {
    Complete {
        transfer_id: B256,
        signatures: Vec<Bytes>,
        signers: Vec<Address>,
    },
    Payout {
        transfer_id: B256,
        user: Address,
        amount: U256,
    },
}

struct VaultState {
    transfers: HashMap<B256, VaultTransfer>,
    allowed_signers: HashSet<Address>,
    min_signatures: usize,
    refund_timeout: u64,
    now: u64,
    caller_is_owner: bool,
    balances: HashMap<Address, U256>,
    receipts: HashMap<B256, ConfirmationResult>,
    mempool: VecDeque<(B256, VaultCall)>,
    stalled: bool,
    next_tx: u64,
    completions: u32,
    payouts: u32,
    injected_errors: VecDeque<String>,
    failing_transfers: HashMap<B256, String>,
    status_read_failures: HashSet<B256>,
    read_delay: Option<Duration>,
}

/// In-process model of the destination vault
pub struct SimulatedVault {
    address: Address,
    state: Mutex<VaultState>,
    sends_in_flight: AtomicUsize,
    max_sends_in_flight: AtomicUsize,
}

impl SimulatedVault {
    pub fn new(
        address: Address,
        allowed_signers: impl IntoIterator<Item = Address>,
        min_signatures: usize,
        refund_timeout: u64,
    ) -> Self {
        Self {
            address,
            state: Mutex::new(VaultState {
                transfers: HashMap::new(),
                allowed_signers: allowed_signers.into_iter().collect(),
                min_signatures,
                refund_timeout,
                now: 0,
                caller_is_owner: true,
                balances: HashMap::new(),
                receipts: HashMap::new(),
                mempool: VecDeque::new(),
                stalled: false,
                next_tx: 0,
                completions: 0,
                payouts: 0,
                injected_errors: VecDeque::new(),
                failing_transfers: HashMap::new(),
                status_read_failures: HashSet::new(),
                read_delay: None,
            }),
            sends_in_flight: AtomicUsize::new(0),
            max_sends_in_flight: AtomicUsize::new(0),
        }
    }

    /// Record a transfer as Pending, as the bridge does when it is initiated
    pub fn register_transfer(&self, event: &TransferInitiated) {
        lock(&self.state).transfers.insert(
            event.transfer_id,
            VaultTransfer {
                source_user: event.user,
                original_amount: event.original_amount,
                bridged_amount: event.bridged_amount,
                source_timestamp: event.timestamp,
                status: TransferStatus::Pending,
            },
        );
    }

    pub fn set_time(&self, now: u64) {
        lock(&self.state).now = now;
    }

    pub fn set_caller_is_owner(&self, owner: bool) {
        lock(&self.state).caller_is_owner = owner;
    }

    pub fn status(&self, transfer_id: &B256) -> Option<TransferStatus> {
        lock(&self.state)
            .transfers
            .get(transfer_id)
            .map(|t| t.status)
    }

    pub fn balance_of(&self, account: &Address) -> U256 {
        lock(&self.state)
            .balances
            .get(account)
            .copied()
            .unwrap_or_default()
    }

    /// Number of `complete` calls that released funds
    pub fn completions(&self) -> u32 {
        lock(&self.state).completions
    }

    /// Number of `payout` calls that released funds
    pub fn payouts(&self) -> u32 {
        lock(&self.state).payouts
    }

    /// Fail the next submissions with these messages, in order
    pub fn inject_submit_errors<I, S>(&self, messages: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        lock(&self.state)
            .injected_errors
            .extend(messages.into_iter().map(Into::into));
    }

    /// Fail every submission for one transfer
    pub fn fail_submissions_for(&self, transfer_id: B256, message: impl Into<String>) {
        lock(&self.state)
            .failing_transfers
            .insert(transfer_id, message.into());
    }

    /// Make `getTransfer` error for one transfer
    pub fn fail_status_reads_for(&self, transfer_id: B256) {
        lock(&self.state).status_read_failures.insert(transfer_id);
    }

    /// Slow every `getTransfer` down, as a lagging RPC node would
    pub fn set_read_delay(&self, delay: Duration) {
        lock(&self.state).read_delay = Some(delay);
    }

    /// Highest number of `complete`/`payout` calls seen overlapping
    pub fn max_sends_in_flight(&self) -> usize {
        self.max_sends_in_flight.load(Ordering::SeqCst)
    }

    /// While stalled, accepted transactions wait in the mempool without receipts
    pub fn set_stalled(&self, stalled: bool) {
        lock(&self.state).stalled = stalled;
    }

    /// Execute queued transactions in arrival order
    pub fn mine_pending(&self) {
        let mut state = lock(&self.state);
        while let Some((tx_hash, call)) = state.mempool.pop_front() {
            let result = match state.execute(self.address, call) {
                Ok(()) => ConfirmationResult::Confirmed,
                Err(_) => ConfirmationResult::Failed,
            };
            state.receipts.insert(tx_hash, result);
        }
    }

    /// `refund(transferId)` called by `caller`
    pub fn refund(&self, transfer_id: &B256, caller: &Address) -> Result<(), String> {
        let mut state = lock(&self.state);
        let now = state.now;
        let refund_timeout = state.refund_timeout;
        let transfer = state
            .transfers
            .get_mut(transfer_id)
            .ok_or_else(|| "unknown transfer".to_string())?;
        if transfer.status != TransferStatus::Pending {
            return Err("transfer not pending".into());
        }
        if &transfer.source_user != caller {
            return Err("caller is not the source user".into());
        }
        if now < transfer.source_timestamp + refund_timeout {
            return Err("refund window not open".into());
        }
        transfer.status = TransferStatus::Refunded;
        Ok(())
    }

    /// Broadcast from the one submitter key
    ///
    /// A send that starts while another is in flight picks the same nonce
    /// and is rejected the way a node rejects a same-nonce replacement.
    async fn broadcast(&self, transfer_id: &B256, call: VaultCall) -> Result<B256, SubmitError> {
        let in_flight = self.sends_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_sends_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        let result = if in_flight > 1 {
            Err(SubmitError::classify("replacement transaction underpriced"))
        } else {
            // Round trip to the node
            tokio::task::yield_now().await;
            self.submit(transfer_id, call)
        };
        self.sends_in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn submit(&self, transfer_id: &B256, call: VaultCall) -> Result<B256, SubmitError> {
        let mut state = lock(&self.state);
        if let Some(message) = state.injected_errors.pop_front() {
            return Err(SubmitError::classify(message));
        }
        if let Some(message) = state.failing_transfers.get(transfer_id) {
            return Err(SubmitError::classify(message.clone()));
        }

        state.next_tx += 1;
        let tx_hash = keccak256(state.next_tx.to_be_bytes());

        if state.stalled {
            // Gas estimation runs against current state before the tx is queued
            state
                .check(self.address, &call)
                .map_err(|reason| SubmitError::classify(format!("execution reverted: {}", reason)))?;
            state.mempool.push_back((tx_hash, call));
            return Ok(tx_hash);
        }

        state
            .execute(self.address, call)
            .map_err(|reason| SubmitError::classify(format!("execution reverted: {}", reason)))?;
        state.receipts.insert(tx_hash, ConfirmationResult::Confirmed);
        Ok(tx_hash)
    }
}

impl VaultState {
    fn check(&self, vault: Address, call: &VaultCall) -> Result<(), String> {
        match call {
            VaultCall::Complete {
                transfer_id,
                signatures,
                signers,
            } => {
                if signatures.len() != signers.len() {
                    return Err("signatures/signers length mismatch".into());
                }
                let transfer = self
                    .transfers
                    .get(transfer_id)
                    .ok_or_else(|| "unknown transfer".to_string())?;
                if transfer.status != TransferStatus::Pending {
                    return Err("transfer not pending".into());
                }

                let message_hash = compute_message_hash(
                    transfer_id,
                    &transfer.source_user,
                    &transfer.bridged_amount,
                    &vault,
                );
                let mut seen = HashSet::new();
                for (signature, declared) in signatures.iter().zip(signers) {
                    let recovered = recover_signer(&message_hash, signature)
                        .map_err(|_| "invalid signature".to_string())?;
                    if recovered != *declared {
                        return Err("invalid signature".into());
                    }
                    if !self.allowed_signers.contains(&recovered) {
                        return Err("signer not allowed".into());
                    }
                    if !seen.insert(recovered) {
                        return Err("duplicate signer".into());
                    }
                }
                if seen.len() < self.min_signatures {
                    return Err("insufficient signatures".into());
                }
                Ok(())
            }
            VaultCall::Payout { transfer_id, .. } => {
                if !self.caller_is_owner {
                    return Err("caller is not the owner".into());
                }
                match self.transfers.get(transfer_id) {
                    Some(t) if t.status != TransferStatus::Pending => {
                        Err("transfer not pending".into())
                    }
                    _ => Ok(()),
                }
            }
        }
    }

    fn execute(&mut self, vault: Address, call: VaultCall) -> Result<(), String> {
        self.check(vault, &call)?;
        match call {
            VaultCall::Complete { transfer_id, .. } => {
                let transfer = self
                    .transfers
                    .get_mut(&transfer_id)
                    .ok_or_else(|| "unknown transfer".to_string())?;
                transfer.status = TransferStatus::Completed;
                let (user, amount) = (transfer.source_user, transfer.bridged_amount);
                *self.balances.entry(user).or_default() += amount;
                self.completions += 1;
            }
            VaultCall::Payout {
                transfer_id,
                user,
                amount,
            } => {
                let transfer = self
                    .transfers
                    .entry(transfer_id)
                    .or_insert_with(|| VaultTransfer {
                        source_user: user,
                        original_amount: amount,
                        bridged_amount: amount,
                        source_timestamp: 0,
                        status: TransferStatus::Pending,
                    });
                transfer.status = TransferStatus::Completed;
                *self.balances.entry(user).or_default() += amount;
                self.payouts += 1;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DestinationClient for SimulatedVault {
    fn contract_address(&self) -> Address {
        self.address
    }

    async fn get_transfer(&self, transfer_id: &B256) -> Result<DestinationTransfer> {
        let delay = lock(&self.state).read_delay;
        if let Some(delay) = delay.filter(|d| !d.is_zero()) {
            tokio::time::sleep(delay).await;
        }
        let state = lock(&self.state);
        if state.status_read_failures.contains(transfer_id) {
            return Err(eyre!("getTransfer failed: connection reset by peer"));
        }
        Ok(match state.transfers.get(transfer_id) {
            Some(t) => DestinationTransfer {
                source_user: t.source_user,
                original_amount: t.original_amount,
                bridged_amount: t.bridged_amount,
                source_timestamp: t.source_timestamp,
                status: Some(t.status),
            },
            None => DestinationTransfer {
                source_user: Address::ZERO,
                original_amount: U256::ZERO,
                bridged_amount: U256::ZERO,
                source_timestamp: 0,
                status: None,
            },
        })
    }

    async fn can_refund(&self, transfer_id: &B256) -> Result<bool> {
        let state = lock(&self.state);
        Ok(state.transfers.get(transfer_id).is_some_and(|t| {
            t.status == TransferStatus::Pending
                && state.now >= t.source_timestamp + state.refund_timeout
        }))
    }

    async fn refund_time(&self, transfer_id: &B256) -> Result<u64> {
        let state = lock(&self.state);
        Ok(state
            .transfers
            .get(transfer_id)
            .map(|t| t.source_timestamp + state.refund_timeout)
            .unwrap_or_default())
    }

    async fn min_signatures(&self) -> Result<usize> {
        Ok(lock(&self.state).min_signatures)
    }

    async fn complete(
        &self,
        transfer_id: &B256,
        signatures: Vec<Bytes>,
        signers: Vec<Address>,
    ) -> std::result::Result<B256, SubmitError> {
        self.broadcast(
            transfer_id,
            VaultCall::Complete {
                transfer_id: *transfer_id,
                signatures,
                signers,
            },
        )
        .await
    }

    async fn payout(
        &self,
        transfer_id: &B256,
        user: &Address,
        amount: &U256,
    ) -> std::result::Result<B256, SubmitError> {
        self.broadcast(
            transfer_id,
            VaultCall::Payout {
                transfer_id: *transfer_id,
                user: *user,
                amount: *amount,
            },
        )
        .await
    }

    async fn check_submission(&self, tx_hash: &B256) -> Result<ConfirmationResult> {
        Ok(lock(&self.state)
            .receipts
            .get(tx_hash)
            .cloned()
            .unwrap_or(ConfirmationResult::Pending))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::AttestationSigner;
    use crate::writers::ErrorClass;

    const KEY_1: &str = "0x0000000000000000000000000000000000000000000000000000000000000001";
    const KEY_2: &str = "0x0000000000000000000000000000000000000000000000000000000000000002";
    const KEY_3: &str = "0x0000000000000000000000000000000000000000000000000000000000000003";

    fn vault_address() -> Address {
        Address::repeat_byte(0xd0)
    }

    fn signer(keys: &[&str], threshold: usize) -> AttestationSigner {
        let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        AttestationSigner::from_keys(&keys, threshold, vault_address()).unwrap()
    }

    fn transfer(id: u8, timestamp: u64) -> TransferInitiated {
        TransferInitiated {
            transfer_id: B256::repeat_byte(id),
            user: Address::repeat_byte(0x0a),
            original_amount: U256::from(1000u64),
            bridged_amount: U256::from(1000u64),
            timestamp,
            block_number: 100,
            tx_hash: None,
            log_index: 0,
        }
    }

    async fn submit_with(
        vault: &SimulatedVault,
        signer: &AttestationSigner,
        event: &TransferInitiated,
    ) -> std::result::Result<B256, SubmitError> {
        let attestation = signer
            .sign(&event.transfer_id, &event.user, &event.bridged_amount)
            .unwrap();
        let (signatures, signers): (Vec<Bytes>, Vec<Address>) = attestation
            .into_iter()
            .map(|s| (s.signature, s.signer))
            .unzip();
        vault.complete(&event.transfer_id, signatures, signers).await
    }

    #[tokio::test]
    async fn test_threshold_enforced() {
        let all = signer(&[KEY_1, KEY_2, KEY_3], 3);
        let vault = SimulatedVault::new(vault_address(), all.addresses(), 2, 3600);

        let event = transfer(1, 0);
        vault.register_transfer(&event);
        let err = submit_with(&vault, &signer(&[KEY_1], 1), &event)
            .await
            .unwrap_err();
        assert_eq!(err.class, ErrorClass::Terminal);
        assert_eq!(vault.status(&event.transfer_id), Some(TransferStatus::Pending));

        // Exactly the minimum is accepted
        submit_with(&vault, &signer(&[KEY_1, KEY_2], 2), &event)
            .await
            .unwrap();
        assert_eq!(vault.status(&event.transfer_id), Some(TransferStatus::Completed));
    }

    #[tokio::test]
    async fn test_signer_outside_allow_list_rejected() {
        let allowed = signer(&[KEY_1, KEY_2], 2);
        let vault = SimulatedVault::new(vault_address(), allowed.addresses(), 2, 3600);
        let event = transfer(2, 0);
        vault.register_transfer(&event);

        let err = submit_with(&vault, &signer(&[KEY_1, KEY_3], 2), &event)
            .await
            .unwrap_err();
        assert_eq!(err.class, ErrorClass::Terminal);
        assert!(err.message.contains("signer not allowed"));
    }

    #[tokio::test]
    async fn test_second_complete_rejected_without_double_payout() {
        let s = signer(&[KEY_1], 1);
        let vault = SimulatedVault::new(vault_address(), s.addresses(), 1, 3600);
        let event = transfer(3, 0);
        vault.register_transfer(&event);

        submit_with(&vault, &s, &event).await.unwrap();
        let err = submit_with(&vault, &s, &event).await.unwrap_err();
        assert_eq!(err.class, ErrorClass::AlreadyDone);
        assert_eq!(vault.completions(), 1);
        assert_eq!(vault.balance_of(&event.user), U256::from(1000u64));
    }

    #[tokio::test]
    async fn test_refund_window_boundary() {
        let vault = SimulatedVault::new(vault_address(), [], 1, 3600);
        let event = transfer(4, 1_000);
        vault.register_transfer(&event);
        assert_eq!(vault.refund_time(&event.transfer_id).await.unwrap(), 4_600);

        vault.set_time(4_599);
        assert!(!vault.can_refund(&event.transfer_id).await.unwrap());
        assert!(vault.refund(&event.transfer_id, &event.user).is_err());

        vault.set_time(4_600);
        assert!(vault.can_refund(&event.transfer_id).await.unwrap());
        assert!(vault
            .refund(&event.transfer_id, &Address::repeat_byte(0x77))
            .is_err());
        vault.refund(&event.transfer_id, &event.user).unwrap();
        assert_eq!(vault.status(&event.transfer_id), Some(TransferStatus::Refunded));
        assert!(!vault.can_refund(&event.transfer_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_stalled_submission_mines_later() {
        let s = signer(&[KEY_1], 1);
        let vault = SimulatedVault::new(vault_address(), s.addresses(), 1, 3600);
        let event = transfer(5, 0);
        vault.register_transfer(&event);
        vault.set_stalled(true);

        let first = submit_with(&vault, &s, &event).await.unwrap();
        let second = submit_with(&vault, &s, &event).await.unwrap();
        assert_eq!(
            vault.check_submission(&first).await.unwrap(),
            ConfirmationResult::Pending
        );

        vault.mine_pending();
        assert_eq!(
            vault.check_submission(&first).await.unwrap(),
            ConfirmationResult::Confirmed
        );
        assert_eq!(
            vault.check_submission(&second).await.unwrap(),
            ConfirmationResult::Failed
        );
        assert_eq!(vault.completions(), 1);
    }

    #[tokio::test]
    async fn test_overlapping_sends_collide() {
        let s = signer(&[KEY_1], 1);
        let vault = SimulatedVault::new(vault_address(), s.addresses(), 1, 3600);
        let (a, b) = (transfer(6, 0), transfer(7, 0));
        vault.register_transfer(&a);
        vault.register_transfer(&b);

        let (first, second) =
            futures::join!(submit_with(&vault, &s, &a), submit_with(&vault, &s, &b));
        assert!(first.is_ok());
        assert_eq!(second.unwrap_err().class, ErrorClass::Infrastructure);
        assert_eq!(vault.max_sends_in_flight(), 2);

        // Back to back is fine
        submit_with(&vault, &s, &b).await.unwrap();
        assert_eq!(vault.completions(), 2);
    }

    #[tokio::test]
    async fn test_scripted_chain_filters_by_range() {
        let chain = ScriptedChain::new();
        chain.push_event(BridgeEvent::Initiated(transfer(1, 0)));
        assert_eq!(chain.head_block().await.unwrap(), 100);
        assert_eq!(chain.fetch_events(0, 99).await.unwrap().len(), 0);
        assert_eq!(chain.fetch_events(100, 100).await.unwrap().len(), 1);

        chain.fail_next_heads(1);
        assert!(chain.head_block().await.is_err());
        assert!(chain.head_block().await.is_ok());
    }
}
