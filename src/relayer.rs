//! Reconciliation loop
//!
//! Each tick polls every chain, persists what it saw, then walks every
//! pending transfer through sign -> submit -> confirm. All state that has to
//! survive a tick lives in the store, so a fresh process (or a second
//! instance holding other leases) picks up exactly where the last one left
//! off.

use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy::primitives::B256;
use chrono::{DateTime, Utc};
use eyre::{eyre, Result, WrapErr};
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{CompletionMode, Config};
use crate::db::TransferStore;
use crate::hash::bytes32_to_hex;
use crate::metrics;
use crate::signer::AttestationSigner;
use crate::types::{BridgeEvent, RelayState, TransferRecord, TransferStatus};
use crate::watchers::{ChainPoller, PollBatch};
use crate::writers::retry::RetryConfig;
use crate::writers::{ConfirmationResult, DestinationClient, ErrorClass, SubmitError};

/// Transfers processed concurrently within one tick
///
/// Reads and signing overlap; destination sends still go one at a time.
const PROCESS_CONCURRENCY: usize = 8;

/// Knobs for the reconciliation loop
#[derive(Debug, Clone)]
pub struct RelayerSettings {
    pub instance_id: String,
    pub mode: CompletionMode,
    pub poll_interval: Duration,
    pub lease_ttl: Duration,
    pub max_submit_attempts: u32,
    pub resubmit_after: Duration,
}

impl Default for RelayerSettings {
    fn default() -> Self {
        Self {
            instance_id: "relayer".to_string(),
            mode: CompletionMode::Attested,
            poll_interval: Duration::from_secs(5),
            lease_ttl: Duration::from_secs(60),
            max_submit_attempts: 5,
            resubmit_after: Duration::from_secs(300),
        }
    }
}

impl From<&Config> for RelayerSettings {
    fn from(config: &Config) -> Self {
        Self {
            instance_id: config.relayer.instance_id.clone(),
            mode: config.signer.mode,
            poll_interval: config.relayer.poll_interval(),
            lease_ttl: config.relayer.lease_ttl(),
            max_submit_attempts: config.relayer.max_submit_attempts,
            resubmit_after: config.relayer.resubmit_after(),
        }
    }
}

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub events_seen: usize,
    pub transfers_observed: usize,
    pub signed: usize,
    pub submitted: usize,
    pub completed: usize,
    pub refunded: usize,
    pub deferred: usize,
    pub needs_operator: usize,
    pub failed: usize,
    pub lease_skipped: usize,
    pub poll_errors: usize,
    /// Destination settlements for transfers the store has not seen yet
    pub unmatched_settlements: usize,
}

/// Result of driving one transfer forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Submitted { signed: bool },
    Settled(TransferStatus),
    Deferred { signed: bool },
    NeedsOperator,
    Waiting,
}

pub struct Relayer {
    store: Arc<dyn TransferStore>,
    pollers: Vec<ChainPoller>,
    client: Arc<dyn DestinationClient>,
    signer: Option<AttestationSigner>,
    settings: RelayerSettings,
    submit_retry: RetryConfig,
    /// All sends share one submitter key and so one nonce sequence
    send_lock: Mutex<()>,
}

impl Relayer {
    /// `pollers` are applied in order each tick; put the source chain first so
    /// initiations land before destination events for the same transfer.
    pub fn new(
        store: Arc<dyn TransferStore>,
        pollers: Vec<ChainPoller>,
        client: Arc<dyn DestinationClient>,
        signer: Option<AttestationSigner>,
        settings: RelayerSettings,
    ) -> Result<Self> {
        if settings.mode == CompletionMode::Attested {
            let Some(signer) = &signer else {
                eyre::bail!("attested completion requires attestation keys");
            };
            if signer.destination_contract() != client.contract_address() {
                eyre::bail!(
                    "attestation signer is bound to {} but destination contract is {}",
                    signer.destination_contract(),
                    client.contract_address()
                );
            }
        }

        let submit_retry = RetryConfig {
            max_retries: settings.max_submit_attempts,
            ..RetryConfig::for_submissions()
        };

        Ok(Self {
            store,
            pollers,
            client,
            signer,
            settings,
            submit_retry,
            send_lock: Mutex::new(()),
        })
    }

    /// Run ticks on a fixed interval until `shutdown` resolves
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(self.settings.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(
            instance_id = %self.settings.instance_id,
            mode = %self.settings.mode,
            interval_ms = self.settings.poll_interval.as_millis() as u64,
            "Relayer loop started"
        );
        metrics::UP.set(1.0);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, stopping relayer loop");
                    break;
                }
                _ = interval.tick() => {
                    let report = self.tick().await;
                    if report != TickReport::default() {
                        info!(?report, "Tick complete");
                    } else {
                        debug!("Tick complete, nothing to do");
                    }
                }
            }
        }

        metrics::UP.set(0.0);
        Ok(())
    }

    pub async fn tick(&self) -> TickReport {
        self.tick_at(Utc::now()).await
    }

    /// One reconciliation pass, evaluated at wall-clock `now`
    ///
    /// Never fails: every error is logged against its chain or transfer and
    /// counted in the report.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> TickReport {
        let started = Instant::now();
        let mut report = TickReport::default();

        self.poll_chains(&mut report).await;
        self.process_pending(now, &mut report).await;

        match self.store.count_by_status().await {
            Ok(counts) => {
                metrics::PENDING_TRANSFERS.set(counts.pending as f64);
                metrics::NEEDS_OPERATOR.set(counts.needs_operator as f64);
            }
            Err(e) => warn!(error = %e, "Failed to count transfers"),
        }
        metrics::TICK_DURATION.observe(started.elapsed().as_secs_f64());

        report
    }

    async fn poll_chains(&self, report: &mut TickReport) {
        let store = &self.store;
        let polls = self.pollers.iter().map(|poller| async move {
            let checkpoint = store
                .get_checkpoint(poller.chain())
                .await
                .wrap_err_with(|| format!("Failed to read checkpoint for {}", poller.chain()))?;
            poller.poll(checkpoint).await
        });
        let results = join_all(polls).await;

        for (poller, result) in self.pollers.iter().zip(results) {
            let batch = match result {
                Ok(Some(batch)) => batch,
                Ok(None) => continue,
                Err(e) => {
                    error!(chain = %poller.chain(), error = %format!("{:#}", e), "Poll failed");
                    metrics::record_error("poll");
                    report.poll_errors += 1;
                    continue;
                }
            };

            if let Err(e) = self.apply_batch(&batch, report).await {
                error!(
                    chain = %batch.chain,
                    from_block = batch.from_block,
                    to_block = batch.to_block,
                    error = %format!("{:#}", e),
                    "Failed to persist events, checkpoint not advanced"
                );
                metrics::record_error("persist");
                report.poll_errors += 1;
            }
        }
    }

    /// Persist a batch in order, then advance the chain's checkpoint
    async fn apply_batch(&self, batch: &PollBatch, report: &mut TickReport) -> Result<()> {
        for event in &batch.events {
            report.events_seen += 1;
            metrics::EVENTS_OBSERVED
                .with_label_values(&[batch.chain.as_str(), event.kind()])
                .inc();
            let transfer_id = event.transfer_id();

            match event {
                BridgeEvent::Initiated(initiated) => {
                    let record = TransferRecord::observed(initiated);
                    if self.store.insert_transfer_if_absent(&record).await? {
                        report.transfers_observed += 1;
                        info!(
                            transfer_id = %bytes32_to_hex(&transfer_id.0),
                            user = %initiated.user,
                            bridged_amount = %initiated.bridged_amount,
                            block = initiated.block_number,
                            "Transfer observed"
                        );
                    } else {
                        debug!(
                            transfer_id = %bytes32_to_hex(&transfer_id.0),
                            "Transfer already known"
                        );
                    }
                }
                BridgeEvent::Completed(settled) | BridgeEvent::Refunded(settled) => {
                    let status = match event {
                        BridgeEvent::Refunded(_) => TransferStatus::Refunded,
                        _ => TransferStatus::Completed,
                    };
                    if self
                        .store
                        .mark_settled(&transfer_id, status, settled.tx_hash)
                        .await?
                    {
                        self.count_settled(status, report);
                        info!(
                            transfer_id = %bytes32_to_hex(&transfer_id.0),
                            status = %status,
                            tx_hash = ?settled.tx_hash,
                            "Transfer settled on destination"
                        );
                    } else if self.store.get_transfer(&transfer_id).await?.is_none() {
                        // Source poller is behind; the pre-flight read settles it later
                        report.unmatched_settlements += 1;
                        debug!(
                            chain = %batch.chain,
                            transfer_id = %bytes32_to_hex(&transfer_id.0),
                            status = %status,
                            tx_hash = ?settled.tx_hash,
                            "Settlement for unknown transfer skipped"
                        );
                    }
                }
            }
        }

        self.store
            .set_checkpoint(&batch.chain, batch.to_block)
            .await
            .wrap_err_with(|| format!("Failed to advance checkpoint for {}", batch.chain))?;

        let scanned = batch.to_block + 1 - batch.from_block;
        metrics::BLOCKS_PROCESSED
            .with_label_values(&[batch.chain.as_str()])
            .inc_by(scanned as f64);
        metrics::CHECKPOINT_BLOCK
            .with_label_values(&[batch.chain.as_str()])
            .set(batch.to_block as f64);
        Ok(())
    }

    async fn process_pending(&self, now: DateTime<Utc>, report: &mut TickReport) {
        let pending = match self.store.get_transfers_by_status(TransferStatus::Pending).await {
            Ok(pending) => pending,
            Err(e) => {
                error!(error = %format!("{:#}", e), "Failed to load pending transfers");
                metrics::record_error("store");
                return;
            }
        };

        let outcomes: Vec<(B256, Result<Option<Step>>)> = stream::iter(pending)
            .map(|record| async move {
                let id = record.transfer_id;
                (id, self.process_leased(record, now).await)
            })
            .buffered(PROCESS_CONCURRENCY)
            .collect()
            .await;

        for (transfer_id, outcome) in outcomes {
            match outcome {
                Ok(None) => report.lease_skipped += 1,
                Ok(Some(step)) => self.count_step(step, report),
                Err(e) => {
                    error!(
                        transfer_id = %bytes32_to_hex(&transfer_id.0),
                        error = %format!("{:#}", e),
                        "Failed to process transfer"
                    );
                    metrics::record_error("process");
                    report.failed += 1;
                }
            }
        }
    }

    /// Process one transfer under its lease; `None` if another instance holds it
    async fn process_leased(
        &self,
        record: TransferRecord,
        now: DateTime<Utc>,
    ) -> Result<Option<Step>> {
        let id = record.transfer_id;
        let owner = self.settings.instance_id.as_str();
        if !self
            .store
            .try_acquire_lease(&id, owner, self.settings.lease_ttl)
            .await?
        {
            debug!(transfer_id = %bytes32_to_hex(&id.0), "Transfer leased elsewhere");
            return Ok(None);
        }

        // Re-read under the lease; another instance may have moved it on
        let work = async {
            match self.store.get_transfer(&id).await? {
                Some(current) if current.status == TransferStatus::Pending => {
                    self.process_transfer(current, now).await
                }
                _ => Ok(Step::Waiting),
            }
        };
        let budget = self.processing_budget();
        let result = match tokio::time::timeout(budget, work).await {
            Ok(step) => step.map(Some),
            Err(_) => Err(eyre!(
                "processing took longer than {}ms, abandoned before the lease expires",
                budget.as_millis()
            )),
        };

        if let Err(e) = self.store.release_lease(&id, owner).await {
            warn!(transfer_id = %bytes32_to_hex(&id.0), error = %e, "Failed to release lease");
        }
        result
    }

    /// Time allowed for one transfer, kept well inside the lease TTL
    fn processing_budget(&self) -> Duration {
        self.settings.lease_ttl * 3 / 4
    }

    /// Renew the lease and confirm it is still ours
    async fn ensure_lease(&self, transfer_id: &B256) -> Result<bool> {
        self.store
            .try_acquire_lease(transfer_id, &self.settings.instance_id, self.settings.lease_ttl)
            .await
    }

    async fn process_transfer(&self, record: TransferRecord, now: DateTime<Utc>) -> Result<Step> {
        match record.relay_state() {
            RelayState::NeedsOperator => self.watch_stuck(record).await,
            RelayState::Submitted => self.check_submitted(record, now).await,
            RelayState::ObservedUnsigned | RelayState::ObservedSigned => {
                self.submit(record, now).await
            }
            RelayState::Completed | RelayState::Refunded => Ok(Step::Waiting),
        }
    }

    /// Attest (if needed) and send the completion transaction
    async fn submit(&self, mut record: TransferRecord, now: DateTime<Utc>) -> Result<Step> {
        let mut signed = false;

        if self.settings.mode == CompletionMode::Attested {
            let signer = self.attestation_signer()?;
            let needs_signing = match signer.verify_record(&record) {
                Ok(()) => false,
                Err(e) => {
                    if !record.attestation.is_empty() {
                        warn!(
                            transfer_id = %bytes32_to_hex(&record.transfer_id.0),
                            error = %e,
                            "Stored attestation does not verify, re-signing"
                        );
                    }
                    true
                }
            };
            if needs_signing {
                record.attestation = match signer.sign_record(&record) {
                    Ok(attestation) => attestation,
                    Err(e) => {
                        metrics::TRANSFERS_SIGNED.with_label_values(&["error"]).inc();
                        return Err(e).wrap_err("Failed to sign transfer");
                    }
                };
                metrics::TRANSFERS_SIGNED.with_label_values(&["ok"]).inc();
                self.store.upsert_transfer(&record).await?;
                signed = true;
            }
        }

        if !record.is_ready_for_retry(now) {
            return Ok(Step::Deferred { signed });
        }

        // Pre-flight: skip the write if the destination already settled it
        let onchain = self.client.get_transfer(&record.transfer_id).await?;
        match onchain.status {
            Some(status) if status.is_final() => {
                return self.settle(&record, status, None).await;
            }
            None if self.settings.mode == CompletionMode::Attested => {
                debug!(
                    transfer_id = %bytes32_to_hex(&record.transfer_id.0),
                    "Transfer not yet known to destination, deferring"
                );
                record.last_error = Some("transfer not yet registered on destination".into());
                record.retry_after =
                    Some(self.submit_retry.next_retry_after_from(now, record.attempts));
                self.store.upsert_transfer(&record).await?;
                return Ok(Step::Deferred { signed });
            }
            _ => {}
        }

        let mode = self.settings.mode.as_str();
        let send_guard = self.send_lock.lock().await;
        if !self.ensure_lease(&record.transfer_id).await? {
            warn!(
                transfer_id = %bytes32_to_hex(&record.transfer_id.0),
                "Lease lost before submission, leaving transfer to its holder"
            );
            return Ok(Step::Waiting);
        }
        let sent = match self.settings.mode {
            CompletionMode::Attested => {
                let (signatures, signers) = record.attestation_arrays();
                self.client
                    .complete(&record.transfer_id, signatures, signers)
                    .await
            }
            CompletionMode::Payout => {
                self.client
                    .payout(
                        &record.transfer_id,
                        &record.source_user,
                        &record.bridged_amount,
                    )
                    .await
            }
        };
        drop(send_guard);

        match sent {
            Ok(tx_hash) => {
                metrics::SUBMISSIONS.with_label_values(&[mode, "sent"]).inc();
                info!(
                    transfer_id = %bytes32_to_hex(&record.transfer_id.0),
                    tx_hash = %tx_hash,
                    mode,
                    "Completion submitted"
                );
                record.submission_tx_hash = Some(tx_hash);
                record.submitted_at = Some(now);
                record.last_error = None;
                record.retry_after = None;
                self.store.upsert_transfer(&record).await?;
                Ok(Step::Submitted { signed })
            }
            Err(rejection) => {
                metrics::SUBMISSIONS
                    .with_label_values(&[mode, "rejected"])
                    .inc();
                let step = self.handle_rejection(record, rejection, now).await?;
                Ok(match step {
                    Step::Deferred { .. } => Step::Deferred { signed },
                    other => other,
                })
            }
        }
    }

    /// Decide what a rejected submission means for the transfer
    async fn handle_rejection(
        &self,
        mut record: TransferRecord,
        rejection: SubmitError,
        now: DateTime<Utc>,
    ) -> Result<Step> {
        let id = bytes32_to_hex(&record.transfer_id.0);
        metrics::REJECTIONS
            .with_label_values(&[rejection.class.as_str()])
            .inc();

        match rejection.class {
            ErrorClass::AlreadyDone => {
                let onchain = self.client.get_transfer(&record.transfer_id).await?;
                if let Some(status) = onchain.status.filter(|s| s.is_final()) {
                    info!(transfer_id = %id, status = %status, "Transfer already settled");
                    return self.settle(&record, status, None).await;
                }
                // Contract says done but reads Pending; retry like any unknown failure
                self.schedule_retry(record, &rejection.message, ErrorClass::Unknown, now)
                    .await
            }
            ErrorClass::Terminal => {
                error!(
                    transfer_id = %id,
                    error = %rejection.message,
                    "Submission rejected permanently, operator action required"
                );
                record.attempts += 1;
                record.needs_operator = true;
                record.last_error = Some(rejection.message);
                record.retry_after = None;
                self.store.upsert_transfer(&record).await?;
                Ok(Step::NeedsOperator)
            }
            class @ (ErrorClass::Infrastructure | ErrorClass::Transient | ErrorClass::Unknown) => {
                self.schedule_retry(record, &rejection.message, class, now)
                    .await
            }
        }
    }

    /// Back off and retry later
    ///
    /// Fee, nonce, congestion and RPC failures retry forever at the capped
    /// backoff. Only unexplained failures count toward `max_submit_attempts`.
    async fn schedule_retry(
        &self,
        mut record: TransferRecord,
        reason: &str,
        class: ErrorClass,
        now: DateTime<Utc>,
    ) -> Result<Step> {
        let id = bytes32_to_hex(&record.transfer_id.0);
        record.attempts = record.attempts.saturating_add(1);
        record.last_error = Some(reason.to_string());

        let bounded = !matches!(class, ErrorClass::Infrastructure | ErrorClass::Transient);
        if bounded && !self.submit_retry.should_retry(record.attempts) {
            error!(
                transfer_id = %id,
                attempts = record.attempts,
                error = %reason,
                "Submission attempts exhausted, operator action required"
            );
            record.needs_operator = true;
            record.retry_after = None;
            self.store.upsert_transfer(&record).await?;
            return Ok(Step::NeedsOperator);
        }

        let retry_after = self
            .submit_retry
            .next_retry_after_from(now, record.attempts - 1);
        warn!(
            transfer_id = %id,
            attempts = record.attempts,
            class = class.as_str(),
            retry_after = %retry_after,
            error = %reason,
            "Submission failed, will retry"
        );
        record.retry_after = Some(retry_after);
        self.store.upsert_transfer(&record).await?;
        Ok(Step::Deferred { signed: false })
    }

    /// Follow up on a sent transaction
    async fn check_submitted(&self, mut record: TransferRecord, now: DateTime<Utc>) -> Result<Step> {
        let Some(tx_hash) = record.submission_tx_hash else {
            return Ok(Step::Waiting);
        };
        let id = bytes32_to_hex(&record.transfer_id.0);

        match self.client.check_submission(&tx_hash).await? {
            ConfirmationResult::Confirmed => {
                let onchain = self.client.get_transfer(&record.transfer_id).await?;
                match onchain.status {
                    Some(TransferStatus::Completed) => {
                        self.settle(&record, TransferStatus::Completed, Some(tx_hash))
                            .await
                    }
                    Some(TransferStatus::Refunded) => {
                        self.settle(&record, TransferStatus::Refunded, None).await
                    }
                    _ => {
                        warn!(
                            transfer_id = %id,
                            tx_hash = %tx_hash,
                            "Submission confirmed but transfer still pending"
                        );
                        record.submission_tx_hash = None;
                        record.submitted_at = None;
                        self.schedule_retry(
                            record,
                            "confirmed submission left transfer pending",
                            ErrorClass::Unknown,
                            now,
                        )
                        .await
                    }
                }
            }
            ConfirmationResult::Failed => {
                let onchain = self.client.get_transfer(&record.transfer_id).await?;
                if let Some(status) = onchain.status.filter(|s| s.is_final()) {
                    return self.settle(&record, status, None).await;
                }
                warn!(transfer_id = %id, tx_hash = %tx_hash, "Submission reverted");
                record.submission_tx_hash = None;
                record.submitted_at = None;
                self.schedule_retry(record, "submission reverted", ErrorClass::Unknown, now)
                    .await
            }
            ConfirmationResult::Pending | ConfirmationResult::WaitingConfirmations(_) => {
                let resubmit_after = chrono::Duration::from_std(self.settings.resubmit_after)
                    .unwrap_or(chrono::Duration::seconds(300));
                let stuck = record
                    .submitted_at
                    .is_some_and(|at| now >= at + resubmit_after);
                if !stuck {
                    return Ok(Step::Waiting);
                }

                let onchain = self.client.get_transfer(&record.transfer_id).await?;
                if let Some(status) = onchain.status.filter(|s| s.is_final()) {
                    return self.settle(&record, status, None).await;
                }
                warn!(
                    transfer_id = %id,
                    tx_hash = %tx_hash,
                    "Submission stuck, clearing it for resubmission"
                );
                record.submission_tx_hash = None;
                record.submitted_at = None;
                record.retry_after = None;
                self.store.upsert_transfer(&record).await?;
                Ok(Step::Deferred { signed: false })
            }
        }
    }

    /// Transfers that stopped auto-retrying are only watched for settlement
    async fn watch_stuck(&self, record: TransferRecord) -> Result<Step> {
        let onchain = self.client.get_transfer(&record.transfer_id).await?;
        if let Some(status) = onchain.status.filter(|s| s.is_final()) {
            return self.settle(&record, status, None).await;
        }
        let id = bytes32_to_hex(&record.transfer_id.0);
        if self.client.can_refund(&record.transfer_id).await? {
            debug!(transfer_id = %id, "Refund window open for stuck transfer");
        } else {
            let refund_time = self.client.refund_time(&record.transfer_id).await?;
            debug!(transfer_id = %id, refund_time, "Stuck transfer waiting for refund window");
        }
        Ok(Step::NeedsOperator)
    }

    async fn settle(
        &self,
        record: &TransferRecord,
        status: TransferStatus,
        destination_tx_hash: Option<B256>,
    ) -> Result<Step> {
        let changed = self
            .store
            .mark_settled(&record.transfer_id, status, destination_tx_hash)
            .await?;
        if changed {
            info!(
                transfer_id = %bytes32_to_hex(&record.transfer_id.0),
                status = %status,
                tx_hash = ?destination_tx_hash,
                "Transfer settled"
            );
            Ok(Step::Settled(status))
        } else {
            Ok(Step::Waiting)
        }
    }

    fn attestation_signer(&self) -> Result<&AttestationSigner> {
        self.signer
            .as_ref()
            .ok_or_else(|| eyre::eyre!("no attestation signer configured"))
    }

    fn count_settled(&self, status: TransferStatus, report: &mut TickReport) {
        metrics::TRANSFERS_SETTLED
            .with_label_values(&[status.as_str()])
            .inc();
        match status {
            TransferStatus::Completed => report.completed += 1,
            TransferStatus::Refunded => report.refunded += 1,
            TransferStatus::Pending => {}
        }
    }

    fn count_step(&self, step: Step, report: &mut TickReport) {
        match step {
            Step::Submitted { signed } => {
                report.signed += usize::from(signed);
                report.submitted += 1;
            }
            Step::Deferred { signed } => {
                report.signed += usize::from(signed);
                report.deferred += 1;
            }
            Step::Settled(status) => self.count_settled(status, report),
            Step::NeedsOperator => report.needs_operator += 1,
            Step::Waiting => {}
        }
    }
}
