//! Lifecycle orchestrator: owns the state machine and the polling loop.
//!
//! One orchestrator instance shepherds one payment from initial broadcast to
//! a terminal state, replacing the active transaction whenever the policy
//! says the fee should move. Exactly one transaction is active at any time;
//! superseded ones are retained for observability only.

use std::sync::{Arc, Mutex};

use bitcoin::ScriptBuf;
use eyre::{eyre, Result};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, timeout, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::builder::{BuilderConfig, ReplacementBuilder};
use crate::config::EngineConfig;
use crate::errors::BroadcastError;
use crate::events::{EngineEvent, EventLog};
use crate::fee_oracle::FeeOracle;
use crate::gateways::{BitcoinDataSource, BroadcastGateway, SigningGateway};
use crate::model::{
    ConfirmationStatus, EngineStatus, LifecycleState, MonitoredTransaction, ReplacementDecision,
    SignedTransaction, SupersededTransaction, TransactionDraft,
};
use crate::policy::{PolicyConfig, PolicySnapshot, ReplacementPolicy};
use crate::tracker::TransactionTracker;

/// Mutable lifecycle bookkeeping, guarded by a std mutex. Never held across
/// an await point.
#[derive(Debug, Default)]
struct RunState {
    active: Option<MonitoredTransaction>,
    active_is_cancel: bool,
    replacement_count: u32,
    superseded: Vec<SupersededTransaction>,
    signing_failures: u32,
}

enum ReplacementFailure {
    /// Structural; the lifecycle cannot proceed.
    Fatal(String),
    /// Transient; monitoring continues and the next cycle may retry.
    Retryable(String),
}

pub struct LifecycleOrchestrator {
    config: EngineConfig,
    fee_oracle: FeeOracle,
    tracker: TransactionTracker,
    policy: ReplacementPolicy,
    builder: ReplacementBuilder,
    signer: Arc<dyn SigningGateway>,
    broadcaster: Arc<dyn BroadcastGateway>,
    events: EventLog,
    state_tx: watch::Sender<LifecycleState>,
    run_state: Mutex<RunState>,
    cancel_request: Mutex<Option<ScriptBuf>>,
    shutdown: CancellationToken,
}

impl LifecycleOrchestrator {
    pub fn new(
        config: EngineConfig,
        data_source: Arc<dyn BitcoinDataSource>,
        signer: Arc<dyn SigningGateway>,
        broadcaster: Arc<dyn BroadcastGateway>,
    ) -> Result<Self> {
        config.validate()?;

        let fee_oracle = FeeOracle::new(data_source.clone(), config.data_source_timeout);
        let tracker = TransactionTracker::new(data_source, config.data_source_timeout);
        let policy = ReplacementPolicy::new(PolicyConfig {
            staleness_threshold: config.staleness_threshold,
            min_relay_fee_rate: config.min_relay_fee_rate,
            target_priority: config.target_priority,
            fee_buffer_percent: config.fee_buffer_percent,
            max_fee_rate: config.max_fee_rate,
        });
        let builder = ReplacementBuilder::new(BuilderConfig {
            dust_threshold: config.dust_threshold,
            min_relay_fee_rate: config.min_relay_fee_rate,
        });
        let (state_tx, _) = watch::channel(LifecycleState::Created);

        Ok(Self {
            config,
            fee_oracle,
            tracker,
            policy,
            builder,
            signer,
            broadcaster,
            events: EventLog::new(256),
            state_tx,
            run_state: Mutex::new(RunState::default()),
            cancel_request: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> LifecycleState {
        *self.state_tx.borrow()
    }

    /// Watch channel following every state transition.
    pub fn state_watch(&self) -> watch::Receiver<LifecycleState> {
        self.state_tx.subscribe()
    }

    /// Requests cancellation of the in-flight payment. The next polling
    /// cycle replaces the active transaction with one redirecting all funds
    /// to `destination`. Idempotent; a later call updates the destination.
    pub fn request_cancellation(&self, destination: ScriptBuf) {
        info!("cancellation requested");
        *self
            .cancel_request
            .lock()
            .expect("cancel request mutex poisoned") = Some(destination);
    }

    /// Token that stops the monitoring loop when cancelled. Stopping the
    /// loop abandons monitoring; it does not cancel the payment.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn status(&self) -> EngineStatus {
        let run = self.run_state.lock().expect("run state mutex poisoned");
        EngineStatus {
            state: self.state(),
            active_txid: run.active.as_ref().map(|a| a.txid),
            replacement_count: run.replacement_count,
            superseded: run.superseded.clone(),
        }
    }

    /// Replay of all events so far plus a live subscription.
    ///
    /// `DecisionMade` is published for actionable decisions only; NoAction
    /// polling cycles are logged at debug level and never enter the stream.
    pub fn subscribe_events(
        &self,
    ) -> (
        Vec<EngineEvent>,
        tokio::sync::broadcast::Receiver<EngineEvent>,
    ) {
        self.events.subscribe()
    }

    /// Spawns `run` on the join set, following the caller's task lifecycle
    /// conventions.
    pub fn spawn_in_set(self: Arc<Self>, initial: TransactionDraft, set: &mut JoinSet<Result<()>>) {
        set.spawn(
            async move {
                self.run(initial).await?;
                Ok(())
            }
            .instrument(info_span!("rbf_lifecycle")),
        );
    }

    /// Drives one payment through its full lifecycle: broadcast the initial
    /// transaction, then poll until a terminal state or shutdown. Returns
    /// the terminal state reached (Terminated if shut down mid-monitoring).
    pub async fn run(&self, initial: TransactionDraft) -> Result<LifecycleState> {
        if self.state() != LifecycleState::Created {
            return Err(eyre!("orchestrator already ran; states are not reusable"));
        }

        if !initial.is_balanced() {
            self.fail("initial transaction fee does not match input/output balance");
            self.set_state(LifecycleState::Terminated);
            return Ok(LifecycleState::Failed);
        }
        if !initial.signals_rbf() {
            self.fail("initial transaction does not signal replaceability");
            self.set_state(LifecycleState::Terminated);
            return Ok(LifecycleState::Failed);
        }

        self.set_state(LifecycleState::Broadcasting);

        let signed = match self.signer.sign(&initial).await {
            Ok(signed) => signed,
            Err(e) => {
                self.fail(&format!("initial signing failed: {e}"));
                self.set_state(LifecycleState::Terminated);
                return Ok(LifecycleState::Failed);
            }
        };

        match self.broadcast_with_retries(&signed).await {
            Ok(txid) => {
                info!(%txid, "initial transaction broadcast");
                self.events.publish(EngineEvent::InitialBroadcast { txid });
                {
                    let mut run = self.run_state.lock().expect("run state mutex poisoned");
                    run.active = Some(MonitoredTransaction::from_draft(txid, initial));
                }
                self.set_state(LifecycleState::Monitoring);
            }
            Err(e) => {
                self.fail(&format!("initial broadcast failed: {e}"));
                self.set_state(LifecycleState::Terminated);
                return Ok(LifecycleState::Failed);
            }
        }

        let mut ticker = interval(self.config.polling_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first interval tick fires immediately; skip it so the first
        // real evaluation happens one full period after broadcast.
        ticker.tick().await;

        let terminal = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("shutdown requested, abandoning monitoring");
                    break LifecycleState::Terminated;
                }
                _ = ticker.tick() => {
                    if let Some(terminal) = self.tick().await {
                        break terminal;
                    }
                }
            }
        };

        self.set_state(LifecycleState::Terminated);
        Ok(terminal)
    }

    /// One polling cycle. Returns the terminal state when the lifecycle
    /// ends, None to keep polling.
    async fn tick(&self) -> Option<LifecycleState> {
        let (active, active_is_cancel) = {
            let run = self.run_state.lock().expect("run state mutex poisoned");
            (run.active.clone()?, run.active_is_cancel)
        };

        let sample = self.refresh_fee_sample().await;

        let status = match self.tracker.status(active.txid).await {
            Ok(status) => status,
            Err(first) => {
                sleep(Duration::from_secs(1)).await;
                match self.tracker.status(active.txid).await {
                    Ok(status) => status,
                    Err(second) => {
                        warn!(%first, %second, "status polling failed twice, skipping cycle");
                        self.events.publish(EngineEvent::ErrorOccurred {
                            state: self.state(),
                            context: format!("status polling failed: {second}"),
                        });
                        return None;
                    }
                }
            }
        };

        match status {
            ConfirmationStatus::Confirmed { block_height } => {
                let terminal = if active_is_cancel {
                    LifecycleState::Canceled
                } else {
                    LifecycleState::Confirmed
                };
                info!(txid = %active.txid, block_height, state = %terminal, "active transaction confirmed");
                self.set_state(terminal);
                Some(terminal)
            }
            ConfirmationStatus::NotFound => self.handle_missing_active(&active).await,
            ConfirmationStatus::Unconfirmed => {
                let decision = {
                    let cancel = self
                        .cancel_request
                        .lock()
                        .expect("cancel request mutex poisoned")
                        .clone();
                    let (replacement_count, is_cancel) = {
                        let run = self.run_state.lock().expect("run state mutex poisoned");
                        (run.replacement_count, run.active_is_cancel)
                    };
                    self.policy.decide(&PolicySnapshot {
                        active: &active,
                        status,
                        sample: sample.as_ref(),
                        cancel_destination: cancel.as_ref(),
                        active_is_cancel: is_cancel,
                        replacement_count,
                        max_replacements: self.config.max_replacements,
                    })
                };

                if decision.is_no_action() {
                    debug!(txid = %active.txid, "no replacement warranted");
                    return None;
                }

                self.events.publish(EngineEvent::DecisionMade {
                    txid: active.txid,
                    decision: decision.clone(),
                });
                self.set_state(LifecycleState::Replacing);

                match self.attempt_replacement(&active, &decision).await {
                    Ok(new_active) => {
                        let is_cancel =
                            matches!(decision, ReplacementDecision::Cancel { .. });
                        info!(
                            replaced = %active.txid,
                            txid = %new_active.txid,
                            fee = new_active.fee.to_sat(),
                            "replacement broadcast"
                        );
                        self.events.publish(EngineEvent::ReplacementBroadcast {
                            replaced: active.txid,
                            txid: new_active.txid,
                            fee: new_active.fee,
                            fee_rate_sat_vb: new_active.fee_rate_sat_vb(),
                        });
                        {
                            let mut run =
                                self.run_state.lock().expect("run state mutex poisoned");
                            let was_cancel = run.active_is_cancel;
                            run.superseded.push(SupersededTransaction {
                                txid: active.txid,
                                fee: active.fee,
                                fee_rate_sat_vb: active.fee_rate_sat_vb(),
                                replaced_by: new_active.txid,
                                was_cancel,
                            });
                            run.active = Some(new_active);
                            run.active_is_cancel = is_cancel;
                            run.replacement_count += 1;
                        }
                        self.set_state(LifecycleState::Monitoring);
                        None
                    }
                    Err(ReplacementFailure::Fatal(context)) => {
                        self.fail(&context);
                        Some(LifecycleState::Failed)
                    }
                    Err(ReplacementFailure::Retryable(context)) => {
                        warn!(%context, "replacement attempt failed, will retry next cycle");
                        self.events.publish(EngineEvent::ErrorOccurred {
                            state: LifecycleState::Replacing,
                            context,
                        });
                        self.set_state(LifecycleState::Monitoring);
                        None
                    }
                }
            }
        }
    }

    /// The active id vanished from the data source. With replacements in
    /// flight this is the expected supersession race: check whether any
    /// superseded predecessor made it on-chain instead. With none, the
    /// transaction was evicted or was never propagated; keep monitoring and
    /// surface the anomaly.
    async fn handle_missing_active(
        &self,
        active: &MonitoredTransaction,
    ) -> Option<LifecycleState> {
        let superseded = {
            let run = self.run_state.lock().expect("run state mutex poisoned");
            if run.replacement_count == 0 {
                warn!(txid = %active.txid, "active transaction missing from data source");
                self.events
                    .publish(EngineEvent::TrackedTransactionMissing { txid: active.txid });
                return None;
            }
            run.superseded.clone()
        };

        for entry in superseded.iter().rev() {
            match self.tracker.status(entry.txid).await {
                Ok(ConfirmationStatus::Confirmed { block_height }) => {
                    let terminal = if entry.was_cancel {
                        LifecycleState::Canceled
                    } else {
                        LifecycleState::Confirmed
                    };
                    info!(
                        txid = %entry.txid,
                        block_height,
                        state = %terminal,
                        "superseded transaction won the replacement race"
                    );
                    self.set_state(terminal);
                    return Some(terminal);
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(txid = %entry.txid, %e, "superseded status check failed");
                }
            }
        }

        // Nothing confirmed; most likely replacement propagation lag.
        debug!(txid = %active.txid, "active missing, no predecessor confirmed; waiting");
        None
    }

    async fn attempt_replacement(
        &self,
        active: &MonitoredTransaction,
        decision: &ReplacementDecision,
    ) -> std::result::Result<MonitoredTransaction, ReplacementFailure> {
        let draft = self
            .builder
            .build(active, decision, &self.signer.change_script())
            .map_err(|e| ReplacementFailure::Fatal(format!("replacement build failed: {e}")))?;

        let signed = match self.signer.sign(&draft).await {
            Ok(signed) => {
                let mut run = self.run_state.lock().expect("run state mutex poisoned");
                run.signing_failures = 0;
                signed
            }
            Err(e) => {
                let failures = {
                    let mut run = self.run_state.lock().expect("run state mutex poisoned");
                    run.signing_failures += 1;
                    run.signing_failures
                };
                return if failures >= self.config.signing_failure_limit {
                    Err(ReplacementFailure::Fatal(format!(
                        "signing failed {failures} consecutive times: {e}"
                    )))
                } else {
                    Err(ReplacementFailure::Retryable(format!(
                        "signing failed (attempt {failures}): {e}"
                    )))
                };
            }
        };

        match self.broadcast_with_retries(&signed).await {
            Ok(txid) => Ok(MonitoredTransaction::from_draft(txid, draft)),
            Err(e @ BroadcastError::Rejected(_)) => {
                self.events.publish(EngineEvent::BroadcastRejected {
                    txid: signed.txid,
                    reason: e.to_string(),
                });
                Err(ReplacementFailure::Retryable(format!(
                    "replacement broadcast rejected: {e}"
                )))
            }
            Err(e) => Err(ReplacementFailure::Retryable(format!(
                "replacement broadcast failed: {e}"
            ))),
        }
    }

    /// Broadcasts with bounded linear-backoff retries for transient
    /// failures. A network rejection returns immediately.
    async fn broadcast_with_retries(
        &self,
        signed: &SignedTransaction,
    ) -> std::result::Result<bitcoin::Txid, BroadcastError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = match timeout(
                self.config.broadcast_timeout,
                self.broadcaster.broadcast(signed),
            )
            .await
            {
                Err(_) => Err(BroadcastError::Timeout(self.config.broadcast_timeout)),
                Ok(result) => result,
            };

            match result {
                Ok(txid) => return Ok(txid),
                Err(e) if e.is_retryable() && attempt < self.config.broadcast_retry_limit => {
                    warn!(attempt, %e, "broadcast attempt failed, retrying");
                    sleep(Duration::from_secs(attempt as u64)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Refreshes the fee oracle, tolerating one transient failure before
    /// falling back to the retained (possibly stale) sample. Staleness is
    /// enforced by the policy, not here.
    async fn refresh_fee_sample(&self) -> Option<crate::model::FeeSample> {
        for attempt in 0..2u32 {
            match self.fee_oracle.sample().await {
                Ok(sample) => return Some(sample),
                Err(e) => {
                    warn!(attempt, %e, "fee sampling failed");
                    if attempt == 0 {
                        sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
        self.fee_oracle.latest().await
    }

    fn fail(&self, context: &str) {
        error!(%context, "lifecycle failed");
        self.events.publish(EngineEvent::ErrorOccurred {
            state: self.state(),
            context: context.to_string(),
        });
        self.set_state(LifecycleState::Failed);
    }

    fn set_state(&self, to: LifecycleState) {
        let from = self.state();
        if from == to || from == LifecycleState::Terminated {
            return;
        }
        info!(%from, %to, "state transition");
        self.events
            .publish(EngineEvent::StateChanged { from, to });
        self.state_tx.send_replace(to);
    }
}
