//! Replacement policy: the pure decision function.
//!
//! Given a snapshot of the active transaction, its confirmation status and
//! the latest fee sample, decides whether a replacement is warranted and at
//! what target rate. Holds no state; identical snapshots always produce
//! identical decisions.

use std::time::Duration;

use bitcoin::ScriptBuf;
use tracing::debug;

use crate::model::{
    ConfirmationStatus, FeePriority, FeeSample, MonitoredTransaction, ReplacementDecision,
};

#[derive(Debug, Clone)]
pub struct PolicyConfig {
    pub staleness_threshold: Duration,
    pub min_relay_fee_rate: u64,
    pub target_priority: FeePriority,
    pub fee_buffer_percent: u8,
    pub max_fee_rate: u64,
}

/// One snapshot of the inputs the policy evaluates. Assembled fresh by the
/// orchestrator every polling cycle.
#[derive(Debug, Clone)]
pub struct PolicySnapshot<'a> {
    pub active: &'a MonitoredTransaction,
    pub status: ConfirmationStatus,
    pub sample: Option<&'a FeeSample>,
    /// Set when an external cancellation was requested; carries the
    /// cancellation destination.
    pub cancel_destination: Option<&'a ScriptBuf>,
    /// True when the active transaction is itself a cancellation
    /// replacement already in flight.
    pub active_is_cancel: bool,
    pub replacement_count: u32,
    pub max_replacements: u32,
}

pub struct ReplacementPolicy {
    config: PolicyConfig,
}

impl ReplacementPolicy {
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    /// Evaluates the replacement rules in order. See BIP125 rules 3 and 4
    /// for the fee-bump minimums: the new fee must exceed the old fee by at
    /// least `min_relay_fee_rate x new_vsize`, and the new fee rate must not
    /// be below the old one.
    pub fn decide(&self, snapshot: &PolicySnapshot<'_>) -> ReplacementDecision {
        // 1. Confirmed: terminal handling belongs to the orchestrator.
        if snapshot.status.is_confirmed() {
            return ReplacementDecision::NoAction;
        }

        // 2. NotFound: the orchestrator disambiguates supersession races.
        if snapshot.status == ConfirmationStatus::NotFound {
            return ReplacementDecision::NoAction;
        }

        // 3. Safety cap.
        if snapshot.replacement_count >= snapshot.max_replacements {
            debug!(
                count = snapshot.replacement_count,
                max = snapshot.max_replacements,
                "replacement cap reached"
            );
            return ReplacementDecision::NoAction;
        }

        // 4. Decisions on stale data are disallowed.
        let sample = match snapshot.sample {
            Some(sample) if !sample.is_stale(self.config.staleness_threshold) => sample,
            _ => {
                debug!("fee sample missing or stale");
                return ReplacementDecision::NoAction;
            }
        };

        let current_rate = snapshot.active.fee_rate_sat_vb();
        let min_viable = self.min_viable_rate(current_rate);

        // 5. Explicit cancellation rides the fastest tier.
        if let Some(destination) = snapshot.cancel_destination {
            let fastest = sample
                .rate(FeePriority::Fastest)
                .map(|r| self.buffered_rate(r))
                .unwrap_or(min_viable);

            // While a cancellation is already in flight, only re-issue it if
            // the fastest tier has outpaced it; otherwise hold.
            if snapshot.active_is_cancel && (fastest as f64) <= current_rate {
                return ReplacementDecision::NoAction;
            }

            return ReplacementDecision::Cancel {
                destination: destination.clone(),
                target_rate: fastest.max(min_viable),
            };
        }

        // 6. Fee bump when the targeted tier outpaces the active rate.
        let desired = match sample.rate(self.config.target_priority) {
            Some(rate) => self.buffered_rate(rate),
            None => return ReplacementDecision::NoAction,
        };

        if (desired as f64) > current_rate {
            let target_rate = desired.max(min_viable);
            debug!(
                current_rate,
                target_rate, "fee bump warranted by current tier rate"
            );
            ReplacementDecision::FeeBump { target_rate }
        } else {
            ReplacementDecision::NoAction
        }
    }

    /// Smallest rate that still satisfies the BIP125 minimums against the
    /// active transaction: at least the old rate plus the relay increment.
    fn min_viable_rate(&self, current_rate: f64) -> u64 {
        current_rate.ceil() as u64 + self.config.min_relay_fee_rate
    }

    /// Observed tier rate with the configured buffer applied, clamped to the
    /// maximum fee rate.
    fn buffered_rate(&self, rate: u64) -> u64 {
        let buffered =
            (rate as f64 * (1.0 + self.config.fee_buffer_percent as f64 / 100.0)).ceil() as u64;
        buffered.min(self.config.max_fee_rate).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::{Amount, OutPoint, Sequence, Txid};
    use std::collections::BTreeMap;

    use crate::model::TxInput;

    fn policy() -> ReplacementPolicy {
        ReplacementPolicy::new(PolicyConfig {
            staleness_threshold: Duration::from_secs(120),
            min_relay_fee_rate: 1,
            target_priority: FeePriority::Fastest,
            fee_buffer_percent: 0,
            max_fee_rate: 100,
        })
    }

    fn active_tx(fee_sat: u64, vsize: u64) -> MonitoredTransaction {
        MonitoredTransaction {
            txid: Txid::all_zeros(),
            inputs: vec![TxInput {
                previous_output: OutPoint::new(Txid::all_zeros(), 0),
                value: Amount::from_sat(100_000),
                sequence: Sequence(0xFFFFFFFD),
            }],
            outputs: vec![],
            fee: Amount::from_sat(fee_sat),
            vsize,
        }
    }

    fn sample(fastest: u64) -> FeeSample {
        FeeSample::new(BTreeMap::from([(FeePriority::Fastest, fastest)]))
    }

    fn snapshot<'a>(
        active: &'a MonitoredTransaction,
        sample: &'a FeeSample,
    ) -> PolicySnapshot<'a> {
        PolicySnapshot {
            active,
            status: ConfirmationStatus::Unconfirmed,
            sample: Some(sample),
            cancel_destination: None,
            active_is_cancel: false,
            replacement_count: 0,
            max_replacements: 5,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn bumps_when_target_exceeds_current_rate() {
        // active: 2 sat/vB over 200 vB, oracle says 5 sat/vB
        let active = active_tx(400, 200);
        let sample = sample(5);

        let decision = policy().decide(&snapshot(&active, &sample));
        assert_eq!(decision, ReplacementDecision::FeeBump { target_rate: 5 });
    }

    #[tokio::test(start_paused = true)]
    async fn target_rate_is_floored_at_minimum_viable_bump() {
        // active already at 4.5 sat/vB; oracle tier barely above it
        let active = active_tx(900, 200);
        let sample = sample(5);

        // 5 > 4.5 but the minimum viable bump is ceil(4.5) + 1 = 6
        let decision = policy().decide(&snapshot(&active, &sample));
        assert_eq!(decision, ReplacementDecision::FeeBump { target_rate: 6 });
    }

    #[tokio::test(start_paused = true)]
    async fn no_action_when_target_does_not_exceed_current() {
        let active = active_tx(2_000, 200); // 10 sat/vB
        let sample = sample(5);

        let decision = policy().decide(&snapshot(&active, &sample));
        assert_eq!(decision, ReplacementDecision::NoAction);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_sample_always_yields_no_action() {
        let active = active_tx(400, 200);
        let sample = sample(50);
        tokio::time::advance(Duration::from_secs(121)).await;

        let decision = policy().decide(&snapshot(&active, &sample));
        assert_eq!(decision, ReplacementDecision::NoAction);
    }

    #[tokio::test(start_paused = true)]
    async fn confirmed_and_not_found_yield_no_action() {
        let active = active_tx(400, 200);
        let sample = sample(50);

        let mut snap = snapshot(&active, &sample);
        snap.status = ConfirmationStatus::Confirmed { block_height: 850_000 };
        assert_eq!(policy().decide(&snap), ReplacementDecision::NoAction);

        snap.status = ConfirmationStatus::NotFound;
        assert_eq!(policy().decide(&snap), ReplacementDecision::NoAction);
    }

    #[tokio::test(start_paused = true)]
    async fn replacement_cap_blocks_further_bumps() {
        let active = active_tx(400, 200);
        let sample = sample(50);

        let mut snap = snapshot(&active, &sample);
        snap.replacement_count = 5;
        assert_eq!(policy().decide(&snap), ReplacementDecision::NoAction);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_targets_fastest_tier() {
        let active = active_tx(400, 200);
        let sample = sample(8);
        let destination = ScriptBuf::from_bytes(vec![0x51]);

        let mut snap = snapshot(&active, &sample);
        snap.cancel_destination = Some(&destination);

        let decision = policy().decide(&snap);
        assert_eq!(
            decision,
            ReplacementDecision::Cancel {
                destination: destination.clone(),
                target_rate: 8,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_is_floored_at_minimum_viable_bump() {
        // active at 10 sat/vB, fastest tier lower than that
        let active = active_tx(2_000, 200);
        let sample = sample(4);
        let destination = ScriptBuf::from_bytes(vec![0x51]);

        let mut snap = snapshot(&active, &sample);
        snap.cancel_destination = Some(&destination);

        match policy().decide(&snap) {
            ReplacementDecision::Cancel { target_rate, .. } => assert_eq!(target_rate, 11),
            other => panic!("expected cancel, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_cancel_holds_unless_tier_outpaces_it() {
        // the active transaction is already the cancellation, at 10 sat/vB
        let active = active_tx(2_000, 200);
        let destination = ScriptBuf::from_bytes(vec![0x51]);

        let slow = sample(6);
        let mut snap = snapshot(&active, &slow);
        snap.cancel_destination = Some(&destination);
        snap.active_is_cancel = true;
        assert_eq!(policy().decide(&snap), ReplacementDecision::NoAction);

        let fast = sample(25);
        let mut snap = snapshot(&active, &fast);
        snap.cancel_destination = Some(&destination);
        snap.active_is_cancel = true;
        match policy().decide(&snap) {
            ReplacementDecision::Cancel { target_rate, .. } => assert_eq!(target_rate, 25),
            other => panic!("expected cancel, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn decide_is_idempotent_for_identical_snapshots() {
        let active = active_tx(400, 200);
        let sample = sample(25);
        let policy = policy();

        let snap = snapshot(&active, &sample);
        let first = policy.decide(&snap);
        let second = policy.decide(&snap);
        assert_eq!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn buffer_and_cap_shape_the_target_rate() {
        let policy = ReplacementPolicy::new(PolicyConfig {
            staleness_threshold: Duration::from_secs(120),
            min_relay_fee_rate: 1,
            target_priority: FeePriority::Fastest,
            fee_buffer_percent: 10,
            max_fee_rate: 30,
        });

        let active = active_tx(400, 200);

        // 20 sat/vB + 10% buffer = 22
        let sample22 = sample(20);
        assert_eq!(
            policy.decide(&snapshot(&active, &sample22)),
            ReplacementDecision::FeeBump { target_rate: 22 }
        );

        // 50 sat/vB buffered to 55, clamped to the 30 sat/vB cap
        let sample_cap = sample(50);
        assert_eq!(
            policy.decide(&snapshot(&active, &sample_cap)),
            ReplacementDecision::FeeBump { target_rate: 30 }
        );
    }
}
