//! Logical data model for the replacement engine
//!
//! The engine never touches raw transaction bytes; it operates on the logical
//! fields (inputs, outputs, fee, sequence numbers, virtual size) and leaves
//! consensus serialization to the `bitcoin` crate at the gateway boundary.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Txid};
use tokio::time::Instant;

/// Fee recommendation tiers, mirroring the mempool.space recommended set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FeePriority {
    Fastest,
    HalfHour,
    Hour,
    Economy,
    Minimum,
}

impl FeePriority {
    pub const ALL: [FeePriority; 5] = [
        FeePriority::Fastest,
        FeePriority::HalfHour,
        FeePriority::Hour,
        FeePriority::Economy,
        FeePriority::Minimum,
    ];

    /// Esplora fee-estimate confirmation target backing this tier.
    pub fn confirmation_target(&self) -> u16 {
        match self {
            FeePriority::Fastest => 1,
            FeePriority::HalfHour => 3,
            FeePriority::Hour => 6,
            FeePriority::Economy => 144,
            FeePriority::Minimum => 1008,
        }
    }
}

impl fmt::Display for FeePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FeePriority::Fastest => "fastest",
            FeePriority::HalfHour => "half-hour",
            FeePriority::Hour => "hour",
            FeePriority::Economy => "economy",
            FeePriority::Minimum => "minimum",
        };
        f.write_str(s)
    }
}

impl FromStr for FeePriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fastest" => Ok(FeePriority::Fastest),
            "half-hour" | "halfhour" | "30min" => Ok(FeePriority::HalfHour),
            "hour" | "1hour" => Ok(FeePriority::Hour),
            "economy" => Ok(FeePriority::Economy),
            "minimum" => Ok(FeePriority::Minimum),
            other => Err(format!("unknown fee priority: {}", other)),
        }
    }
}

/// A snapshot of recommended fee rates, stamped when it was fetched.
///
/// The timestamp uses `tokio::time::Instant` so staleness checks follow
/// virtual time under a paused test runtime.
#[derive(Debug, Clone)]
pub struct FeeSample {
    fetched_at: Instant,
    rates: BTreeMap<FeePriority, u64>,
}

impl FeeSample {
    pub fn new(rates: BTreeMap<FeePriority, u64>) -> Self {
        Self {
            fetched_at: Instant::now(),
            rates,
        }
    }

    /// Recommended rate for a tier in sat/vB.
    pub fn rate(&self, priority: FeePriority) -> Option<u64> {
        self.rates.get(&priority).copied()
    }

    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }

    /// A sample older than the staleness threshold is invalid for
    /// decision-making.
    pub fn is_stale(&self, threshold: Duration) -> bool {
        self.age() > threshold
    }

    pub fn rates(&self) -> &BTreeMap<FeePriority, u64> {
        &self.rates
    }
}

/// On-chain status of a tracked transaction id.
///
/// `NotFound` is a valid, meaningful result (the id is unknown to the data
/// source), distinct from a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationStatus {
    Unconfirmed,
    Confirmed { block_height: u32 },
    NotFound,
}

impl ConfirmationStatus {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, ConfirmationStatus::Confirmed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    pub previous_output: OutPoint,
    pub value: Amount,
    pub sequence: Sequence,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    pub script_pubkey: ScriptBuf,
    pub value: Amount,
}

/// An unsigned transaction in logical form, ready for the signing gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionDraft {
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub fee: Amount,
    /// Virtual size in vbytes.
    pub vsize: u64,
}

impl TransactionDraft {
    pub fn input_value(&self) -> Amount {
        self.inputs.iter().map(|i| i.value).sum()
    }

    pub fn output_value(&self) -> Amount {
        self.outputs.iter().map(|o| o.value).sum()
    }

    /// Checks the declared fee against the input/output balance.
    pub fn is_balanced(&self) -> bool {
        self.input_value()
            .checked_sub(self.output_value())
            .map(|diff| diff == self.fee)
            .unwrap_or(false)
    }

    pub fn fee_rate_sat_vb(&self) -> f64 {
        if self.vsize == 0 {
            return 0.0;
        }
        self.fee.to_sat() as f64 / self.vsize as f64
    }

    /// RBF-eligible iff at least one input has sequence below 0xFFFFFFFE.
    pub fn signals_rbf(&self) -> bool {
        self.inputs.iter().any(|i| i.sequence.is_rbf())
    }
}

/// A broadcast (or broadcast-candidate) transaction the engine tracks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoredTransaction {
    pub txid: Txid,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub fee: Amount,
    /// Virtual size in vbytes.
    pub vsize: u64,
}

impl MonitoredTransaction {
    pub fn from_draft(txid: Txid, draft: TransactionDraft) -> Self {
        Self {
            txid,
            inputs: draft.inputs,
            outputs: draft.outputs,
            fee: draft.fee,
            vsize: draft.vsize,
        }
    }

    pub fn input_value(&self) -> Amount {
        self.inputs.iter().map(|i| i.value).sum()
    }

    pub fn output_value(&self) -> Amount {
        self.outputs.iter().map(|o| o.value).sum()
    }

    pub fn fee_rate_sat_vb(&self) -> f64 {
        if self.vsize == 0 {
            return 0.0;
        }
        self.fee.to_sat() as f64 / self.vsize as f64
    }

    pub fn signals_rbf(&self) -> bool {
        self.inputs.iter().any(|i| i.sequence.is_rbf())
    }
}

/// Opaque signed transaction handed back by the signing gateway.
#[derive(Debug, Clone)]
pub struct SignedTransaction {
    pub txid: Txid,
    pub raw_tx: Vec<u8>,
}

/// Outcome of one policy evaluation. Produced fresh each polling cycle,
/// never persisted across cycles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplacementDecision {
    NoAction,
    FeeBump {
        /// Target rate in sat/vB.
        target_rate: u64,
    },
    Cancel {
        destination: ScriptBuf,
        /// Target rate in sat/vB.
        target_rate: u64,
    },
}

impl ReplacementDecision {
    pub fn is_no_action(&self) -> bool {
        matches!(self, ReplacementDecision::NoAction)
    }
}

/// Lifecycle state machine states. Exactly one transaction is active at any
/// time; Confirmed, Canceled and Failed are terminal and flow into
/// Terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Broadcasting,
    Monitoring,
    Replacing,
    Confirmed,
    Canceled,
    Failed,
    Terminated,
}

impl LifecycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LifecycleState::Confirmed
                | LifecycleState::Canceled
                | LifecycleState::Failed
                | LifecycleState::Terminated
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Created => "created",
            LifecycleState::Broadcasting => "broadcasting",
            LifecycleState::Monitoring => "monitoring",
            LifecycleState::Replacing => "replacing",
            LifecycleState::Confirmed => "confirmed",
            LifecycleState::Canceled => "canceled",
            LifecycleState::Failed => "failed",
            LifecycleState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Audit record for a transaction superseded by a replacement. Retained for
/// observability only, never re-monitored.
#[derive(Debug, Clone)]
pub struct SupersededTransaction {
    pub txid: Txid,
    pub fee: Amount,
    pub fee_rate_sat_vb: f64,
    pub replaced_by: Txid,
    /// Whether the transaction itself was a cancellation replacement.
    pub was_cancel: bool,
}

/// Point-in-time snapshot of one engine instance.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub state: LifecycleState,
    pub active_txid: Option<Txid>,
    pub replacement_count: u32,
    pub superseded: Vec<SupersededTransaction>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    fn dummy_outpoint() -> OutPoint {
        OutPoint::new(Txid::all_zeros(), 0)
    }

    #[test]
    fn rbf_signaling_requires_low_sequence() {
        let mut tx = MonitoredTransaction {
            txid: Txid::all_zeros(),
            inputs: vec![TxInput {
                previous_output: dummy_outpoint(),
                value: Amount::from_sat(10_000),
                sequence: Sequence(0xFFFFFFFF),
            }],
            outputs: vec![],
            fee: Amount::from_sat(10_000),
            vsize: 110,
        };
        assert!(!tx.signals_rbf());

        tx.inputs[0].sequence = Sequence(0xFFFFFFFD);
        assert!(tx.signals_rbf());
    }

    #[test]
    fn draft_balance_check() {
        let draft = TransactionDraft {
            inputs: vec![TxInput {
                previous_output: dummy_outpoint(),
                value: Amount::from_sat(100_000),
                sequence: Sequence(0xFFFFFFFD),
            }],
            outputs: vec![TxOutput {
                script_pubkey: ScriptBuf::new(),
                value: Amount::from_sat(99_000),
            }],
            fee: Amount::from_sat(1_000),
            vsize: 110,
        };
        assert!(draft.is_balanced());
        assert!((draft.fee_rate_sat_vb() - 1_000.0 / 110.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn fee_sample_staleness_follows_virtual_time() {
        let sample = FeeSample::new(BTreeMap::from([(FeePriority::Fastest, 20)]));
        assert!(!sample.is_stale(Duration::from_secs(120)));

        tokio::time::advance(Duration::from_secs(121)).await;
        assert!(sample.is_stale(Duration::from_secs(120)));
    }
}
