//! Append-only event stream for engine observability.
//!
//! Every state transition, decision and error is recorded; subscribers get
//! a replay of everything recorded so far plus a live feed, so observation
//! is restartable.

use bitcoin::{Amount, Txid};
use tokio::sync::broadcast;

use crate::model::{LifecycleState, ReplacementDecision};

#[derive(Debug, Clone)]
pub enum EngineEvent {
    StateChanged {
        from: LifecycleState,
        to: LifecycleState,
    },
    InitialBroadcast {
        txid: Txid,
    },
    DecisionMade {
        txid: Txid,
        decision: ReplacementDecision,
    },
    ReplacementBroadcast {
        replaced: Txid,
        txid: Txid,
        fee: Amount,
        fee_rate_sat_vb: f64,
    },
    BroadcastRejected {
        txid: Txid,
        reason: String,
    },
    /// The tracked id disappeared from the data source with no prior
    /// replacement to explain it.
    TrackedTransactionMissing {
        txid: Txid,
    },
    ErrorOccurred {
        state: LifecycleState,
        context: String,
    },
}

pub struct EventLog {
    entries: std::sync::Mutex<Vec<EngineEvent>>,
    sender: broadcast::Sender<EngineEvent>,
}

impl EventLog {
    pub fn new(live_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(live_capacity);
        Self {
            entries: std::sync::Mutex::new(Vec::new()),
            sender,
        }
    }

    pub fn publish(&self, event: EngineEvent) {
        self.entries
            .lock()
            .expect("event log mutex poisoned")
            .push(event.clone());
        // No live subscribers is fine; the log still records everything.
        let _ = self.sender.send(event);
    }

    /// Replay of the log so far plus a live subscription for what follows.
    pub fn subscribe(&self) -> (Vec<EngineEvent>, broadcast::Receiver<EngineEvent>) {
        let entries = self.entries.lock().expect("event log mutex poisoned");
        (entries.clone(), self.sender.subscribe())
    }
}
