//! Scripted gateway implementations for driving the engine in tests.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bitcoin::hashes::Hash;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Txid};
use rbf_engine::errors::{BroadcastError, DataSourceError, SigningError};
use rbf_engine::gateways::{BitcoinDataSource, BroadcastGateway, SigningGateway};
use rbf_engine::model::{
    ConfirmationStatus, FeePriority, SignedTransaction, TransactionDraft, TxInput, TxOutput,
};

pub fn test_txid(n: u8) -> Txid {
    Txid::from_byte_array([n; 32])
}

pub fn recipient_script() -> ScriptBuf {
    ScriptBuf::from_bytes(vec![0x00, 0x14, 0xBB])
}

pub fn change_script() -> ScriptBuf {
    ScriptBuf::from_bytes(vec![0x00, 0x14, 0xCC])
}

pub fn cancel_script() -> ScriptBuf {
    ScriptBuf::from_bytes(vec![0x00, 0x14, 0xDD])
}

/// A balanced, RBF-signaling payment with a change output: 100k sat in,
/// 50k to the recipient, 400 sat fee over 141 vB (~2.8 sat/vB).
pub fn payment_draft() -> TransactionDraft {
    TransactionDraft {
        inputs: vec![TxInput {
            previous_output: OutPoint::new(test_txid(0xF0), 0),
            value: Amount::from_sat(100_000),
            sequence: Sequence(0xFFFFFFFD),
        }],
        outputs: vec![
            TxOutput {
                script_pubkey: recipient_script(),
                value: Amount::from_sat(50_000),
            },
            TxOutput {
                script_pubkey: change_script(),
                value: Amount::from_sat(49_600),
            },
        ],
        fee: Amount::from_sat(400),
        vsize: 141,
    }
}

/// Data source with a settable fee table and per-txid status scripts. Each
/// status lookup pops the next scripted entry; the last entry repeats.
/// Unscripted txids report Unconfirmed.
pub struct MockDataSource {
    rates: Mutex<BTreeMap<FeePriority, u64>>,
    statuses: Mutex<HashMap<Txid, VecDeque<ConfirmationStatus>>>,
    fail_status: AtomicUsize,
}

impl MockDataSource {
    pub fn new(fastest: u64) -> Self {
        Self {
            rates: Mutex::new(BTreeMap::from([(FeePriority::Fastest, fastest)])),
            statuses: Mutex::new(HashMap::new()),
            fail_status: AtomicUsize::new(0),
        }
    }

    pub fn set_rate(&self, priority: FeePriority, rate: u64) {
        self.rates.lock().unwrap().insert(priority, rate);
    }

    pub fn script_statuses(&self, txid: Txid, statuses: &[ConfirmationStatus]) {
        self.statuses
            .lock()
            .unwrap()
            .insert(txid, statuses.iter().copied().collect());
    }

    /// Makes the next `n` status lookups fail with a transport error.
    pub fn fail_status_next(&self, n: usize) {
        self.fail_status.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl BitcoinDataSource for MockDataSource {
    async fn fee_estimates(&self) -> Result<BTreeMap<FeePriority, u64>, DataSourceError> {
        Ok(self.rates.lock().unwrap().clone())
    }

    async fn tx_status(&self, txid: Txid) -> Result<ConfirmationStatus, DataSourceError> {
        let remaining = self.fail_status.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_status.store(remaining - 1, Ordering::SeqCst);
            return Err(DataSourceError::Transport("data source unreachable".into()));
        }

        let mut statuses = self.statuses.lock().unwrap();
        match statuses.get_mut(&txid) {
            Some(queue) if queue.len() > 1 => Ok(queue.pop_front().unwrap()),
            Some(queue) => Ok(*queue.front().unwrap()),
            None => Ok(ConfirmationStatus::Unconfirmed),
        }
    }
}

/// Signer handing out deterministic txids: the nth signed transaction gets
/// `test_txid(n)`.
pub struct MockSigner {
    counter: AtomicUsize,
    fail_next: AtomicUsize,
}

impl MockSigner {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
            fail_next: AtomicUsize::new(0),
        }
    }

    /// Makes the next `n` sign calls fail with a transport error.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl SigningGateway for MockSigner {
    async fn sign(&self, _draft: &TransactionDraft) -> Result<SignedTransaction, SigningError> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(SigningError::Transport("signer unreachable".into()));
        }

        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SignedTransaction {
            txid: test_txid(n as u8),
            raw_tx: vec![n as u8],
        })
    }

    fn change_script(&self) -> ScriptBuf {
        change_script()
    }
}

/// Broadcaster recording everything submitted; individual attempts can be
/// scripted to fail.
pub struct MockBroadcaster {
    broadcasts: Mutex<Vec<Txid>>,
    attempts: AtomicUsize,
    reject_at: Mutex<HashSet<usize>>,
}

impl MockBroadcaster {
    pub fn new() -> Self {
        Self {
            broadcasts: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            reject_at: Mutex::new(HashSet::new()),
        }
    }

    /// Rejects the nth broadcast attempt (1-based).
    pub fn reject_attempt(&self, n: usize) {
        self.reject_at.lock().unwrap().insert(n);
    }

    pub fn broadcasts(&self) -> Vec<Txid> {
        self.broadcasts.lock().unwrap().clone()
    }
}

#[async_trait]
impl BroadcastGateway for MockBroadcaster {
    async fn broadcast(&self, tx: &SignedTransaction) -> Result<Txid, BroadcastError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.reject_at.lock().unwrap().contains(&attempt) {
            return Err(BroadcastError::Rejected("insufficient fee".into()));
        }
        self.broadcasts.lock().unwrap().push(tx.txid);
        Ok(tx.txid)
    }
}
