//! External gateway traits consumed by the engine.
//!
//! Key custody, transport and serialization live behind these seams; the
//! engine only sees logical fields and opaque signed bytes.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bitcoin::{ScriptBuf, Txid};

use crate::errors::{BroadcastError, DataSourceError, SigningError};
use crate::model::{ConfirmationStatus, FeePriority, SignedTransaction, TransactionDraft};

/// Blockchain data provider backing the fee oracle and transaction tracker.
#[async_trait]
pub trait BitcoinDataSource: Send + Sync {
    /// Current recommended fee rates per priority tier, in sat/vB.
    async fn fee_estimates(&self) -> Result<BTreeMap<FeePriority, u64>, DataSourceError>;

    /// On-chain status of a transaction id. `NotFound` is a valid result and
    /// must not be reported as a transport failure.
    async fn tx_status(&self, txid: Txid) -> Result<ConfirmationStatus, DataSourceError>;
}

/// Opaque signing service. The engine never inspects key material.
#[async_trait]
pub trait SigningGateway: Send + Sync {
    async fn sign(&self, draft: &TransactionDraft) -> Result<SignedTransaction, SigningError>;

    /// Script identifying the wallet's change output, used by the builder to
    /// decide which output absorbs a fee increase.
    fn change_script(&self) -> ScriptBuf;
}

/// Network submission gateway for signed transactions.
#[async_trait]
pub trait BroadcastGateway: Send + Sync {
    async fn broadcast(&self, tx: &SignedTransaction) -> Result<Txid, BroadcastError>;
}
