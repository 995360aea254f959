//! Confirmation tracking for the active transaction id.

use std::sync::Arc;
use std::time::Duration;

use bitcoin::Txid;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::errors::DataSourceError;
use crate::gateways::BitcoinDataSource;
use crate::model::ConfirmationStatus;

/// Polls the data source for the on-chain status of a transaction id.
///
/// `NotFound` is surfaced as a valid status, never as an error; it is the
/// expected outcome once a replaced transaction leaves the mempool in favor
/// of its replacement.
pub struct TransactionTracker {
    data_source: Arc<dyn BitcoinDataSource>,
    call_timeout: Duration,
    last_observed: RwLock<Option<(Txid, ConfirmationStatus)>>,
}

impl TransactionTracker {
    pub fn new(data_source: Arc<dyn BitcoinDataSource>, call_timeout: Duration) -> Self {
        Self {
            data_source,
            call_timeout,
            last_observed: RwLock::new(None),
        }
    }

    /// Fetches the current status of `txid`, bounded by the call timeout.
    pub async fn status(&self, txid: Txid) -> Result<ConfirmationStatus, DataSourceError> {
        let status = match timeout(self.call_timeout, self.data_source.tx_status(txid)).await {
            Err(_) => {
                warn!(%txid, timeout = ?self.call_timeout, "status request timed out");
                return Err(DataSourceError::Timeout(self.call_timeout));
            }
            Ok(Err(e)) => return Err(e),
            Ok(Ok(status)) => status,
        };

        debug!(%txid, ?status, "transaction status refreshed");
        *self.last_observed.write().await = Some((txid, status));
        Ok(status)
    }

    /// Last successfully observed (txid, status) pair, if any.
    pub async fn last_observed(&self) -> Option<(Txid, ConfirmationStatus)> {
        *self.last_observed.read().await
    }
}
