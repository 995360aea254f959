//! Fee oracle: periodic sampling of recommended network fee rates.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::errors::DataSourceError;
use crate::gateways::BitcoinDataSource;
use crate::model::FeeSample;

/// Samples the data source on demand and retains the latest successful
/// sample. On failure the previous sample is kept with its original
/// timestamp, so its staleness keeps increasing. No internal retries;
/// retry policy belongs to the orchestrator.
pub struct FeeOracle {
    data_source: Arc<dyn BitcoinDataSource>,
    call_timeout: Duration,
    latest: RwLock<Option<FeeSample>>,
}

impl FeeOracle {
    pub fn new(data_source: Arc<dyn BitcoinDataSource>, call_timeout: Duration) -> Self {
        Self {
            data_source,
            call_timeout,
            latest: RwLock::new(None),
        }
    }

    /// Fetches a fresh sample, bounded by the call timeout.
    pub async fn sample(&self) -> Result<FeeSample, DataSourceError> {
        let rates = match timeout(self.call_timeout, self.data_source.fee_estimates()).await {
            Err(_) => {
                warn!(timeout = ?self.call_timeout, "fee estimate request timed out");
                return Err(DataSourceError::Timeout(self.call_timeout));
            }
            Ok(Err(e)) => return Err(e),
            Ok(Ok(rates)) => rates,
        };

        let sample = FeeSample::new(rates);
        debug!(rates = ?sample.rates(), "fee sample updated");
        *self.latest.write().await = Some(sample.clone());
        Ok(sample)
    }

    /// Most recent successful sample, if any. May be stale.
    pub async fn latest(&self) -> Option<FeeSample> {
        self.latest.read().await.clone()
    }
}
