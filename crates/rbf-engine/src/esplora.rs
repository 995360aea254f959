//! Esplora-backed implementations of the data source and broadcast gateways.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::{Transaction, Txid};
use esplora_client::r#async::AsyncClient;
use tracing::{debug, warn};

use crate::errors::{BroadcastError, DataSourceError};
use crate::gateways::{BitcoinDataSource, BroadcastGateway};
use crate::model::{ConfirmationStatus, FeePriority, SignedTransaction};

/// Thin wrapper over an esplora HTTP API (mempool.space compatible),
/// implementing both the data source and the broadcast gateway.
#[derive(Clone)]
pub struct EsploraApi {
    client: Arc<AsyncClient>,
}

impl EsploraApi {
    /// `timeout_secs` bounds every request issued by the underlying client.
    pub fn new(base_url: &str, timeout_secs: u64) -> eyre::Result<Self> {
        let client = esplora_client::Builder::new(base_url)
            .timeout(timeout_secs)
            .build_async()
            .map_err(|e| eyre::eyre!("failed to build esplora client: {}", e))?;

        Ok(Self {
            client: Arc::new(client),
        })
    }
}

/// Projects esplora's confirmation-target -> sat/vB map onto a tier.
///
/// Falls back to the nearest estimate at a shorter target when the exact
/// target is absent, which over- rather than under-pays.
fn rate_for_target(estimates: &std::collections::HashMap<u16, f64>, target: u16) -> Option<u64> {
    let mut keys: Vec<u16> = estimates.keys().copied().collect();
    keys.sort_unstable();

    let chosen = keys
        .iter()
        .rev()
        .find(|&&k| k <= target)
        .or_else(|| keys.first())?;

    estimates
        .get(chosen)
        .map(|rate| (rate.max(1.0)).ceil() as u64)
}

#[async_trait]
impl BitcoinDataSource for EsploraApi {
    async fn fee_estimates(&self) -> Result<BTreeMap<FeePriority, u64>, DataSourceError> {
        let estimates = self
            .client
            .get_fee_estimates()
            .await
            .map_err(|e| DataSourceError::Transport(e.to_string()))?;

        if estimates.is_empty() {
            return Err(DataSourceError::Transport(
                "esplora returned empty fee estimates".into(),
            ));
        }

        let mut rates = BTreeMap::new();
        for priority in FeePriority::ALL {
            if let Some(rate) = rate_for_target(&estimates, priority.confirmation_target()) {
                rates.insert(priority, rate);
            }
        }

        debug!(?rates, "fetched fee estimates");
        Ok(rates)
    }

    async fn tx_status(&self, txid: Txid) -> Result<ConfirmationStatus, DataSourceError> {
        match self.client.get_tx_status(&txid).await {
            Ok(status) => {
                if status.confirmed {
                    Ok(ConfirmationStatus::Confirmed {
                        block_height: status.block_height.unwrap_or_default(),
                    })
                } else {
                    Ok(ConfirmationStatus::Unconfirmed)
                }
            }
            Err(esplora_client::Error::HttpResponse { status: 404, .. })
            | Err(esplora_client::Error::TransactionNotFound(_)) => {
                Ok(ConfirmationStatus::NotFound)
            }
            Err(e) => Err(DataSourceError::Transport(e.to_string())),
        }
    }
}

#[async_trait]
impl BroadcastGateway for EsploraApi {
    async fn broadcast(&self, tx: &SignedTransaction) -> Result<Txid, BroadcastError> {
        let decoded = deserialize_transaction(&tx.raw_tx)
            .map_err(|e| BroadcastError::Rejected(format!("undecodable transaction: {}", e)))?;

        match self.client.broadcast(&decoded).await {
            Ok(()) => Ok(tx.txid),
            Err(esplora_client::Error::HttpResponse { status, message })
                if (400..500).contains(&status) =>
            {
                warn!(status, %message, "broadcast rejected");
                Err(BroadcastError::Rejected(message))
            }
            Err(e) => Err(BroadcastError::Transport(e.to_string())),
        }
    }
}

pub fn deserialize_transaction(raw_tx: &[u8]) -> eyre::Result<Transaction> {
    use bitcoin::consensus::encode::Decodable;

    let tx = Transaction::consensus_decode(&mut &raw_tx[..])
        .map_err(|e| eyre::eyre!("failed to deserialize transaction: {}", e))?;

    Ok(tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn tier_lookup_prefers_exact_then_shorter_target() {
        let estimates = HashMap::from([(1u16, 52.3), (6u16, 30.0), (144u16, 2.1)]);

        assert_eq!(rate_for_target(&estimates, 1), Some(53));
        assert_eq!(rate_for_target(&estimates, 6), Some(30));
        // no exact 3-block estimate, use the 1-block one
        assert_eq!(rate_for_target(&estimates, 3), Some(53));
        assert_eq!(rate_for_target(&estimates, 144), Some(3));
        // 1008 absent, fall back to 144
        assert_eq!(rate_for_target(&estimates, 1008), Some(3));
    }

    #[test]
    fn tier_lookup_floors_at_one_sat_vb() {
        let estimates = HashMap::from([(144u16, 0.25)]);
        assert_eq!(rate_for_target(&estimates, 144), Some(1));
    }
}
