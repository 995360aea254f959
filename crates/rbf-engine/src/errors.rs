//! Error taxonomy for the replacement engine.
//!
//! Transient failures (data source, broadcast transport) are retried by the
//! orchestrator within bounded limits; structural failures (build, repeated
//! signing) drive the Failed terminal state.

use std::time::Duration;

use thiserror::Error;

/// Failure reaching the blockchain data provider. Always transient from the
/// engine's perspective; retry policy lives in the orchestrator.
#[derive(Debug, Clone, Error)]
pub enum DataSourceError {
    #[error("data source request timed out after {0:?}")]
    Timeout(Duration),
    #[error("data source transport error: {0}")]
    Transport(String),
}

/// Failure from the opaque signing service.
#[derive(Debug, Clone, Error)]
pub enum SigningError {
    #[error("signer rejected the transaction: {0}")]
    Rejected(String),
    #[error("signer transport error: {0}")]
    Transport(String),
    #[error("signer returned an incomplete signature set")]
    Incomplete,
}

/// Structural failure while constructing a replacement. Indicates the active
/// transaction or the decision cannot produce a valid replacement; never
/// retried with the same inputs.
#[derive(Debug, Clone, Error)]
pub enum BuildError {
    #[error("active transaction has no inputs")]
    NoInputs,
    #[error("insufficient funds: replacement needs {required} sat, inputs cover {available} sat")]
    InsufficientFunds { required: u64, available: u64 },
    #[error("no output remains above the dust threshold after paying the fee")]
    OutputBelowDust,
    #[error("fee calculation overflow")]
    FeeOverflow,
    #[error("decision carries no replacement to build")]
    NothingToBuild,
}

/// Failure broadcasting a signed transaction. `Rejected` is non-retryable
/// for the attempt (the network refused the transaction); transport failures
/// and timeouts are retried up to the configured limit.
#[derive(Debug, Clone, Error)]
pub enum BroadcastError {
    #[error("broadcast rejected by the network: {0}")]
    Rejected(String),
    #[error("broadcast transport error: {0}")]
    Transport(String),
    #[error("broadcast timed out after {0:?}")]
    Timeout(Duration),
}

impl BroadcastError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BroadcastError::Transport(_) | BroadcastError::Timeout(_)
        )
    }
}
