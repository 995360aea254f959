pub mod builder;
pub mod config;
pub mod errors;
pub mod esplora;
pub mod events;
pub mod fee_oracle;
pub mod gateways;
pub mod model;
pub mod orchestrator;
pub mod policy;
pub mod tracker;

pub use builder::{BuilderConfig, ReplacementBuilder};
pub use config::EngineConfig;
pub use errors::{BroadcastError, BuildError, DataSourceError, SigningError};
pub use events::{EngineEvent, EventLog};
pub use fee_oracle::FeeOracle;
pub use gateways::{BitcoinDataSource, BroadcastGateway, SigningGateway};
pub use model::{
    ConfirmationStatus, EngineStatus, FeePriority, FeeSample, LifecycleState,
    MonitoredTransaction, ReplacementDecision, SignedTransaction, SupersededTransaction,
    TransactionDraft, TxInput, TxOutput,
};
pub use orchestrator::LifecycleOrchestrator;
pub use policy::{PolicyConfig, PolicySnapshot, ReplacementPolicy};
pub use tracker::TransactionTracker;
