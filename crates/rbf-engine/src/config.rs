//! Engine configuration.

use std::time::Duration;

use bitcoin::Amount;

use crate::model::FeePriority;

/// Configuration recognized by one orchestrator instance. Injected at
/// construction; instances never share configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Cadence of the monitoring loop.
    pub polling_interval: Duration,
    /// Fee samples older than this are invalid for decision-making.
    pub staleness_threshold: Duration,
    /// Safety cap on successful replacements per lifecycle.
    pub max_replacements: u32,
    /// Minimum relay fee rate in sat/vB (BIP125 rule 4 increment).
    pub min_relay_fee_rate: u64,
    /// Outputs below this value are folded into the fee, never emitted.
    pub dust_threshold: Amount,
    /// Maximum broadcast attempts per replacement for transient failures.
    pub broadcast_retry_limit: u32,
    /// Timeout bounding each broadcast call.
    pub broadcast_timeout: Duration,
    /// Timeout bounding each fee/status polling call.
    pub data_source_timeout: Duration,
    /// Consecutive signing failures tolerated before transitioning to Failed.
    pub signing_failure_limit: u32,
    /// Fee tier targeted for fee bumps.
    pub target_priority: FeePriority,
    /// Percentage buffer applied on top of the observed tier rate.
    pub fee_buffer_percent: u8,
    /// Hard cap on any target fee rate, in sat/vB.
    pub max_fee_rate: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_secs(30),
            staleness_threshold: Duration::from_secs(120),
            max_replacements: 5,
            min_relay_fee_rate: 1,
            dust_threshold: Amount::from_sat(546),
            broadcast_retry_limit: 3,
            broadcast_timeout: Duration::from_secs(30),
            data_source_timeout: Duration::from_secs(10),
            signing_failure_limit: 3,
            target_priority: FeePriority::Fastest,
            fee_buffer_percent: 10,
            max_fee_rate: 100,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> eyre::Result<()> {
        if self.polling_interval < Duration::from_secs(1) {
            return Err(eyre::eyre!("polling_interval must be at least 1 second"));
        }

        if self.staleness_threshold < self.polling_interval {
            return Err(eyre::eyre!(
                "staleness_threshold ({:?}) must not be shorter than polling_interval ({:?})",
                self.staleness_threshold,
                self.polling_interval
            ));
        }

        if self.max_replacements == 0 {
            return Err(eyre::eyre!("max_replacements must be > 0"));
        }

        if self.min_relay_fee_rate == 0 {
            return Err(eyre::eyre!("min_relay_fee_rate must be greater than 0"));
        }

        if self.fee_buffer_percent > 100 {
            return Err(eyre::eyre!(
                "fee_buffer_percent: {} (must be <= 100)",
                self.fee_buffer_percent
            ));
        }

        if self.max_fee_rate < self.min_relay_fee_rate {
            return Err(eyre::eyre!(
                "max_fee_rate ({}) must be >= min_relay_fee_rate ({})",
                self.max_fee_rate,
                self.min_relay_fee_rate
            ));
        }

        if self.broadcast_retry_limit == 0 {
            return Err(eyre::eyre!("broadcast_retry_limit must be > 0"));
        }

        if self.signing_failure_limit == 0 {
            return Err(eyre::eyre!("signing_failure_limit must be > 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_relay_rate_rejected() {
        let config = EngineConfig {
            min_relay_fee_rate: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn staleness_shorter_than_polling_rejected() {
        let config = EngineConfig {
            polling_interval: Duration::from_secs(60),
            staleness_threshold: Duration::from_secs(30),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
