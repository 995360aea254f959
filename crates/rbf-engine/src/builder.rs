//! Replacement builder: constructs the logical fields of a BIP125-valid
//! replacement for the active transaction.

use bitcoin::{Amount, FeeRate, ScriptBuf, Sequence};
use tracing::debug;

use crate::errors::BuildError;
use crate::model::{MonitoredTransaction, ReplacementDecision, TransactionDraft, TxInput, TxOutput};

/// Weight constants for P2WPKH, in vbytes (see BIP-141).
const CHANGE_OUTPUT_VB: u64 = 31;
const INPUT_VB: u64 = 68;
const TX_BASE_VB: u64 = 10;

#[derive(Debug, Clone)]
pub struct BuilderConfig {
    pub dust_threshold: Amount,
    pub min_relay_fee_rate: u64,
}

pub struct ReplacementBuilder {
    config: BuilderConfig,
}

impl ReplacementBuilder {
    pub fn new(config: BuilderConfig) -> Self {
        Self { config }
    }

    /// Builds the replacement described by `decision`. The input set is
    /// always identical to the active transaction's, with every sequence
    /// number forced below 0xFFFFFFFE so the replacement itself stays
    /// replaceable.
    pub fn build(
        &self,
        active: &MonitoredTransaction,
        decision: &ReplacementDecision,
        change_script: &ScriptBuf,
    ) -> Result<TransactionDraft, BuildError> {
        if active.inputs.is_empty() {
            return Err(BuildError::NoInputs);
        }

        match decision {
            ReplacementDecision::NoAction => Err(BuildError::NothingToBuild),
            ReplacementDecision::FeeBump { target_rate } => {
                self.build_fee_bump(active, *target_rate, change_script)
            }
            ReplacementDecision::Cancel {
                destination,
                target_rate,
            } => self.build_cancel(active, destination, *target_rate),
        }
    }

    fn build_fee_bump(
        &self,
        active: &MonitoredTransaction,
        target_rate: u64,
        change_script: &ScriptBuf,
    ) -> Result<TransactionDraft, BuildError> {
        let total_in = active.input_value();

        // Preserve every non-change output; the change output absorbs the
        // fee increase.
        let kept: Vec<TxOutput> = active
            .outputs
            .iter()
            .filter(|o| &o.script_pubkey != change_script)
            .cloned()
            .collect();
        let kept_value: Amount = kept.iter().map(|o| o.value).sum();
        let had_change = kept.len() != active.outputs.len();

        let vsize_no_change = if had_change {
            active.vsize.saturating_sub(CHANGE_OUTPUT_VB)
        } else {
            active.vsize
        };
        let vsize_with_change = vsize_no_change + CHANGE_OUTPUT_VB;

        let fee_with_change = self.min_viable_fee(active, target_rate, vsize_with_change)?;
        let required = kept_value
            .checked_add(fee_with_change)
            .ok_or(BuildError::FeeOverflow)?;

        if let Some(remainder) = total_in.checked_sub(required) {
            if remainder >= self.config.dust_threshold {
                let mut outputs = kept;
                outputs.push(TxOutput {
                    script_pubkey: change_script.clone(),
                    value: remainder,
                });

                debug!(
                    fee = fee_with_change.to_sat(),
                    change = remainder.to_sat(),
                    "built fee bump with change output"
                );

                return Ok(TransactionDraft {
                    inputs: rbf_inputs(active),
                    outputs,
                    fee: fee_with_change,
                    vsize: vsize_with_change,
                });
            }
        }

        // Change would fall below dust (or is already exhausted): drop it
        // and fold the remaining value into the fee, never losing it.
        let fee_no_change = total_in
            .checked_sub(kept_value)
            .ok_or(BuildError::InsufficientFunds {
                required: required.to_sat(),
                available: total_in.to_sat(),
            })?;

        let min_fee = self.min_viable_fee(active, target_rate, vsize_no_change)?;
        if fee_no_change < min_fee {
            return Err(BuildError::InsufficientFunds {
                required: kept_value.to_sat() + min_fee.to_sat(),
                available: total_in.to_sat(),
            });
        }

        if kept.is_empty() {
            // Every output was change; a transaction with no outputs cannot
            // exist, and the value cannot be reduced further.
            return Err(BuildError::OutputBelowDust);
        }

        debug!(
            fee = fee_no_change.to_sat(),
            "built fee bump, change folded into fee"
        );

        Ok(TransactionDraft {
            inputs: rbf_inputs(active),
            outputs: kept,
            fee: fee_no_change,
            vsize: vsize_no_change,
        })
    }

    fn build_cancel(
        &self,
        active: &MonitoredTransaction,
        destination: &ScriptBuf,
        target_rate: u64,
    ) -> Result<TransactionDraft, BuildError> {
        let total_in = active.input_value();

        // Single output redirecting the full input value minus the fee.
        let vsize = TX_BASE_VB + INPUT_VB * active.inputs.len() as u64 + CHANGE_OUTPUT_VB;
        let fee = self.min_viable_fee(active, target_rate, vsize)?;

        let value = total_in
            .checked_sub(fee)
            .ok_or(BuildError::InsufficientFunds {
                required: fee.to_sat(),
                available: total_in.to_sat(),
            })?;

        if value <= self.config.dust_threshold {
            return Err(BuildError::OutputBelowDust);
        }

        debug!(
            fee = fee.to_sat(),
            value = value.to_sat(),
            "built cancellation transaction"
        );

        Ok(TransactionDraft {
            inputs: rbf_inputs(active),
            outputs: vec![TxOutput {
                script_pubkey: destination.clone(),
                value,
            }],
            fee,
            vsize,
        })
    }

    /// Minimum fee satisfying BIP125 rules 3 and 4 at the replacement's
    /// size: the target rate, the old absolute fee plus the relay increment,
    /// and the old fee rate, whichever demands more.
    fn min_viable_fee(
        &self,
        active: &MonitoredTransaction,
        target_rate: u64,
        vsize: u64,
    ) -> Result<Amount, BuildError> {
        let target_fee = FeeRate::from_sat_per_vb(target_rate)
            .ok_or(BuildError::FeeOverflow)?
            .fee_vb(vsize)
            .ok_or(BuildError::FeeOverflow)?;

        let bandwidth_fee = FeeRate::from_sat_per_vb(self.config.min_relay_fee_rate)
            .ok_or(BuildError::FeeOverflow)?
            .fee_vb(vsize)
            .ok_or(BuildError::FeeOverflow)?;

        let bip125_min = active
            .fee
            .checked_add(bandwidth_fee)
            .ok_or(BuildError::FeeOverflow)?;

        let old_rate_floor =
            Amount::from_sat((active.fee_rate_sat_vb() * vsize as f64).ceil() as u64);

        Ok(target_fee.max(bip125_min).max(old_rate_floor))
    }
}

fn rbf_inputs(active: &MonitoredTransaction) -> Vec<TxInput> {
    active
        .inputs
        .iter()
        .map(|i| TxInput {
            previous_output: i.previous_output,
            value: i.value,
            sequence: Sequence(0xFFFFFFFD), // signal RBF
        })
        .collect()
}
