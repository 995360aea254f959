pub mod wallet_rpc;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::{Address, Amount, Network, OutPoint, ScriptBuf, Sequence, Txid};
use clap::Parser;
use eyre::{eyre, Result};
use rbf_engine::{
    EngineConfig, FeePriority, LifecycleOrchestrator, TransactionDraft, TxInput, TxOutput,
};
use rbf_engine::esplora::EsploraApi;
use tokio::task::JoinSet;
use tracing::info;

use wallet_rpc::CoreWalletSigner;

/// Estimated vbytes for P2WPKH components, used only to size the initial
/// transaction. Replacements are sized by the engine.
const TX_BASE_VB: u64 = 10;
const INPUT_VB: u64 = 68;
const OUTPUT_VB: u64 = 31;

/// One wallet UTXO in `txid:vout:value_sat` form.
#[derive(Debug, Clone)]
pub struct UtxoArg {
    pub outpoint: OutPoint,
    pub value: Amount,
}

impl FromStr for UtxoArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let txid = parts.next().ok_or("missing txid")?;
        let vout = parts.next().ok_or("missing vout")?;
        let value = parts.next().ok_or("missing value_sat")?;

        Ok(UtxoArg {
            outpoint: OutPoint::new(
                Txid::from_str(txid).map_err(|e| format!("bad txid: {e}"))?,
                vout.parse().map_err(|e| format!("bad vout: {e}"))?,
            ),
            value: Amount::from_sat(value.parse().map_err(|e| format!("bad value_sat: {e}"))?),
        })
    }
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct MonitorArgs {
    /// Esplora HTTP API base URL (mempool.space compatible)
    #[arg(long, env)]
    pub esplora_url: String,

    /// Bitcoin Core wallet RPC URL (http://host:port/wallet/<name>)
    #[arg(long, env)]
    pub wallet_rpc_url: String,

    /// Bitcoin Core RPC username
    #[arg(long, env)]
    pub wallet_rpc_user: String,

    /// Bitcoin Core RPC password
    #[arg(long, env)]
    pub wallet_rpc_password: String,

    /// Network the addresses belong to
    #[arg(long, env, default_value = "bitcoin")]
    pub network: Network,

    /// Wallet UTXO to spend, txid:vout:value_sat (repeatable)
    #[arg(long = "input", required = true)]
    pub inputs: Vec<UtxoArg>,

    /// Recipient address
    #[arg(long, env)]
    pub recipient: String,

    /// Amount to send, in satoshis
    #[arg(long, env)]
    pub amount_sat: u64,

    /// Change address; the change output absorbs fee increases on
    /// replacements
    #[arg(long, env)]
    pub change_address: String,

    /// Destination for a cancellation triggered by the first Ctrl-C. When
    /// absent, Ctrl-C stops monitoring without cancelling the payment.
    #[arg(long, env)]
    pub cancel_address: Option<String>,

    /// Fee rate of the initial broadcast, in sat/vB
    #[arg(long, env, default_value = "2")]
    pub initial_fee_rate: u64,

    /// Seconds between monitoring cycles
    #[arg(long, env, default_value = "30")]
    pub polling_interval_secs: u64,

    /// Safety cap on replacements per lifecycle
    #[arg(long, env, default_value = "5")]
    pub max_replacements: u32,

    /// Fee tier targeted for bumps (fastest, half-hour, hour, economy, minimum)
    #[arg(long, env, value_parser = FeePriority::from_str, default_value = "fastest")]
    pub target_priority: FeePriority,

    /// Percentage buffer applied on top of the observed tier rate
    #[arg(long, env, default_value = "10")]
    pub fee_buffer_percent: u8,

    /// Hard cap on any target fee rate, in sat/vB
    #[arg(long, env, default_value = "100")]
    pub max_fee_rate: u64,
}

impl MonitorArgs {
    pub async fn run(&self) -> Result<()> {
        let config = EngineConfig {
            polling_interval: Duration::from_secs(self.polling_interval_secs),
            max_replacements: self.max_replacements,
            target_priority: self.target_priority,
            fee_buffer_percent: self.fee_buffer_percent,
            max_fee_rate: self.max_fee_rate,
            ..Default::default()
        };

        let recipient_script = self.parse_address(&self.recipient)?;
        let change_script = self.parse_address(&self.change_address)?;
        let cancel_script = self
            .cancel_address
            .as_deref()
            .map(|addr| self.parse_address(addr))
            .transpose()?;

        let draft = self.initial_draft(&config, recipient_script, &change_script)?;
        info!(
            fee = draft.fee.to_sat(),
            vsize = draft.vsize,
            "initial transaction assembled"
        );

        let esplora = Arc::new(EsploraApi::new(
            &self.esplora_url,
            config.data_source_timeout.as_secs(),
        )?);
        let signer = Arc::new(CoreWalletSigner::new(
            self.wallet_rpc_url.clone(),
            self.wallet_rpc_user.clone(),
            self.wallet_rpc_password.clone(),
            change_script,
        ));

        let orchestrator = Arc::new(LifecycleOrchestrator::new(
            config,
            esplora.clone(),
            signer,
            esplora,
        )?);

        spawn_signal_handler(orchestrator.clone(), cancel_script);

        let mut join_set = JoinSet::new();
        orchestrator.clone().spawn_in_set(draft, &mut join_set);
        while let Some(result) = join_set.join_next().await {
            result??;
        }

        let status = orchestrator.status();
        info!(
            state = %status.state,
            replacements = status.replacement_count,
            "lifecycle finished"
        );
        Ok(())
    }

    fn parse_address(&self, addr: &str) -> Result<ScriptBuf> {
        Ok(Address::from_str(addr)
            .map_err(|e| eyre!("invalid address {addr}: {e}"))?
            .require_network(self.network)
            .map_err(|e| eyre!("address {addr} is not valid for {}: {e}", self.network))?
            .script_pubkey())
    }

    /// Assembles the initial payment at the requested fee rate. Change below
    /// the dust threshold is folded into the fee.
    fn initial_draft(
        &self,
        config: &EngineConfig,
        recipient_script: ScriptBuf,
        change_script: &ScriptBuf,
    ) -> Result<TransactionDraft> {
        let inputs: Vec<TxInput> = self
            .inputs
            .iter()
            .map(|u| TxInput {
                previous_output: u.outpoint,
                value: u.value,
                sequence: Sequence(0xFFFFFFFD), // signal RBF
            })
            .collect();

        let total_in: Amount = inputs.iter().map(|i| i.value).sum();
        let amount = Amount::from_sat(self.amount_sat);

        let vsize_with_change = TX_BASE_VB + INPUT_VB * inputs.len() as u64 + 2 * OUTPUT_VB;
        let fee = Amount::from_sat(self.initial_fee_rate * vsize_with_change);

        let required = amount
            .checked_add(fee)
            .ok_or_else(|| eyre!("amount + fee overflows"))?;
        let change = total_in
            .checked_sub(required)
            .ok_or_else(|| eyre!("inputs cover {total_in} but {required} is needed"))?;

        let mut outputs = vec![TxOutput {
            script_pubkey: recipient_script,
            value: amount,
        }];

        if change >= config.dust_threshold {
            outputs.push(TxOutput {
                script_pubkey: change_script.clone(),
                value: change,
            });
            Ok(TransactionDraft {
                inputs,
                outputs,
                fee,
                vsize: vsize_with_change,
            })
        } else {
            Ok(TransactionDraft {
                inputs,
                outputs,
                fee: fee + change,
                vsize: vsize_with_change - OUTPUT_VB,
            })
        }
    }
}

/// First Ctrl-C requests cancellation (when a cancel address was given);
/// the next one stops monitoring.
fn spawn_signal_handler(orchestrator: Arc<LifecycleOrchestrator>, cancel_script: Option<ScriptBuf>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        match cancel_script {
            Some(script) => {
                orchestrator.request_cancellation(script);
                info!("cancellation requested; press Ctrl-C again to stop monitoring");
                if tokio::signal::ctrl_c().await.is_ok() {
                    orchestrator.shutdown_token().cancel();
                }
            }
            None => orchestrator.shutdown_token().cancel(),
        }
    });
}
