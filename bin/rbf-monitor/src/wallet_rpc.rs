//! Bitcoin Core wallet RPC signing gateway.
//!
//! The wallet holds the keys; the engine only ever sees the unsigned logical
//! fields going in and opaque signed bytes coming out.

use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::consensus::encode;
use bitcoin::transaction::Version;
use bitcoin::{ScriptBuf, Transaction, TxIn, TxOut, Witness};
use rbf_engine::errors::SigningError;
use rbf_engine::gateways::SigningGateway;
use rbf_engine::model::{SignedTransaction, TransactionDraft};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

pub struct CoreWalletSigner {
    http: reqwest::Client,
    url: String,
    user: String,
    password: String,
    change_script: ScriptBuf,
}

#[derive(Deserialize)]
struct RpcEnvelope<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct SignResult {
    hex: String,
    complete: bool,
}

impl CoreWalletSigner {
    pub fn new(url: String, user: String, password: String, change_script: ScriptBuf) -> Self {
        Self {
            http: reqwest::Client::new(),
            url,
            user,
            password,
            change_script,
        }
    }

    async fn call<T: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, SigningError> {
        let body = json!({
            "jsonrpc": "1.0",
            "id": "rbf-monitor",
            "method": method,
            "params": params,
        });

        let response = self
            .http
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| SigningError::Transport(e.to_string()))?;

        let envelope: RpcEnvelope<T> = response
            .json()
            .await
            .map_err(|e| SigningError::Transport(e.to_string()))?;

        if let Some(error) = envelope.error {
            return Err(SigningError::Rejected(format!(
                "rpc error {}: {}",
                error.code, error.message
            )));
        }
        envelope
            .result
            .ok_or_else(|| SigningError::Transport("rpc response carried no result".into()))
    }
}

fn to_unsigned_transaction(draft: &TransactionDraft) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: draft
            .inputs
            .iter()
            .map(|i| TxIn {
                previous_output: i.previous_output,
                script_sig: ScriptBuf::new(),
                sequence: i.sequence,
                witness: Witness::new(),
            })
            .collect(),
        output: draft
            .outputs
            .iter()
            .map(|o| TxOut {
                value: o.value,
                script_pubkey: o.script_pubkey.clone(),
            })
            .collect(),
    }
}

#[async_trait]
impl SigningGateway for CoreWalletSigner {
    async fn sign(&self, draft: &TransactionDraft) -> Result<SignedTransaction, SigningError> {
        let unsigned_hex = encode::serialize_hex(&to_unsigned_transaction(draft));

        let signed: SignResult = self
            .call("signrawtransactionwithwallet", json!([unsigned_hex]))
            .await?;
        if !signed.complete {
            return Err(SigningError::Incomplete);
        }

        let raw_tx = hex::decode(&signed.hex)
            .map_err(|e| SigningError::Transport(format!("undecodable signed hex: {e}")))?;
        let tx: Transaction = encode::deserialize(&raw_tx)
            .map_err(|e| SigningError::Transport(format!("undecodable signed transaction: {e}")))?;

        let txid = tx.compute_txid();
        debug!(%txid, "wallet signed transaction");
        Ok(SignedTransaction { txid, raw_tx })
    }

    fn change_script(&self) -> ScriptBuf {
        self.change_script.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::{Amount, OutPoint, Sequence, Txid};
    use rbf_engine::model::{TxInput, TxOutput};

    #[test]
    fn unsigned_transaction_preserves_logical_fields() {
        let draft = TransactionDraft {
            inputs: vec![TxInput {
                previous_output: OutPoint::new(Txid::all_zeros(), 3),
                value: Amount::from_sat(100_000),
                sequence: Sequence(0xFFFFFFFD),
            }],
            outputs: vec![TxOutput {
                script_pubkey: ScriptBuf::from_bytes(vec![0x00, 0x14, 0xAA]),
                value: Amount::from_sat(99_000),
            }],
            fee: Amount::from_sat(1_000),
            vsize: 110,
        };

        let tx = to_unsigned_transaction(&draft);
        assert_eq!(tx.input.len(), 1);
        assert_eq!(tx.input[0].previous_output.vout, 3);
        assert_eq!(tx.input[0].sequence, Sequence(0xFFFFFFFD));
        assert_eq!(tx.output[0].value, Amount::from_sat(99_000));
    }
}
