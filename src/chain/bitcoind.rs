use super::{Broadcaster, ChainOracle, UtxoInfo};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bitcoin::consensus::encode::{deserialize_hex, serialize_hex};
use bitcoin::{Amount, Block, OutPoint, ScriptBuf, Transaction, TxOut, Txid};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

/// bitcoind error code for unknown transactions and blocks.
const RPC_INVALID_ADDRESS_OR_KEY: i64 = -5;
/// bitcoind error code for a block height out of range.
const RPC_INVALID_PARAMETER: i64 = -8;

/// Chain oracle and broadcaster backed by bitcoind's JSON-RPC interface.
pub struct BitcoindClient {
    url: String,
    auth: Option<(String, String)>,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcError>,
}

#[derive(Deserialize, Debug)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct TxOutResult {
    confirmations: u32,
    value: f64,
    #[serde(rename = "scriptPubKey")]
    script_pubkey: ScriptPubKey,
    coinbase: bool,
}

#[derive(Deserialize)]
struct ScriptPubKey {
    hex: String,
}

#[derive(Deserialize)]
struct FeeEstimate {
    feerate: Option<f64>,
    #[serde(default)]
    errors: Vec<String>,
}

#[derive(Deserialize)]
struct RawTransactionInfo {
    #[serde(default)]
    confirmations: u32,
}

enum CallError {
    Rpc(RpcError),
    Transport(anyhow::Error),
}

impl BitcoindClient {
    pub fn new(url: impl Into<String>, auth: Option<(String, String)>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { url: url.into(), auth, http })
    }

    async fn call_raw(&self, method: &str, params: Value) -> std::result::Result<Value, CallError> {
        let body = json!({
            "jsonrpc": "1.0",
            "id": "coordinator",
            "method": method,
            "params": params,
        });
        let mut req = self.http.post(&self.url).json(&body);
        if let Some((user, pass)) = &self.auth {
            req = req.basic_auth(user, Some(pass));
        }

        let resp = req.send().await.map_err(|e| CallError::Transport(e.into()))?;
        let status = resp.status();
        let resp: RpcResponse = resp
            .json()
            .await
            .map_err(|e| CallError::Transport(anyhow!("{} returned {}: {}", method, status, e)))?;

        if let Some(err) = resp.error {
            return Err(CallError::Rpc(err));
        }
        Ok(resp.result.unwrap_or(Value::Null))
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let value = match self.call_raw(method, params).await {
            Ok(v) => v,
            Err(CallError::Rpc(e)) => bail!("{} failed ({}): {}", method, e.code, e.message),
            Err(CallError::Transport(e)) => return Err(e),
        };
        serde_json::from_value(value).with_context(|| format!("decoding {} result", method))
    }
}

#[async_trait]
impl ChainOracle for BitcoindClient {
    async fn get_utxo(&self, outpoint: &OutPoint) -> Result<Option<UtxoInfo>> {
        let result: Option<TxOutResult> = self
            .call("gettxout", json!([outpoint.txid.to_string(), outpoint.vout, true]))
            .await?;
        let Some(out) = result else {
            return Ok(None);
        };
        let script_pubkey = ScriptBuf::from_hex(&out.script_pubkey.hex)?;
        Ok(Some(UtxoInfo {
            txout: TxOut { value: Amount::from_btc(out.value)?, script_pubkey },
            confirmations: out.confirmations,
            is_coinbase: out.coinbase,
        }))
    }

    async fn estimate_fee_rate(&self, target: u32) -> Result<u64> {
        let estimate: FeeEstimate = self.call("estimatesmartfee", json!([target])).await?;
        let Some(btc_per_kvb) = estimate.feerate else {
            bail!("fee estimation unavailable: {}", estimate.errors.join("; "));
        };
        let sat_per_vb = (btc_per_kvb * 100_000_000.0 / 1000.0).ceil() as u64;
        Ok(sat_per_vb.max(1))
    }

    async fn tx_confirmations(&self, txid: &Txid) -> Result<Option<u32>> {
        match self.call_raw("getrawtransaction", json!([txid.to_string(), true])).await {
            Ok(value) => {
                let info: RawTransactionInfo = serde_json::from_value(value)?;
                Ok(Some(info.confirmations))
            }
            Err(CallError::Rpc(e)) if e.code == RPC_INVALID_ADDRESS_OR_KEY => Ok(None),
            Err(CallError::Rpc(e)) => bail!("getrawtransaction failed ({}): {}", e.code, e.message),
            Err(CallError::Transport(e)) => Err(e),
        }
    }

    async fn best_block_height(&self) -> Result<u64> {
        self.call("getblockcount", json!([])).await
    }

    async fn block_transactions(&self, height: u64) -> Result<Option<Vec<Transaction>>> {
        let hash: String = match self.call_raw("getblockhash", json!([height])).await {
            Ok(value) => serde_json::from_value(value)?,
            Err(CallError::Rpc(e)) if e.code == RPC_INVALID_PARAMETER => return Ok(None),
            Err(CallError::Rpc(e)) => bail!("getblockhash failed ({}): {}", e.code, e.message),
            Err(CallError::Transport(e)) => return Err(e),
        };
        let raw: String = self.call("getblock", json!([hash, 0])).await?;
        let block: Block = deserialize_hex(&raw).with_context(|| format!("decoding block {}", hash))?;
        Ok(Some(block.txdata))
    }
}

#[async_trait]
impl Broadcaster for BitcoindClient {
    async fn broadcast(&self, tx: &Transaction) -> Result<Txid> {
        let txid: String = self.call("sendrawtransaction", json!([serialize_hex(tx)])).await?;
        Ok(txid.parse()?)
    }
}
