use super::{Broadcaster, ChainOracle, UtxoInfo};
use anyhow::{bail, Result};
use async_trait::async_trait;
use bitcoin::{OutPoint, Transaction, TxOut, Txid};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// In-process chain: a UTXO set, a fixed fee rate, a broadcast log and a
/// list of mined blocks. Broadcasting spends the inputs and adds the
/// outputs unconfirmed.
pub struct MemoryChain {
    inner: Mutex<Inner>,
}

struct Inner {
    utxos: HashMap<OutPoint, UtxoInfo>,
    confirmations: HashMap<Txid, u32>,
    fee_rate: Option<u64>,
    broadcasts: Vec<Transaction>,
    broadcast_failure: Option<String>,
    /// Block at height `h` is `blocks[h - 1]`.
    blocks: Vec<Vec<Transaction>>,
}

impl Default for MemoryChain {
    fn default() -> Self {
        Self::new(10)
    }
}

impl MemoryChain {
    pub fn new(fee_rate: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                utxos: HashMap::new(),
                confirmations: HashMap::new(),
                fee_rate: Some(fee_rate),
                broadcasts: Vec::new(),
                broadcast_failure: None,
                blocks: Vec::new(),
            }),
        }
    }

    pub async fn add_utxo(&self, outpoint: OutPoint, txout: TxOut, confirmations: u32, is_coinbase: bool) {
        let mut inner = self.inner.lock().await;
        inner.utxos.insert(outpoint, UtxoInfo { txout, confirmations, is_coinbase });
        inner.confirmations.entry(outpoint.txid).or_insert(confirmations);
    }

    pub async fn spend(&self, outpoint: &OutPoint) {
        self.inner.lock().await.utxos.remove(outpoint);
    }

    /// `None` makes fee estimation fail.
    pub async fn set_fee_rate(&self, fee_rate: Option<u64>) {
        self.inner.lock().await.fee_rate = fee_rate;
    }

    pub async fn fail_broadcasts(&self, reason: Option<String>) {
        self.inner.lock().await.broadcast_failure = reason;
    }

    pub async fn broadcasts(&self) -> Vec<Transaction> {
        self.inner.lock().await.broadcasts.clone()
    }

    /// Append a block. Its transactions spend their inputs and their
    /// outputs get one confirmation. Returns the new height.
    pub async fn mine_block(&self, txs: Vec<Transaction>) -> u64 {
        let mut inner = self.inner.lock().await;
        for tx in &txs {
            for input in &tx.input {
                inner.utxos.remove(&input.previous_output);
            }
            let txid = tx.compute_txid();
            for (vout, txout) in tx.output.iter().enumerate() {
                inner.utxos.insert(
                    OutPoint::new(txid, vout as u32),
                    UtxoInfo { txout: txout.clone(), confirmations: 1, is_coinbase: false },
                );
            }
            inner.confirmations.insert(txid, 1);
        }
        inner.blocks.push(txs);
        inner.blocks.len() as u64
    }

    /// Set the confirmation count of `txid` and its unspent outputs.
    pub async fn confirm(&self, txid: &Txid, confirmations: u32) {
        let mut inner = self.inner.lock().await;
        inner.confirmations.insert(*txid, confirmations);
        for (outpoint, utxo) in inner.utxos.iter_mut() {
            if outpoint.txid == *txid {
                utxo.confirmations = confirmations;
            }
        }
    }
}

#[async_trait]
impl ChainOracle for MemoryChain {
    async fn get_utxo(&self, outpoint: &OutPoint) -> Result<Option<UtxoInfo>> {
        Ok(self.inner.lock().await.utxos.get(outpoint).cloned())
    }

    async fn estimate_fee_rate(&self, _target: u32) -> Result<u64> {
        match self.inner.lock().await.fee_rate {
            Some(rate) => Ok(rate),
            None => bail!("fee estimation unavailable"),
        }
    }

    async fn tx_confirmations(&self, txid: &Txid) -> Result<Option<u32>> {
        Ok(self.inner.lock().await.confirmations.get(txid).copied())
    }

    async fn best_block_height(&self) -> Result<u64> {
        Ok(self.inner.lock().await.blocks.len() as u64)
    }

    async fn block_transactions(&self, height: u64) -> Result<Option<Vec<Transaction>>> {
        let inner = self.inner.lock().await;
        let Some(index) = height.checked_sub(1) else {
            return Ok(Some(Vec::new()));
        };
        Ok(inner.blocks.get(index as usize).cloned())
    }
}

#[async_trait]
impl Broadcaster for MemoryChain {
    async fn broadcast(&self, tx: &Transaction) -> Result<Txid> {
        let mut inner = self.inner.lock().await;
        if let Some(reason) = &inner.broadcast_failure {
            bail!("{}", reason);
        }
        if let Some(missing) = tx.input.iter().find(|i| !inner.utxos.contains_key(&i.previous_output)) {
            bail!("missing or spent input {}", missing.previous_output);
        }
        for input in &tx.input {
            inner.utxos.remove(&input.previous_output);
        }

        let txid = tx.compute_txid();
        for (vout, txout) in tx.output.iter().enumerate() {
            inner.utxos.insert(
                OutPoint::new(txid, vout as u32),
                UtxoInfo { txout: txout.clone(), confirmations: 0, is_coinbase: false },
            );
        }
        inner.confirmations.insert(txid, 0);
        inner.broadcasts.push(tx.clone());
        Ok(txid)
    }
}
