//! Collaborators the coordinator consults about the blockchain.

pub mod bitcoind;
pub mod memory;

pub use bitcoind::BitcoindClient;
pub use memory::MemoryChain;

use anyhow::Result;
use async_trait::async_trait;
use bitcoin::{OutPoint, Transaction, TxOut, Txid};

/// An unspent output as seen by the chain backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UtxoInfo {
    pub txout: TxOut,
    /// Zero while the creating transaction is in the mempool.
    pub confirmations: u32,
    pub is_coinbase: bool,
}

#[async_trait]
pub trait ChainOracle: Send + Sync {
    /// The output, if it exists and is unspent (mempool included).
    async fn get_utxo(&self, outpoint: &OutPoint) -> Result<Option<UtxoInfo>>;

    /// Fee rate in sat/vB for confirmation within `target` blocks.
    async fn estimate_fee_rate(&self, target: u32) -> Result<u64>;

    /// Confirmations of `txid`, or `None` if the backend does not know it.
    async fn tx_confirmations(&self, txid: &Txid) -> Result<Option<u32>>;

    /// Height of the best block.
    async fn best_block_height(&self) -> Result<u64>;

    /// Transactions of the block at `height`, or `None` above the tip.
    async fn block_transactions(&self, height: u64) -> Result<Option<Vec<Transaction>>>;
}

#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn broadcast(&self, tx: &Transaction) -> Result<Txid>;
}
