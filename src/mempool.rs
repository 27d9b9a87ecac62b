use async_trait::async_trait;
use bitcoin::{Transaction, Txid};

/// Unconfirmed transactions known to the node.
#[async_trait]
pub trait Mempool: Send + Sync {
    /// Ids of every transaction currently in the pool.
    async fn dump(&self) -> anyhow::Result<Vec<Txid>>;

    /// Look a transaction up; `None` once it has left the pool.
    async fn query(&self, txid: Txid) -> anyhow::Result<Option<Transaction>>;
}
