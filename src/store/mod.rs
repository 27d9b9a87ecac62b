//! Persistence interfaces and implementations used by the subchains
//! (scan watermark, patterns, wallet outputs).
use async_trait::async_trait;
use bitcoin::OutPoint;

use crate::{
    elements::Txo,
    matcher::TransactionMatch,
    types::{ElementIndex, Position, SubchainId},
};

/// Wallet persistence as seen by the scanning engine.
///
/// Every write must be idempotent: the same block can be delivered twice when
/// a rescan finds new matches in it.
#[async_trait]
pub trait WalletDatabase: Send + Sync {
    /// Last position whose scan results are durable.
    async fn subchain_last_scanned(&self, subchain: &SubchainId) -> anyhow::Result<Option<Position>>;

    /// Update the scan watermark.
    async fn set_subchain_last_scanned(
        &self,
        subchain: &SubchainId,
        position: Position,
    ) -> anyhow::Result<()>;

    /// Every stored pattern of `subchain`.
    async fn get_patterns(&self, subchain: &SubchainId)
        -> anyhow::Result<Vec<(ElementIndex, Vec<u8>)>>;

    /// Store patterns derived for new keys.
    async fn add_patterns(
        &self,
        subchain: &SubchainId,
        patterns: &[(ElementIndex, Vec<u8>)],
    ) -> anyhow::Result<()>;

    /// Wallet outputs not yet spent in a confirmed block.
    async fn get_unspent_outputs(&self, subchain: &SubchainId) -> anyhow::Result<Vec<(OutPoint, Txo)>>;

    /// Record the wallet outputs created and spent by a confirmed block.
    async fn add_confirmed_transactions(
        &self,
        subchain: &SubchainId,
        position: Position,
        matches: &[TransactionMatch],
    ) -> anyhow::Result<()>;

    /// Forget everything above `ancestor`: outputs created above it are
    /// deleted, spends above it undone, and the watermark lowered to it.
    async fn reorg_to(&self, subchain: &SubchainId, ancestor: Position) -> anyhow::Result<()>;
}

// concrete stores live here
#[cfg(feature = "store-sqlite")]
pub mod sqlite_store;
#[cfg(feature = "store-sqlite")]
pub use sqlite_store::SqliteWalletDb;
