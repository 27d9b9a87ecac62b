//! Wallet glue: receive notifications on matches and scan progress.
use async_trait::async_trait;

use crate::{
    matcher::TransactionMatch,
    types::{Position, SubchainId},
};

#[async_trait]
/// Downstream consumer of what the subchains find.
pub trait WalletHooks: Send + Sync {
    /// Called when the block at `position` contains wallet transactions.
    /// `matches` are in block order.
    async fn on_block_match(
        &self,
        subchain: SubchainId,
        position: Position,
        matches: Vec<TransactionMatch>,
    ) -> anyhow::Result<()>;

    /// Called for an unconfirmed wallet transaction.
    async fn on_mempool_match(
        &self,
        _subchain: SubchainId,
        _found: TransactionMatch,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called whenever the subchain's scan watermark moves.
    async fn on_scan_progress(&self, _subchain: SubchainId, _position: Position) -> anyhow::Result<()> {
        Ok(())
    }
}
