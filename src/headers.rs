use async_trait::async_trait;
use bitcoin::BlockHash;

use crate::types::Position;

/// Source of best-chain header information (height ↔ hash).
#[async_trait]
pub trait HeaderOracle: Send + Sync {
    /// Current best chain tip.
    async fn best_tip(&self) -> anyhow::Result<Position>;

    /// Up to `count` consecutive best-chain hashes starting at `start_height`.
    /// Shorter (or empty) past the tip.
    async fn best_hashes(&self, start_height: u32, count: usize) -> anyhow::Result<Vec<BlockHash>>;

    /// Best-chain position at `height`, `None` above the tip.
    async fn get_position(&self, height: u32) -> anyhow::Result<Option<Position>>;

    /// Positions of the best chain from `from` upward, at most `limit` of them.
    /// Empty when `from` is no longer on the best chain.
    async fn best_chain(&self, from: Position, limit: usize) -> anyhow::Result<Vec<Position>> {
        let hashes = self.best_hashes(from.height, limit).await?;
        if hashes.first() != Some(&from.hash) {
            return Ok(Vec::new());
        }
        Ok(hashes
            .into_iter()
            .enumerate()
            .map(|(i, hash)| Position::new(from.height + i as u32, hash))
            .collect())
    }

    /// Whether `position` is on the best chain.
    async fn is_in_best_chain(&self, position: Position) -> anyhow::Result<bool> {
        Ok(self.get_position(position.height).await? == Some(position))
    }

    /// Positions from `tip` back to (excluding) the last common ancestor with
    /// the best chain, highest first. Empty when `tip` is on the best chain.
    async fn calculate_reorg(&self, tip: Position) -> anyhow::Result<Vec<Position>>;
}
