//! Abstractions for fetching compact filters and full blocks.
use async_trait::async_trait;
use bitcoin::{Block, BlockHash};

use crate::{gcs::Gcs, types::{FilterType, Position}};

/// Local store of compact filters.
#[async_trait]
pub trait FilterOracle: Send + Sync {
    /// Filter of `filter_type` for `block`; `None` when missing or invalid.
    async fn load_filter(
        &self,
        filter_type: FilterType,
        block: BlockHash,
    ) -> anyhow::Result<Option<Gcs>>;

    /// Filters for `blocks`, index-aligned with the input.
    async fn load_filters(
        &self,
        filter_type: FilterType,
        blocks: &[BlockHash],
    ) -> anyhow::Result<Vec<Option<Gcs>>> {
        let mut out = Vec::with_capacity(blocks.len());
        for block in blocks {
            out.push(self.load_filter(filter_type, *block).await?);
        }
        Ok(out)
    }

    /// Highest block with a `filter_type` filter available.
    async fn filter_tip(&self, filter_type: FilterType) -> anyhow::Result<Position>;
}

/// Full block download.
#[async_trait]
pub trait BlockOracle: Send + Sync {
    /// Fetch `block` (used after a filter hit).
    async fn load_block(&self, block: BlockHash) -> anyhow::Result<Block>;
}
