use anyhow::Context;
use async_trait::async_trait;

use crate::types::{JobType, Position};

use super::{
    context::SubchainContext,
    job::{Job, Work},
};

/// Persists and reports the scan watermark, and prunes match-cache entries
/// nothing will consult again.
pub(crate) struct ProgressJob;

impl ProgressJob {
    async fn resolve(ctx: &SubchainContext, height: u32) -> anyhow::Result<Option<Position>> {
        let known = {
            let p = ctx.positions.lock();
            [p.last_scanned, p.rescan, p.progress]
                .into_iter()
                .flatten()
                .find(|pos| pos.height == height)
        };
        match known {
            Some(position) => Ok(Some(position)),
            None => ctx
                .node
                .headers
                .get_position(height)
                .await
                .context("resolve watermark position"),
        }
    }
}

#[async_trait]
impl Job for ProgressJob {
    fn kind(&self) -> JobType {
        JobType::Progress
    }

    async fn work(&mut self, _ctx: &SubchainContext, _work: Work) -> anyhow::Result<()> {
        Ok(())
    }

    async fn state_machine(&mut self, ctx: &SubchainContext) -> anyhow::Result<bool> {
        let (height, current) = {
            let p = ctx.positions.lock();
            (p.watermark_height(), p.progress)
        };
        let Some(height) = height else {
            return Ok(false);
        };
        if current.is_some_and(|c| c.height == height) {
            return Ok(false);
        }
        let Some(target) = Self::resolve(ctx, height).await? else {
            return Ok(false);
        };
        ctx.report_scan(target).await?;

        let floor = {
            let mut p = ctx.positions.lock();
            // a reorg or new dirty block may have moved things while we awaited
            if p.watermark_height() != Some(height) {
                return Ok(true);
            }
            p.progress = Some(target);
            [Some(target), p.rescan, p.match_floor]
                .into_iter()
                .flatten()
                .map(|pos| pos.height)
                .min()
                .unwrap_or(target.height)
        };
        let pruned = ctx.matches.write().prune_below(floor);
        if pruned > 0 {
            tracing::trace!(subchain = %ctx.id, pruned, below = floor, "match cache pruned");
        }
        Ok(false)
    }
}
