use async_trait::async_trait;

use crate::types::{JobType, Position};

use super::{
    context::SubchainContext,
    job::{Job, Work},
    scan::{scan_range, ScanMode},
};

/// Re-tests positions below Scan's watermark for targets that have no
/// outcome there yet.
pub(crate) struct RescanJob;

impl RescanJob {
    fn lower_cursor(ctx: &SubchainContext, to: Position) {
        let mut positions = ctx.positions.lock();
        let Some(last) = positions.last_scanned else {
            return;
        };
        if to.height >= last.height {
            return;
        }
        if positions.rescan.map_or(true, |r| r.height > to.height) {
            tracing::debug!(subchain = %ctx.id, from = %to, "rescan scheduled");
            positions.rescan = Some(to);
        }
    }
}

#[async_trait]
impl Job for RescanJob {
    fn kind(&self) -> JobType {
        JobType::Rescan
    }

    async fn work(&mut self, ctx: &SubchainContext, work: Work) -> anyhow::Result<()> {
        match work {
            Work::NewElements => {
                let floor = {
                    let mut positions = ctx.positions.lock();
                    positions.match_floor.take().or(positions.progress)
                };
                if let Some(floor) = floor {
                    Self::lower_cursor(ctx, floor);
                }
            }
            Work::Rescan(from) => {
                let forgotten = ctx.matches.write().forget_above(from.height);
                tracing::info!(subchain = %ctx.id, %from, forgotten, "explicit rescan");
                Self::lower_cursor(ctx, from);
            }
            _ => {}
        }
        Ok(())
    }

    async fn state_machine(&mut self, ctx: &SubchainContext) -> anyhow::Result<bool> {
        let (cursor, last) = {
            let p = ctx.positions.lock();
            (p.rescan, p.last_scanned)
        };
        let (Some(cursor), Some(last)) = (cursor, last) else {
            return Ok(false);
        };
        if cursor.height >= last.height {
            let mut positions = ctx.positions.lock();
            if positions.rescan == Some(cursor) {
                positions.rescan = None;
                positions.scan_dirty = false;
                tracing::debug!(subchain = %ctx.id, at = %cursor, "rescan caught up");
            }
            drop(positions);
            ctx.router.notify(JobType::Progress, Work::Update);
            ctx.router.notify(JobType::Scan, Work::StateMachine);
            return Ok(false);
        }

        let Some(batch) = scan_range(ctx, cursor, last.height, ScanMode::Rescan).await? else {
            return Ok(false);
        };
        if !batch.dirty.is_empty() {
            let dirty = batch.dirty.iter().map(|(p, _)| *p).collect();
            ctx.router.notify(JobType::Process, Work::Dirty(dirty));
        }
        ctx.router.notify(JobType::Progress, Work::Update);
        Ok(true)
    }
}
