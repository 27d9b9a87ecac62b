//! Scan job plus the batch routine it shares with Rescan.
use std::{collections::BTreeSet, sync::Arc};

use anyhow::Context;
use async_trait::async_trait;

use crate::{
    elements::TargetId,
    prehash::{choose_thread_count, get_batch_size, match_batch, BlockTest, Targets},
    types::{JobType, Position},
};

use super::{
    context::SubchainContext,
    job::{Job, Work},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ScanMode {
    Scan,
    Rescan,
}

/// What one committed batch produced.
#[derive(Debug, Default)]
pub(crate) struct ScanBatch {
    /// Highest position committed.
    pub last: Option<Position>,
    /// Positions with new probable matches, each with its parent.
    pub dirty: Vec<(Position, Position)>,
}

/// Test the blocks above `start` (exclusive) up to `stop_height` against the
/// targets still untested at each of them, then commit the outcome.
///
/// Returns `None` without committing anything when `start` has left the best
/// chain or the cursor moved while the batch was in flight.
pub(crate) async fn scan_range(
    ctx: &SubchainContext,
    start: Position,
    stop_height: u32,
    mode: ScanMode,
) -> anyhow::Result<Option<ScanBatch>> {
    if stop_height <= start.height {
        return Ok(Some(ScanBatch::default()));
    }
    let elements = ctx.elements.read().elements();
    let avg_filter = ctx.positions.lock().avg_filter_elements;
    let targets = Targets::new(ctx.id.filter_type, &elements);
    let threads = choose_thread_count(elements.len(), ctx.config.hardware_concurrency());
    let batch = ctx
        .config
        .maximum_scan
        .min(get_batch_size(avg_filter, elements.len()) * threads);
    let count = batch.min((stop_height - start.height) as usize);

    let chain = ctx
        .node
        .headers
        .best_chain(start, count + 1)
        .await
        .context("load best chain")?;
    if chain.first() != Some(&start) {
        tracing::debug!(subchain = %ctx.id, %start, ?mode, "batch start is no longer on the best chain");
        return Ok(None);
    }
    if chain.len() < 2 {
        return Ok(Some(ScanBatch::default()));
    }

    // `None`: no outcome yet, test everything. Empty set: nothing left to test.
    let plan: Vec<(Position, Option<BTreeSet<TargetId>>)> = {
        let matches = ctx.matches.read();
        chain[1..]
            .iter()
            .map(|p| {
                let restrict = matches.get(p).map(|index| {
                    targets
                        .ids()
                        .iter()
                        .filter(|t| !index.is_tested(t))
                        .copied()
                        .collect()
                });
                (*p, restrict)
            })
            .collect()
    };
    let needs_test =
        |restrict: &Option<BTreeSet<TargetId>>| !targets.is_empty() && restrict.as_ref().map_or(true, |r| !r.is_empty());

    let wanted: Vec<_> = plan
        .iter()
        .filter(|(_, r)| needs_test(r))
        .map(|(p, _)| p.hash)
        .collect();
    let mut loaded = ctx
        .node
        .filters
        .load_filters(ctx.id.filter_type, &wanted)
        .await
        .context("load filters")?
        .into_iter();

    let mut blocks = Vec::new();
    let mut committed = Vec::new();
    let mut filter_elements = 0usize;
    for (position, restrict) in plan {
        if needs_test(&restrict) {
            let Some(Some(filter)) = loaded.next() else {
                tracing::debug!(subchain = %ctx.id, %position, "filter not available yet");
                break;
            };
            filter_elements += filter.count() as usize;
            blocks.push(BlockTest {
                position,
                filter: Arc::new(filter),
                restrict,
            });
        }
        committed.push(position);
    }
    let Some(&last) = committed.last() else {
        anyhow::bail!("filter for block {} not available", chain[1]);
    };

    let tested_blocks = blocks.len();
    let results = tokio::task::spawn_blocking(move || match_batch(&targets, &blocks, threads))
        .await
        .context("prehash workers")?;

    let mut out = ScanBatch {
        last: Some(last),
        dirty: Vec::new(),
    };
    let mut matches = ctx.matches.write();
    let mut positions = ctx.positions.lock();
    let cursor = match mode {
        ScanMode::Scan => positions.last_scanned,
        ScanMode::Rescan => positions.rescan,
    };
    if cursor != Some(start) {
        tracing::debug!(subchain = %ctx.id, %start, ?mode, "discarding stale batch");
        return Ok(None);
    }
    for result in results {
        matches.record(result.position, &result.tested, &result.matched);
        if !result.matched.is_empty() {
            let height = result.position.height;
            let parent = chain[(height - start.height - 1) as usize];
            out.dirty.push((result.position, parent));
        }
    }
    positions.dirty.extend(out.dirty.iter().map(|(p, _)| *p));
    if tested_blocks > 0 {
        let batch_avg = filter_elements / tested_blocks;
        positions.avg_filter_elements = if positions.avg_filter_elements == 0 {
            batch_avg
        } else {
            (positions.avg_filter_elements + batch_avg) / 2
        };
    }
    match mode {
        ScanMode::Scan => {
            positions.last_scanned = Some(last);
            if let Some((_, parent)) = out.dirty.first() {
                positions.scan_dirty = true;
                if positions.rescan.map_or(true, |r| r.height > parent.height) {
                    positions.rescan = Some(*parent);
                }
            }
        }
        ScanMode::Rescan => positions.rescan = Some(last),
    }
    tracing::debug!(
        subchain = %ctx.id,
        ?mode,
        from = start.height + 1,
        to = last.height,
        tested = tested_blocks,
        dirty = out.dirty.len(),
        threads,
        "batch committed"
    );
    Ok(Some(out))
}

/// Walks forward through available filters.
pub(crate) struct ScanJob;

impl ScanJob {
    async fn refresh_filter_tip(&self, ctx: &SubchainContext) -> anyhow::Result<()> {
        let tip = ctx
            .node
            .filters
            .filter_tip(ctx.id.filter_type)
            .await
            .context("load filter tip")?;
        let mut positions = ctx.positions.lock();
        match positions.last_scanned {
            Some(last) if tip.height < last.height => {
                tracing::debug!(subchain = %ctx.id, %tip, %last, "filter tip below last scanned, awaiting reorg");
            }
            _ => positions.filter_tip = Some(tip),
        }
        Ok(())
    }
}

#[async_trait]
impl Job for ScanJob {
    fn kind(&self) -> JobType {
        JobType::Scan
    }

    async fn work(&mut self, _ctx: &SubchainContext, _work: Work) -> anyhow::Result<()> {
        Ok(())
    }

    async fn state_machine(&mut self, ctx: &SubchainContext) -> anyhow::Result<bool> {
        self.refresh_filter_tip(ctx).await?;
        let (last, tip, rescan, scan_dirty) = {
            let p = ctx.positions.lock();
            (p.last_scanned, p.filter_tip, p.rescan, p.scan_dirty)
        };
        let (Some(last), Some(tip)) = (last, tip) else {
            return Ok(false);
        };
        if last.height >= tip.height {
            return Ok(false);
        }
        if ctx.elements.read().elements().is_empty() {
            return Ok(false);
        }
        if let Some(rescan) = rescan {
            let lead = last.height.saturating_sub(rescan.height);
            if scan_dirty && lead > ctx.config.scan_threshold {
                tracing::trace!(subchain = %ctx.id, lead, "waiting for rescan to catch up");
                return Ok(false);
            }
        }

        let Some(batch) = scan_range(ctx, last, tip.height, ScanMode::Scan).await? else {
            return Ok(false);
        };
        if !batch.dirty.is_empty() {
            let dirty = batch.dirty.iter().map(|(p, _)| *p).collect();
            ctx.router.notify(JobType::Process, Work::Dirty(dirty));
            ctx.router.notify(JobType::Rescan, Work::StateMachine);
        }
        ctx.router.notify(JobType::Progress, Work::Update);
        Ok(batch.last.is_some_and(|p| p.height < tip.height))
    }
}
