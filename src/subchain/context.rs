//! State shared by a subchain's jobs.
//!
//! Lock order when more than one is needed: `elements`, then `matches`, then
//! `positions`, then `process`. No guard is ever held across an `.await`.
use std::{collections::BTreeSet, sync::Arc};

use parking_lot::{Mutex, RwLock};

use crate::{
    config::SyncConfig,
    elements::ElementCache,
    hooks::WalletHooks,
    matches::MatchCache,
    node::Node,
    store::WalletDatabase,
    types::{Position, SubchainId},
};

use super::{job::JobRouter, process::ProcessQueue, watchdog::Activity};

/// Scan watermarks of one subchain.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct ScanPositions {
    /// Highest position Scan has committed.
    pub last_scanned: Option<Position>,
    /// Highest position with a filter available.
    pub filter_tip: Option<Position>,
    /// Last persisted and reported watermark.
    pub progress: Option<Position>,
    /// Rescan's cursor: last position it re-tested. `None` when caught up.
    pub rescan: Option<Position>,
    /// Dirty positions not yet confirmed by Process.
    pub dirty: BTreeSet<Position>,
    /// Scan produced dirty positions that Rescan has not walked past yet.
    pub scan_dirty: bool,
    /// Parent of the lowest block with a confirmed match since the last rescan.
    pub match_floor: Option<Position>,
    /// Running average of elements per filter.
    pub avg_filter_elements: usize,
}

fn clamp(position: &mut Option<Position>, ancestor: Position) {
    if position.is_some_and(|p| p.height > ancestor.height) {
        *position = Some(ancestor);
    }
}

impl ScanPositions {
    /// Rewind every watermark to at most `ancestor`.
    pub fn clamp(&mut self, ancestor: Position) {
        clamp(&mut self.last_scanned, ancestor);
        clamp(&mut self.filter_tip, ancestor);
        clamp(&mut self.progress, ancestor);
        clamp(&mut self.rescan, ancestor);
        self.dirty.retain(|p| p.height <= ancestor.height);
        if self.match_floor.is_some_and(|p| p.height > ancestor.height) {
            self.match_floor = None;
        }
        if self.rescan.is_none() {
            self.scan_dirty = false;
        }
    }

    /// `min(last_scanned, parent of the lowest dirty block, rescan cursor)`,
    /// by height. The dirty parent is returned separately because only its
    /// height is known here.
    pub fn watermark_height(&self) -> Option<u32> {
        let last = self.last_scanned?.height;
        let dirty = self.dirty.first().map(|p| p.height.saturating_sub(1));
        let rescan = self.rescan.map(|p| p.height);
        Some([Some(last), dirty, rescan].into_iter().flatten().min().unwrap_or(last))
    }
}

/// Everything a subchain's jobs share. Owned by `SubchainStateData`; jobs
/// only hold a `Weak` to it.
pub(crate) struct SubchainContext {
    pub id: SubchainId,
    pub config: Arc<SyncConfig>,
    pub node: Node,
    pub db: Arc<dyn WalletDatabase>,
    pub hooks: Arc<dyn WalletHooks>,
    pub elements: RwLock<ElementCache>,
    pub matches: RwLock<MatchCache>,
    pub positions: Mutex<ScanPositions>,
    pub process: Mutex<ProcessQueue>,
    pub router: JobRouter,
    pub activity: Activity,
}

impl SubchainContext {
    /// Persist and publish a new scan watermark.
    pub async fn report_scan(&self, position: Position) -> anyhow::Result<()> {
        self.db.set_subchain_last_scanned(&self.id, position).await?;
        self.hooks.on_scan_progress(self.id, position).await?;
        tracing::debug!(subchain = %self.id, %position, "scan progress");
        Ok(())
    }
}
