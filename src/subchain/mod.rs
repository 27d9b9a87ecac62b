//! Per-subchain orchestrator: owns the Scan, Process, Index, Rescan and
//! Progress jobs and drives them through the reorg protocol.
//!
//! ```text
//!            prepare_reorg(id)          finish_reorg(id)
//!   Normal ────────────────────▶ Reorg ─────────────────▶ Normal
//!      │                           │ process_reorg(ancestor)
//!      └──────── shutdown ─────────┴──────────▶ Shutdown
//! ```
//!
//! While in `Reorg` every job is frozen: regular work sent to it is queued and
//! replayed in order once the reorg ends.
mod context;
mod index;
mod job;
mod process;
mod progress;
mod rescan;
mod scan;
mod watchdog;

use std::{
    collections::HashSet,
    sync::{Arc, Weak},
};

use anyhow::Context;
use bitcoin::{Block, PublicKey, Transaction};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::{
    config::SyncConfig,
    elements::ElementCache,
    error::SyncError,
    hooks::WalletHooks,
    matcher::TransactionMatch,
    matches::MatchCache,
    node::Node,
    store::WalletDatabase,
    types::{ElementIndex, JobType, Position, StateSequence, SubchainId},
};

pub(crate) use self::job::AckCounter;

use self::{
    context::{ScanPositions, SubchainContext},
    index::IndexJob,
    job::{spawn_job, JobMessage, JobRouter, Work},
    process::{ProcessJob, ProcessQueue},
    progress::ProgressJob,
    rescan::RescanJob,
    scan::ScanJob,
    watchdog::{spawn_watchdog, Activity},
};

/// Lifecycle of a subchain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SubchainState {
    /// Scanning.
    Normal,
    /// Frozen for a reorg.
    Reorg,
    /// Stopped for good.
    Shutdown,
}

impl SubchainState {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Reorg => "reorg",
            Self::Shutdown => "shutdown",
        }
    }
}

struct Control {
    state: SubchainState,
    reorgs: HashSet<StateSequence>,
    current: Option<StateSequence>,
}

/// Scanning state of one (subaccount, subchain, filter type).
pub struct SubchainStateData {
    ctx: Arc<SubchainContext>,
    control: tokio::sync::Mutex<Control>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Where scanning resumes: the stored watermark if it is still on the best
/// chain, its surviving ancestor if not, otherwise just below the birth height.
async fn resume_position(
    id: &SubchainId,
    config: &SyncConfig,
    node: &Node,
    db: &dyn WalletDatabase,
) -> anyhow::Result<Position> {
    let headers = &node.headers;
    if let Some(stored) = db.subchain_last_scanned(id).await? {
        if headers.is_in_best_chain(stored).await? {
            return Ok(stored);
        }
        let invalid = headers
            .calculate_reorg(stored)
            .await
            .context("calculate reorg of stored watermark")?;
        let fork_height = invalid
            .last()
            .map(|p| p.height)
            .unwrap_or(stored.height)
            .saturating_sub(1);
        let ancestor = headers
            .get_position(fork_height)
            .await?
            .with_context(|| format!("no best-chain block at height {fork_height}"))?;
        tracing::warn!(subchain = %id, %stored, %ancestor, "stored watermark is stale, rewinding");
        db.reorg_to(id, ancestor).await?;
        return Ok(ancestor);
    }
    let start = config.birth_height.saturating_sub(1);
    match headers.get_position(start).await? {
        Some(position) => Ok(position),
        None => headers.best_tip().await,
    }
}

impl SubchainStateData {
    /// Load persisted state for `id` and start its jobs.
    pub async fn start(
        id: SubchainId,
        config: Arc<SyncConfig>,
        node: Node,
        db: Arc<dyn WalletDatabase>,
        hooks: Arc<dyn WalletHooks>,
    ) -> anyhow::Result<Self> {
        let start = resume_position(&id, &config, &node, db.as_ref())
            .await
            .with_context(|| format!("resume subchain {id}"))?;

        let mut elements = ElementCache::new();
        elements.extend_patterns(db.get_patterns(&id).await.context("load patterns")?);
        elements.replace_txos(db.get_unspent_outputs(&id).await.context("load outputs")?);
        tracing::info!(
            subchain = %id,
            %start,
            keys = elements.key_count(),
            outputs = elements.txos().len(),
            "starting subchain"
        );

        let (router, mut inboxes) = JobRouter::new();
        let ctx = Arc::new(SubchainContext {
            id,
            config: config.clone(),
            node,
            db,
            hooks,
            elements: RwLock::new(elements),
            matches: RwLock::new(MatchCache::new()),
            positions: Mutex::new(ScanPositions {
                last_scanned: Some(start),
                progress: Some(start),
                ..Default::default()
            }),
            process: Mutex::new(ProcessQueue::default()),
            router,
            activity: Activity::new(),
        });

        let weak: Weak<SubchainContext> = Arc::downgrade(&ctx);
        let mut handles = Vec::with_capacity(JobType::ALL.len() + 1);
        for kind in JobType::ALL {
            let inbox = inboxes
                .remove(&kind)
                .ok_or(SyncError::JobUnavailable(kind))?;
            let handle = match kind {
                JobType::Scan => spawn_job(ScanJob, weak.clone(), inbox),
                JobType::Process => spawn_job(ProcessJob::new(config.txid_cache_size), weak.clone(), inbox),
                JobType::Index => spawn_job(IndexJob, weak.clone(), inbox),
                JobType::Rescan => spawn_job(RescanJob, weak.clone(), inbox),
                JobType::Progress => spawn_job(ProgressJob, weak.clone(), inbox),
            };
            handles.push(handle);
        }
        handles.push(spawn_watchdog(weak, config.watchdog_interval, config.watchdog_timeout));

        Ok(Self {
            ctx,
            control: tokio::sync::Mutex::new(Control {
                state: SubchainState::Normal,
                reorgs: HashSet::new(),
                current: None,
            }),
            handles: Mutex::new(handles),
        })
    }

    /// Identity of this subchain.
    pub fn id(&self) -> SubchainId {
        self.ctx.id
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> SubchainState {
        self.control.lock().await.state
    }

    /// Move to `state`; `reorg` names the reorg for transitions into and out
    /// of [`SubchainState::Reorg`]. Returns whether the transition happened.
    pub async fn change_state(&self, state: SubchainState, reorg: Option<StateSequence>) -> bool {
        let result = match (state, reorg) {
            (SubchainState::Reorg, Some(id)) => self.prepare_reorg(id).await,
            (SubchainState::Normal, Some(id)) => self.finish_reorg(id).await,
            (SubchainState::Shutdown, _) => {
                self.shutdown().await;
                Ok(())
            }
            _ => Err(SyncError::InvalidState {
                operation: "change_state without a reorg id",
                state: state.as_str(),
            }
            .into()),
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(subchain = %self.ctx.id, "state change to {} failed: {e:#}", state.as_str());
                false
            }
        }
    }

    /// Freeze every job for reorg `id`. A reorg already seen is acknowledged
    /// without doing anything.
    pub async fn prepare_reorg(&self, id: StateSequence) -> anyhow::Result<()> {
        let mut control = self.control.lock().await;
        if control.reorgs.contains(&id) {
            tracing::debug!(subchain = %self.ctx.id, reorg = %id, "duplicate reorg ignored");
            return Ok(());
        }
        if control.state != SubchainState::Normal {
            return Err(SyncError::InvalidState {
                operation: "prepare_reorg",
                state: control.state.as_str(),
            }
            .into());
        }
        self.ctx
            .router
            .broadcast(|ack| JobMessage::ReorgBegin(id, ack))
            .await?;
        control.reorgs.insert(id);
        control.current = Some(id);
        control.state = SubchainState::Reorg;
        tracing::debug!(subchain = %self.ctx.id, reorg = %id, "all jobs frozen");
        Ok(())
    }

    /// Rewind to `ancestor`. Only valid between `prepare_reorg` and
    /// `finish_reorg`; failures are counted into `errors`.
    pub async fn process_reorg(&self, errors: &mut usize, ancestor: Position) {
        let control = self.control.lock().await;
        if control.state != SubchainState::Reorg {
            tracing::error!(subchain = %self.ctx.id, state = control.state.as_str(), "process_reorg outside a reorg");
            *errors += 1;
            return;
        }
        let ctx = &self.ctx;
        let h = ancestor.height;
        let forgotten = {
            let mut elements = ctx.elements.write();
            let mut matches = ctx.matches.write();
            let mut positions = ctx.positions.lock();
            elements.forget_txos_above(h);
            positions.clamp(ancestor);
            matches.forget_above(h)
        };
        tracing::info!(subchain = %ctx.id, %ancestor, forgotten, "rewinding to reorg ancestor");

        match ctx.db.reorg_to(&ctx.id, ancestor).await {
            Ok(()) => match ctx.db.get_unspent_outputs(&ctx.id).await {
                Ok(txos) => ctx.elements.write().replace_txos(txos),
                Err(e) => {
                    tracing::error!(subchain = %ctx.id, "reload outputs after reorg: {e:#}");
                    *errors += 1;
                }
            },
            Err(e) => {
                tracing::error!(subchain = %ctx.id, "database reorg failed: {e:#}");
                *errors += 1;
            }
        }

        match ctx
            .router
            .broadcast(|ack| JobMessage::ProcessReorg(ancestor, ack))
            .await
        {
            Ok(job_errors) => *errors += job_errors.into_iter().sum::<usize>(),
            Err(e) => {
                tracing::error!(subchain = %ctx.id, "job reorg failed: {e}");
                *errors += 1;
            }
        }
        drop(control);
    }

    /// Unfreeze every job after reorg `id`.
    pub async fn finish_reorg(&self, id: StateSequence) -> anyhow::Result<()> {
        let mut control = self.control.lock().await;
        if control.state != SubchainState::Reorg || control.current != Some(id) {
            if control.reorgs.contains(&id) && control.current != Some(id) {
                // duplicate of a finished reorg
                return Ok(());
            }
            return Err(SyncError::InvalidState {
                operation: "finish_reorg",
                state: control.state.as_str(),
            }
            .into());
        }
        self.ctx
            .router
            .broadcast(|ack| JobMessage::ReorgEnd(id, ack))
            .await?;
        control.current = None;
        control.state = SubchainState::Normal;
        tracing::debug!(subchain = %self.ctx.id, reorg = %id, "reorg finished");
        Ok(())
    }

    /// Exactly match an already downloaded `block`. Returns whether it held
    /// wallet transactions.
    pub async fn process_block(&self, position: Position, block: &Block) -> anyhow::Result<bool> {
        let state = self.state().await;
        if state != SubchainState::Normal {
            return Err(SyncError::InvalidState {
                operation: "process_block",
                state: state.as_str(),
            }
            .into());
        }
        let found = process::process_block(&self.ctx, position, Arc::new(block.clone())).await?;
        if found.is_empty() {
            return Ok(false);
        }
        let txids = found.iter().map(TransactionMatch::txid).collect();
        self.ctx
            .router
            .notify(JobType::Process, Work::Confirmed(position, txids));
        Ok(true)
    }

    /// Match an unconfirmed transaction.
    pub fn process_transaction(&self, tx: Transaction) -> Result<(), SyncError> {
        self.send(JobType::Process, Work::Mempool(tx))
    }

    /// Match a transaction synchronously, without notifying anyone.
    pub fn match_transaction(&self, tx: &Transaction) -> Option<TransactionMatch> {
        let elements = self.ctx.elements.read().elements();
        crate::matcher::match_transaction(tx, &elements)
    }

    /// Persist and publish `position` as the scan watermark.
    pub async fn report_scan(&self, position: Position) -> anyhow::Result<()> {
        self.ctx.report_scan(position).await
    }

    /// Index new keys.
    pub fn add_keys(&self, keys: Vec<(ElementIndex, PublicKey)>) -> Result<(), SyncError> {
        self.send(JobType::Index, Work::Key(keys))
    }

    /// Index raw patterns (e.g. payment-code derived hashes).
    pub fn add_patterns(&self, patterns: Vec<(ElementIndex, Vec<u8>)>) -> Result<(), SyncError> {
        self.send(JobType::Index, Work::Patterns(patterns))
    }

    /// Re-test every block above `from`.
    pub fn rescan(&self, from: Position) -> Result<(), SyncError> {
        self.send(JobType::Rescan, Work::Rescan(from))
    }

    fn send(&self, kind: JobType, work: Work) -> Result<(), SyncError> {
        self.ctx
            .router
            .send(kind, JobMessage::Work(work))
            .map_err(|_| SyncError::Shutdown(self.ctx.id))
    }

    /// Stop every job. A reorg in progress is aborted and counted as one
    /// error; deferred work is dropped. Returns the error count.
    pub async fn shutdown(&self) -> usize {
        let mut control = self.control.lock().await;
        if control.state == SubchainState::Shutdown {
            return 0;
        }
        let mut errors = 0;
        if control.state == SubchainState::Reorg {
            tracing::error!(
                subchain = %self.ctx.id,
                reorg = ?control.current,
                "shutdown during reorg, aborting it"
            );
            errors += 1;
        }
        if let Err(e) = self.ctx.router.broadcast(JobMessage::Shutdown).await {
            tracing::debug!(subchain = %self.ctx.id, "shutdown broadcast: {e}");
        }
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }
        control.state = SubchainState::Shutdown;
        control.current = None;
        tracing::info!(subchain = %self.ctx.id, "subchain stopped");
        errors
    }

    /// Highest position Scan has committed.
    pub fn last_scanned(&self) -> Option<Position> {
        self.ctx.positions.lock().last_scanned
    }

    /// Highest position with a filter, as last seen by Scan.
    pub fn filter_tip(&self) -> Option<Position> {
        self.ctx.positions.lock().filter_tip
    }

    /// Persisted scan watermark.
    pub fn progress(&self) -> Option<Position> {
        self.ctx.positions.lock().progress
    }

    /// Rescan's cursor; `None` when it has caught up.
    pub fn rescan_position(&self) -> Option<Position> {
        self.ctx.positions.lock().rescan
    }

    /// Dirty positions not yet confirmed.
    pub fn dirty_positions(&self) -> Vec<Position> {
        self.ctx.positions.lock().dirty.iter().copied().collect()
    }

    /// Positions waiting, downloading or ready in the Process pipeline.
    pub fn pending_blocks(&self) -> Vec<Position> {
        self.ctx.process.lock().positions()
    }

    /// Highest position with a match-cache entry.
    pub fn highest_cached(&self) -> Option<Position> {
        self.ctx.matches.read().highest()
    }

    /// Match-cache entry of `position`: `(probable hits, definite misses)`.
    pub fn cached_outcome(&self, position: &Position) -> Option<(usize, usize)> {
        self.ctx
            .matches
            .read()
            .get(position)
            .map(|m| (m.confirmed_match.len(), m.confirmed_no_match.len()))
    }

    /// Number of targets (patterns and outputs) being scanned for.
    pub fn element_count(&self) -> usize {
        self.ctx.elements.read().elements().len()
    }

    /// Unspent wallet outputs being tracked.
    pub fn output_count(&self) -> usize {
        self.ctx.elements.read().txos().len()
    }
}

impl Drop for SubchainStateData {
    fn drop(&mut self) {
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for SubchainStateData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubchainStateData")
            .field("id", &self.ctx.id)
            .field("positions", &*self.ctx.positions.lock())
            .finish_non_exhaustive()
    }
}
