//! Process job: downloads dirty blocks and confirms their matches exactly.
use std::{
    collections::{BTreeMap, BTreeSet, HashSet, VecDeque},
    sync::Arc,
};

use anyhow::Context;
use async_trait::async_trait;
use bitcoin::{Block, OutPoint, Transaction, Txid};
use tokio::task::JoinHandle;

use crate::{
    elements::Txo,
    filter_source::BlockOracle,
    matcher::{self, TransactionMatch},
    types::{JobType, Position},
};

use super::{
    context::SubchainContext,
    job::{Job, Work},
};

type Download = JoinHandle<anyhow::Result<Block>>;

/// Dirty blocks on their way through download and matching.
#[derive(Debug, Default)]
pub(crate) struct ProcessQueue {
    waiting: BTreeSet<Position>,
    downloading: BTreeMap<Position, Download>,
    ready: BTreeMap<Position, Block>,
}

impl ProcessQueue {
    /// Queue positions not already somewhere in the pipeline.
    pub fn enqueue<I: IntoIterator<Item = Position>>(&mut self, positions: I) -> usize {
        let mut added = 0;
        for position in positions {
            if !self.contains(&position) && self.waiting.insert(position) {
                added += 1;
            }
        }
        added
    }

    pub fn contains(&self, position: &Position) -> bool {
        self.waiting.contains(position)
            || self.downloading.contains_key(position)
            || self.ready.contains_key(position)
    }

    /// Next waiting position, if the download budget allows another one.
    ///
    /// A position below everything in flight is always started: blocks are
    /// matched in height order, so the pipeline would otherwise stall behind it.
    pub fn next_download(&mut self, limit: usize) -> Option<Position> {
        let first = *self.waiting.first()?;
        let in_flight = self.downloading.len() + self.ready.len();
        let lowest = self
            .downloading
            .keys()
            .chain(self.ready.keys())
            .all(|p| *p > first);
        if in_flight >= limit && !lowest {
            return None;
        }
        self.waiting.pop_first()
    }

    pub fn start(&mut self, position: Position, download: Download) {
        self.downloading.insert(position, download);
    }

    /// Remove downloads that have completed.
    pub fn take_finished(&mut self) -> Vec<(Position, Download)> {
        let done: Vec<Position> = self
            .downloading
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(p, _)| *p)
            .collect();
        done.into_iter()
            .filter_map(|p| self.downloading.remove(&p).map(|h| (p, h)))
            .collect()
    }

    pub fn retry(&mut self, position: Position) {
        self.waiting.insert(position);
    }

    pub fn ready(&mut self, position: Position, block: Block) {
        self.ready.insert(position, block);
    }

    /// The lowest queued block, once it has arrived. A later block waits for
    /// every earlier one so outputs are known before their spends are matched.
    pub fn pop_ready(&mut self) -> Option<(Position, Block)> {
        let (&next, _) = self.ready.first_key_value()?;
        let blocked = self.waiting.first().is_some_and(|p| *p < next)
            || self.downloading.keys().next().is_some_and(|p| *p < next);
        if blocked {
            return None;
        }
        self.ready.pop_first()
    }

    /// Drop every entry above `ancestor`. In-flight downloads are abandoned.
    pub fn reorg(&mut self, ancestor: Position) -> usize {
        let h = ancestor.height;
        let before = self.len();
        self.waiting.retain(|p| p.height <= h);
        self.ready.retain(|p, _| p.height <= h);
        let stale: Vec<Position> = self
            .downloading
            .keys()
            .filter(|p| p.height > h)
            .copied()
            .collect();
        for position in stale {
            if let Some(handle) = self.downloading.remove(&position) {
                handle.abort();
            }
        }
        before - self.len()
    }

    /// Abandon everything.
    pub fn clear(&mut self) {
        for (_, handle) in std::mem::take(&mut self.downloading) {
            handle.abort();
        }
        self.waiting.clear();
        self.ready.clear();
    }

    /// Every queued position, ascending.
    pub fn positions(&self) -> Vec<Position> {
        let mut out: Vec<Position> = self
            .waiting
            .iter()
            .chain(self.downloading.keys())
            .chain(self.ready.keys())
            .copied()
            .collect();
        out.sort();
        out
    }

    pub fn len(&self) -> usize {
        self.waiting.len() + self.downloading.len() + self.ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bounded set of recently confirmed txids, oldest evicted first.
#[derive(Debug)]
pub(crate) struct TxidCache {
    capacity: usize,
    order: VecDeque<(Txid, u32)>,
    set: HashSet<Txid>,
}

impl TxidCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            set: HashSet::new(),
        }
    }

    pub fn insert(&mut self, txid: Txid, height: u32) {
        if !self.set.insert(txid) {
            return;
        }
        self.order.push_back((txid, height));
        while self.order.len() > self.capacity {
            if let Some((old, _)) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
    }

    pub fn contains(&self, txid: &Txid) -> bool {
        self.set.contains(txid)
    }

    /// Forget confirmations above `height`.
    pub fn forget_above(&mut self, height: u32) {
        let set = &mut self.set;
        self.order.retain(|(txid, h)| {
            let keep = *h <= height;
            if !keep {
                set.remove(txid);
            }
            keep
        });
    }
}

/// Exactly match `block` at `position` and hand the result downstream.
///
/// Uses the match-cache entry for the block when there is one, otherwise
/// every wallet element. Returns the confirmed transactions.
pub(crate) async fn process_block(
    ctx: &SubchainContext,
    position: Position,
    block: Arc<Block>,
) -> anyhow::Result<Vec<TransactionMatch>> {
    let restrict = ctx
        .matches
        .read()
        .get(&position)
        .map(|index| index.confirmed_match.clone());
    if restrict.is_none() {
        tracing::warn!(subchain = %ctx.id, %position, "no match cache entry, testing all elements");
    }
    let elements = ctx.elements.read().elements();
    let found = {
        let block = block.clone();
        tokio::task::spawn_blocking(move || {
            matcher::match_block(&block, &elements, restrict.as_ref())
        })
        .await
        .context("exact matching task")?
    };

    if !found.is_empty() {
        tracing::info!(subchain = %ctx.id, %position, transactions = found.len(), "confirmed wallet transactions");
        ctx.hooks
            .on_block_match(ctx.id, position, found.clone())
            .await
            .with_context(|| format!("on_block_match @{position}"))?;
        ctx.db
            .add_confirmed_transactions(&ctx.id, position, &found)
            .await
            .with_context(|| format!("persist matches @{position}"))?;
    }

    let mut new_outputs = 0;
    {
        let mut elements = ctx.elements.write();
        for m in &found {
            let txid = m.txid();
            for spend in &m.spends {
                elements.spend_txo(&spend.outpoint);
            }
            for output in &m.outputs {
                if let Some(index) = output.owner() {
                    let outpoint = OutPoint {
                        txid,
                        vout: output.vout,
                    };
                    let txo = Txo {
                        index,
                        height: position.height,
                    };
                    if elements.add_txo(outpoint, txo) {
                        new_outputs += 1;
                    }
                }
            }
        }
    }
    {
        let mut positions = ctx.positions.lock();
        positions.dirty.remove(&position);
        if !found.is_empty() {
            let parent = Position::new(position.height.saturating_sub(1), block.header.prev_blockhash);
            if positions.match_floor.map_or(true, |f| f.height > parent.height) {
                positions.match_floor = Some(parent);
            }
        }
    }

    if new_outputs > 0 {
        ctx.router.notify(JobType::Rescan, Work::NewElements);
    }
    ctx.router.notify(JobType::Progress, Work::Update);
    Ok(found)
}

/// Downloads dirty blocks, matches them exactly, and watches the mempool.
pub(crate) struct ProcessJob {
    txids: TxidCache,
    bootstrapped: bool,
}

impl ProcessJob {
    pub fn new(txid_cache_size: usize) -> Self {
        Self {
            txids: TxidCache::new(txid_cache_size),
            bootstrapped: false,
        }
    }

    async fn handle_transaction(&mut self, ctx: &SubchainContext, tx: Transaction) -> anyhow::Result<()> {
        let txid = tx.compute_txid();
        if self.txids.contains(&txid) {
            tracing::trace!(subchain = %ctx.id, %txid, "already confirmed");
            return Ok(());
        }
        let elements = ctx.elements.read().elements();
        if let Some(found) = matcher::match_transaction(&tx, &elements) {
            tracing::debug!(subchain = %ctx.id, %txid, "mempool match");
            ctx.hooks
                .on_mempool_match(ctx.id, found)
                .await
                .with_context(|| format!("on_mempool_match {txid}"))?;
        }
        Ok(())
    }

    async fn bootstrap_mempool(&mut self, ctx: &SubchainContext) -> anyhow::Result<()> {
        let Some(mempool) = ctx.node.mempool.clone() else {
            return Ok(());
        };
        let txids = mempool.dump().await.context("dump mempool")?;
        tracing::debug!(subchain = %ctx.id, count = txids.len(), "loading mempool");
        for txid in txids {
            if let Some(tx) = mempool.query(txid).await? {
                self.handle_transaction(ctx, tx).await?;
            }
        }
        Ok(())
    }

    fn start_downloads(&self, ctx: &SubchainContext) {
        let limit = ctx.config.download_limit();
        let mut queue = ctx.process.lock();
        while let Some(position) = queue.next_download(limit) {
            let blocks: Arc<dyn BlockOracle> = ctx.node.blocks.clone();
            let download = tokio::spawn(async move { blocks.load_block(position.hash).await });
            queue.start(position, download);
        }
    }

    async fn collect_downloads(&self, ctx: &SubchainContext) {
        let finished = ctx.process.lock().take_finished();
        for (position, handle) in finished {
            let outcome = match handle.await {
                Ok(Ok(block)) if block.block_hash() == position.hash => Ok(block),
                Ok(Ok(block)) => Err(anyhow::anyhow!("got block {}", block.block_hash())),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(e.into()),
            };
            let mut queue = ctx.process.lock();
            match outcome {
                Ok(block) => queue.ready(position, block),
                Err(e) => {
                    tracing::warn!(subchain = %ctx.id, %position, "block download failed: {e:#}");
                    queue.retry(position);
                }
            }
        }
    }
}

#[async_trait]
impl Job for ProcessJob {
    fn kind(&self) -> JobType {
        JobType::Process
    }

    async fn work(&mut self, ctx: &SubchainContext, work: Work) -> anyhow::Result<()> {
        match work {
            Work::Dirty(positions) => {
                let added = ctx.process.lock().enqueue(positions);
                tracing::trace!(subchain = %ctx.id, added, "dirty blocks queued");
            }
            Work::Mempool(tx) => self.handle_transaction(ctx, tx).await?,
            Work::Confirmed(position, txids) => {
                for txid in txids {
                    self.txids.insert(txid, position.height);
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn state_machine(&mut self, ctx: &SubchainContext) -> anyhow::Result<bool> {
        if !self.bootstrapped {
            self.bootstrapped = true;
            if let Err(e) = self.bootstrap_mempool(ctx).await {
                tracing::warn!(subchain = %ctx.id, "mempool bootstrap failed: {e:#}");
            }
        }

        self.start_downloads(ctx);
        self.collect_downloads(ctx).await;

        loop {
            let next = ctx.process.lock().pop_ready();
            let Some((position, block)) = next else { break };
            let block = Arc::new(block);
            match process_block(ctx, position, block.clone()).await {
                Ok(found) => {
                    for m in &found {
                        self.txids.insert(m.txid(), position.height);
                    }
                }
                Err(e) => {
                    tracing::warn!(subchain = %ctx.id, %position, "block processing failed: {e:#}");
                    ctx.process.lock().retry(position);
                    break;
                }
            }
        }

        Ok(!ctx.process.lock().is_empty())
    }

    async fn process_reorg(&mut self, ctx: &SubchainContext, ancestor: Position) -> usize {
        let dropped = ctx.process.lock().reorg(ancestor);
        self.txids.forget_above(ancestor.height);
        tracing::debug!(subchain = %ctx.id, %ancestor, dropped, "process queue rewound");
        0
    }

    async fn shutdown(&mut self, ctx: &SubchainContext) {
        ctx.process.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::{hashes::Hash, BlockHash};

    fn pos(height: u32) -> Position {
        Position::new(height, BlockHash::from_byte_array([height as u8; 32]))
    }

    fn block() -> Block {
        bitcoin::constants::genesis_block(bitcoin::Network::Regtest)
    }

    #[test]
    fn queue_respects_limit_and_dedups() {
        let mut q = ProcessQueue::default();
        assert_eq!(q.enqueue([pos(3), pos(1), pos(2), pos(1)]), 3);
        assert_eq!(q.next_download(2), Some(pos(1)));
        assert_eq!(q.positions(), vec![pos(2), pos(3)]);
    }

    #[tokio::test]
    async fn ready_blocks_leave_in_height_order() {
        let mut q = ProcessQueue::default();
        q.enqueue([pos(4), pos(5)]);
        assert_eq!(q.next_download(2), Some(pos(4)));
        assert_eq!(q.next_download(2), Some(pos(5)));
        q.start(pos(4), tokio::spawn(std::future::pending::<anyhow::Result<Block>>()));
        q.ready(pos(5), block());
        assert!(q.pop_ready().is_none(), "5 must wait for 4");

        if let Some(handle) = q.downloading.remove(&pos(4)) {
            handle.abort();
        }
        q.ready(pos(4), block());
        assert_eq!(q.pop_ready().map(|(p, _)| p), Some(pos(4)));
        assert_eq!(q.pop_ready().map(|(p, _)| p), Some(pos(5)));
    }

    #[test]
    fn lower_position_starts_past_the_limit() {
        let mut q = ProcessQueue::default();
        q.ready(pos(8), block());
        q.ready(pos(9), block());
        q.enqueue([pos(3), pos(10)]);
        assert_eq!(q.next_download(2), Some(pos(3)));
        assert_eq!(q.next_download(2), None);
    }

    #[test]
    fn txid_cache_evicts_and_rewinds() {
        let mut cache = TxidCache::new(2);
        let a = Txid::from_byte_array([1; 32]);
        let b = Txid::from_byte_array([2; 32]);
        let c = Txid::from_byte_array([3; 32]);
        cache.insert(a, 10);
        cache.insert(b, 11);
        cache.insert(c, 12);
        assert!(!cache.contains(&a));
        assert!(cache.contains(&b) && cache.contains(&c));
        cache.forget_above(11);
        assert!(cache.contains(&b));
        assert!(!cache.contains(&c));
    }
}
