//! In-memory collaborators shared by the integration tests.
#![allow(dead_code)]

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use bitcoin::{
    absolute::LockTime,
    block::{Header, Version as BlockVersion},
    hashes::{sha256, Hash},
    secp256k1::{Secp256k1, SecretKey},
    transaction::Version,
    Amount, Block, BlockHash, CompactTarget, OutPoint, PublicKey, ScriptBuf, Sequence,
    Transaction, TxIn, TxMerkleNode, TxOut, Txid, WPubkeyHash, Witness,
};
use niebla_sync::{
    elements::Txo, gcs::block_filter, BlockOracle, ElementIndex, FilterOracle, FilterType, Gcs,
    HeaderOracle, Mempool, Node, Position, SubaccountId, SubchainId, SyncConfig,
    TransactionMatch, WalletDatabase, WalletHooks,
};

pub fn test_config() -> SyncConfig {
    SyncConfig::new(bitcoin::Network::Regtest)
        .with_intervals(Duration::from_millis(5), Duration::from_millis(25))
        .with_max_threads(2)
}

pub fn subaccount(seed: u8) -> SubaccountId {
    SubaccountId([seed; 32])
}

pub fn wallet_key(seed: u8) -> PublicKey {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(&[seed; 32]).unwrap();
    PublicKey::new(bitcoin::secp256k1::PublicKey::from_secret_key(&secp, &sk))
}

pub fn p2wpkh(key: &PublicKey) -> ScriptBuf {
    ScriptBuf::new_p2wpkh(&key.wpubkey_hash().unwrap())
}

/// A P2WPKH script nobody in the tests owns.
pub fn decoy_script(tag: u64) -> ScriptBuf {
    let digest = sha256::Hash::hash(&tag.to_le_bytes()).to_byte_array();
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&digest[..20]);
    ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array(hash))
}

pub fn spend(outpoint: OutPoint, outputs: Vec<ScriptBuf>) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: outputs
            .into_iter()
            .map(|script_pubkey| TxOut {
                value: Amount::from_sat(1_000),
                script_pubkey,
            })
            .collect(),
    }
}

struct ChainState {
    best: Vec<Block>,
    known: HashMap<BlockHash, (u32, Block)>,
    filters: HashMap<(FilterType, BlockHash), Gcs>,
    coins: HashMap<OutPoint, ScriptBuf>,
    downloads_enabled: bool,
    salt: u64,
}

/// A regtest-like chain serving headers, filters and blocks from memory.
pub struct MockChain {
    state: Mutex<ChainState>,
}

impl MockChain {
    /// Genesis plus `blocks` coinbase-only blocks.
    pub fn new(blocks: u32) -> Arc<Self> {
        let chain = Arc::new(Self {
            state: Mutex::new(ChainState {
                best: Vec::new(),
                known: HashMap::new(),
                filters: HashMap::new(),
                coins: HashMap::new(),
                downloads_enabled: true,
                salt: 0,
            }),
        });
        chain.mine(Vec::new());
        chain.mine_empty(blocks);
        chain
    }

    pub fn node(self: &Arc<Self>) -> Node {
        Node::new(self.clone(), self.clone(), self.clone())
    }

    /// Append a block holding a coinbase plus `txs`.
    pub fn mine(&self, txs: Vec<Transaction>) -> Position {
        let mut state = self.state.lock().unwrap();
        let height = state.best.len() as u32;
        state.salt += 1;
        let salt = state.salt;
        let prev = state
            .best
            .last()
            .map(|b| b.block_hash())
            .unwrap_or_else(BlockHash::all_zeros);

        let mut tag = height.to_le_bytes().to_vec();
        tag.extend_from_slice(&salt.to_le_bytes());
        let coinbase = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::from_bytes(tag),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(50_000),
                script_pubkey: decoy_script(1_000_000 + salt),
            }],
        };
        let mut txdata = vec![coinbase];
        txdata.extend(txs);
        let mut block = Block {
            header: Header {
                version: BlockVersion::ONE,
                prev_blockhash: prev,
                merkle_root: TxMerkleNode::all_zeros(),
                time: 1_700_000_000 + height,
                bits: CompactTarget::from_consensus(0x207f_ffff),
                nonce: salt as u32,
            },
            txdata,
        };
        block.header.merkle_root = block.compute_merkle_root().unwrap();

        for tx in &block.txdata {
            let txid = tx.compute_txid();
            for (vout, out) in tx.output.iter().enumerate() {
                state.coins.insert(
                    OutPoint {
                        txid,
                        vout: vout as u32,
                    },
                    out.script_pubkey.clone(),
                );
            }
        }
        let coins = state.coins.clone();
        let hash = block.block_hash();
        for filter_type in [FilterType::Basic, FilterType::Es] {
            let filter = block_filter(filter_type, &block, |op| {
                coins
                    .get(op)
                    .cloned()
                    .ok_or_else(|| anyhow::anyhow!("unknown coin {op}"))
            })
            .unwrap();
            state.filters.insert((filter_type, hash), filter);
        }
        state.known.insert(hash, (height, block.clone()));
        state.best.push(block);
        Position::new(height, hash)
    }

    pub fn mine_empty(&self, count: u32) -> Position {
        let mut last = self.tip();
        for _ in 0..count {
            last = self.mine(Vec::new());
        }
        last
    }

    /// Drop the best chain above `ancestor`; the old blocks stay known.
    pub fn rewind(&self, ancestor: u32) {
        let mut state = self.state.lock().unwrap();
        state.best.truncate(ancestor as usize + 1);
    }

    pub fn tip(&self) -> Position {
        self.position(self.height()).unwrap()
    }

    pub fn height(&self) -> u32 {
        self.state.lock().unwrap().best.len() as u32 - 1
    }

    pub fn position(&self, height: u32) -> Option<Position> {
        let state = self.state.lock().unwrap();
        state
            .best
            .get(height as usize)
            .map(|b| Position::new(height, b.block_hash()))
    }

    pub fn block(&self, height: u32) -> Block {
        self.state.lock().unwrap().best[height as usize].clone()
    }

    pub fn coinbase_outpoint(&self, height: u32) -> OutPoint {
        let state = self.state.lock().unwrap();
        OutPoint {
            txid: state.best[height as usize].txdata[0].compute_txid(),
            vout: 0,
        }
    }

    pub fn set_downloads(&self, enabled: bool) {
        self.state.lock().unwrap().downloads_enabled = enabled;
    }
}

#[async_trait]
impl HeaderOracle for MockChain {
    async fn best_tip(&self) -> anyhow::Result<Position> {
        Ok(self.tip())
    }

    async fn best_hashes(&self, start_height: u32, count: usize) -> anyhow::Result<Vec<BlockHash>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .best
            .iter()
            .skip(start_height as usize)
            .take(count)
            .map(Block::block_hash)
            .collect())
    }

    async fn get_position(&self, height: u32) -> anyhow::Result<Option<Position>> {
        Ok(self.position(height))
    }

    async fn calculate_reorg(&self, tip: Position) -> anyhow::Result<Vec<Position>> {
        let state = self.state.lock().unwrap();
        let mut out = Vec::new();
        let mut cursor = tip.hash;
        loop {
            let Some((height, block)) = state.known.get(&cursor) else {
                anyhow::bail!("unknown block {cursor}");
            };
            let on_best = state
                .best
                .get(*height as usize)
                .is_some_and(|b| b.block_hash() == cursor);
            if on_best {
                return Ok(out);
            }
            out.push(Position::new(*height, cursor));
            cursor = block.header.prev_blockhash;
        }
    }
}

#[async_trait]
impl FilterOracle for MockChain {
    async fn load_filter(&self, filter_type: FilterType, block: BlockHash) -> anyhow::Result<Option<Gcs>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .filters
            .get(&(filter_type, block))
            .cloned())
    }

    async fn filter_tip(&self, _filter_type: FilterType) -> anyhow::Result<Position> {
        Ok(self.tip())
    }
}

#[async_trait]
impl BlockOracle for MockChain {
    async fn load_block(&self, block: BlockHash) -> anyhow::Result<Block> {
        let state = self.state.lock().unwrap();
        if !state.downloads_enabled {
            anyhow::bail!("downloads paused");
        }
        state
            .known
            .get(&block)
            .map(|(_, b)| b.clone())
            .ok_or_else(|| anyhow::anyhow!("unknown block {block}"))
    }
}

/// Serves blocks from a [`MockChain`], holding one of them back for `delay`.
pub struct SlowBlocks {
    pub chain: Arc<MockChain>,
    pub slow: BlockHash,
    pub delay: Duration,
}

#[async_trait]
impl BlockOracle for SlowBlocks {
    async fn load_block(&self, block: BlockHash) -> anyhow::Result<Block> {
        if block == self.slow {
            tokio::time::sleep(self.delay).await;
        }
        self.chain.load_block(block).await
    }
}

/// Headers from a [`MockChain`]; walking the chain from `stuck` fails while
/// the gate is closed.
pub struct GatedHeaders {
    pub chain: Arc<MockChain>,
    pub stuck: u32,
    pub open: AtomicBool,
}

impl GatedHeaders {
    pub fn new(chain: Arc<MockChain>, stuck: u32) -> Arc<Self> {
        Arc::new(Self {
            chain,
            stuck,
            open: AtomicBool::new(false),
        })
    }

    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl HeaderOracle for GatedHeaders {
    async fn best_tip(&self) -> anyhow::Result<Position> {
        self.chain.best_tip().await
    }

    async fn best_hashes(&self, start_height: u32, count: usize) -> anyhow::Result<Vec<BlockHash>> {
        self.chain.best_hashes(start_height, count).await
    }

    async fn get_position(&self, height: u32) -> anyhow::Result<Option<Position>> {
        self.chain.get_position(height).await
    }

    async fn best_chain(&self, from: Position, limit: usize) -> anyhow::Result<Vec<Position>> {
        if from.height == self.stuck && !self.open.load(Ordering::SeqCst) {
            anyhow::bail!("headers unavailable from {}", from.height);
        }
        self.chain.best_chain(from, limit).await
    }

    async fn calculate_reorg(&self, tip: Position) -> anyhow::Result<Vec<Position>> {
        self.chain.calculate_reorg(tip).await
    }
}

/// A fixed set of unconfirmed transactions.
pub struct StaticMempool(pub Vec<Transaction>);

#[async_trait]
impl Mempool for StaticMempool {
    async fn dump(&self) -> anyhow::Result<Vec<Txid>> {
        Ok(self.0.iter().map(Transaction::compute_txid).collect())
    }

    async fn query(&self, txid: Txid) -> anyhow::Result<Option<Transaction>> {
        Ok(self.0.iter().find(|tx| tx.compute_txid() == txid).cloned())
    }
}

#[derive(Clone, Debug)]
struct StoredOutput {
    txo: Txo,
    spent: Option<u32>,
}

#[derive(Default)]
struct DbState {
    last_scanned: HashMap<SubchainId, Position>,
    patterns: HashMap<SubchainId, BTreeMap<(ElementIndex, Vec<u8>), ()>>,
    outputs: HashMap<SubchainId, BTreeMap<OutPoint, StoredOutput>>,
    reorgs: Vec<(SubchainId, Position)>,
}

/// Minimal in-memory wallet database.
#[derive(Default)]
pub struct MemDb {
    state: Mutex<DbState>,
}

impl MemDb {
    pub fn last_scanned(&self, id: &SubchainId) -> Option<Position> {
        self.state.lock().unwrap().last_scanned.get(id).copied()
    }

    pub fn unspent(&self, id: &SubchainId) -> Vec<OutPoint> {
        let state = self.state.lock().unwrap();
        state
            .outputs
            .get(id)
            .map(|o| {
                o.iter()
                    .filter(|(_, s)| s.spent.is_none())
                    .map(|(op, _)| *op)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn reorgs(&self) -> Vec<(SubchainId, Position)> {
        self.state.lock().unwrap().reorgs.clone()
    }
}

#[async_trait]
impl WalletDatabase for MemDb {
    async fn subchain_last_scanned(&self, subchain: &SubchainId) -> anyhow::Result<Option<Position>> {
        Ok(self.last_scanned(subchain))
    }

    async fn set_subchain_last_scanned(&self, subchain: &SubchainId, position: Position) -> anyhow::Result<()> {
        self.state.lock().unwrap().last_scanned.insert(*subchain, position);
        Ok(())
    }

    async fn get_patterns(&self, subchain: &SubchainId) -> anyhow::Result<Vec<(ElementIndex, Vec<u8>)>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .patterns
            .get(subchain)
            .map(|p| p.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn add_patterns(&self, subchain: &SubchainId, patterns: &[(ElementIndex, Vec<u8>)]) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        let entry = state.patterns.entry(*subchain).or_default();
        for row in patterns {
            entry.insert(row.clone(), ());
        }
        Ok(())
    }

    async fn get_unspent_outputs(&self, subchain: &SubchainId) -> anyhow::Result<Vec<(OutPoint, Txo)>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .outputs
            .get(subchain)
            .map(|o| {
                o.iter()
                    .filter(|(_, s)| s.spent.is_none())
                    .map(|(op, s)| (*op, s.txo))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn add_confirmed_transactions(
        &self,
        subchain: &SubchainId,
        position: Position,
        matches: &[TransactionMatch],
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        let outputs = state.outputs.entry(*subchain).or_default();
        for m in matches {
            let txid = m.txid();
            for output in &m.outputs {
                if let Some(index) = output.owner() {
                    outputs
                        .entry(OutPoint {
                            txid,
                            vout: output.vout,
                        })
                        .or_insert(StoredOutput {
                            txo: Txo {
                                index,
                                height: position.height,
                            },
                            spent: None,
                        });
                }
            }
            for spend in &m.spends {
                if let Some(stored) = outputs.get_mut(&spend.outpoint) {
                    stored.spent.get_or_insert(position.height);
                }
            }
        }
        Ok(())
    }

    async fn reorg_to(&self, subchain: &SubchainId, ancestor: Position) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.reorgs.push((*subchain, ancestor));
        if let Some(outputs) = state.outputs.get_mut(subchain) {
            outputs.retain(|_, s| s.txo.height <= ancestor.height);
            for stored in outputs.values_mut() {
                if stored.spent.is_some_and(|h| h > ancestor.height) {
                    stored.spent = None;
                }
            }
        }
        if let Some(last) = state.last_scanned.get_mut(subchain) {
            if last.height > ancestor.height {
                *last = ancestor;
            }
        }
        Ok(())
    }
}

/// Hooks that record everything they are told.
#[derive(Default)]
pub struct RecordingHooks {
    blocks: Mutex<Vec<(SubchainId, Position, Vec<TransactionMatch>)>>,
    mempool: Mutex<Vec<(SubchainId, TransactionMatch)>>,
    progress: Mutex<Vec<(SubchainId, Position)>>,
}

impl RecordingHooks {
    pub fn block_matches(&self) -> Vec<(SubchainId, Position, Vec<TransactionMatch>)> {
        self.blocks.lock().unwrap().clone()
    }

    pub fn mempool_matches(&self) -> Vec<(SubchainId, TransactionMatch)> {
        self.mempool.lock().unwrap().clone()
    }

    pub fn progress(&self) -> Vec<(SubchainId, Position)> {
        self.progress.lock().unwrap().clone()
    }
}

#[async_trait]
impl WalletHooks for RecordingHooks {
    async fn on_block_match(
        &self,
        subchain: SubchainId,
        position: Position,
        matches: Vec<TransactionMatch>,
    ) -> anyhow::Result<()> {
        self.blocks.lock().unwrap().push((subchain, position, matches));
        Ok(())
    }

    async fn on_mempool_match(&self, subchain: SubchainId, found: TransactionMatch) -> anyhow::Result<()> {
        self.mempool.lock().unwrap().push((subchain, found));
        Ok(())
    }

    async fn on_scan_progress(&self, subchain: SubchainId, position: Position) -> anyhow::Result<()> {
        self.progress.lock().unwrap().push((subchain, position));
        Ok(())
    }
}

/// Poll `condition` until it holds; panics after ten seconds.
pub async fn wait_for<F: FnMut() -> bool>(what: &str, mut condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
