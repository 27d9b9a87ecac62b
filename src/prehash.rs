//! Prehash batch engine.
//!
//! Target byte strings are derived once per batch from the element snapshot.
//! Filters are keyed per block, so every block still needs its own SipHash
//! pass; blocks are spread over scoped worker threads by index modulo the
//! thread count, so each worker owns its output slots outright.
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    thread,
};

use bitcoin::{
    consensus::encode,
    hashes::Hash,
    opcodes::{
        all::{OP_CHECKSIG, OP_PUSHNUM_1},
        Opcode,
    },
    script::{Builder, PushBytes},
    PubkeyHash, ScriptBuf, ScriptHash, WPubkeyHash, WScriptHash,
};

use crate::{
    elements::{ElementKind, Elements, TargetId},
    gcs::Gcs,
    types::{FilterType, Position},
};

const BATCH_TARGET: f64 = 420_000.0;
const CFILTER_WEIGHT: f64 = 2.0;
const WALLET_WEIGHT: f64 = 1.0;
const MIN_BATCH: usize = 1;
const MAX_BATCH: usize = 10_000;
const ELEMENTS_PER_THREAD: usize = 512;

/// Blocks per worker thread that balance filter decoding against wallet size.
pub fn get_batch_size(cfilter_elements: usize, wallet_elements: usize) -> usize {
    let cost = CFILTER_WEIGHT * cfilter_elements as f64 + WALLET_WEIGHT * wallet_elements as f64;
    if cost <= 0.0 {
        return MAX_BATCH;
    }
    let size = (BATCH_TARGET / cost).floor();
    (size as usize).clamp(MIN_BATCH, MAX_BATCH)
}

/// Worker threads for a wallet of `elements` targets: `isqrt(elements / 512)`
/// clamped to `[1, hardware - 1]`.
pub fn choose_thread_count(elements: usize, hardware: usize) -> usize {
    let root = isqrt(elements / ELEMENTS_PER_THREAD);
    root.clamp(1, hardware.saturating_sub(1).max(1))
}

fn isqrt(n: usize) -> usize {
    if n < 2 {
        return n;
    }
    let mut x = n;
    let mut y = (x + 1) / 2;
    while y < x {
        x = y;
        y = (x + n / x) / 2;
    }
    x
}

fn script_basic(kind: ElementKind, data: &[u8]) -> Vec<ScriptBuf> {
    let push = |prefix: Option<Opcode>, suffix: Option<Opcode>| {
        let bytes: &PushBytes = <&PushBytes>::try_from(data).ok()?;
        let mut builder = Builder::new();
        if let Some(op) = prefix {
            builder = builder.push_opcode(op);
        }
        builder = builder.push_slice(bytes);
        if let Some(op) = suffix {
            builder = builder.push_opcode(op);
        }
        Some(builder.into_script())
    };
    match kind {
        ElementKind::Hash20 => {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(data);
            vec![
                ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array(hash)),
                ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array(hash)),
                ScriptBuf::new_p2sh(&ScriptHash::from_byte_array(hash)),
            ]
        }
        ElementKind::Hash32 => {
            let mut hash = [0u8; 32];
            hash.copy_from_slice(data);
            let mut out = vec![ScriptBuf::new_p2wsh(&WScriptHash::from_byte_array(hash))];
            out.extend(push(Some(OP_PUSHNUM_1), None));
            out
        }
        ElementKind::Key33 | ElementKind::Key65 => push(None, Some(OP_CHECKSIG)).into_iter().collect(),
        ElementKind::Key64 => Vec::new(),
    }
}

/// Filter element bytes for every target of a snapshot.
///
/// One target can have several byte forms (a 20-byte hash is a P2PKH, P2WPKH
/// or P2SH script under the basic filter); it matches if any form does.
#[derive(Clone, Debug, Default)]
pub struct Targets {
    forms: Vec<(TargetId, Vec<u8>)>,
    ids: BTreeSet<TargetId>,
}

impl Targets {
    /// Derive the forms `filter_type` commits to.
    pub fn new(filter_type: FilterType, elements: &Elements) -> Self {
        let mut forms = Vec::new();
        match filter_type {
            FilterType::Basic => {
                for (id, data) in elements.patterns() {
                    if let TargetId::Element(kind, _) = id {
                        for script in script_basic(kind, data) {
                            forms.push((id, script.into_bytes()));
                        }
                    }
                }
            }
            FilterType::Es => {
                forms.extend(elements.patterns().map(|(id, data)| (id, data.to_vec())));
                forms.extend(
                    elements
                        .txos
                        .iter()
                        .map(|(op, _)| (TargetId::Txo(*op), encode::serialize(op))),
                );
            }
        }
        let ids = forms.iter().map(|(id, _)| *id).collect();
        Self { forms, ids }
    }

    /// Targets with at least one filter form.
    pub fn ids(&self) -> &BTreeSet<TargetId> {
        &self.ids
    }

    /// Number of byte forms.
    pub fn len(&self) -> usize {
        self.forms.len()
    }

    /// No testable targets.
    pub fn is_empty(&self) -> bool {
        self.forms.is_empty()
    }

    fn forms_for<'a>(
        &'a self,
        restrict: Option<&'a BTreeSet<TargetId>>,
    ) -> impl Iterator<Item = &'a (TargetId, Vec<u8>)> + 'a {
        self.forms
            .iter()
            .filter(move |(id, _)| restrict.map_or(true, |r| r.contains(id)))
    }
}

/// One block to test.
#[derive(Clone, Debug)]
pub struct BlockTest {
    /// Block the filter belongs to.
    pub position: Position,
    /// Its filter.
    pub filter: Arc<Gcs>,
    /// Only test these targets; `None` tests every target.
    pub restrict: Option<BTreeSet<TargetId>>,
}

/// Outcome of testing one block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockResult {
    /// Block tested.
    pub position: Position,
    /// Targets that were actually tested.
    pub tested: Vec<TargetId>,
    /// Targets the filter probably contains.
    pub matched: BTreeSet<TargetId>,
}

fn test_block(targets: &Targets, block: &BlockTest) -> BlockResult {
    let forms: Vec<&(TargetId, Vec<u8>)> = targets.forms_for(block.restrict.as_ref()).collect();
    let hashes: Vec<u64> = forms
        .iter()
        .map(|(_, bytes)| block.filter.hash_element(bytes))
        .collect();
    let matched = block
        .filter
        .match_hashes(&hashes)
        .into_iter()
        .map(|i| forms[i].0)
        .collect();
    let tested = forms
        .iter()
        .map(|(id, _)| *id)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    BlockResult {
        position: block.position,
        tested,
        matched,
    }
}

/// Test every block of a batch against `targets` on `threads` scoped workers.
/// Results come back in input order.
pub fn match_batch(targets: &Targets, blocks: &[BlockTest], threads: usize) -> Vec<BlockResult> {
    let threads = threads.clamp(1, blocks.len().max(1));
    if threads == 1 {
        return blocks.iter().map(|b| test_block(targets, b)).collect();
    }

    let mut slots: BTreeMap<usize, BlockResult> = BTreeMap::new();
    thread::scope(|scope| {
        let workers: Vec<_> = (0..threads)
            .map(|worker| {
                scope.spawn(move || {
                    blocks
                        .iter()
                        .enumerate()
                        .filter(|(i, _)| i % threads == worker)
                        .map(|(i, block)| (i, test_block(targets, block)))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        for handle in workers {
            match handle.join() {
                Ok(results) => slots.extend(results),
                Err(_) => tracing::error!("prehash worker panicked"),
            }
        }
    });

    // A panicked worker leaves holes; those blocks are re-tested inline so
    // no block is ever reported without a result.
    blocks
        .iter()
        .enumerate()
        .map(|(i, block)| slots.remove(&i).unwrap_or_else(|| test_block(targets, block)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elements::ElementCache;
    use bitcoin::BlockHash;

    #[test]
    fn batch_size_boundaries() {
        assert_eq!(get_batch_size(1, 1), 10_000);
        assert_eq!(get_batch_size(1_000, 40_000), 10);
        assert_eq!(get_batch_size(0, 0), 10_000);
        assert_eq!(get_batch_size(1_000_000, 1_000_000), 1);
        assert_eq!(get_batch_size(100, 1_000), 350);
    }

    #[test]
    fn thread_count_table() {
        let table = [
            (0, 4, 1),
            (511, 4, 1),
            (2_048, 8, 2),
            (8_192, 4, 3),
            (8_192, 16, 4),
            (1 << 20, 64, 45),
            (1 << 20, 1, 1),
            (1 << 20, 0, 1),
        ];
        for (elements, hardware, expected) in table {
            assert_eq!(
                choose_thread_count(elements, hardware),
                expected,
                "elements={elements} hardware={hardware}"
            );
        }
    }

    #[test]
    fn basic_forms_cover_script_templates() {
        let mut cache = ElementCache::new();
        cache.add_patterns(0, vec![vec![1u8; 20], vec![2u8; 32], vec![3u8; 33], vec![4u8; 64]]);
        let targets = Targets::new(FilterType::Basic, &cache.elements());
        // 3 scripts for the hash160, 2 for the 32-byte hash, 1 P2PK, none for 64
        assert_eq!(targets.len(), 6);
        assert_eq!(targets.ids().len(), 3);

        let es = Targets::new(FilterType::Es, &cache.elements());
        assert_eq!(es.len(), 4);
    }

    #[test]
    fn threaded_batch_matches_sequential() {
        let mut cache = ElementCache::new();
        for i in 0..16u32 {
            cache.add_patterns(i, vec![vec![i as u8 + 1; 20]]);
        }
        let targets = Targets::new(FilterType::Basic, &cache.elements());
        let blocks: Vec<BlockTest> = (0..9u32)
            .map(|h| {
                let hash = BlockHash::from_byte_array([h as u8; 32]);
                let wallet = ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([h as u8 + 1; 20]));
                let decoy = vec![0xee; 25];
                let filter = Gcs::new(
                    FilterType::Basic.bits(),
                    FilterType::Basic.fp_rate(),
                    &FilterType::Basic.key(&hash),
                    &[wallet.into_bytes(), decoy],
                )
                .unwrap();
                BlockTest {
                    position: Position::new(h, hash),
                    filter: Arc::new(filter),
                    restrict: None,
                }
            })
            .collect();

        let sequential = match_batch(&targets, &blocks, 1);
        let threaded = match_batch(&targets, &blocks, 3);
        assert_eq!(sequential, threaded);
        for (h, result) in threaded.iter().enumerate() {
            assert!(result
                .matched
                .contains(&TargetId::Element(ElementKind::Hash20, h as u32)));
            assert_eq!(result.tested.len(), 16);
        }
    }
}
