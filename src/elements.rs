//! Element Cache: the wallet-owned data a subchain scans for.
//!
//! Patterns are kept raw, grouped by length class (20/32/33/64/65 bytes), and
//! keyed by the index of the key that produced them. Unspent wallet outputs
//! (TXOs) are tracked alongside so spends can be recognised. Readers take a
//! cheap [`Elements`] snapshot; writers rebuild it.
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use bitcoin::{
    hashes::{hash160, Hash},
    key::TapTweak,
    secp256k1::Secp256k1,
    OutPoint, PublicKey, ScriptBuf, WPubkeyHash,
};

use crate::types::ElementIndex;

/// Length class of a raw wallet pattern.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ElementKind {
    /// HASH160 of a key or script.
    Hash20,
    /// SHA256 script hash or taproot output key.
    Hash32,
    /// Compressed public key.
    Key33,
    /// Uncompressed public key without its `0x04` prefix.
    Key64,
    /// Uncompressed public key.
    Key65,
}

impl ElementKind {
    /// Classify a pattern by its length.
    pub fn from_len(len: usize) -> Option<Self> {
        match len {
            20 => Some(Self::Hash20),
            32 => Some(Self::Hash32),
            33 => Some(Self::Key33),
            64 => Some(Self::Key64),
            65 => Some(Self::Key65),
            _ => None,
        }
    }

    /// Byte length of patterns of this kind.
    pub fn len(&self) -> usize {
        match self {
            Self::Hash20 => 20,
            Self::Hash32 => 32,
            Self::Key33 => 33,
            Self::Key64 => 64,
            Self::Key65 => 65,
        }
    }
}

/// One thing that can be tested against a filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TargetId {
    /// A raw pattern of `kind` owned by key `index`.
    Element(ElementKind, ElementIndex),
    /// A wallet output that may be spent.
    Txo(OutPoint),
}

/// A wallet output together with the key that owns it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Txo {
    /// Owning key.
    pub index: ElementIndex,
    /// Height of the block that created it.
    pub height: u32,
}

/// Immutable snapshot of a subchain's patterns and unspent outputs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Elements {
    /// 20-byte patterns.
    pub elements_20: Vec<(ElementIndex, [u8; 20])>,
    /// 32-byte patterns.
    pub elements_32: Vec<(ElementIndex, [u8; 32])>,
    /// 33-byte patterns.
    pub elements_33: Vec<(ElementIndex, [u8; 33])>,
    /// 64-byte patterns.
    pub elements_64: Vec<(ElementIndex, [u8; 64])>,
    /// 65-byte patterns.
    pub elements_65: Vec<(ElementIndex, [u8; 65])>,
    /// Unspent outputs and their owners.
    pub txos: Vec<(OutPoint, ElementIndex)>,
}

impl Elements {
    /// Total number of targets.
    pub fn len(&self) -> usize {
        self.elements_20.len()
            + self.elements_32.len()
            + self.elements_33.len()
            + self.elements_64.len()
            + self.elements_65.len()
            + self.txos.len()
    }

    /// No patterns and no outputs.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every raw pattern with its target id.
    pub fn patterns(&self) -> impl Iterator<Item = (TargetId, &[u8])> + '_ {
        let e20 = self
            .elements_20
            .iter()
            .map(|(i, d)| (TargetId::Element(ElementKind::Hash20, *i), &d[..]));
        let e32 = self
            .elements_32
            .iter()
            .map(|(i, d)| (TargetId::Element(ElementKind::Hash32, *i), &d[..]));
        let e33 = self
            .elements_33
            .iter()
            .map(|(i, d)| (TargetId::Element(ElementKind::Key33, *i), &d[..]));
        let e64 = self
            .elements_64
            .iter()
            .map(|(i, d)| (TargetId::Element(ElementKind::Key64, *i), &d[..]));
        let e65 = self
            .elements_65
            .iter()
            .map(|(i, d)| (TargetId::Element(ElementKind::Key65, *i), &d[..]));
        e20.chain(e32).chain(e33).chain(e64).chain(e65)
    }

    /// Every target id, patterns first.
    pub fn target_ids(&self) -> impl Iterator<Item = TargetId> + '_ {
        self.patterns()
            .map(|(id, _)| id)
            .chain(self.txos.iter().map(|(op, _)| TargetId::Txo(*op)))
    }
}

/// Mutable owner of a subchain's patterns and outputs.
#[derive(Debug, Default)]
pub struct ElementCache {
    patterns: BTreeMap<ElementIndex, BTreeSet<Vec<u8>>>,
    txos: BTreeMap<OutPoint, Txo>,
    snapshot: Arc<Elements>,
}

impl ElementCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot; cheap to clone and safe to hand to worker threads.
    pub fn elements(&self) -> Arc<Elements> {
        self.snapshot.clone()
    }

    /// Number of keys with at least one pattern.
    pub fn key_count(&self) -> usize {
        self.patterns.len()
    }

    /// Add patterns for `index`; lengths outside the five classes are ignored.
    /// Returns how many were new.
    pub fn add_patterns<I>(&mut self, index: ElementIndex, patterns: I) -> usize
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        self.extend_patterns(patterns.into_iter().map(|p| (index, p)))
    }

    /// Add `(index, pattern)` rows, rebuilding the snapshot once.
    pub fn extend_patterns<I>(&mut self, rows: I) -> usize
    where
        I: IntoIterator<Item = (ElementIndex, Vec<u8>)>,
    {
        let mut added = 0;
        for (index, pattern) in rows {
            if ElementKind::from_len(pattern.len()).is_none() {
                tracing::trace!(index, len = pattern.len(), "ignoring pattern of unknown length");
                continue;
            }
            if self.patterns.entry(index).or_default().insert(pattern) {
                added += 1;
            }
        }
        if added > 0 {
            self.rebuild();
        }
        added
    }

    /// Unspent wallet outputs.
    pub fn txos(&self) -> &BTreeMap<OutPoint, Txo> {
        &self.txos
    }

    /// Record a new wallet output.
    pub fn add_txo(&mut self, outpoint: OutPoint, txo: Txo) -> bool {
        let added = self.txos.insert(outpoint, txo).is_none();
        if added {
            self.rebuild();
        }
        added
    }

    /// Forget a spent output.
    pub fn spend_txo(&mut self, outpoint: &OutPoint) -> Option<Txo> {
        let removed = self.txos.remove(outpoint);
        if removed.is_some() {
            self.rebuild();
        }
        removed
    }

    /// Replace the whole output set (after reloading from the database).
    pub fn replace_txos<I>(&mut self, txos: I)
    where
        I: IntoIterator<Item = (OutPoint, Txo)>,
    {
        self.txos = txos.into_iter().collect();
        self.rebuild();
    }

    /// Drop outputs created above `height`. Returns how many went.
    pub fn forget_txos_above(&mut self, height: u32) -> usize {
        let before = self.txos.len();
        self.txos.retain(|_, txo| txo.height <= height);
        let removed = before - self.txos.len();
        if removed > 0 {
            self.rebuild();
        }
        removed
    }

    fn rebuild(&mut self) {
        let mut out = Elements::default();
        for (&index, patterns) in &self.patterns {
            for pattern in patterns {
                match ElementKind::from_len(pattern.len()) {
                    Some(ElementKind::Hash20) => out.elements_20.push((index, array(pattern))),
                    Some(ElementKind::Hash32) => out.elements_32.push((index, array(pattern))),
                    Some(ElementKind::Key33) => out.elements_33.push((index, array(pattern))),
                    Some(ElementKind::Key64) => out.elements_64.push((index, array(pattern))),
                    Some(ElementKind::Key65) => out.elements_65.push((index, array(pattern))),
                    None => {}
                }
            }
        }
        out.txos = self.txos.iter().map(|(op, txo)| (*op, txo.index)).collect();
        self.snapshot = Arc::new(out);
    }
}

fn array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

/// Raw patterns a key can appear as on chain.
///
/// Compressed keys yield the key, its HASH160 (P2PKH/P2WPKH), the HASH160 of
/// its P2WPKH script (P2SH-wrapped segwit) and its BIP86 taproot output key.
/// Uncompressed keys yield the key, its 64-byte body and its HASH160.
pub fn key_patterns(key: &PublicKey) -> Vec<Vec<u8>> {
    let pubkey_hash = key.pubkey_hash().to_byte_array();
    if key.compressed {
        let p2wpkh = ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array(pubkey_hash));
        let nested = hash160::Hash::hash(p2wpkh.as_bytes()).to_byte_array();
        let secp = Secp256k1::verification_only();
        let (internal, _) = key.inner.x_only_public_key();
        let (output_key, _) = internal.tap_tweak(&secp, None);
        vec![
            key.inner.serialize().to_vec(),
            pubkey_hash.to_vec(),
            nested.to_vec(),
            output_key.to_inner().serialize().to_vec(),
        ]
    } else {
        let full = key.inner.serialize_uncompressed();
        vec![full.to_vec(), full[1..].to_vec(), pubkey_hash.to_vec()]
    }
}
