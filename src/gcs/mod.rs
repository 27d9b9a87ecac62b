//! Golomb-Rice coded sets (GCS) as used by BIP158-style compact block filters.
//!
//! A filter holds `N` elements hashed with SipHash-2-4 into `[0, N·M)`, sorted,
//! and stored as Golomb-Rice coded deltas with parameter `P`. Serialized form is
//! `CompactSize(N) || golomb bytes`, bit-compatible with BIP158 when `P = 19`,
//! `M = 784931` and the key is the first 16 bytes of the block hash.
//!
//! Filters are immutable; the decoded ("hashed") set is computed on first use
//! and cached, so a `Gcs` can be shared across threads freely.
mod golomb;

use std::{collections::BTreeSet, sync::OnceLock};

use bitcoin::{
    consensus::encode::{self, VarInt},
    hashes::siphash24,
    Block, OutPoint, ScriptBuf,
};

use crate::{
    elements::ElementKind, error::GcsError, matcher::script_elements, types::FilterType,
};

/// Map a 64-bit hash uniformly into `[0, range)` without division.
pub fn hash_to_range(range: u64, hash: u64) -> u64 {
    ((u128::from(hash) * u128::from(range)) >> 64) as u64
}

fn split_key(key: &[u8; 16]) -> (u64, u64) {
    let mut k0 = [0u8; 8];
    let mut k1 = [0u8; 8];
    k0.copy_from_slice(&key[..8]);
    k1.copy_from_slice(&key[8..]);
    (u64::from_le_bytes(k0), u64::from_le_bytes(k1))
}

fn check_params(bits: u8, fp_rate: u32, key: &[u8]) -> Result<[u8; 16], GcsError> {
    if bits == 0 || bits > 32 || fp_rate == 0 {
        return Err(GcsError::InvalidParameters { bits, fp_rate });
    }
    key.try_into().map_err(|_| GcsError::InvalidKey(key.len()))
}

/// One block's compact filter.
#[derive(Clone, Debug)]
pub struct Gcs {
    bits: u8,
    fp_rate: u32,
    key: [u8; 16],
    k0: u64,
    k1: u64,
    count: u32,
    compressed: Vec<u8>,
    hashed: OnceLock<Result<Vec<u64>, GcsError>>,
}

impl Gcs {
    /// Build a filter over the distinct byte strings in `elements`.
    pub fn new<T: AsRef<[u8]>>(
        bits: u8,
        fp_rate: u32,
        key: &[u8],
        elements: &[T],
    ) -> Result<Self, GcsError> {
        let key = check_params(bits, fp_rate, key)?;
        let unique: BTreeSet<&[u8]> = elements.iter().map(AsRef::as_ref).collect();
        let count =
            u32::try_from(unique.len()).map_err(|_| GcsError::TooManyElements(unique.len()))?;
        let (k0, k1) = split_key(&key);
        let range = u64::from(count) * u64::from(fp_rate);
        let mut hashed: Vec<u64> = unique
            .into_iter()
            .map(|e| hash_to_range(range, siphash24::Hash::hash_to_u64_with_keys(k0, k1, e)))
            .collect();
        hashed.sort_unstable();
        Self::from_hashed_set(bits, fp_rate, &key, hashed)
    }

    /// Build a filter from an already hashed, sorted set.
    pub fn from_hashed_set(
        bits: u8,
        fp_rate: u32,
        key: &[u8],
        hashed: Vec<u64>,
    ) -> Result<Self, GcsError> {
        let key = check_params(bits, fp_rate, key)?;
        let count =
            u32::try_from(hashed.len()).map_err(|_| GcsError::TooManyElements(hashed.len()))?;
        let compressed = golomb::encode_set(&hashed, bits)?;
        let (k0, k1) = split_key(&key);
        Ok(Self {
            bits,
            fp_rate,
            key,
            k0,
            k1,
            count,
            compressed,
            hashed: OnceLock::from(Ok(hashed)),
        })
    }

    /// Wrap a Golomb body whose element count is known out of band.
    pub fn from_compressed(
        bits: u8,
        fp_rate: u32,
        key: &[u8],
        count: u32,
        compressed: Vec<u8>,
    ) -> Result<Self, GcsError> {
        let key = check_params(bits, fp_rate, key)?;
        let (k0, k1) = split_key(&key);
        Ok(Self {
            bits,
            fp_rate,
            key,
            k0,
            k1,
            count,
            compressed,
            hashed: OnceLock::new(),
        })
    }

    /// Parse the serialized `CompactSize(N) || golomb bytes` form.
    pub fn decode(bits: u8, fp_rate: u32, key: &[u8], encoded: &[u8]) -> Result<Self, GcsError> {
        let (VarInt(n), used) = encode::deserialize_partial::<VarInt>(encoded)
            .map_err(|e| GcsError::InvalidCount(e.to_string()))?;
        let count = u32::try_from(n).map_err(|_| GcsError::TooManyElements(n as usize))?;
        Self::from_compressed(bits, fp_rate, key, count, encoded[used..].to_vec())
    }

    /// Parse a stored filter of `filter_type` for `block`.
    pub fn decode_for(
        filter_type: FilterType,
        block: &bitcoin::BlockHash,
        encoded: &[u8],
    ) -> Result<Self, GcsError> {
        Self::decode(
            filter_type.bits(),
            filter_type.fp_rate(),
            &filter_type.key(block),
            encoded,
        )
    }

    /// Serialized form: `CompactSize(N) || golomb bytes`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = encode::serialize(&VarInt(u64::from(self.count)));
        out.extend_from_slice(&self.compressed);
        out
    }

    /// Golomb body without the count prefix.
    pub fn compressed(&self) -> &[u8] {
        &self.compressed
    }

    /// Number of elements `N`.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Golomb-Rice parameter `P`.
    pub fn bits(&self) -> u8 {
        self.bits
    }

    /// False-positive parameter `M`.
    pub fn fp_rate(&self) -> u32 {
        self.fp_rate
    }

    /// SipHash key.
    pub fn key(&self) -> &[u8; 16] {
        &self.key
    }

    /// `N · M`, the hash range of this filter.
    pub fn range(&self) -> u64 {
        u64::from(self.count) * u64::from(self.fp_rate)
    }

    /// Membership hash of `element` for this filter.
    pub fn hash_element(&self, element: &[u8]) -> u64 {
        hash_to_range(
            self.range(),
            siphash24::Hash::hash_to_u64_with_keys(self.k0, self.k1, element),
        )
    }

    /// Sorted decoded set, decompressed once and cached.
    pub fn hashed_set(&self) -> Result<&[u64], GcsError> {
        let decoded = self
            .hashed
            .get_or_init(|| golomb::decode_set(&self.compressed, self.count, self.bits));
        match decoded {
            Ok(set) => Ok(set.as_slice()),
            Err(e) => Err(e.clone()),
        }
    }

    /// Indices of `hashes` (already mapped with [`Gcs::hash_element`]) found in
    /// the set, ascending.
    ///
    /// A body that fails to decode reports every index: the caller then fetches
    /// the block rather than trusting a broken filter.
    pub fn match_hashes(&self, hashes: &[u64]) -> Vec<usize> {
        let set = match self.hashed_set() {
            Ok(set) => set,
            Err(e) => {
                tracing::warn!(error = %e, "undecodable filter treated as matching everything");
                return (0..hashes.len()).collect();
            }
        };

        let mut order: Vec<usize> = (0..hashes.len()).collect();
        order.sort_unstable_by_key(|&i| hashes[i]);

        let mut out = Vec::new();
        let mut cursor = 0;
        for i in order {
            let wanted = hashes[i];
            while cursor < set.len() && set[cursor] < wanted {
                cursor += 1;
            }
            if cursor == set.len() {
                break;
            }
            if set[cursor] == wanted {
                out.push(i);
            }
        }
        out.sort_unstable();
        out
    }

    /// Targets probably present in the filter.
    pub fn matches<'a, T: AsRef<[u8]>>(&self, targets: &'a [T]) -> Vec<&'a T> {
        let hashes: Vec<u64> = targets
            .iter()
            .map(|t| self.hash_element(t.as_ref()))
            .collect();
        self.match_hashes(&hashes)
            .into_iter()
            .map(|i| &targets[i])
            .collect()
    }

    /// Whether `target` is probably present.
    pub fn test(&self, target: &[u8]) -> bool {
        !self.match_hashes(&[self.hash_element(target)]).is_empty()
    }
}

impl PartialEq for Gcs {
    fn eq(&self, other: &Self) -> bool {
        self.bits == other.bits
            && self.fp_rate == other.fp_rate
            && self.key == other.key
            && self.count == other.count
            && self.compressed == other.compressed
    }
}

impl Eq for Gcs {}

/// Elements a filter of `filter_type` commits to for `block`.
///
/// `script_for_coin` resolves the script of an output spent in the block; it
/// is only consulted for [`FilterType::Basic`].
pub fn block_elements<F>(
    filter_type: FilterType,
    block: &Block,
    mut script_for_coin: F,
) -> anyhow::Result<Vec<Vec<u8>>>
where
    F: FnMut(&OutPoint) -> anyhow::Result<ScriptBuf>,
{
    let mut elements = Vec::new();
    match filter_type {
        FilterType::Basic => {
            for tx in &block.txdata {
                for output in &tx.output {
                    if !output.script_pubkey.is_op_return() {
                        elements.push(output.script_pubkey.to_bytes());
                    }
                }
            }
            for tx in block.txdata.iter().skip(1) {
                for input in &tx.input {
                    elements.push(script_for_coin(&input.previous_output)?.to_bytes());
                }
            }
        }
        FilterType::Es => {
            for tx in &block.txdata {
                for output in &tx.output {
                    elements.extend(script_elements(&output.script_pubkey).map(<[u8]>::to_vec));
                }
            }
            for tx in block.txdata.iter().skip(1) {
                for input in &tx.input {
                    elements.push(encode::serialize(&input.previous_output));
                    elements.extend(script_elements(&input.script_sig).map(<[u8]>::to_vec));
                    elements.extend(
                        input
                            .witness
                            .iter()
                            .filter(|item| ElementKind::from_len(item.len()).is_some())
                            .map(<[u8]>::to_vec),
                    );
                }
            }
        }
    }
    elements.retain(|e| !e.is_empty());
    Ok(elements)
}

/// Construct the `filter_type` filter of `block`.
pub fn block_filter<F>(filter_type: FilterType, block: &Block, script_for_coin: F) -> anyhow::Result<Gcs>
where
    F: FnMut(&OutPoint) -> anyhow::Result<ScriptBuf>,
{
    let elements = block_elements(filter_type, block, script_for_coin)?;
    Ok(Gcs::new(
        filter_type.bits(),
        filter_type.fp_rate(),
        &filter_type.key(&block.block_hash()),
        &elements,
    )?)
}
