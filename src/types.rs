//! Small value types shared by every layer: block positions, subchain
//! identities, filter types and job names.
use std::{fmt, str::FromStr};

use bitcoin::{hashes::Hash, BlockHash};

/// Index of a derived key within its subchain (BIP32 child number).
pub type ElementIndex = u32;

/// A block on some chain: `(height, hash)`.
///
/// Ordered by height first, so `BTreeMap<Position, _>` iterates in chain order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Position {
    /// Block height.
    pub height: u32,
    /// Block hash at that height.
    pub hash: BlockHash,
}

impl Position {
    /// Create a position.
    pub fn new(height: u32, hash: BlockHash) -> Self {
        Self { height, hash }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.height, self.hash)
    }
}

/// Opaque 32-byte wallet subaccount identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubaccountId(pub [u8; 32]);

impl fmt::Display for SubaccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for SubaccountId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        let id: [u8; 32] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| anyhow::anyhow!("subaccount id must be 32 bytes, got {}", v.len()))?;
        Ok(Self(id))
    }
}

/// Derivation direction within a subaccount.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Subchain {
    /// Receive addresses.
    External,
    /// Change addresses.
    Internal,
    /// Payment-code incoming channel.
    Incoming,
    /// Payment-code outgoing channel.
    Outgoing,
    /// Payment-code notification keys.
    Notification,
}

impl Subchain {
    /// Stable lowercase name used in logs and persistence keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::External => "external",
            Self::Internal => "internal",
            Self::Incoming => "incoming",
            Self::Outgoing => "outgoing",
            Self::Notification => "notification",
        }
    }
}

impl fmt::Display for Subchain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compact filter flavour a subchain is scanned with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FilterType {
    /// BIP158 basic filter: whole output scripts and spent-output scripts.
    #[default]
    Basic,
    /// Extended filter: script data pushes and spent outpoints.
    Es,
}

impl FilterType {
    /// Golomb-Rice parameter `P`.
    pub fn bits(&self) -> u8 {
        match self {
            Self::Basic => 19,
            Self::Es => 23,
        }
    }

    /// False-positive parameter `M`.
    pub fn fp_rate(&self) -> u32 {
        match self {
            Self::Basic => 784_931,
            Self::Es => 12_558_895,
        }
    }

    /// SipHash key for the filter of `block`: the first 16 bytes of its hash.
    pub fn key(&self, block: &BlockHash) -> [u8; 16] {
        let mut key = [0u8; 16];
        key.copy_from_slice(&block.as_byte_array()[..16]);
        key
    }

    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Es => "es",
        }
    }
}

impl fmt::Display for FilterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one scanned subchain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubchainId {
    /// Owning subaccount.
    pub subaccount: SubaccountId,
    /// Derivation direction.
    pub subchain: Subchain,
    /// Filter type used to scan it.
    pub filter_type: FilterType,
}

impl SubchainId {
    /// Create a subchain id.
    pub fn new(subaccount: SubaccountId, subchain: Subchain, filter_type: FilterType) -> Self {
        Self {
            subaccount,
            subchain,
            filter_type,
        }
    }

    /// Key under which the database stores this subchain's rows.
    pub fn db_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for SubchainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.subaccount, self.subchain, self.filter_type)
    }
}

/// Monotonically increasing reorg identifier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateSequence(pub u64);

impl StateSequence {
    /// The id following this one.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for StateSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The five cooperating jobs owned by a subchain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum JobType {
    /// Forward filter scanning.
    Scan,
    /// Block download and exact matching.
    Process,
    /// Key → pattern indexing.
    Index,
    /// Re-testing historical positions.
    Rescan,
    /// Watermark persistence and reporting.
    Progress,
}

impl JobType {
    /// Every job, in start-up order.
    pub const ALL: [JobType; 5] = [
        JobType::Scan,
        JobType::Process,
        JobType::Index,
        JobType::Rescan,
        JobType::Progress,
    ];

    /// Lowercase job name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scan => "scan",
            Self::Process => "process",
            Self::Index => "index",
            Self::Rescan => "rescan",
            Self::Progress => "progress",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
