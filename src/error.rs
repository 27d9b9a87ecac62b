//! Error types shared across the crate.
//!
//! Async collaborators (oracles, database, hooks) speak `anyhow::Result`; the
//! enums here are the typed failures the engine itself produces.
use crate::types::{JobType, SubaccountId, SubchainId};

/// Failures constructing or decoding a Golomb-coded set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GcsError {
    /// SipHash key must be exactly 16 bytes.
    #[error("invalid siphash key length: expected 16 bytes, got {0}")]
    InvalidKey(usize),
    /// Golomb parameter or false-positive rate out of range.
    #[error("invalid gcs parameters: bits={bits}, fp_rate={fp_rate}")]
    InvalidParameters {
        /// Golomb-Rice parameter `P`.
        bits: u8,
        /// False-positive parameter `M`.
        fp_rate: u32,
    },
    /// More distinct elements than a filter can count.
    #[error("too many elements for a gcs: {0}")]
    TooManyElements(usize),
    /// The hashed set handed to the encoder was not sorted.
    #[error("hashed set is not sorted")]
    Unsorted,
    /// Encoded body ended before `count` values were read.
    #[error("gcs body truncated after {decoded} of {expected} elements")]
    Truncated {
        /// Values successfully decoded.
        decoded: u32,
        /// Values announced by the element count.
        expected: u32,
    },
    /// Running sum of deltas overflowed 64 bits.
    #[error("gcs delta overflow")]
    Overflow,
    /// The CompactSize element count prefix could not be read.
    #[error("invalid gcs element count prefix: {0}")]
    InvalidCount(String),
}

/// Orchestration and protocol failures of the subchain machinery.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// A job's mailbox is closed (the job exited).
    #[error("{0} job is not running")]
    JobUnavailable(JobType),
    /// No account registered under this id.
    #[error("unknown subaccount {0}")]
    UnknownSubaccount(SubaccountId),
    /// Account exists but does not track this subchain.
    #[error("unknown subchain {0}")]
    UnknownSubchain(SubchainId),
    /// Subaccount registered twice.
    #[error("subaccount {0} already registered")]
    DuplicateSubaccount(SubaccountId),
    /// Operation requires a different orchestrator state.
    #[error("{operation} is not valid while {state}")]
    InvalidState {
        /// What was attempted.
        operation: &'static str,
        /// The state that rejected it.
        state: &'static str,
    },
    /// The orchestrator has been shut down.
    #[error("subchain {0} is shut down")]
    Shutdown(SubchainId),
}
