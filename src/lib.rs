#![forbid(unsafe_code)]
#![deny(missing_docs)]
//! niebla-sync: a compact-filter (GCS) scanning and matching engine for
//! multi-subaccount wallets.
//!
//! ## What you implement
//! - [`HeaderOracle`]: best-chain positions and reorg calculation.
//! - [`FilterOracle`] / [`BlockOracle`]: per-block filters and full blocks.
//! - [`Mempool`] (optional): unconfirmed transactions at startup.
//! - [`WalletDatabase`]: scan watermarks, patterns and wallet outputs
//!   ([`SqliteWalletDb`] is provided).
//! - [`WalletHooks`]: receive confirmed/unconfirmed matches and progress.
//!
//! ## What the engine does
//! - Keeps, per (subaccount, subchain, filter type), a set of cooperating jobs:
//!   **Scan** tests new filters, **Process** downloads probable hits and
//!   matches them exactly, **Index** turns keys into patterns, **Rescan**
//!   re-tests history for new targets and **Progress** persists the watermark.
//! - Freezes every job across every account during a reorg, rewinds caches to
//!   the common ancestor and replays deferred work afterwards.
//!
//! ## Minimal usage
//! ```rust,ignore
//! use niebla_sync::prelude::*;
//! use std::sync::Arc;
//!
//! async fn run(node: Node, hooks: Arc<dyn WalletHooks>) -> anyhow::Result<()> {
//!     let db = Arc::new(SqliteWalletDb::new("wallet.db")?);
//!     let config = SyncConfig::new(bitcoin::Network::Bitcoin).with_birth_height(840_000);
//!     let accounts = Accounts::new(config, node, db, hooks);
//!
//!     let subaccount: SubaccountId = "00".repeat(32).parse()?;
//!     accounts
//!         .add_subaccount(subaccount, &[Subchain::External, Subchain::Internal])
//!         .await?;
//!     accounts.add_keys(&subaccount, Subchain::External, vec![(0, my_pubkey())])?;
//!
//!     // later, when the header oracle reports a fork:
//!     let errors = accounts.reorg(ancestor).await?;
//!     assert_eq!(errors, 0);
//!     accounts.shutdown().await;
//!     Ok(())
//! }
//! ```
/// Account-level reorg fan-out.
pub mod account;

/// Immutable engine configuration.
pub mod config;

/// Wallet element cache and key → pattern derivation.
pub mod elements;

/// Error types.
pub mod error;

/// Traits for loading filters and blocks.
pub mod filter_source;

/// Golomb-coded set codec.
pub mod gcs;

/// Best-chain header lookups.
pub mod headers;

/// Wallet callbacks: receive matches and progress.
pub mod hooks;

/// Exact matching of transactions against wallet elements.
pub mod matcher;

/// Per-block filter match outcomes.
pub mod matches;

/// Unconfirmed transaction source.
pub mod mempool;

/// Bundle of consumed oracles.
pub mod node;

/// Batched, multi-threaded filter testing.
pub mod prehash;

/// Persistence layer (traits and SQLite implementation).
pub mod store;

/// Per-subchain orchestration and jobs.
pub mod subchain;

/// Shared value types.
pub mod types;

// Public re-exports
pub use account::{Account, AccountState, Accounts};
pub use config::{ChainParams, SyncConfig};
pub use error::{GcsError, SyncError};
pub use filter_source::{BlockOracle, FilterOracle};
pub use gcs::Gcs;
pub use headers::HeaderOracle;
pub use hooks::WalletHooks;
pub use matcher::TransactionMatch;
pub use mempool::Mempool;
pub use node::Node;
#[cfg(feature = "store-sqlite")]
pub use store::SqliteWalletDb;
pub use store::WalletDatabase;
pub use subchain::{SubchainState, SubchainStateData};
pub use types::{ElementIndex, FilterType, Position, StateSequence, SubaccountId, Subchain, SubchainId};

/// Convenience prelude for end users.
pub mod prelude {
    #[cfg(feature = "store-sqlite")]
    pub use crate::SqliteWalletDb;
    pub use crate::{
        Accounts, BlockOracle, FilterOracle, FilterType, HeaderOracle, Mempool, Node, Position,
        SubaccountId, Subchain, SubchainId, SyncConfig, TransactionMatch, WalletDatabase,
        WalletHooks,
    };
}
