//! Immutable engine configuration.
//!
//! Chain-dependent constants live in [`ChainParams`], resolved once from the
//! network and carried inside [`SyncConfig`]; nothing reads a global table.
use std::time::Duration;

use bitcoin::Network;

use crate::types::FilterType;

/// Per-network constants.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainParams {
    /// Network these parameters describe.
    pub network: Network,
    /// Blocks requested per download round from the block oracle.
    pub block_download_batch: usize,
    /// Filter type scanned when the caller does not pick one.
    pub default_filter_type: FilterType,
}

impl ChainParams {
    /// Parameters for `network`.
    pub fn for_network(network: Network) -> Self {
        let block_download_batch = match network {
            Network::Bitcoin => 8,
            Network::Testnet | Network::Signet => 16,
            _ => 32,
        };
        Self {
            network,
            block_download_batch,
            default_filter_type: FilterType::Basic,
        }
    }
}

/// Everything a subchain needs to know that does not change at runtime.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Chain constants.
    pub chain: ChainParams,
    /// Filter type used for new subchains.
    pub filter_type: FilterType,
    /// First height that can contain wallet activity.
    pub birth_height: u32,
    /// Upper bound on blocks per scan batch.
    pub maximum_scan: usize,
    /// Blocks Scan may run ahead of an unfinished Rescan before pausing.
    pub scan_threshold: u32,
    /// Fast polling interval while a job has pending work.
    pub tick_interval: Duration,
    /// Idle polling interval (new filter tips, watchdog heartbeats).
    pub poll_interval: Duration,
    /// How often the watchdog inspects job activity.
    pub watchdog_interval: Duration,
    /// Inactivity after which a job is reported as stalled.
    pub watchdog_timeout: Duration,
    /// Capacity of the recently-confirmed txid cache.
    pub txid_cache_size: usize,
    /// Override for the detected hardware concurrency.
    pub max_threads: Option<usize>,
}

impl SyncConfig {
    /// Defaults for `network`.
    pub fn new(network: Network) -> Self {
        let chain = ChainParams::for_network(network);
        Self {
            filter_type: chain.default_filter_type,
            chain,
            birth_height: 0,
            maximum_scan: 1_000,
            scan_threshold: 1_000,
            tick_interval: Duration::from_millis(5),
            poll_interval: Duration::from_secs(1),
            watchdog_interval: Duration::from_secs(30),
            watchdog_timeout: Duration::from_secs(90),
            txid_cache_size: 10_000,
            max_threads: None,
        }
    }

    /// Scan subchains with `filter_type`.
    pub fn with_filter_type(mut self, filter_type: FilterType) -> Self {
        self.filter_type = filter_type;
        self
    }

    /// Skip history below `height`.
    pub fn with_birth_height(mut self, height: u32) -> Self {
        self.birth_height = height;
        self
    }

    /// Cap the number of blocks per scan batch.
    pub fn with_maximum_scan(mut self, blocks: usize) -> Self {
        self.maximum_scan = blocks.max(1);
        self
    }

    /// Blocks Scan may lead an unfinished Rescan by.
    pub fn with_scan_threshold(mut self, blocks: u32) -> Self {
        self.scan_threshold = blocks;
        self
    }

    /// Set both polling intervals.
    pub fn with_intervals(mut self, tick: Duration, poll: Duration) -> Self {
        self.tick_interval = tick;
        self.poll_interval = poll;
        self
    }

    /// Set watchdog cadence and stall threshold.
    pub fn with_watchdog(mut self, interval: Duration, timeout: Duration) -> Self {
        self.watchdog_interval = interval;
        self.watchdog_timeout = timeout;
        self
    }

    /// Pin the worker thread budget instead of asking the OS.
    pub fn with_max_threads(mut self, threads: usize) -> Self {
        self.max_threads = Some(threads.max(1));
        self
    }

    /// Maximum blocks waiting in the Process download pipeline.
    pub fn download_limit(&self) -> usize {
        2 * self.chain.block_download_batch
    }

    /// Hardware concurrency used by the thread-count heuristic.
    pub fn hardware_concurrency(&self) -> usize {
        self.max_threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new(Network::Bitcoin)
    }
}
