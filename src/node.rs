//! Bundle of node-side collaborators handed to every subchain.
use std::sync::Arc;

use crate::{
    filter_source::{BlockOracle, FilterOracle},
    headers::HeaderOracle,
    mempool::Mempool,
};

/// Shared handles to the node's header, filter, block and mempool services.
#[derive(Clone)]
pub struct Node {
    /// Best-chain headers.
    pub headers: Arc<dyn HeaderOracle>,
    /// Compact filters.
    pub filters: Arc<dyn FilterOracle>,
    /// Full blocks.
    pub blocks: Arc<dyn BlockOracle>,
    /// Unconfirmed transactions, when the node relays them.
    pub mempool: Option<Arc<dyn Mempool>>,
}

impl Node {
    /// Bundle the required services.
    pub fn new(
        headers: Arc<dyn HeaderOracle>,
        filters: Arc<dyn FilterOracle>,
        blocks: Arc<dyn BlockOracle>,
    ) -> Self {
        Self {
            headers,
            filters,
            blocks,
            mempool: None,
        }
    }

    /// Attach a mempool.
    pub fn with_mempool(mut self, mempool: Arc<dyn Mempool>) -> Self {
        self.mempool = Some(mempool);
        self
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("mempool", &self.mempool.is_some())
            .finish_non_exhaustive()
    }
}
