//! Loaders for the L2 table and refcount block caches.

use super::tables::{L2Table, RefBlock};
use super::types::HostCluster;
use crate::async_lru_cache::CacheLoader;
use crate::backend::Backend;
use crate::error::Result;
use crate::misc_helpers::ResultErrorContext;
use std::sync::Arc;
use tracing::trace;

/// Reads L2 tables.
pub(crate) struct L2Loader<B: Backend> {
    backend: Arc<B>,
    cluster_bits: u32,
}

impl<B: Backend> L2Loader<B> {
    pub fn new(backend: Arc<B>, cluster_bits: u32) -> Self {
        L2Loader {
            backend,
            cluster_bits,
        }
    }
}

impl<B: Backend> CacheLoader for L2Loader<B> {
    type Key = HostCluster;
    type Value = L2Table;

    async fn load(&self, cluster: HostCluster) -> Result<L2Table> {
        trace!("Reading L2 table at {cluster}");
        L2Table::load(self.backend.as_ref(), cluster, self.cluster_bits)
            .await
            .err_context(|| format!("L2 table at {cluster}"))
    }
}

/// Reads refcount blocks.
pub(crate) struct RefBlockLoader<B: Backend> {
    backend: Arc<B>,
    cluster_bits: u32,
    /// log2 of the refcount width in bits.
    refcount_order: u32,
}

impl<B: Backend> RefBlockLoader<B> {
    pub fn new(backend: Arc<B>, cluster_bits: u32, refcount_order: u32) -> Self {
        RefBlockLoader {
            backend,
            cluster_bits,
            refcount_order,
        }
    }
}

impl<B: Backend> CacheLoader for RefBlockLoader<B> {
    type Key = HostCluster;
    type Value = RefBlock;

    async fn load(&self, cluster: HostCluster) -> Result<RefBlock> {
        trace!("Reading refcount block at {cluster}");
        RefBlock::load(
            self.backend.as_ref(),
            cluster,
            self.cluster_bits,
            self.refcount_order,
        )
        .await
        .err_context(|| format!("Refcount block at {cluster}"))
    }
}
