//! Guest-to-host address translation.
//!
//! Looks up guest offsets in the L1 and L2 tables, and materializes L2 tables and data clusters
//! on write.  Every new structure is fully written before the entry referencing it, so a crash
//! leaves at most leaked clusters, never a reference to garbage.

use super::allocator::Allocator;
use super::cache::L2Loader;
use super::header::Header;
use super::tables::{L1Table, L2Mapping, L2Table};
use super::types::{ClusterCount, GuestCluster, GuestOffset, HostCluster, HostOffset};
use crate::async_lru_cache::AsyncLruCache;
use crate::backend::{Backend, BackendExt};
use crate::error::{Error, Result};
use crate::io_buffers::IoVector;
use crate::misc_helpers::{invalid_metadata, ResultErrorContext};
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, trace, warn};

/// Number of L2 tables to keep cached.
const L2_CACHE_SIZE: usize = 128;

/// Outcome of [`Translation::resolve_for_write()`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum WriteResolution {
    /// The cluster is mapped; the caller writes its data to this host offset.
    Mapped(HostOffset),

    /// A new data cluster was materialized and already contains the caller’s data.
    Written,
}

/// The L1/L2 translation structures of an image.
pub(crate) struct Translation<B: Backend> {
    /// Image backend.
    backend: Arc<B>,

    /// log2 of the cluster size.
    cluster_bits: u32,

    /// First cluster of the L1 table.
    l1_cluster: HostCluster,

    /// Number of L1 entries.
    l1_entries: usize,

    /// The L1 table, loaded on first use.
    l1: OnceCell<RwLock<L1Table>>,

    /// L2 table cache.
    l2_cache: AsyncLruCache<L2Loader<B>>,
}

impl<B: Backend> Translation<B> {
    /// Prepare translation for the image described by `header`.
    ///
    /// Nothing is loaded yet.
    pub fn new(backend: Arc<B>, header: &Header) -> Result<Self> {
        let cb = header.cluster_bits;
        let l1_offset = header.l1_table_offset;
        let l1_cluster = HostOffset(l1_offset)
            .aligned_cluster(cb)
            .ok_or_else(|| invalid_metadata(format!("Unaligned L1 table: {l1_offset:#x}")))?;
        let l1_entries = header.l1_size as usize;
        if l1_entries > L1Table::MAX_ENTRIES {
            return Err(Error::Unsupported(format!(
                "L1 table too big: {l1_entries} > {}",
                L1Table::MAX_ENTRIES
            )));
        }

        let l2_loader = L2Loader::new(Arc::clone(&backend), cb);
        Ok(Translation {
            backend,
            cluster_bits: cb,
            l1_cluster,
            l1_entries,
            l1: OnceCell::new(),
            l2_cache: AsyncLruCache::new(l2_loader, L2_CACHE_SIZE),
        })
    }

    /// Number of L1 entries.
    pub fn l1_entries(&self) -> usize {
        self.l1_entries
    }

    /// Clusters occupied by the L1 table.
    pub fn l1_clusters(&self) -> (HostCluster, ClusterCount) {
        let bytes = (self.l1_entries * std::mem::size_of::<u64>()) as u64;
        (
            self.l1_cluster,
            ClusterCount::covering(bytes, self.cluster_bits),
        )
    }

    /// The L1 table, loading it if necessary.
    async fn l1(&self) -> Result<&RwLock<L1Table>> {
        self.l1
            .get_or_try_init(|| async {
                debug!(
                    "Loading L1 table ({} entries) from {}",
                    self.l1_entries, self.l1_cluster
                );
                L1Table::load(
                    self.backend.as_ref(),
                    self.l1_cluster,
                    self.l1_entries,
                    self.cluster_bits,
                )
                .await
                .map(RwLock::new)
            })
            .await
    }

    /// Get the L2 table referenced by L1 entry `l1_index`, if any.
    ///
    /// Never allocates.  Indices beyond the L1 table have no L2 table.
    pub async fn l2_table_at(&self, l1_index: usize) -> Result<Option<Arc<L2Table>>> {
        let l2_cluster = self.l1().await?.read().await.l2_table(l1_index);
        match l2_cluster {
            Some(l2_cluster) => self.l2_cache.get_or_insert(l2_cluster).await.map(Some),
            None => Ok(None),
        }
    }

    /// Get the L2 table holding the mapping of `guest_cluster`, if any.
    pub async fn l2_table_for(&self, guest_cluster: GuestCluster) -> Result<Option<Arc<L2Table>>> {
        self.l2_table_at(guest_cluster.l1_index(self.cluster_bits))
            .await
    }

    /// Look up the mapping of `guest_cluster`.
    pub async fn mapping(&self, guest_cluster: GuestCluster) -> Result<L2Mapping> {
        Ok(match self.l2_table_for(guest_cluster).await? {
            Some(l2) => l2.mapping(guest_cluster),
            None => L2Mapping::Unallocated,
        })
    }

    /// Find where `offset` is stored, without allocating anything.
    ///
    /// `None` means the offset reads as zero.
    pub async fn resolve_for_read(&self, offset: GuestOffset) -> Result<Option<HostOffset>> {
        let cb = self.cluster_bits;
        match self.mapping(offset.cluster(cb)).await? {
            L2Mapping::Unallocated | L2Mapping::Zero { .. } => Ok(None),
            L2Mapping::DataFile { host_cluster } => Ok(Some(host_cluster.translate(offset, cb))),
            L2Mapping::Compressed => Err(Error::Unsupported(format!(
                "Compressed cluster at guest offset {offset}"
            ))),
        }
    }

    /// Find where to write `data` for `offset`, allocating as needed.
    ///
    /// `data` must not cross the end of the cluster containing `offset`.  If a data cluster has to
    /// be materialized, it is written in full (with `data` at its place and zeroes everywhere
    /// else) before it is entered into its L2 table; the caller then has nothing left to do.
    ///
    /// On error, an L2 table created for this request is unlinked and freed again.
    pub async fn resolve_for_write(
        &self,
        allocator: &mut Allocator<B>,
        offset: GuestOffset,
        data: &IoVector<'_>,
    ) -> Result<WriteResolution> {
        let cb = self.cluster_bits;
        let guest_cluster = offset.cluster(cb);
        if data.len() > offset.to_cluster_end(cb) {
            return Err(Error::InvalidRequest(format!(
                "Write of {} bytes at {offset} crosses a cluster boundary",
                data.len()
            )));
        }

        let (l2, created) = self.ensure_l2_table(allocator, guest_cluster).await?;
        let result = self
            .resolve_in_table(allocator, &l2, offset, data)
            .await;
        if result.is_err() && created {
            self.drop_l2_table(allocator, guest_cluster.l1_index(cb), &l2)
                .await;
        }
        result
    }

    /// Second half of [`Translation::resolve_for_write()`], once the L2 table exists.
    async fn resolve_in_table(
        &self,
        allocator: &mut Allocator<B>,
        l2: &L2Table,
        offset: GuestOffset,
        data: &IoVector<'_>,
    ) -> Result<WriteResolution> {
        let cb = self.cluster_bits;
        let guest_cluster = offset.cluster(cb);

        let preallocation = match l2.mapping(guest_cluster) {
            L2Mapping::DataFile { host_cluster } => {
                return Ok(WriteResolution::Mapped(host_cluster.translate(offset, cb)));
            }
            L2Mapping::Compressed => {
                return Err(Error::Unsupported(format!(
                    "Compressed cluster at guest offset {offset}"
                )));
            }
            L2Mapping::Zero { host_cluster } => host_cluster,
            L2Mapping::Unallocated => None,
        };

        // A preallocated zero cluster is only reused if nothing else references it
        let reusable = match preallocation {
            Some(host_cluster) => allocator.refcount(host_cluster).await? == 1,
            None => false,
        };
        let (target, preallocated) = match preallocation.filter(|_| reusable) {
            Some(host_cluster) => (host_cluster, true),
            None => (allocator.allocate_cluster().await?, false),
        };

        let mut buf = vec![0u8; 1 << cb];
        let in_cluster = offset.within_cluster(cb);
        data.copy_into_slice(&mut buf[in_cluster..in_cluster + data.len() as usize]);

        let written = async {
            self.backend
                .write_at((&buf).into(), target.offset(cb).0)
                .await?;
            l2.map(self.backend.as_ref(), guest_cluster, target).await
        };
        if let Err(err) = written.await {
            if !preallocated {
                allocator.free_clusters(target, ClusterCount(1)).await;
            }
            return Err(err.context(format!("Materializing guest cluster at {offset}")));
        }

        trace!(
            "Mapped guest cluster {} to host cluster {target}{}",
            guest_cluster.0,
            if preallocated { " (preallocated)" } else { "" }
        );
        Ok(WriteResolution::Written)
    }

    /// Get the L2 table for `guest_cluster`, creating it if there is none.
    ///
    /// A new table is zeroed on disk before the L1 table references it.  Returns whether the
    /// table was created.
    async fn ensure_l2_table(
        &self,
        allocator: &mut Allocator<B>,
        guest_cluster: GuestCluster,
    ) -> Result<(Arc<L2Table>, bool)> {
        if let Some(l2) = self.l2_table_for(guest_cluster).await? {
            return Ok((l2, false));
        }

        let cb = self.cluster_bits;
        let l1_index = guest_cluster.l1_index(cb);
        if l1_index >= self.l1_entries {
            return Err(Error::InvalidRequest(format!(
                "Guest cluster {} beyond the L1 table ({} entries)",
                guest_cluster.0, self.l1_entries
            )));
        }

        let l2_cluster = allocator.allocate_cluster().await?;
        let l2 = L2Table::new(l2_cluster, cb);
        let linked = async {
            l2.write(self.backend.as_ref()).await?;
            let l1 = self.l1().await?.write().await;
            l1.link(self.backend.as_ref(), l1_index, l2_cluster).await
        };
        if let Err(err) = linked.await {
            allocator.free_clusters(l2_cluster, ClusterCount(1)).await;
            return Err(err.context(format!("Creating L2 table for L1 index {l1_index}")));
        }
        debug!("New L2 table for L1 index {l1_index} at {l2_cluster}");

        let l2 = Arc::new(l2);
        self.l2_cache.insert(l2_cluster, Arc::clone(&l2)).await;
        Ok((l2, true))
    }

    /// Take back an L2 table that [`Translation::ensure_l2_table()`] just created.
    ///
    /// Best effort; if the L1 entry cannot be cleared on disk, the (empty) table stays in place.
    async fn drop_l2_table(&self, allocator: &mut Allocator<B>, l1_index: usize, l2: &L2Table) {
        let l2_cluster = l2.cluster();
        let unlinked = match self.l1().await {
            Ok(l1) => l1.write().await.unlink(self.backend.as_ref(), l1_index).await,
            Err(err) => Err(err),
        };
        if let Err(err) = unlinked {
            warn!("Keeping unused L2 table {l2_cluster} for L1 index {l1_index}: {err}");
            return;
        }

        self.l2_cache.remove(l2_cluster).await;
        allocator.free_clusters(l2_cluster, ClusterCount(1)).await;
        debug!("Dropped new L2 table for L1 index {l1_index} at {l2_cluster}");
    }

    /// Unmap `guest_cluster`, freeing its host cluster.
    ///
    /// The cleared L2 entry is written before the refcount is dropped.  Unallocated clusters and
    /// zero clusters without preallocation are left as they are.
    pub async fn unmap(&self, allocator: &mut Allocator<B>, guest_cluster: GuestCluster) -> Result<()> {
        let Some(l2) = self.l2_table_for(guest_cluster).await? else {
            return Ok(());
        };

        let host_cluster = match l2.mapping(guest_cluster) {
            L2Mapping::Unallocated | L2Mapping::Zero { host_cluster: None } => return Ok(()),
            L2Mapping::Compressed => {
                return Err(Error::Unsupported(format!(
                    "Cannot discard compressed guest cluster {}",
                    guest_cluster.0
                )));
            }
            L2Mapping::DataFile { host_cluster }
            | L2Mapping::Zero {
                host_cluster: Some(host_cluster),
            } => host_cluster,
        };

        l2.unmap(self.backend.as_ref(), guest_cluster).await?;
        if let Err(err) = allocator.decrement(host_cluster).await {
            warn!("Leaking host cluster {host_cluster} of discarded guest cluster: {err}");
            return Err(err);
        }
        trace!(
            "Unmapped guest cluster {} (host cluster {host_cluster})",
            guest_cluster.0
        );
        Ok(())
    }

    /// All L2 tables with their L1 index.
    pub async fn l2_tables(&self) -> Result<Vec<(usize, Arc<L2Table>)>> {
        let l2_clusters: Vec<(usize, HostCluster)> =
            self.l1().await?.read().await.l2_tables().collect();

        let mut tables = Vec::with_capacity(l2_clusters.len());
        for (l1_index, l2_cluster) in l2_clusters {
            let l2 = self
                .l2_cache
                .get_or_insert(l2_cluster)
                .await
                .err_context(|| format!("L1 index {l1_index}"))?;
            tables.push((l1_index, l2));
        }
        Ok(tables)
    }

    /// Drop all cached L2 tables.
    pub async fn clear_cache(&self) {
        self.l2_cache.clear().await;
    }
}
