//! Cluster allocation and refcount bookkeeping.
//!
//! Allocation is first-fit from a cursor.  Refcount blocks are created on demand, below the range
//! they cover if existing blocks still have room there, or else as the first cluster of that range
//! so that they describe themselves.  When the refcount table runs out of entries, a larger copy
//! is placed in the first sufficiently large free run and the header is switched over to it.
//!
//! The allocator also owns the image header, because relocating the refcount table is the only
//! structural change that rewrites it at runtime.

use super::cache::RefBlockLoader;
use super::header::Header;
use super::tables::{grown_reftable_len, RefBlock, RefTable};
use super::types::{ClusterCount, HostCluster, HostOffset};
use super::MAX_FILE_LENGTH;
use crate::async_lru_cache::AsyncLruCache;
use crate::backend::{Backend, BackendExt};
use crate::error::{Error, Result};
use crate::misc_helpers::{invalid_metadata, ResultErrorContext};
use std::cmp;
use std::mem::size_of;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Number of refcount blocks to keep cached.
const RB_CACHE_SIZE: usize = 32;

/// Hands out host clusters and keeps their refcounts.
pub(crate) struct Allocator<B: Backend> {
    /// Image backend.
    backend: Arc<B>,

    /// Image header.
    header: Header,

    /// Refcount table, loaded on first use.
    reftable: Option<RefTable>,

    /// Where the next allocation scan starts.
    cursor: HostCluster,

    /// No cluster below this one is free.
    floor: HostCluster,

    /// Number of host clusters that may be used; everything at or beyond is off limits.
    limit: ClusterCount,

    /// Refcount block cache.
    rb_cache: AsyncLruCache<RefBlockLoader<B>>,
}

/// Worst-case number of host clusters an image can ever need.
///
/// That is the header cluster, the L1 table, one L2 table per L1 entry, every data cluster, and
/// the refcount blocks and refcount table describing all of it.  On top of that comes headroom for
/// relocating the refcount table once (old and new table coexist for a moment) and for the hole
/// the old table leaves behind.
pub(crate) fn host_cluster_budget(header: &Header) -> u64 {
    let cb = header.cluster_bits;
    let cluster_size = 1u64 << cb;
    let rb_entries = header.rb_entries() as u64;

    let data = header.size.div_ceil(cluster_size);
    let l2_tables = header.l1_size as u64;
    let l1 = (header.l1_size as u64 * size_of::<u64>() as u64).div_ceil(cluster_size);
    let base = 1 + l1 + l2_tables + data;

    // The function is monotonic, so iterating from 0 converges on the least fixed point
    let mut refcount_clusters = 0;
    loop {
        let covered = base + refcount_clusters;
        let refblocks = covered.div_ceil(rb_entries);
        let reftable = cmp::max((refblocks * size_of::<u64>() as u64).div_ceil(cluster_size), 1);
        let needed = refblocks + 2 * reftable + 2;
        if needed <= refcount_clusters {
            break;
        }
        refcount_clusters = needed;
    }

    cmp::min(base + refcount_clusters, MAX_FILE_LENGTH >> cb)
}

impl<B: Backend> Allocator<B> {
    /// Allocator for the image described by `header`.
    ///
    /// `limit` is the number of host clusters allocations may use.  The refcount table is only
    /// loaded once needed.
    pub fn new(backend: Arc<B>, header: Header, limit: u64) -> Self {
        let rb_loader = RefBlockLoader::new(
            Arc::clone(&backend),
            header.cluster_bits,
            header.refcount_order(),
        );

        Allocator {
            backend,
            header,
            reftable: None,
            cursor: HostCluster(0),
            floor: HostCluster(0),
            limit: ClusterCount(limit),
            rb_cache: AsyncLruCache::new(rb_loader, RB_CACHE_SIZE),
        }
    }

    /// The image header.
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Encode the header and write it to the start of the image.
    pub async fn write_header(&self) -> Result<()> {
        let raw = self.header.encode()?;
        self.backend.write_at((&raw).into(), 0).await?;
        Ok(())
    }

    /// Number of host clusters allocations may use.
    pub fn limit(&self) -> u64 {
        self.limit.0
    }

    /// Start the next allocation scan at `cluster`.
    ///
    /// Used to force allocations onto structural boundaries.  Free clusters below `cluster` are
    /// still found once the scan reaches the limit.
    #[cfg(any(test, feature = "test_utils"))]
    pub fn set_next_cluster(&mut self, cluster: HostCluster) {
        self.cursor = cluster;
    }

    /// Where the next allocation scan starts.
    #[cfg(test)]
    pub fn next_cluster(&self) -> HostCluster {
        self.cursor
    }

    /// Load the refcount table if that has not happened yet.
    async fn load_reftable(&mut self) -> Result<()> {
        if self.reftable.is_some() {
            return Ok(());
        }

        let cb = self.header.cluster_bits;
        let rt_offset = self.header.refcount_table_offset;
        let rt_cluster = HostOffset(rt_offset)
            .aligned_cluster(cb)
            .ok_or_else(|| invalid_metadata(format!("Unaligned refcount table: {rt_offset:#x}")))?;

        let entries = self.header.reftable_entries();
        debug!("Loading refcount table ({entries} entries) from {rt_cluster}");
        let reftable = RefTable::load(self.backend.as_ref(), rt_cluster, entries, cb).await?;
        self.reftable = Some(reftable);
        Ok(())
    }

    /// The loaded refcount table.
    fn rt(&self) -> Result<&RefTable> {
        self.reftable
            .as_ref()
            .ok_or_else(|| Error::ConsistencyViolation("Refcount table not loaded".into()))
    }

    /// All refcount blocks with their refcount table index.
    pub async fn refblock_clusters(&mut self) -> Result<Vec<(usize, HostCluster)>> {
        self.load_reftable().await?;
        Ok(self.rt()?.refblocks().collect())
    }

    /// Clusters occupied by the refcount table.
    pub async fn reftable_clusters(&mut self) -> Result<(HostCluster, ClusterCount)> {
        self.load_reftable().await?;
        let rt = self.rt()?;
        Ok((rt.cluster(), rt.clusters()))
    }

    /// All clusters with a nonzero refcount, with that refcount, in ascending order.
    pub async fn allocated_clusters(&mut self) -> Result<Vec<(HostCluster, u64)>> {
        let rb_bits = self.header.rb_bits();
        let mut allocated = Vec::new();
        for (rt_index, rb_cluster) in self.refblock_clusters().await? {
            let rb = self
                .rb_cache
                .get_or_insert(rb_cluster)
                .await
                .err_context(|| format!("Refcount table index {rt_index}"))?;
            allocated.extend((0..rb.len()).filter_map(|rb_index| {
                let refcount = rb.get(rb_index);
                (refcount != 0).then(|| {
                    let cluster = HostCluster::from_refcount_slot(rt_index, rb_index, rb_bits);
                    (cluster, refcount)
                })
            }));
        }
        Ok(allocated)
    }

    /// Allocate one cluster.
    ///
    /// Scans from the cursor up to the limit, then from the lowest possibly free cluster up to
    /// the cursor.  The refcount of the cluster found is set to 1.
    pub async fn allocate_cluster(&mut self) -> Result<HostCluster> {
        self.load_reftable().await?;

        let limit = HostCluster(self.limit.0);
        let passes = [
            (self.cursor, limit),
            (self.floor, cmp::min(self.cursor, limit)),
        ];
        for (start, end) in passes {
            let mut candidate = start;
            while candidate < end {
                if self.claim(candidate).await? {
                    trace!("Allocated cluster {candidate}");
                    return Ok(candidate);
                }
                candidate += ClusterCount(1);
            }
        }

        Err(Error::NoSpace {
            limit: self.limit.0,
        })
    }

    /// `cluster`’s refcount.
    pub async fn refcount(&mut self, cluster: HostCluster) -> Result<u64> {
        self.load_reftable().await?;
        let (rt_index, rb_index) = cluster.refcount_slot(self.header.rb_bits());
        Ok(match self.get_rb(rt_index).await? {
            Some(rb) => rb.get(rb_index),
            None => 0,
        })
    }

    /// Add a reference to `cluster`, creating refcount structures as needed.
    ///
    /// Returns the new refcount.
    #[cfg_attr(not(test), allow(dead_code))]
    pub async fn increment(&mut self, cluster: HostCluster) -> Result<u64> {
        self.load_reftable().await?;
        if cluster.0 >= self.limit.0 {
            return Err(Error::NoSpace {
                limit: self.limit.0,
            });
        }

        let (rt_index, rb_index) = cluster.refcount_slot(self.header.rb_bits());
        let rb = self.ensure_rb(rt_index).await?;
        let old = self.write_increment(&rb, rb_index).await?;
        if old == 0 {
            self.taken(cluster);
        }
        Ok(old + 1)
    }

    /// Drop a reference to `cluster`; at 0 the cluster is free.
    ///
    /// Dropping a reference that does not exist is a [`Error::ConsistencyViolation`].  Returns the
    /// new refcount.
    pub async fn decrement(&mut self, cluster: HostCluster) -> Result<u64> {
        self.load_reftable().await?;
        let (rt_index, rb_index) = cluster.refcount_slot(self.header.rb_bits());
        let rb = self.get_rb(rt_index).await?.ok_or_else(|| {
            Error::ConsistencyViolation(format!(
                "Cannot free cluster {cluster}: No refcount block covers it"
            ))
        })?;

        let old = rb
            .decrement(rb_index)
            .err_context(|| format!("Freeing cluster {cluster}"))?;
        if let Err(err) = rb.write_refcount(self.backend.as_ref(), rb_index).await {
            let _ = rb.increment(rb_index);
            return Err(err);
        }

        if old == 1 {
            self.released(cluster);
        }
        Ok(old - 1)
    }

    /// Drop one reference to each of `count` clusters from `start`.
    ///
    /// Best effort: failures are logged, and the clusters concerned leak.
    pub async fn free_clusters(&mut self, start: HostCluster, count: ClusterCount) {
        let rb_bits = self.header.rb_bits();
        let end = start + count;

        let mut cluster = start;
        while cluster < end {
            let (rt_index, first) = cluster.refcount_slot(rb_bits);
            let block_end = cmp::min(HostCluster::from_refcount_slot(rt_index + 1, 0, rb_bits), end);
            let n = (block_end - cluster).0 as usize;

            match self.get_rb(rt_index).await {
                Ok(Some(rb)) => {
                    for rb_index in first..first + n {
                        if let Err(err) = rb.decrement(rb_index) {
                            warn!("Failed to free cluster: {err}");
                        }
                    }
                    if let Err(err) = rb.write(self.backend.as_ref()).await {
                        warn!("Leaking {n} clusters from {cluster}; cannot write refcount block: {err}");
                    }
                }
                Ok(None) => warn!("Cannot free {n} clusters from {cluster}: Not allocated"),
                Err(err) => warn!("Cannot free {n} clusters from {cluster}: {err}"),
            }

            cluster = block_end;
        }

        self.released(start);
    }

    /// Note that `cluster` is in use now.
    fn taken(&mut self, cluster: HostCluster) {
        if cluster == self.cursor {
            self.cursor += ClusterCount(1);
        }
        if cluster == self.floor {
            self.floor += ClusterCount(1);
        }
    }

    /// Note that `cluster` may be free now.
    fn released(&mut self, cluster: HostCluster) {
        self.cursor = cmp::min(self.cursor, cluster);
        self.floor = cmp::min(self.floor, cluster);
    }

    /// Take `cluster` if it is free.
    ///
    /// Returns whether it was.
    async fn claim(&mut self, cluster: HostCluster) -> Result<bool> {
        let (rt_index, rb_index) = cluster.refcount_slot(self.header.rb_bits());
        let rb = self.ensure_rb(rt_index).await?;
        let free = rb.is_free(rb_index);
        if free {
            self.write_increment(&rb, rb_index).await?;
        }
        self.taken(cluster);
        Ok(free)
    }

    /// Increment refcount `index` of `rb` and write it back.
    ///
    /// The cached block is reverted if the write fails.  Returns the old refcount.
    async fn write_increment(&self, rb: &RefBlock, index: usize) -> Result<u64> {
        let old = rb.increment(index)?;
        if let Err(err) = rb.write_refcount(self.backend.as_ref(), index).await {
            let _ = rb.decrement(index);
            return Err(err);
        }
        Ok(old)
    }

    /// The refcount block at refcount table index `rt_index`, if there is one.
    async fn get_rb(&self, rt_index: usize) -> Result<Option<Arc<RefBlock>>> {
        match self.rt()?.refblock(rt_index) {
            Some(rb_cluster) => self.rb_cache.get_or_insert(rb_cluster).await.map(Some),
            None => Ok(None),
        }
    }

    /// The refcount block at refcount table index `rt_index`, created if missing.
    async fn ensure_rb(&mut self, rt_index: usize) -> Result<Arc<RefBlock>> {
        if let Some(rb) = self.get_rb(rt_index).await? {
            return Ok(rb);
        }

        if rt_index >= self.rt()?.len() {
            self.grow_reftable(rt_index).await?;
            // The new table may come with this very block
            if let Some(rb) = self.get_rb(rt_index).await? {
                return Ok(rb);
            }
        }

        let cb = self.header.cluster_bits;
        let rb_bits = self.header.rb_bits();
        let first_covered = HostCluster::from_refcount_slot(rt_index, 0, rb_bits);

        // Blocks that already exist can describe a home below `first_covered` without any new
        // refcount structures; otherwise the block goes to the start of its own range.
        let below = self.claim_existing(self.cursor, first_covered).await?;
        let rb = RefBlock::new(below.unwrap_or(first_covered), cb, self.header.refcount_order());
        if below.is_none() {
            rb.increment(0)?;
        }

        let linked = match rb.write(self.backend.as_ref()).await {
            Ok(()) => {
                self.rt()?
                    .link(self.backend.as_ref(), rt_index, rb.cluster())
                    .await
            }
            Err(err) => Err(err),
        };
        if let Err(err) = linked {
            if let Some(cluster) = below {
                self.free_clusters(cluster, ClusterCount(1)).await;
            }
            return Err(err.context(format!("Creating refcount block {rt_index}")));
        }

        debug!(
            "New refcount block for refcount table index {rt_index} at {}{}",
            rb.cluster(),
            if below.is_none() { " (self-describing)" } else { "" }
        );
        if below.is_none() {
            self.taken(first_covered);
        }

        let rb = Arc::new(rb);
        self.rb_cache.insert(rb.cluster(), Arc::clone(&rb)).await;
        Ok(rb)
    }

    /// Take the first free cluster in `start..end` whose refcount block already exists.
    ///
    /// Ranges without a refcount block are skipped, so this never creates refcount structures.
    async fn claim_existing(
        &mut self,
        start: HostCluster,
        end: HostCluster,
    ) -> Result<Option<HostCluster>> {
        let rb_bits = self.header.rb_bits();
        let mut cluster = start;
        while cluster < end {
            let (rt_index, rb_index) = cluster.refcount_slot(rb_bits);
            let Some(rb) = self.get_rb(rt_index).await? else {
                cluster = HostCluster::from_refcount_slot(rt_index + 1, 0, rb_bits);
                continue;
            };

            if rb.is_free(rb_index) {
                self.write_increment(&rb, rb_index).await?;
                self.taken(cluster);
                return Ok(Some(cluster));
            }
            cluster += ClusterCount(1);
        }
        Ok(None)
    }

    /// Replace the refcount table with a larger one that has an entry `at_least_index`.
    ///
    /// The new table goes into the first free run that can hold it together with the refcount
    /// blocks that run still lacks.  Everything is written before the header is switched over;
    /// until then, a failure leaves the old table in charge and reverts the cached refcounts.
    async fn grow_reftable(&mut self, at_least_index: usize) -> Result<()> {
        let cb = self.header.cluster_bits;
        let rb_bits = self.header.rb_bits();

        let entries = grown_reftable_len(self.rt()?.len(), at_least_index, rb_bits, cb)?;
        let table_clusters = ClusterCount::covering((entries * size_of::<u64>()) as u64, cb);
        let (start, missing) = self.find_reftable_run(table_clusters, entries).await?;
        let run = ClusterCount(missing.len() as u64) + table_clusters;
        if (start + run).0 > self.limit.0 {
            return Err(Error::NoSpace {
                limit: self.limit.0,
            });
        }

        // The missing blocks come first, then the table
        let table_cluster = start + ClusterCount(missing.len() as u64);
        let new_rt = self.rt()?.relocated(table_cluster, entries);
        let mut new_blocks = Vec::with_capacity(missing.len());
        for (i, rt_index) in missing.into_iter().enumerate() {
            let rb = RefBlock::new(start + ClusterCount(i as u64), cb, self.header.refcount_order());
            new_rt.set_refblock(rt_index, rb.cluster())?;
            new_blocks.push((rt_index, Arc::new(rb)));
        }

        // Account for the run, in whichever block covers each cluster
        let mut counted: Vec<(Arc<RefBlock>, usize)> = Vec::new();
        let mut touched: Vec<Arc<RefBlock>> = Vec::new();
        for cluster in start.0..(start + run).0 {
            let (rt_index, rb_index) = HostCluster(cluster).refcount_slot(rb_bits);
            let new_rb = new_blocks.iter().find(|(i, _)| *i == rt_index);
            let result = match new_rb {
                Some((_, rb)) => rb.increment(rb_index).map(|_| ()),
                None => match self.get_rb(rt_index).await {
                    Ok(Some(rb)) => {
                        let result = rb.increment(rb_index).map(|_| ());
                        if result.is_ok() {
                            if !touched.iter().any(|t| Arc::ptr_eq(t, &rb)) {
                                touched.push(Arc::clone(&rb));
                            }
                            counted.push((rb, rb_index));
                        }
                        result
                    }
                    Ok(None) => Err(Error::ConsistencyViolation(format!(
                        "No refcount block for cluster #{cluster} of the new refcount table"
                    ))),
                    Err(err) => Err(err),
                },
            };
            if let Err(err) = result {
                self.revert_counts(&counted, &[]).await;
                return Err(err);
            }
        }

        let written = self
            .switch_reftable(&new_rt, &new_blocks, &touched, table_clusters)
            .await;
        if let Err(err) = written {
            self.revert_counts(&counted, &touched).await;
            return Err(err.context("Growing the refcount table"));
        }
        debug!(
            "Refcount table relocated to {table_cluster} ({entries} entries), new refcount \
             blocks at {:?}",
            new_blocks
                .iter()
                .map(|(_, rb)| rb.cluster().0)
                .collect::<Vec<_>>()
        );

        for (_, rb) in new_blocks {
            self.rb_cache.insert(rb.cluster(), rb).await;
        }
        let old = self.reftable.replace(new_rt);
        for cluster in start.0..(start + run).0 {
            self.taken(HostCluster(cluster));
        }
        if let Some(old) = old {
            self.free_clusters(old.cluster(), old.clusters()).await;
        }
        Ok(())
    }

    /// Write the new refcount structures, then point the header at `new_rt`.
    async fn switch_reftable(
        &mut self,
        new_rt: &RefTable,
        new_blocks: &[(usize, Arc<RefBlock>)],
        touched: &[Arc<RefBlock>],
        table_clusters: ClusterCount,
    ) -> Result<()> {
        for rb in new_blocks.iter().map(|(_, rb)| rb).chain(touched) {
            rb.write(self.backend.as_ref()).await?;
        }
        new_rt.write(self.backend.as_ref()).await?;

        let old_header = self.header.clone();
        self.header.refcount_table_offset = new_rt.cluster().offset(self.header.cluster_bits).0;
        self.header.refcount_table_clusters = table_clusters.0.try_into().map_err(|_| {
            Error::Unsupported(format!("Refcount table too big: {table_clusters} clusters"))
        })?;
        if let Err(err) = self.write_header().await {
            self.header = old_header;
            return Err(err);
        }
        Ok(())
    }

    /// Undo refcount increments in cached blocks, and rewrite the blocks in `written`.
    ///
    /// Best effort; failures are logged.
    async fn revert_counts(&self, counted: &[(Arc<RefBlock>, usize)], written: &[Arc<RefBlock>]) {
        for (rb, rb_index) in counted {
            if let Err(err) = rb.decrement(*rb_index) {
                warn!("Cannot revert refcount: {err}");
            }
        }
        for rb in written {
            if let Err(err) = rb.write(self.backend.as_ref()).await {
                warn!("Leaking clusters; cannot restore refcount block {}: {err}", rb.cluster());
            }
        }
    }

    /// First free run from the floor that can hold `table_clusters` clusters plus the refcount
    /// blocks missing for the run itself.
    ///
    /// Returns the run’s start and the refcount table indices of the missing blocks.  Ranges
    /// without a block are free as a whole.  The run must fit into a table of `entries` entries.
    async fn find_reftable_run(
        &mut self,
        table_clusters: ClusterCount,
        entries: usize,
    ) -> Result<(HostCluster, Vec<usize>)> {
        let rb_bits = self.header.rb_bits();
        let mut start = self.floor;
        let mut missing = Vec::new();
        let mut cluster = start;

        loop {
            let needed = table_clusters + ClusterCount(missing.len() as u64);
            if cluster - start >= needed {
                return Ok((start, missing));
            }

            let (rt_index, rb_index) = cluster.refcount_slot(rb_bits);
            if rt_index >= entries {
                return Err(Error::ConsistencyViolation(format!(
                    "No room for a refcount table of {entries} entries that describes itself"
                )));
            }

            match self.get_rb(rt_index).await? {
                None => {
                    missing.push(rt_index);
                    cluster = HostCluster::from_refcount_slot(rt_index + 1, 0, rb_bits);
                }
                Some(rb) if rb.is_free(rb_index) => cluster += ClusterCount(1),
                Some(_) => {
                    cluster += ClusterCount(1);
                    start = cluster;
                    missing.clear();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemBackend;
    use crate::qcow2::header::Version;

    /// Lay out a minimal image by hand: header at 0, refcount table at 1, one refcount block at 2.
    async fn fresh(cluster_bits: u32, refcount_order: u32, limit: u64) -> Allocator<MemBackend> {
        let backend = Arc::new(MemBackend::new());
        let mut header = Header::new(Version::V3, cluster_bits, refcount_order, 0);
        header.refcount_table_offset = 1 << cluster_bits;
        header.refcount_table_clusters = 1;

        let rt = RefTable::new(HostCluster(1), 1 << (cluster_bits - 3), cluster_bits);
        let rb = RefBlock::new(HostCluster(2), cluster_bits, refcount_order);
        for i in 0..3 {
            rb.increment(i).unwrap();
        }
        rt.set_refblock(0, rb.cluster()).unwrap();
        rt.write(backend.as_ref()).await.unwrap();
        rb.write(backend.as_ref()).await.unwrap();

        let alloc = Allocator::new(backend, header, limit);
        alloc.write_header().await.unwrap();
        alloc
    }

    #[tokio::test]
    async fn allocates_sequentially_and_reuses_freed() {
        let mut alloc = fresh(16, 4, 1024).await;
        assert_eq!(alloc.allocate_cluster().await.unwrap(), HostCluster(3));
        assert_eq!(alloc.allocate_cluster().await.unwrap(), HostCluster(4));
        assert_eq!(alloc.refcount(HostCluster(4)).await.unwrap(), 1);

        assert_eq!(alloc.decrement(HostCluster(3)).await.unwrap(), 0);
        assert_eq!(alloc.next_cluster(), HostCluster(3));
        assert_eq!(alloc.allocate_cluster().await.unwrap(), HostCluster(3));
        assert_eq!(alloc.allocate_cluster().await.unwrap(), HostCluster(5));
    }

    #[tokio::test]
    async fn double_free_is_a_consistency_violation() {
        let mut alloc = fresh(16, 4, 1024).await;
        let c = alloc.allocate_cluster().await.unwrap();
        alloc.decrement(c).await.unwrap();
        assert!(matches!(
            alloc.decrement(c).await,
            Err(Error::ConsistencyViolation(_))
        ));
        // Beyond any refcount block
        assert!(matches!(
            alloc.decrement(HostCluster(1 << 40)).await,
            Err(Error::ConsistencyViolation(_))
        ));
    }

    #[tokio::test]
    async fn increment_and_decrement_round_trip() {
        let mut alloc = fresh(16, 4, 1024).await;
        assert_eq!(alloc.increment(HostCluster(10)).await.unwrap(), 1);
        assert_eq!(alloc.increment(HostCluster(10)).await.unwrap(), 2);
        assert_eq!(alloc.decrement(HostCluster(10)).await.unwrap(), 1);
        assert!(matches!(
            alloc.increment(HostCluster(1024)).await,
            Err(Error::NoSpace { limit: 1024 })
        ));
    }

    #[tokio::test]
    async fn no_space_at_the_limit() {
        let mut alloc = fresh(16, 4, 5).await;
        alloc.allocate_cluster().await.unwrap();
        alloc.allocate_cluster().await.unwrap();
        assert!(matches!(
            alloc.allocate_cluster().await,
            Err(Error::NoSpace { limit: 5 })
        ));
    }

    #[tokio::test]
    async fn cursor_at_or_past_the_limit_wraps_around() {
        let mut alloc = fresh(16, 4, 8).await;
        alloc.set_next_cluster(HostCluster(8));
        assert_eq!(alloc.allocate_cluster().await.unwrap(), HostCluster(3));

        alloc.set_next_cluster(HostCluster(1000));
        assert_eq!(alloc.allocate_cluster().await.unwrap(), HostCluster(4));

        // From the middle: up to the limit first, then what is left below
        alloc.set_next_cluster(HostCluster(6));
        let order: Vec<HostCluster> = [
            alloc.allocate_cluster().await.unwrap(),
            alloc.allocate_cluster().await.unwrap(),
            alloc.allocate_cluster().await.unwrap(),
        ]
        .into();
        assert_eq!(order, [HostCluster(6), HostCluster(7), HostCluster(5)]);
        assert!(matches!(
            alloc.allocate_cluster().await,
            Err(Error::NoSpace { limit: 8 })
        ));
    }

    #[tokio::test]
    async fn refblock_boundary_creates_self_describing_block() {
        // 512 byte clusters, 64 bit refcounts: 64 clusters per refcount block
        let mut alloc = fresh(9, 6, 1 << 20).await;
        alloc.set_next_cluster(HostCluster(63));
        assert_eq!(alloc.allocate_cluster().await.unwrap(), HostCluster(63));

        // Cluster 64 is the first one of refcount table index 1; the new block covers itself
        assert_eq!(alloc.allocate_cluster().await.unwrap(), HostCluster(65));
        assert_eq!(
            alloc.refblock_clusters().await.unwrap(),
            vec![(0, HostCluster(2)), (1, HostCluster(64))]
        );
        assert_eq!(alloc.refcount(HostCluster(64)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn refblock_goes_below_its_range_if_possible() {
        let mut alloc = fresh(9, 6, 1 << 20).await;
        // Reference a cluster in the second block’s range while the first still has room
        alloc.increment(HostCluster(100)).await.unwrap();
        assert_eq!(
            alloc.refblock_clusters().await.unwrap(),
            vec![(0, HostCluster(2)), (1, HostCluster(3))]
        );
        assert_eq!(alloc.refcount(HostCluster(3)).await.unwrap(), 1);
        assert_eq!(alloc.allocate_cluster().await.unwrap(), HostCluster(4));
    }

    #[tokio::test]
    async fn reftable_growth_relocates_table() {
        // One table cluster holds 64 entries, each refcount block covers 64 clusters
        let mut alloc = fresh(9, 6, 1 << 20).await;
        alloc.set_next_cluster(HostCluster(64 * 64 - 1));
        assert_eq!(alloc.allocate_cluster().await.unwrap(), HostCluster(4095));
        let c = alloc.allocate_cluster().await.unwrap();
        assert!(c.0 >= 4096);

        let header = alloc.header().clone();
        assert_ne!(header.refcount_table_offset, 512);
        assert!(header.refcount_table_clusters >= 2);
        // The old table was freed, and its cluster went to the block for index 64
        assert!(alloc
            .refblock_clusters()
            .await
            .unwrap()
            .contains(&(64, HostCluster(1))));

        // The rewritten header points to the new table
        let raw = alloc.backend.read_bytes(0, 512).await.unwrap();
        let on_disk = Header::decode(&raw).unwrap();
        assert_eq!(on_disk.refcount_table_offset, header.refcount_table_offset);

        // New table and its blocks are accounted for
        let (rt_cluster, rt_count) = alloc.reftable_clusters().await.unwrap();
        for i in 0..rt_count.0 {
            assert_eq!(alloc.refcount(rt_cluster + ClusterCount(i)).await.unwrap(), 1);
        }
        for (_, rb) in alloc.refblock_clusters().await.unwrap() {
            assert_eq!(alloc.refcount(rb).await.unwrap(), 1);
        }

        // A reload from disk sees the same table
        let mut reloaded = Allocator::new(Arc::clone(&alloc.backend), on_disk, 1 << 20);
        assert_eq!(
            reloaded.refblock_clusters().await.unwrap(),
            alloc.refblock_clusters().await.unwrap()
        );
    }

    #[tokio::test]
    async fn failed_reftable_growth_keeps_old_table() {
        let mut alloc = fresh(9, 6, 1 << 20).await;
        alloc.set_next_cluster(HostCluster(64 * 64 - 1));
        assert_eq!(alloc.allocate_cluster().await.unwrap(), HostCluster(4095));

        alloc.backend.set_fail_writes(true);
        assert!(matches!(alloc.allocate_cluster().await, Err(Error::Io(_))));
        alloc.backend.set_fail_writes(false);

        // The run the new table would have used is free again, and the old table is in charge
        assert_eq!(alloc.refcount(HostCluster(3)).await.unwrap(), 0);
        assert_eq!(alloc.header().refcount_table_offset, 512);
        assert_eq!(alloc.reftable_clusters().await.unwrap().0, HostCluster(1));

        let c = alloc.allocate_cluster().await.unwrap();
        assert!(c.0 >= 4096);
        assert_ne!(alloc.header().refcount_table_offset, 512);
    }

    #[tokio::test]
    async fn failed_refcount_write_keeps_cache_consistent() {
        let mut alloc = fresh(16, 4, 1024).await;
        alloc.backend.set_fail_writes(true);
        assert!(matches!(alloc.allocate_cluster().await, Err(Error::Io(_))));
        alloc.backend.set_fail_writes(false);
        assert_eq!(alloc.refcount(HostCluster(3)).await.unwrap(), 0);
        assert_eq!(alloc.allocate_cluster().await.unwrap(), HostCluster(3));
    }

    #[test]
    fn budget_covers_metadata() {
        // 1 MiB at 64k clusters: 16 data clusters, one L2 table, one L1 cluster, header
        let mut h = Header::new(Version::V3, 16, 4, 1 << 20);
        h.l1_size = 1;
        let budget = host_cluster_budget(&h);
        assert!(budget >= 16 + 1 + 1 + 1 + 2);

        // 1-bit refcounts need very few refcount blocks, 64-bit ones many
        let mut h = Header::new(Version::V3, 9, 6, 4 << 20);
        h.l1_size = Header::required_l1_entries(4 << 20, 9) as u32;
        let data_and_tables: u64 = 8192 + 128 + 2 + 1;
        let budget = host_cluster_budget(&h);
        assert!(budget >= data_and_tables + data_and_tables.div_ceil(64));
    }
}
