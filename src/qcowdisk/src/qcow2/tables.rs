//! On-disk metadata tables.
//!
//! L1, L2 and refcount tables are arrays of big-endian 64-bit entries occupying whole clusters.
//! Refcount blocks are single clusters of packed refcounts.  Nothing is buffered: the methods
//! that change an entry write the affected sector back before returning, and put the old value
//! back in memory if that write fails.

use super::header::MAX_CLUSTER_BITS;
use super::types::{ClusterCount, GuestCluster, HostCluster, HostOffset};
use super::MAX_FILE_LENGTH;
use crate::backend::{Backend, BackendExt};
use crate::error::{Error, Result};
use crate::misc_helpers::invalid_metadata;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

/// Size of one table entry in bytes.
const ENTRY_SIZE: usize = 8;

/// Host offset bits of L1 and L2 entries.
const OFFSET_MASK: u64 = 0x00ff_ffff_ffff_fe00;

/// Host offset bits of refcount table entries.
const RT_OFFSET_MASK: u64 = 0xffff_ffff_ffff_fe00;

/// Set in L1 and L2 entries whose target has a refcount of exactly one.
const COPIED: u64 = 1 << 63;

/// Set in L2 entries of compressed clusters.
const L2_COMPRESSED: u64 = 1 << 62;

/// Set in L2 entries of clusters that read as zero.
const L2_ZERO: u64 = 1;

/// Entry format of one kind of table.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum TableKind {
    /// L1 table
    L1,
    /// L2 table
    L2,
    /// Refcount table
    Refcount,
}

impl TableKind {
    /// For messages.
    fn name(self) -> &'static str {
        match self {
            TableKind::L1 => "L1 table",
            TableKind::L2 => "L2 table",
            TableKind::Refcount => "Refcount table",
        }
    }

    /// Bits of `entry` that must be zero.
    fn reserved_bits(self, entry: u64) -> u64 {
        match self {
            TableKind::L1 => entry & 0x7f00_0000_0000_01fe,
            // The compressed descriptor uses all bits
            TableKind::L2 if entry & L2_COMPRESSED != 0 => 0,
            TableKind::L2 => entry & 0x3f00_0000_0000_01fe,
            TableKind::Refcount => entry & 0x1ff,
        }
    }

    /// Host cluster offset referenced by `entry`.
    ///
    /// Compressed L2 entries reference no cluster in this sense.
    fn target(self, entry: u64) -> Option<HostOffset> {
        let offset = match self {
            TableKind::L1 => entry & OFFSET_MASK,
            TableKind::L2 if entry & L2_COMPRESSED != 0 => 0,
            TableKind::L2 => entry & OFFSET_MASK,
            TableKind::Refcount => entry & RT_OFFSET_MASK,
        };
        (offset != 0).then_some(HostOffset(offset))
    }

    /// Reject entries with reserved bits set or an unaligned target.
    fn validate(self, entry: u64, cluster_bits: u32) -> Result<()> {
        let reserved = self.reserved_bits(entry);
        if reserved != 0 {
            return Err(invalid_metadata(format!(
                "{} entry {entry:#x} has reserved bits {reserved:#x} set",
                self.name()
            )));
        }
        match self.target(entry) {
            Some(target) if target.aligned_cluster(cluster_bits).is_none() => {
                Err(invalid_metadata(format!(
                    "{} entry {entry:#x} points into the middle of a cluster ({target})",
                    self.name()
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Make sure `bytes` bytes of metadata at `offset` are cluster-aligned and stay below the
/// maximum file length.
fn check_placement(what: &str, offset: HostOffset, bytes: u64, cluster_bits: u32) -> Result<()> {
    if offset.aligned_cluster(cluster_bits).is_none() {
        return Err(invalid_metadata(format!("{what} at unaligned offset {offset}")));
    }
    match offset.0.checked_add(bytes) {
        Some(end) if end <= MAX_FILE_LENGTH => Ok(()),
        _ => Err(invalid_metadata(format!(
            "{what} at {offset} ({bytes} bytes) extends beyond the maximum file length"
        ))),
    }
}

/// Array of 64-bit entries stored from the start of `cluster`.
#[derive(Debug)]
struct EntryTable {
    /// Entry format.
    kind: TableKind,

    /// First cluster in the image file.
    cluster: HostCluster,

    /// log2 of the cluster size.
    cluster_bits: u32,

    /// Raw entry values, native endian.
    entries: Box<[AtomicU64]>,
}

impl EntryTable {
    /// All-zero table.
    fn new(kind: TableKind, cluster: HostCluster, len: usize, cluster_bits: u32) -> Self {
        EntryTable {
            kind,
            cluster,
            cluster_bits,
            entries: (0..len).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Read and validate a table of `len` entries.
    async fn load<B: Backend>(
        backend: &B,
        kind: TableKind,
        cluster: HostCluster,
        len: usize,
        cluster_bits: u32,
    ) -> Result<Self> {
        let offset = cluster.offset(cluster_bits);
        let bytes = len
            .checked_mul(ENTRY_SIZE)
            .ok_or_else(|| invalid_metadata(format!("{} of {len} entries", kind.name())))?;
        check_placement(kind.name(), offset, bytes as u64, cluster_bits)?;

        let raw = backend.read_bytes(offset.0, bytes).await?;
        let entries = raw
            .chunks_exact(ENTRY_SIZE)
            .map(|chunk| -> Result<AtomicU64> {
                let mut be = [0u8; ENTRY_SIZE];
                be.copy_from_slice(chunk);
                let entry = u64::from_be_bytes(be);
                kind.validate(entry, cluster_bits)?;
                Ok(AtomicU64::new(entry))
            })
            .collect::<Result<_>>()?;

        Ok(EntryTable {
            kind,
            cluster,
            cluster_bits,
            entries,
        })
    }

    /// Number of entries.
    fn len(&self) -> usize {
        self.entries.len()
    }

    /// Clusters spanned by the table.
    fn clusters(&self) -> ClusterCount {
        ClusterCount::covering((self.len() * ENTRY_SIZE) as u64, self.cluster_bits)
    }

    /// Raw value of entry `index`; 0 beyond the end.
    fn get(&self, index: usize) -> u64 {
        self.entries
            .get(index)
            .map_or(0, |entry| entry.load(Ordering::Relaxed))
    }

    /// Set entry `index` in memory only, returning the previous value.
    fn replace(&self, index: usize, value: u64) -> Result<u64> {
        let entry = self.entries.get(index).ok_or_else(|| {
            Error::InvalidRequest(format!(
                "{} index {index} out of bounds ({} entries)",
                self.kind.name(),
                self.len()
            ))
        })?;
        Ok(entry.swap(value, Ordering::Relaxed))
    }

    /// Big-endian image of entries `range`, with zeroes past the end of the table.
    fn encode(&self, range: Range<usize>) -> Vec<u8> {
        range.flat_map(|i| self.get(i).to_be_bytes()).collect()
    }

    /// Write the whole table.
    async fn write<B: Backend>(&self, backend: &B) -> Result<()> {
        let raw = self.encode(0..self.len());
        backend
            .write_at((&raw).into(), self.cluster.offset(self.cluster_bits).0)
            .await?;
        Ok(())
    }

    /// Set entry `index` and write back the backend sector holding it.
    ///
    /// The in-memory entry is restored if the write fails.
    async fn store<B: Backend>(&self, backend: &B, index: usize, value: u64) -> Result<()> {
        let old = self.replace(index, value)?;

        // Sectors are never larger than a cluster, so the chunk stays inside the table’s clusters
        let per_chunk = backend.sector_size().max(ENTRY_SIZE) / ENTRY_SIZE;
        let first = index - index % per_chunk;
        let raw = self.encode(first..first + per_chunk);
        let offset = self.cluster.offset(self.cluster_bits).0 + (first * ENTRY_SIZE) as u64;

        if let Err(err) = backend.write_at((&raw).into(), offset).await {
            self.entries[index].store(old, Ordering::Relaxed);
            return Err(err.into());
        }
        Ok(())
    }

    /// Targets of all entries with their index.
    fn targets(&self) -> impl Iterator<Item = (usize, HostCluster)> + '_ {
        (0..self.len()).filter_map(|i| {
            self.kind
                .target(self.get(i))
                .map(|target| (i, target.cluster(self.cluster_bits)))
        })
    }
}

/// L1 table: references one L2 table per entry.
#[derive(Debug)]
pub(crate) struct L1Table(EntryTable);

impl L1Table {
    /// Largest L1 table accepted, in entries.
    pub const MAX_ENTRIES: usize = 4 << 20;

    /// Load the table of `entries` entries at `cluster`.
    pub async fn load<B: Backend>(
        backend: &B,
        cluster: HostCluster,
        entries: usize,
        cluster_bits: u32,
    ) -> Result<Self> {
        if entries > Self::MAX_ENTRIES {
            return Err(invalid_metadata(format!(
                "L1 table of {entries} entries exceeds the maximum of {}",
                Self::MAX_ENTRIES
            )));
        }
        EntryTable::load(backend, TableKind::L1, cluster, entries, cluster_bits)
            .await
            .map(L1Table)
    }

    /// Empty table at `cluster`; nothing is written.
    #[cfg(test)]
    pub fn new(cluster: HostCluster, entries: usize, cluster_bits: u32) -> Self {
        L1Table(EntryTable::new(TableKind::L1, cluster, entries, cluster_bits))
    }

    /// Write the whole table.
    #[cfg(test)]
    pub async fn write<B: Backend>(&self, backend: &B) -> Result<()> {
        self.0.write(backend).await
    }

    /// The L2 table referenced by entry `index`, if any.
    pub fn l2_table(&self, index: usize) -> Option<HostCluster> {
        TableKind::L1
            .target(self.0.get(index))
            .map(|target| target.cluster(self.0.cluster_bits))
    }

    /// Reference `l2_table` from entry `index`, on disk.
    pub async fn link<B: Backend>(
        &self,
        backend: &B,
        index: usize,
        l2_table: HostCluster,
    ) -> Result<()> {
        let entry = COPIED | l2_table.offset(self.0.cluster_bits).0;
        self.0.store(backend, index, entry).await
    }

    /// Clear entry `index`, on disk.
    pub async fn unlink<B: Backend>(&self, backend: &B, index: usize) -> Result<()> {
        self.0.store(backend, index, 0).await
    }

    /// All referenced L2 tables with their index.
    pub fn l2_tables(&self) -> impl Iterator<Item = (usize, HostCluster)> + '_ {
        self.0.targets()
    }
}

/// What an L2 entry says about its guest cluster.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum L2Mapping {
    /// Not allocated; reads as zero.
    Unallocated,

    /// Reads as zero, possibly with preallocated host space.
    Zero {
        /// Preallocated host cluster.
        host_cluster: Option<HostCluster>,
    },

    /// Data lives in the given host cluster.
    DataFile {
        /// Host cluster holding the data.
        host_cluster: HostCluster,
    },

    /// Compressed cluster.
    Compressed,
}

impl L2Mapping {
    /// Decode a raw L2 entry.
    fn decode(entry: u64, cluster_bits: u32) -> Self {
        if entry & L2_COMPRESSED != 0 {
            return L2Mapping::Compressed;
        }

        let host_cluster = TableKind::L2
            .target(entry)
            .map(|target| target.cluster(cluster_bits));
        match host_cluster {
            _ if entry & L2_ZERO != 0 => L2Mapping::Zero { host_cluster },
            Some(host_cluster) => L2Mapping::DataFile { host_cluster },
            None => L2Mapping::Unallocated,
        }
    }
}

/// L2 table: maps the guest clusters of one L1 entry.
///
/// Shared through the L2 cache; entries are changed under the allocator lock.
#[derive(Debug)]
pub(crate) struct L2Table(EntryTable);

impl L2Table {
    /// Entries per table with the largest cluster size.
    pub const MAX_ENTRIES: usize = 1 << (MAX_CLUSTER_BITS - 3);

    /// Empty table at `cluster`; nothing is written.
    pub fn new(cluster: HostCluster, cluster_bits: u32) -> Self {
        let entries = 1 << (cluster_bits - 3);
        L2Table(EntryTable::new(TableKind::L2, cluster, entries, cluster_bits))
    }

    /// Load the table at `cluster`.
    pub async fn load<B: Backend>(
        backend: &B,
        cluster: HostCluster,
        cluster_bits: u32,
    ) -> Result<Self> {
        let entries = 1 << (cluster_bits - 3);
        debug_assert!(entries <= Self::MAX_ENTRIES);
        EntryTable::load(backend, TableKind::L2, cluster, entries, cluster_bits)
            .await
            .map(L2Table)
    }

    /// Write the whole table.
    pub async fn write<B: Backend>(&self, backend: &B) -> Result<()> {
        self.0.write(backend).await
    }

    /// Where the table is stored.
    pub fn cluster(&self) -> HostCluster {
        self.0.cluster
    }

    /// Look up `guest_cluster`, which must belong to this table.
    pub fn mapping(&self, guest_cluster: GuestCluster) -> L2Mapping {
        let cb = self.0.cluster_bits;
        L2Mapping::decode(self.0.get(guest_cluster.l2_index(cb)), cb)
    }

    /// Map `guest_cluster` to `host_cluster`, on disk.
    pub async fn map<B: Backend>(
        &self,
        backend: &B,
        guest_cluster: GuestCluster,
        host_cluster: HostCluster,
    ) -> Result<()> {
        let cb = self.0.cluster_bits;
        let entry = COPIED | host_cluster.offset(cb).0;
        self.0.store(backend, guest_cluster.l2_index(cb), entry).await
    }

    /// Make `guest_cluster` unallocated, on disk.
    pub async fn unmap<B: Backend>(&self, backend: &B, guest_cluster: GuestCluster) -> Result<()> {
        let index = guest_cluster.l2_index(self.0.cluster_bits);
        self.0.store(backend, index, 0).await
    }

    /// Host clusters referenced from this table, with their index.
    ///
    /// Includes preallocated zero clusters, excludes compressed clusters.
    pub fn host_clusters(&self) -> impl Iterator<Item = (usize, HostCluster)> + '_ {
        self.0.targets()
    }
}

/// Refcount table: references one refcount block per entry.
#[derive(Debug)]
pub(crate) struct RefTable(EntryTable);

impl RefTable {
    /// Largest refcount table accepted, in entries.
    pub const MAX_ENTRIES: usize = L1Table::MAX_ENTRIES;

    /// Empty table of `entries` entries at `cluster`; nothing is written.
    pub fn new(cluster: HostCluster, entries: usize, cluster_bits: u32) -> Self {
        RefTable(EntryTable::new(TableKind::Refcount, cluster, entries, cluster_bits))
    }

    /// Load the table of `entries` entries at `cluster`.
    pub async fn load<B: Backend>(
        backend: &B,
        cluster: HostCluster,
        entries: usize,
        cluster_bits: u32,
    ) -> Result<Self> {
        if entries > Self::MAX_ENTRIES {
            return Err(invalid_metadata(format!(
                "Refcount table of {entries} entries exceeds the maximum of {}",
                Self::MAX_ENTRIES
            )));
        }
        EntryTable::load(backend, TableKind::Refcount, cluster, entries, cluster_bits)
            .await
            .map(RefTable)
    }

    /// Copy of this table with `entries` entries (at least as many as now), stored at `cluster`.
    pub fn relocated(&self, cluster: HostCluster, entries: usize) -> Self {
        let table = EntryTable::new(TableKind::Refcount, cluster, entries, self.0.cluster_bits);
        for (slot, old) in table.entries.iter().zip(self.0.entries.iter()) {
            slot.store(old.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        RefTable(table)
    }

    /// Write the whole table.
    pub async fn write<B: Backend>(&self, backend: &B) -> Result<()> {
        self.0.write(backend).await
    }

    /// First cluster of the table.
    pub fn cluster(&self) -> HostCluster {
        self.0.cluster
    }

    /// Clusters spanned by the table.
    pub fn clusters(&self) -> ClusterCount {
        self.0.clusters()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// The refcount block referenced by entry `index`, if any.
    pub fn refblock(&self, index: usize) -> Option<HostCluster> {
        TableKind::Refcount
            .target(self.0.get(index))
            .map(|target| target.cluster(self.0.cluster_bits))
    }

    /// Reference `refblock` from entry `index`, in memory only.
    pub fn set_refblock(&self, index: usize, refblock: HostCluster) -> Result<()> {
        self.0
            .replace(index, refblock.offset(self.0.cluster_bits).0)
            .map(|_| ())
    }

    /// Reference `refblock` from entry `index`, on disk.
    pub async fn link<B: Backend>(
        &self,
        backend: &B,
        index: usize,
        refblock: HostCluster,
    ) -> Result<()> {
        let entry = refblock.offset(self.0.cluster_bits).0;
        self.0.store(backend, index, entry).await
    }

    /// All referenced refcount blocks with their index.
    pub fn refblocks(&self) -> impl Iterator<Item = (usize, HostCluster)> + '_ {
        self.0.targets()
    }
}

/// Size of a refcount table that replaces one of `current` entries and covers refcount block
/// `index`.
///
/// The new table and the refcount blocks it needs for itself are placed at or below the range of
/// block `index`, so the result leaves room for those blocks’ entries too.  Always a whole number
/// of clusters.
pub(crate) fn grown_reftable_len(
    current: usize,
    index: usize,
    rb_bits: u32,
    cluster_bits: u32,
) -> Result<usize> {
    let per_cluster = 1usize << (cluster_bits - 3);
    let rb_entries = 1usize << rb_bits;
    let entries_for = |extra_blocks: usize| {
        // One more for a run that starts in the middle of a block
        (index + 2 + extra_blocks)
            .max(current)
            .next_multiple_of(per_cluster)
    };

    // k blocks covering the table’s n clusters and themselves need k * rb_entries >= n + k
    let mut entries = entries_for(0);
    loop {
        let table_clusters = entries / per_cluster;
        let own_blocks = table_clusters.div_ceil(rb_entries - 1);
        let needed = entries_for(own_blocks);
        if needed <= entries {
            break;
        }
        entries = needed;
    }

    if entries > RefTable::MAX_ENTRIES {
        return Err(Error::Unsupported(format!(
            "Refcount table of {entries} entries exceeds the maximum of {}",
            RefTable::MAX_ENTRIES
        )));
    }
    Ok(entries)
}

/// Where one refcount lives inside a refcount block.
enum RefcountBits {
    /// Part of a byte, starting at the least significant bit.
    Packed {
        /// Byte index.
        byte: usize,
        /// Bit position inside the byte.
        shift: u32,
        /// Mask of the refcount’s width, not shifted.
        mask: u8,
    },

    /// Whole bytes, big-endian.
    Bytes(Range<usize>),
}

/// Refcount block.
///
/// Holds `1 << rb_bits` refcounts, each `1 << refcount_order` bits wide.  The bytes are atomic so
/// the block can be shared through the cache; the allocator serializes all changes.
#[derive(Debug)]
pub(crate) struct RefBlock {
    /// Cluster in the image file.
    cluster: HostCluster,

    /// On-disk image of the block.
    raw: Box<[AtomicU8]>,

    /// log2 of the refcount width in bits.
    refcount_order: u32,

    /// log2 of the cluster size.
    cluster_bits: u32,
}

impl RefBlock {
    /// All-zero block at `cluster`; nothing is written.
    pub fn new(cluster: HostCluster, cluster_bits: u32, refcount_order: u32) -> Self {
        RefBlock {
            cluster,
            raw: (0..1usize << cluster_bits).map(|_| AtomicU8::new(0)).collect(),
            refcount_order,
            cluster_bits,
        }
    }

    /// Load the block at `cluster`.
    pub async fn load<B: Backend>(
        backend: &B,
        cluster: HostCluster,
        cluster_bits: u32,
        refcount_order: u32,
    ) -> Result<Self> {
        let offset = cluster.offset(cluster_bits);
        check_placement("Refcount block", offset, 1 << cluster_bits, cluster_bits)?;

        let raw = backend.read_bytes(offset.0, 1 << cluster_bits).await?;
        Ok(RefBlock {
            cluster,
            raw: raw.into_iter().map(AtomicU8::new).collect(),
            refcount_order,
            cluster_bits,
        })
    }

    /// Where the block is stored.
    pub fn cluster(&self) -> HostCluster {
        self.cluster
    }

    /// Bytes `range` as they are now.
    fn snapshot(&self, range: Range<usize>) -> Vec<u8> {
        self.raw[range]
            .iter()
            .map(|byte| byte.load(Ordering::Relaxed))
            .collect()
    }

    /// Write the whole block.
    pub async fn write<B: Backend>(&self, backend: &B) -> Result<()> {
        let raw = self.snapshot(0..self.raw.len());
        backend
            .write_at((&raw).into(), self.cluster.offset(self.cluster_bits).0)
            .await?;
        Ok(())
    }

    /// Write the backend sector holding refcount `index`.
    pub async fn write_refcount<B: Backend>(&self, backend: &B, index: usize) -> Result<()> {
        let chunk = backend.sector_size().min(self.raw.len());
        let byte = (index << self.refcount_order) / 8;
        let start = byte - byte % chunk;

        let raw = self.snapshot(start..start + chunk);
        let offset = self.cluster.offset(self.cluster_bits).0 + start as u64;
        backend.write_at((&raw).into(), offset).await?;
        Ok(())
    }

    /// Number of refcounts in the block.
    pub fn len(&self) -> usize {
        (self.raw.len() * 8) >> self.refcount_order
    }

    /// Largest refcount the width allows.
    pub fn max_refcount(&self) -> u64 {
        u64::MAX >> (64 - (1u32 << self.refcount_order))
    }

    /// Locate refcount `index`.
    fn bits_of(&self, index: usize) -> RefcountBits {
        let width = 1usize << self.refcount_order;
        if width < 8 {
            let bit = index * width;
            RefcountBits::Packed {
                byte: bit / 8,
                shift: (bit % 8) as u32,
                mask: ((1u16 << width) - 1) as u8,
            }
        } else {
            let bytes = width / 8;
            RefcountBits::Bytes(index * bytes..(index + 1) * bytes)
        }
    }

    /// Refcount `index`.
    pub fn get(&self, index: usize) -> u64 {
        match self.bits_of(index) {
            RefcountBits::Packed { byte, shift, mask } => {
                ((self.raw[byte].load(Ordering::Relaxed) >> shift) & mask) as u64
            }
            RefcountBits::Bytes(range) => self.raw[range]
                .iter()
                .fold(0, |acc, byte| (acc << 8) | byte.load(Ordering::Relaxed) as u64),
        }
    }

    /// Set refcount `index` to `value`, which must fit the width.
    fn put(&self, index: usize, value: u64) {
        match self.bits_of(index) {
            RefcountBits::Packed { byte, shift, mask } => {
                let byte = &self.raw[byte];
                let others = byte.load(Ordering::Relaxed) & !(mask << shift);
                byte.store(others | ((value as u8 & mask) << shift), Ordering::Relaxed);
            }
            RefcountBits::Bytes(range) => {
                for (byte, value) in self.raw[range]
                    .iter()
                    .rev()
                    .zip(value.to_le_bytes())
                {
                    byte.store(value, Ordering::Relaxed);
                }
            }
        }
    }

    /// Change refcount `index` to `f(old)`, returning the old value.
    ///
    /// `None` from `f`, or a result beyond the width, is a consistency violation.
    fn update(&self, index: usize, what: &str, f: impl FnOnce(u64) -> Option<u64>) -> Result<u64> {
        let old = self.get(index);
        match f(old).filter(|new| *new <= self.max_refcount()) {
            Some(new) => {
                self.put(index, new);
                Ok(old)
            }
            None => Err(Error::ConsistencyViolation(format!(
                "Cannot {what} refcount {old} (entry {index} of refcount block {})",
                self.cluster
            ))),
        }
    }

    /// Add one to refcount `index`, returning the old value.
    pub fn increment(&self, index: usize) -> Result<u64> {
        self.update(index, "increment", |old| old.checked_add(1))
    }

    /// Subtract one from refcount `index`, returning the old value.
    pub fn decrement(&self, index: usize) -> Result<u64> {
        self.update(index, "decrement", |old| old.checked_sub(1))
    }

    /// Whether refcount `index` is 0.
    pub fn is_free(&self, index: usize) -> bool {
        self.get(index) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemBackend;

    #[test]
    fn entry_validation() {
        let cb = 16;
        assert!(TableKind::L1.validate(0, cb).is_ok());
        assert!(TableKind::L1.validate(COPIED | 0x30000, cb).is_ok());
        // Reserved bit 1
        assert!(matches!(
            TableKind::L1.validate(0x30002, cb),
            Err(Error::MalformedMetadata(_))
        ));
        // Inside a cluster
        assert!(matches!(
            TableKind::L1.validate(0x30200, cb),
            Err(Error::MalformedMetadata(_))
        ));

        // Compressed descriptors have no reserved bits
        assert!(TableKind::L2.validate(L2_COMPRESSED | 0x1234, cb).is_ok());
        assert!(TableKind::L2.validate(1 << 57 | 0x70000, cb).is_err());

        assert!(TableKind::Refcount.validate(0x10000, cb).is_ok());
        assert!(TableKind::Refcount.validate(0x10001, cb).is_err());
        assert!(TableKind::Refcount.validate(0x10200, cb).is_err());
    }

    #[test]
    fn l2_entry_decoding() {
        let cb = 16;
        assert_eq!(L2Mapping::decode(0, cb), L2Mapping::Unallocated);
        // COPIED does not change the mapping
        for entry in [COPIED | 0x70000, 0x70000] {
            assert_eq!(
                L2Mapping::decode(entry, cb),
                L2Mapping::DataFile {
                    host_cluster: HostCluster(7)
                }
            );
        }
        assert_eq!(L2Mapping::decode(L2_ZERO, cb), L2Mapping::Zero { host_cluster: None });
        assert_eq!(
            L2Mapping::decode(0x70001, cb),
            L2Mapping::Zero {
                host_cluster: Some(HostCluster(7))
            }
        );
        assert_eq!(L2Mapping::decode(L2_COMPRESSED | 0x1234, cb), L2Mapping::Compressed);
    }

    #[test]
    fn refcounts_of_every_width() {
        for order in 0..=6u32 {
            let rb = RefBlock::new(HostCluster(1), 9, order);
            let max = rb.max_refcount();
            assert_eq!(rb.len(), (512 * 8) >> order);

            let last = rb.len() - 1;
            for index in [0, 1, 2, last] {
                assert_eq!(rb.increment(index).unwrap(), 0);
                assert_eq!(rb.get(index), 1);
            }
            // Neighbours stay untouched
            assert_eq!(rb.get(3), 0);
            assert_eq!(rb.get(last - 1), 0);

            rb.put(5, max);
            assert_eq!(rb.get(5), max);
            assert_eq!((rb.get(4), rb.get(6)), (0, 0));
            assert!(matches!(rb.increment(5), Err(Error::ConsistencyViolation(_))));

            assert_eq!(rb.decrement(0).unwrap(), 1);
            assert!(rb.is_free(0));
            assert!(matches!(rb.decrement(0), Err(Error::ConsistencyViolation(_))));
        }
    }

    #[test]
    fn refcount_byte_layout() {
        // 4-bit refcounts: index 1 is the high nibble of byte 0
        let rb = RefBlock::new(HostCluster(1), 9, 2);
        rb.put(1, 0xa);
        rb.put(0, 0x3);
        assert_eq!(rb.snapshot(0..1), [0xa3]);

        // 16-bit refcounts are big-endian
        let rb = RefBlock::new(HostCluster(1), 9, 4);
        rb.put(1, 0x0102);
        assert_eq!(rb.snapshot(0..4), [0, 0, 1, 2]);
    }

    #[test]
    fn grown_reftable_describes_itself() {
        // 512 byte clusters: 64 entries per table cluster, 16-bit refcounts: 256 per block
        let entries = grown_reftable_len(64, 100, 8, 9).unwrap();
        assert!(entries >= 103);
        assert_eq!(entries % 64, 0);

        // Never shrinks
        assert_eq!(grown_reftable_len(640, 3, 8, 9).unwrap(), 640);

        assert!(matches!(
            grown_reftable_len(64, RefTable::MAX_ENTRIES, 8, 9),
            Err(Error::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn entries_are_written_through() {
        let backend = MemBackend::new();
        let cb = 9;

        let l2 = L2Table::new(HostCluster(3), cb);
        l2.write(&backend).await.unwrap();
        l2.map(&backend, GuestCluster(5), HostCluster(4)).await.unwrap();
        l2.map(&backend, GuestCluster(63), HostCluster(5)).await.unwrap();
        let raw = backend.read_bytes(3 * 512 + 5 * 8, 8).await.unwrap();
        assert_eq!(raw, (COPIED | 4 * 512).to_be_bytes());

        let loaded = L2Table::load(&backend, HostCluster(3), cb).await.unwrap();
        assert_eq!(
            loaded.mapping(GuestCluster(5)),
            L2Mapping::DataFile {
                host_cluster: HostCluster(4)
            }
        );
        assert_eq!(
            loaded.host_clusters().collect::<Vec<_>>(),
            vec![(5, HostCluster(4)), (63, HostCluster(5))]
        );

        loaded.unmap(&backend, GuestCluster(5)).await.unwrap();
        let reloaded = L2Table::load(&backend, HostCluster(3), cb).await.unwrap();
        assert_eq!(reloaded.mapping(GuestCluster(5)), L2Mapping::Unallocated);

        let rb = RefBlock::new(HostCluster(6), cb, 4);
        rb.increment(200).unwrap();
        rb.write_refcount(&backend, 200).await.unwrap();
        let loaded = RefBlock::load(&backend, HostCluster(6), cb, 4).await.unwrap();
        assert_eq!(loaded.get(200), 1);
    }

    #[tokio::test]
    async fn failed_store_restores_entry() {
        let backend = MemBackend::new();
        let l1 = L1Table::new(HostCluster(1), 32, 9);
        l1.write(&backend).await.unwrap();

        backend.set_fail_writes(true);
        assert!(l1.link(&backend, 7, HostCluster(9)).await.is_err());
        backend.set_fail_writes(false);
        assert_eq!(l1.l2_table(7), None);

        l1.link(&backend, 7, HostCluster(9)).await.unwrap();
        assert_eq!(l1.l2_tables().collect::<Vec<_>>(), vec![(7, HostCluster(9))]);
        assert!(matches!(
            l1.link(&backend, 32, HostCluster(9)).await,
            Err(Error::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn load_rejects_bad_tables() {
        let backend = MemBackend::new();
        let mut raw = vec![0u8; 512];
        raw[8..16].copy_from_slice(&0x201u64.to_be_bytes());
        backend.write_at((&raw).into(), 512).await.unwrap();
        assert!(matches!(
            RefTable::load(&backend, HostCluster(1), 64, 9).await,
            Err(Error::MalformedMetadata(_))
        ));
        assert!(matches!(
            L1Table::load(&backend, HostCluster(1), L1Table::MAX_ENTRIES + 1, 9).await,
            Err(Error::MalformedMetadata(_))
        ));
        assert!(matches!(
            RefBlock::load(&backend, HostCluster(MAX_FILE_LENGTH >> 9), 9, 4).await,
            Err(Error::MalformedMetadata(_))
        ));
    }
}
