//! Virtual block device on top of a qcow2 image.
//!
//! [`Device`] ties the header, the allocator, and the translation tables together.  It is
//! addressed in 512 byte sectors; requests are cut at cluster boundaries and each piece is
//! translated on its own.

use crate::backend::{Backend, BackendExt, BackendInfo, BackendOpenOptions};
use crate::error::{Error, Result};
use crate::extent::Extent;
use crate::io_buffers::{IoVector, IoVectorMut};
use crate::misc_helpers::{invalid_request, ResultErrorContext};
use crate::qcow2::allocator::{host_cluster_budget, Allocator};
use crate::qcow2::check::{self, CheckReport};
use crate::qcow2::header::{
    AutoclearFeatures, CompatibleFeatures, FeatureName, FeatureType, HeaderExtension,
    IncompatibleFeatures, MAX_CLUSTER_BITS, MAX_REFCOUNT_ORDER, MIN_CLUSTER_BITS,
    V2_REFCOUNT_ORDER,
};
use crate::qcow2::tables::{L1Table, L2Mapping, RefBlock, RefTable};
use crate::qcow2::translation::{Translation, WriteResolution};
use crate::qcow2::types::{ClusterCount, GuestCluster, GuestOffset, HostCluster};
use crate::qcow2::{Header, Version};
use std::cmp;
use std::mem::size_of;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, trace};

/// Size of a device sector in bytes.
pub const SECTOR_SIZE: u64 = 512;

/// Options for creating a new image.
#[derive(Clone, Debug)]
pub struct CreateOptions {
    /// Format version.
    pub(crate) version: Version,

    /// log2 of the cluster size.
    pub(crate) cluster_bits: u32,

    /// log2 of the refcount width in bits.
    pub(crate) refcount_order: u32,

    /// Whether to set the lazy refcounts feature bit.
    pub(crate) lazy_refcounts: bool,

    /// Upper bound for the number of host clusters.
    pub(crate) max_host_clusters: Option<u64>,
}

/// A run of sectors reported by [`Device::fold_over_mapped()`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Segment {
    /// The sectors.
    pub extent: Extent,

    /// Whether the sectors are stored in the image, as opposed to implicitly reading as zero.
    pub backed: bool,
}

/// Summary of a connected device.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DeviceInfo {
    /// Virtual size in sectors.
    pub size_sectors: u64,

    /// Cluster size in bytes.
    pub cluster_size: usize,

    /// Image format version.
    pub version: Version,

    /// Whether the device accepts writes.
    pub read_write: bool,

    /// Number of host clusters the image may grow to.
    pub host_cluster_limit: u64,

    /// The underlying backend.
    pub backend: BackendInfo,
}

/// Virtual block device stored in a qcow2 image.
#[must_use = "devices must be disconnected to flush outstanding writes"]
pub struct Device<B: Backend> {
    /// Image backend.
    backend: Arc<B>,

    /// Whether this device may be modified.
    writable: bool,

    /// Virtual size in bytes.
    size: u64,

    /// log2 of the cluster size.
    cluster_bits: u32,

    /// Allocates clusters; also holds the header.
    allocator: Mutex<Allocator<B>>,

    /// L1/L2 tables.
    translation: Translation<B>,

    /// Shared by data I/O, taken exclusively by operations that must not interleave with it.
    ///
    /// Unaligned writes are read-modify-write cycles on the backend and so must not run
    /// concurrently with any other write to the same sectors.
    io_lock: RwLock<()>,
}

impl CreateOptions {
    /// Default options: version 3, 64 KiB clusters, 16 bit refcounts.
    pub fn new() -> Self {
        CreateOptions::default()
    }

    /// Set the format version.
    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    /// Set the cluster size (as log2).
    pub fn cluster_bits(mut self, cluster_bits: u32) -> Self {
        self.cluster_bits = cluster_bits;
        self
    }

    /// Set the refcount width (as log2 of its bits).
    ///
    /// Version 2 images only support an order of 4.
    pub fn refcount_order(mut self, refcount_order: u32) -> Self {
        self.refcount_order = refcount_order;
        self
    }

    /// Whether to mark the image as using lazy refcounts (version 3 only).
    pub fn lazy_refcounts(mut self, lazy_refcounts: bool) -> Self {
        self.lazy_refcounts = lazy_refcounts;
        self
    }

    /// Limit the image to the given number of host clusters.
    ///
    /// Creation fails with [`Error::NoSpace`] if the limit does not allow writing the whole
    /// device.
    pub fn max_host_clusters(mut self, max_host_clusters: u64) -> Self {
        self.max_host_clusters = Some(max_host_clusters);
        self
    }

    /// Check the options for consistency.
    fn validate(&self) -> Result<()> {
        if !(MIN_CLUSTER_BITS..=MAX_CLUSTER_BITS).contains(&self.cluster_bits) {
            return Err(invalid_request(format!(
                "Cluster size must be between 2^{MIN_CLUSTER_BITS} and 2^{MAX_CLUSTER_BITS}, not 2^{}",
                self.cluster_bits
            )));
        }
        if self.refcount_order > MAX_REFCOUNT_ORDER {
            return Err(invalid_request(format!(
                "Refcount width must not exceed 2^{MAX_REFCOUNT_ORDER} bits, not 2^{}",
                self.refcount_order
            )));
        }
        if self.version == Version::V2 {
            if self.refcount_order != V2_REFCOUNT_ORDER {
                return Err(invalid_request(
                    "Version 2 images only support 16 bit refcounts",
                ));
            }
            if self.lazy_refcounts {
                return Err(invalid_request(
                    "Version 2 images do not support lazy refcounts",
                ));
            }
        }
        Ok(())
    }
}

impl Default for CreateOptions {
    fn default() -> Self {
        CreateOptions {
            version: Version::V3,
            cluster_bits: 16,
            refcount_order: V2_REFCOUNT_ORDER,
            lazy_refcounts: false,
            max_host_clusters: None,
        }
    }
}

/// Feature name table written into new version 3 images.
fn default_feature_names() -> Vec<FeatureName> {
    let names: [(FeatureType, u32, &str); 8] = [
        (FeatureType::Incompatible, IncompatibleFeatures::DIRTY.bits().trailing_zeros(), "dirty bit"),
        (FeatureType::Incompatible, IncompatibleFeatures::CORRUPT.bits().trailing_zeros(), "corrupt bit"),
        (
            FeatureType::Incompatible,
            IncompatibleFeatures::EXTERNAL_DATA_FILE.bits().trailing_zeros(),
            "external data file",
        ),
        (
            FeatureType::Incompatible,
            IncompatibleFeatures::COMPRESSION_TYPE.bits().trailing_zeros(),
            "compression type",
        ),
        (
            FeatureType::Incompatible,
            IncompatibleFeatures::EXTENDED_L2_ENTRIES.bits().trailing_zeros(),
            "extended L2 entries",
        ),
        (
            FeatureType::Compatible,
            CompatibleFeatures::LAZY_REFCOUNTS.bits().trailing_zeros(),
            "lazy refcounts",
        ),
        (FeatureType::Autoclear, AutoclearFeatures::BITMAPS.bits().trailing_zeros(), "bitmaps"),
        (
            FeatureType::Autoclear,
            AutoclearFeatures::RAW_EXTERNAL_DATA.bits().trailing_zeros(),
            "raw external data",
        ),
    ];

    names
        .into_iter()
        .map(|(feature_type, bit, name)| FeatureName {
            feature_type: feature_type.into(),
            bit: bit as u8,
            name: name.to_string(),
        })
        .collect()
}

/// Initial image layout, in clusters.
struct Layout {
    /// Clusters taken by the refcount table (starting at cluster 1).
    reftable: u64,

    /// Clusters taken by the L1 table (following the refcount table).
    l1: u64,

    /// Number of refcount blocks (following the L1 table).
    refblocks: u64,
}

impl Layout {
    /// Find the smallest layout whose refcount structures cover the whole layout.
    fn new(header: &Header) -> Self {
        let cb = header.cluster_bits;
        let cluster_size = 1u64 << cb;
        let rb_entries = header.rb_entries() as u64;
        let l1 = (header.l1_size as u64 * size_of::<u64>() as u64).div_ceil(cluster_size);

        let mut layout = Layout {
            reftable: 1,
            l1,
            refblocks: 1,
        };
        loop {
            let refblocks = layout.total().div_ceil(rb_entries);
            let reftable = cmp::max((refblocks * size_of::<u64>() as u64).div_ceil(cluster_size), 1);
            if refblocks == layout.refblocks && reftable == layout.reftable {
                return layout;
            }
            layout.refblocks = refblocks;
            layout.reftable = reftable;
        }
    }

    /// All clusters, including the header.
    fn total(&self) -> u64 {
        1 + self.reftable + self.l1 + self.refblocks
    }

    /// First L1 table cluster.
    fn l1_start(&self) -> HostCluster {
        HostCluster(1 + self.reftable)
    }

    /// First refcount block.
    fn refblocks_start(&self) -> HostCluster {
        HostCluster(1 + self.reftable + self.l1)
    }
}

impl<B: Backend> Device<B> {
    /// Create a new, empty image of `size` bytes on `backend`.
    ///
    /// Lays out the header at cluster 0, the refcount table from cluster 1, the L1 table after
    /// that, and the refcount blocks describing all of these last.  The header is written after
    /// everything else.
    pub async fn create(backend: B, size: u64, opts: &CreateOptions) -> Result<Self> {
        opts.validate()?;
        if !backend.is_writable() {
            return Err(Error::ReadOnly);
        }
        if size % SECTOR_SIZE != 0 {
            return Err(invalid_request(format!(
                "Size {size} is not a multiple of the sector size {SECTOR_SIZE}"
            )));
        }

        let cb = opts.cluster_bits;
        check_backend_sector_size(&backend, cb)?;

        let l1_size = Header::required_l1_entries(size, cb);
        if l1_size > L1Table::MAX_ENTRIES as u64 {
            return Err(invalid_request(format!(
                "Size {size} needs {l1_size} L1 entries, more than the maximum of {}",
                L1Table::MAX_ENTRIES
            )));
        }

        let mut header = Header::new(opts.version, cb, opts.refcount_order, size);
        header.l1_size = l1_size as u32;
        if let Some(features) = header.features.as_mut() {
            if opts.lazy_refcounts {
                features.compatible |= CompatibleFeatures::LAZY_REFCOUNTS.bits();
            }
            header
                .extensions
                .push(HeaderExtension::FeatureNameTable(default_feature_names()));
        }

        let budget = host_cluster_budget(&header);
        let max_refblocks = budget.div_ceil(header.rb_entries() as u64);
        if max_refblocks > RefTable::MAX_ENTRIES as u64 {
            return Err(invalid_request(format!(
                "Size {size} needs up to {max_refblocks} refcount blocks, more than the maximum of {}",
                RefTable::MAX_ENTRIES
            )));
        }
        let limit = match opts.max_host_clusters {
            Some(cap) if cap < budget => return Err(Error::NoSpace { limit: cap }),
            Some(cap) => cap,
            None => budget,
        };

        let layout = Layout::new(&header);
        header.refcount_table_offset = HostCluster(1).offset(cb).0;
        header.refcount_table_clusters = layout.reftable as u32;
        header.l1_table_offset = layout.l1_start().offset(cb).0;
        debug!(
            "Creating image of {size} bytes: {} byte clusters, {} bit refcounts, {} L1 entries, \
             {} clusters of metadata, limit {limit} clusters",
            1u64 << cb,
            1u64 << opts.refcount_order,
            l1_size,
            layout.total()
        );

        let backend = Arc::new(backend);
        write_initial_metadata(backend.as_ref(), &header, &layout).await?;

        let raw = header.encode()?;
        backend.write_at((&raw).into(), 0).await?;
        backend.flush().await?;

        Self::from_parts(backend, header, limit, true)
    }

    /// Open the image on `backend`.
    ///
    /// Reads and validates the header; the L1 table and refcount structures are loaded on first
    /// use.  Opening writable clears all auto-clear feature bits.
    pub async fn connect(backend: B, writable: bool) -> Result<Self> {
        if writable && !backend.is_writable() {
            return Err(Error::ReadOnly);
        }

        let first_sector = backend.read_bytes(0, SECTOR_SIZE as usize).await?;
        let cluster_bits = u32::from_be_bytes([
            first_sector[20],
            first_sector[21],
            first_sector[22],
            first_sector[23],
        ]);
        // Let the decoder report an out-of-range cluster size
        let header_bytes = if (MIN_CLUSTER_BITS..=MAX_CLUSTER_BITS).contains(&cluster_bits) {
            backend.read_bytes(0, 1 << cluster_bits).await?
        } else {
            first_sector
        };
        let mut header = Header::decode(&header_bytes)?;
        let cb = header.cluster_bits;

        check_supported(&header, writable)?;
        check_backend_sector_size(&backend, cb)?;

        let backend = Arc::new(backend);
        if writable && header.clear_autoclear_bits() {
            debug!("Clearing auto-clear feature bits");
            let raw = header.encode()?;
            backend.write_at((&raw).into(), 0).await?;
        }

        let budget = host_cluster_budget(&header);
        let file_clusters = ClusterCount::covering(backend.size()?, cb).0;
        let limit = cmp::max(budget, file_clusters);
        debug!(
            "Connected {:?} image of {} bytes ({} byte clusters){}",
            header.version,
            header.size,
            1u64 << cb,
            if writable { "" } else { ", read-only" }
        );

        Self::from_parts(backend, header, limit, writable)
    }

    /// Connect a backend with the given options, then open the image on it.
    pub async fn open(opts: BackendOpenOptions) -> Result<Self> {
        let writable = opts.writable;
        let backend = B::connect(opts).await?;
        Self::connect(backend, writable).await
    }

    /// Assemble a device from a validated header.
    fn from_parts(backend: Arc<B>, header: Header, limit: u64, writable: bool) -> Result<Self> {
        let translation = Translation::new(Arc::clone(&backend), &header)?;
        Ok(Device {
            writable,
            size: header.size,
            cluster_bits: header.cluster_bits,
            allocator: Mutex::new(Allocator::new(Arc::clone(&backend), header, limit)),
            translation,
            backend,
            io_lock: RwLock::new(()),
        })
    }

    /// Virtual size in sectors.
    pub fn size_sectors(&self) -> u64 {
        self.size / SECTOR_SIZE
    }

    /// Whether the device accepts writes.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Check that `length` bytes at `sector` lie within the device and cover whole sectors.
    ///
    /// Returns the byte offset.
    fn check_bounds(&self, sector: u64, length: u64) -> Result<u64> {
        let Some(sectors) = Extent::from_byte_range(0, length, SECTOR_SIZE) else {
            return Err(invalid_request(format!(
                "Length {length} is not a multiple of the sector size {SECTOR_SIZE}"
            )));
        };
        self.check_range(sector, sectors.length)?;
        Ok(sector * SECTOR_SIZE)
    }

    /// Check that `count` sectors from `sector` lie within the device.
    fn check_range(&self, sector: u64, count: u64) -> Result<()> {
        let in_bounds = sector
            .checked_add(count)
            .is_some_and(|end| end <= self.size_sectors());
        if !in_bounds {
            return Err(invalid_request(format!(
                "Request of {count} sectors at sector {sector} exceeds the device size of {} sectors",
                self.size_sectors()
            )));
        }
        Ok(())
    }

    /// Read from `sector` into `bufv`.
    ///
    /// `bufv` may be arbitrarily fragmented, but its total length must be a multiple of the sector
    /// size.  Unallocated areas read as zeroes without touching the backend.
    pub async fn read(&self, sector: u64, mut bufv: IoVectorMut<'_>) -> Result<()> {
        let mut offset = self.check_bounds(sector, bufv.len())?;
        let cb = self.cluster_bits;
        let _io = self.io_lock.read().await;

        while !bufv.is_empty() {
            let guest_offset = GuestOffset(offset);
            let chunk_length = cmp::min(guest_offset.to_cluster_end(cb), bufv.len());
            let (mut chunk, remainder) = bufv.split_at(chunk_length);
            bufv = remainder;

            match self
                .translation
                .resolve_for_read(guest_offset)
                .await
                .err_context(|| format!("Reading guest offset {guest_offset}"))?
            {
                Some(host_offset) => self.backend.read_at(chunk, host_offset.0).await?,
                None => chunk.fill(0),
            }

            offset += chunk_length;
        }

        Ok(())
    }

    /// Write `bufv` to `sector`.
    ///
    /// `bufv` may be arbitrarily fragmented, but its total length must be a multiple of the sector
    /// size.  Clusters are allocated as needed.
    pub async fn write(&self, sector: u64, mut bufv: IoVector<'_>) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        let mut offset = self.check_bounds(sector, bufv.len())?;
        let cb = self.cluster_bits;

        // Host clusters are aligned, so host alignment equals guest alignment
        let _io_shared;
        let _io_exclusive;
        if self.backend.is_aligned(offset, bufv.len()) {
            _io_shared = self.io_lock.read().await;
        } else {
            _io_exclusive = self.io_lock.write().await;
        }

        while !bufv.is_empty() {
            let guest_offset = GuestOffset(offset);
            let chunk_length = cmp::min(guest_offset.to_cluster_end(cb), bufv.len());
            let (chunk, remainder) = bufv.split_at(chunk_length);
            bufv = remainder;

            self.write_chunk(guest_offset, chunk)
                .await
                .err_context(|| format!("Writing guest offset {guest_offset}"))?;

            offset += chunk_length;
        }

        Ok(())
    }

    /// Write data that does not cross a cluster boundary.
    async fn write_chunk(&self, guest_offset: GuestOffset, chunk: IoVector<'_>) -> Result<()> {
        if let Some(host_offset) = self.translation.resolve_for_read(guest_offset).await? {
            self.backend.write_at(chunk, host_offset.0).await?;
            return Ok(());
        }

        let resolution = {
            let mut allocator = self.allocator.lock().await;
            self.translation
                .resolve_for_write(&mut allocator, guest_offset, &chunk)
                .await?
        };

        if let WriteResolution::Mapped(host_offset) = resolution {
            self.backend.write_at(chunk, host_offset.0).await?;
        }
        Ok(())
    }

    /// Discard `count` sectors from `sector`.
    ///
    /// Clusters fully covered are unmapped and their host clusters freed.  Allocated clusters only
    /// partially covered get the discarded part overwritten with zeroes.  Afterwards, the whole
    /// range reads as zero.
    pub async fn discard(&self, sector: u64, count: u64) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        self.check_range(sector, count)?;
        if count == 0 {
            return Ok(());
        }

        let cb = self.cluster_bits;
        let sectors_per_cluster = 1u64 << (cb - 9);
        let device = Extent::new(0, self.size_sectors());
        let range = Extent::new(sector, count);
        let _io = self.io_lock.write().await;

        let first_cluster = range.start / sectors_per_cluster;
        let end_cluster = range.end().div_ceil(sectors_per_cluster);
        for cluster_index in first_cluster..end_cluster {
            let cluster = Extent::new(cluster_index * sectors_per_cluster, sectors_per_cluster);
            let Some(cluster) = cluster.intersect(&device) else {
                break;
            };

            if range.covers(&cluster) {
                let guest_offset = GuestOffset(cluster.start * SECTOR_SIZE);
                let mut allocator = self.allocator.lock().await;
                self.translation
                    .unmap(&mut allocator, guest_offset.cluster(cb))
                    .await
                    .err_context(|| format!("Discarding guest offset {guest_offset}"))?;
                continue;
            }

            let Some(partial) = cluster.intersect(&range) else {
                continue;
            };
            let bytes = partial.byte_range(SECTOR_SIZE);
            let guest_offset = GuestOffset(bytes.start);
            if let Some(host_offset) = self.translation.resolve_for_read(guest_offset).await? {
                trace!("Zeroing {partial} in place of a partial-cluster discard");
                let zeroes = vec![0u8; (bytes.end - bytes.start) as usize];
                self.backend
                    .write_at((&zeroes).into(), host_offset.0)
                    .await?;
            }
        }

        Ok(())
    }

    /// Visit all runs of backed and unbacked sectors in ascending order.
    ///
    /// The runs partition the whole device and are maximal: two adjacent runs always differ in
    /// whether they are backed.  `f` is called for each run, threading through an accumulator
    /// that starts as `init`.  L1 slots without an L2 table are skipped as a whole, without
    /// loading anything.  Compressed clusters count as backed, zero clusters as unbacked.
    pub async fn fold_over_mapped<T, F>(&self, init: T, mut f: F) -> Result<T>
    where
        F: FnMut(T, Segment) -> T,
    {
        let cb = self.cluster_bits;
        let sectors_per_cluster = 1u64 << (cb - 9);
        let l2_entries = 1usize << (cb - 3);
        let sectors_per_l2 = sectors_per_cluster * l2_entries as u64;
        let device = Extent::new(0, self.size_sectors());
        let _io = self.io_lock.read().await;

        let mut acc = init;
        let mut current: Option<Segment> = None;
        let mut push = |acc: T, current: &mut Option<Segment>, segment: Segment| -> T {
            match current.take() {
                Some(cur) if cur.backed == segment.backed => {
                    // Runs are produced in order without gaps
                    let merged = cur.extent.merge_adjacent(&segment.extent).unwrap_or(cur.extent);
                    *current = Some(Segment {
                        extent: merged,
                        backed: cur.backed,
                    });
                    acc
                }
                Some(cur) => {
                    *current = Some(segment);
                    f(acc, cur)
                }
                None => {
                    *current = Some(segment);
                    acc
                }
            }
        };

        for l1_index in 0..self.translation.l1_entries() {
            let slot = Extent::new(l1_index as u64 * sectors_per_l2, sectors_per_l2);
            let Some(slot) = slot.intersect(&device) else {
                break;
            };

            let Some(l2) = self
                .translation
                .l2_table_at(l1_index)
                .await
                .err_context(|| format!("L1 index {l1_index}"))?
            else {
                acc = push(acc, &mut current, Segment { extent: slot, backed: false });
                continue;
            };

            let first_cluster = slot.start / sectors_per_cluster;
            for l2_index in 0..l2_entries {
                let cluster_index = first_cluster + l2_index as u64;
                let cluster = Extent::new(cluster_index * sectors_per_cluster, sectors_per_cluster);
                let Some(cluster) = cluster.intersect(&device) else {
                    break;
                };

                let backed = matches!(
                    l2.mapping(GuestCluster(cluster_index)),
                    L2Mapping::DataFile { .. } | L2Mapping::Compressed
                );
                acc = push(acc, &mut current, Segment { extent: cluster, backed });
            }
        }

        drop(push);
        if let Some(last) = current {
            acc = f(acc, last);
        }
        Ok(acc)
    }

    /// Number of sectors stored in the image.
    pub async fn allocated_sectors(&self) -> Result<u64> {
        self.fold_over_mapped(0, |sum, segment| {
            if segment.backed {
                sum + segment.extent.length
            } else {
                sum
            }
        })
        .await
    }

    /// Name of the backing file given in the header, if any.
    ///
    /// Backing files are not opened; unallocated areas always read as zero.
    pub async fn backing_file_name(&self) -> Result<Option<String>> {
        let Some(backing_file) = self.allocator.lock().await.header().backing_file else {
            return Ok(None);
        };

        let raw = self
            .backend
            .read_bytes(backing_file.offset, backing_file.length as usize)
            .await?;
        let name = String::from_utf8(raw)
            .map_err(|err| Error::MalformedHeader(format!("Invalid backing file name: {err}")))?;
        Ok(Some(name))
    }

    /// Make all completed writes durable.
    pub async fn flush(&self) -> Result<()> {
        self.backend.flush().await?;
        Ok(())
    }

    /// Flush and release the backend.
    pub async fn disconnect(self) -> Result<()> {
        let _io = self.io_lock.write().await;
        self.translation.clear_cache().await;
        self.backend.disconnect().await?;
        debug!("Disconnected");
        Ok(())
    }

    /// A copy of the current image header.
    pub async fn header(&self) -> Header {
        self.allocator.lock().await.header().clone()
    }

    /// Summarize the device.
    pub async fn get_info(&self) -> Result<DeviceInfo> {
        let allocator = self.allocator.lock().await;
        Ok(DeviceInfo {
            size_sectors: self.size_sectors(),
            cluster_size: 1 << self.cluster_bits,
            version: allocator.header().version,
            read_write: self.writable,
            host_cluster_limit: allocator.limit(),
            backend: self.backend.get_info()?,
        })
    }

    /// Walk all structures and verify that no two of them share a host cluster, and that the
    /// refcounts match.
    ///
    /// Waits for in-flight requests to finish and blocks new ones while running.
    pub async fn check(&self) -> Result<CheckReport> {
        let _io = self.io_lock.write().await;
        let mut allocator = self.allocator.lock().await;
        check::check(&mut allocator, &self.translation).await
    }

    /// Make the next cluster allocation scan start at host cluster `cluster`.
    #[cfg(any(test, feature = "test_utils"))]
    pub async fn set_next_cluster(&self, cluster: u64) {
        self.allocator
            .lock()
            .await
            .set_next_cluster(HostCluster(cluster));
    }
}

/// Reject images using features this implementation cannot handle.
fn check_supported(header: &Header, writable: bool) -> Result<()> {
    if header.crypt_method != 0 {
        return Err(Error::Unsupported(format!(
            "Encryption (method {})",
            header.crypt_method
        )));
    }

    let unknown = header.unknown_incompatible_features();
    if unknown != 0 {
        return Err(Error::Unsupported(format!(
            "Unknown incompatible feature(s): {}",
            header.describe_features(FeatureType::Incompatible, unknown)
        )));
    }

    let incompatible = header.incompatible_features();
    for feature in [
        IncompatibleFeatures::EXTERNAL_DATA_FILE,
        IncompatibleFeatures::EXTENDED_L2_ENTRIES,
    ] {
        if incompatible.contains(feature) {
            return Err(Error::Unsupported(format!(
                "Incompatible feature {}",
                header.describe_features(FeatureType::Incompatible, feature.bits())
            )));
        }
    }
    if header.external_data_file_name().is_some() {
        return Err(Error::Unsupported("External data file".into()));
    }

    if writable {
        for feature in [IncompatibleFeatures::DIRTY, IncompatibleFeatures::CORRUPT] {
            if incompatible.contains(feature) {
                return Err(Error::Unsupported(format!(
                    "Image is marked with {}; it can only be opened read-only",
                    header.describe_features(FeatureType::Incompatible, feature.bits())
                )));
            }
        }
        if header.nb_snapshots != 0 {
            return Err(Error::Unsupported(format!(
                "Image has {} internal snapshot(s); it can only be opened read-only",
                header.nb_snapshots
            )));
        }
    }

    if header.refcount_table_clusters == 0 {
        return Err(Error::MalformedHeader("Image has no refcount table".into()));
    }

    Ok(())
}

/// Backend sectors must not be larger than clusters.
fn check_backend_sector_size<B: Backend>(backend: &B, cluster_bits: u32) -> Result<()> {
    let sector_size = backend.sector_size();
    if !sector_size.is_power_of_two() || sector_size > 1 << cluster_bits {
        return Err(Error::Unsupported(format!(
            "Backend sector size {sector_size} with {} byte clusters",
            1u64 << cluster_bits
        )));
    }
    Ok(())
}

/// Write refcount blocks, refcount table, and an empty L1 table for a new image.
async fn write_initial_metadata<B: Backend>(
    backend: &B,
    header: &Header,
    layout: &Layout,
) -> Result<()> {
    let cb = header.cluster_bits;
    let cluster_size = 1usize << cb;
    let rb_bits = header.rb_bits();

    let reftable = RefTable::new(
        HostCluster(1),
        (layout.reftable as usize) * cluster_size / size_of::<u64>(),
        cb,
    );

    let mut refblocks = Vec::with_capacity(layout.refblocks as usize);
    for i in 0..layout.refblocks {
        let rb = RefBlock::new(
            layout.refblocks_start() + ClusterCount(i),
            cb,
            header.refcount_order(),
        );
        reftable.set_refblock(i as usize, rb.cluster())?;
        refblocks.push(rb);
    }

    for cluster in 0..layout.total() {
        let (rt_index, rb_index) = HostCluster(cluster).refcount_slot(rb_bits);
        let rb = refblocks.get(rt_index).ok_or_else(|| {
            Error::ConsistencyViolation(format!("No refcount block for new cluster #{cluster}"))
        })?;
        rb.increment(rb_index)?;
    }

    for rb in &refblocks {
        rb.write(backend).await?;
    }
    reftable.write(backend).await?;

    // Whole clusters, so that nothing stale remains behind the table
    let zeroes = vec![0u8; (layout.l1 as usize) * cluster_size];
    backend
        .write_at((&zeroes).into(), layout.l1_start().offset(cb).0)
        .await?;

    Ok(())
}
