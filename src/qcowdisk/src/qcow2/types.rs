//! Address and size newtypes.
//!
//! Virtual disk addresses (`Guest*`) and image file addresses (`Host*`) are distinct types, and
//! so are byte offsets and cluster indices.  Every conversion takes the cluster size as
//! `cluster_bits`; table geometry follows from it because all table entries are eight bytes.

use std::fmt::{self, Display, Formatter};
use std::ops::{Add, AddAssign, Sub, SubAssign};

/// Byte offset on the virtual disk.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) struct GuestOffset(pub u64);

/// Cluster on the virtual disk.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) struct GuestCluster(pub u64);

/// Byte offset in the image file.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) struct HostOffset(pub u64);

/// Cluster in the image file.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) struct HostCluster(pub u64);

/// A number of clusters.
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
pub(crate) struct ClusterCount(pub u64);

/// Selects the in-cluster part of an offset.
fn in_cluster_mask(cluster_bits: u32) -> u64 {
    (1 << cluster_bits) - 1
}

/// log2 of the number of 64-bit entries per cluster.
fn entries_per_cluster_bits(cluster_bits: u32) -> u32 {
    cluster_bits - 3
}

impl GuestOffset {
    /// The cluster containing this offset.
    pub fn cluster(self, cluster_bits: u32) -> GuestCluster {
        GuestCluster(self.0 >> cluster_bits)
    }

    /// Position of this offset inside its cluster.
    pub fn within_cluster(self, cluster_bits: u32) -> usize {
        (self.0 & in_cluster_mask(cluster_bits)) as usize
    }

    /// Bytes from this offset up to the end of its cluster.
    pub fn to_cluster_end(self, cluster_bits: u32) -> u64 {
        (1 << cluster_bits) - (self.0 & in_cluster_mask(cluster_bits))
    }
}

impl GuestCluster {
    /// The L1 entry whose L2 table maps this cluster.
    pub fn l1_index(self, cluster_bits: u32) -> usize {
        (self.0 >> entries_per_cluster_bits(cluster_bits)) as usize
    }

    /// This cluster’s entry in its L2 table.
    pub fn l2_index(self, cluster_bits: u32) -> usize {
        let per_table = 1u64 << entries_per_cluster_bits(cluster_bits);
        (self.0 & (per_table - 1)) as usize
    }

    /// The cluster mapped by entry `l2_index` of the L2 table behind L1 entry `l1_index`.
    pub fn from_table_indices(l1_index: usize, l2_index: usize, cluster_bits: u32) -> Self {
        let shift = entries_per_cluster_bits(cluster_bits);
        GuestCluster(((l1_index as u64) << shift) | l2_index as u64)
    }
}

impl HostOffset {
    /// The cluster containing this offset.
    pub fn cluster(self, cluster_bits: u32) -> HostCluster {
        HostCluster(self.0 >> cluster_bits)
    }

    /// The cluster starting exactly here; `None` for offsets inside a cluster.
    pub fn aligned_cluster(self, cluster_bits: u32) -> Option<HostCluster> {
        ((self.0 & in_cluster_mask(cluster_bits)) == 0).then_some(self.cluster(cluster_bits))
    }
}

impl HostCluster {
    /// Offset of the first byte of this cluster.
    pub fn offset(self, cluster_bits: u32) -> HostOffset {
        HostOffset(self.0 << cluster_bits)
    }

    /// Where this cluster’s refcount is stored: the refcount table index of its refcount block,
    /// and its index in that block.
    ///
    /// A refcount block covers `1 << rb_bits` clusters.
    pub fn refcount_slot(self, rb_bits: u32) -> (usize, usize) {
        let rb_index = self.0 & ((1 << rb_bits) - 1);
        ((self.0 >> rb_bits) as usize, rb_index as usize)
    }

    /// Inverse of [`HostCluster::refcount_slot()`].
    pub fn from_refcount_slot(rt_index: usize, rb_index: usize, rb_bits: u32) -> Self {
        HostCluster(((rt_index as u64) << rb_bits) | rb_index as u64)
    }

    /// Host offset of the byte at `guest`, given that `guest`’s cluster is mapped here.
    pub fn translate(self, guest: GuestOffset, cluster_bits: u32) -> HostOffset {
        HostOffset(self.offset(cluster_bits).0 | guest.within_cluster(cluster_bits) as u64)
    }
}

impl ClusterCount {
    /// Clusters needed to hold `bytes` bytes.
    pub fn covering(bytes: u64, cluster_bits: u32) -> Self {
        ClusterCount(bytes.div_ceil(1 << cluster_bits))
    }
}

/// Implements a binary operator on the wrapped integers.
macro_rules! newtype_op {
    ($trait:ident, $method:ident, $lhs:ident, $rhs:ident => $out:ident) => {
        impl $trait<$rhs> for $lhs {
            type Output = $out;

            fn $method(self, rhs: $rhs) -> $out {
                $out(self.0.$method(rhs.0))
            }
        }
    };
}

newtype_op!(Add, add, HostCluster, ClusterCount => HostCluster);
newtype_op!(Sub, sub, HostCluster, HostCluster => ClusterCount);
newtype_op!(Add, add, ClusterCount, ClusterCount => ClusterCount);
newtype_op!(Sub, sub, ClusterCount, ClusterCount => ClusterCount);

impl AddAssign<ClusterCount> for HostCluster {
    fn add_assign(&mut self, rhs: ClusterCount) {
        *self = *self + rhs;
    }
}

impl AddAssign for ClusterCount {
    fn add_assign(&mut self, rhs: ClusterCount) {
        *self = *self + rhs;
    }
}

impl SubAssign for ClusterCount {
    fn sub_assign(&mut self, rhs: ClusterCount) {
        *self = *self - rhs;
    }
}

/// Implements `Display` through a format string applied to the wrapped integer.
macro_rules! display_with {
    ($type:ident, $fmt:literal) => {
        impl Display for $type {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                write!(f, $fmt, self.0)
            }
        }
    };
}

display_with!(GuestOffset, "{:#x}");
display_with!(HostOffset, "{:#x}");
display_with!(HostCluster, "#{}");
display_with!(ClusterCount, "{}");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_table_indices() {
        // 64k clusters: 8192 entries per L2 table
        let cb = 16;
        let ofs = GuestOffset((8192 + 3) * 65536 + 100);
        let cluster = ofs.cluster(cb);
        assert_eq!((cluster.l1_index(cb), cluster.l2_index(cb)), (1, 3));
        assert_eq!(ofs.within_cluster(cb), 100);
        assert_eq!(ofs.to_cluster_end(cb), 65436);
        assert_eq!(GuestOffset(65536).to_cluster_end(cb), 65536);
        assert_eq!(GuestCluster::from_table_indices(1, 3, cb), cluster);
    }

    #[test]
    fn host_refcount_slots() {
        // 64k clusters with 16-bit refcounts: 32768 refcounts per block
        let rb_bits = 15;
        let cluster = HostCluster(32768 * 2 + 5);
        assert_eq!(cluster.refcount_slot(rb_bits), (2, 5));
        assert_eq!(HostCluster::from_refcount_slot(2, 5, rb_bits), cluster);

        assert_eq!(HostOffset(131072).aligned_cluster(16), Some(HostCluster(2)));
        assert_eq!(HostOffset(131073).aligned_cluster(16), None);
        assert_eq!(
            HostCluster(2).translate(GuestOffset(65536 * 7 + 512), 16),
            HostOffset(131072 + 512)
        );
    }

    #[test]
    fn cluster_arithmetic() {
        let mut end = HostCluster(10) + ClusterCount(4);
        assert_eq!(end, HostCluster(14));
        assert_eq!(end - HostCluster(10), ClusterCount(4));

        end += ClusterCount(2);
        let mut count = end - HostCluster(10);
        count -= ClusterCount(1);
        count += ClusterCount(3);
        assert_eq!(count, ClusterCount(8));

        assert_eq!(ClusterCount::covering(65537, 16), ClusterCount(2));
        assert_eq!(ClusterCount::covering(0, 16), ClusterCount(0));
        assert_eq!(HostCluster(3).to_string(), "#3");
        assert_eq!(HostOffset(4096).to_string(), "0x1000");
    }
}
