//! Image consistency check.
//!
//! Walks every structure reachable from the header, makes sure no host cluster is used twice,
//! and compares the result against the refcounts.

use super::allocator::Allocator;
use super::translation::Translation;
use super::types::{ClusterCount, GuestCluster, HostCluster};
use crate::backend::Backend;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use tracing::debug;

/// What a host cluster is used for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ClusterUse {
    /// Image header.
    Header,
    /// Refcount table.
    RefTable,
    /// Refcount block for the given reftable index.
    RefBlock(usize),
    /// L1 table.
    L1Table,
    /// L2 table for the given L1 index.
    L2Table(usize),
    /// Data for the given guest cluster.
    Data(u64),
}

/// Result of a successful check.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CheckReport {
    /// Clusters holding metadata (header and tables).
    pub metadata_clusters: u64,

    /// Clusters holding guest data.
    pub data_clusters: u64,
}

/// Records which host cluster is used for what.
#[derive(Default)]
struct ClusterMap {
    /// Use of every referenced cluster.
    uses: HashMap<HostCluster, ClusterUse>,

    /// Summary.
    report: CheckReport,
}

impl Display for ClusterUse {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ClusterUse::Header => write!(f, "image header"),
            ClusterUse::RefTable => write!(f, "refcount table"),
            ClusterUse::RefBlock(i) => write!(f, "refcount block {i}"),
            ClusterUse::L1Table => write!(f, "L1 table"),
            ClusterUse::L2Table(i) => write!(f, "L2 table {i}"),
            ClusterUse::Data(c) => write!(f, "data of guest cluster {c}"),
        }
    }
}

impl ClusterMap {
    /// Claim `count` clusters from `start` for `what`.
    fn claim(&mut self, start: HostCluster, count: ClusterCount, what: ClusterUse) -> Result<()> {
        for i in 0..count.0 {
            let cluster = start + ClusterCount(i);
            if let Some(previous) = self.uses.insert(cluster, what) {
                return Err(Error::ConsistencyViolation(format!(
                    "Host cluster {cluster} is used as {previous} and as {what}"
                )));
            }
        }

        match what {
            ClusterUse::Data(_) => self.report.data_clusters += count.0,
            _ => self.report.metadata_clusters += count.0,
        }
        Ok(())
    }
}

/// Check the image for aliasing and refcount mismatches.
///
/// Every cluster referenced from the header must have a refcount of at least 1.  Without internal
/// snapshots (which are not walked), every referenced cluster must have a refcount of exactly 1
/// and no other cluster may have a nonzero refcount.
pub(crate) async fn check<B: Backend>(
    allocator: &mut Allocator<B>,
    translation: &Translation<B>,
) -> Result<CheckReport> {
    let mut map = ClusterMap::default();

    map.claim(HostCluster(0), ClusterCount(1), ClusterUse::Header)?;

    let (rt_cluster, rt_count) = allocator.reftable_clusters().await?;
    map.claim(rt_cluster, rt_count, ClusterUse::RefTable)?;

    for (rt_index, rb_cluster) in allocator.refblock_clusters().await? {
        map.claim(rb_cluster, ClusterCount(1), ClusterUse::RefBlock(rt_index))?;
    }

    let (l1_cluster, l1_count) = translation.l1_clusters();
    map.claim(l1_cluster, l1_count, ClusterUse::L1Table)?;

    let cb = allocator.header().cluster_bits;
    for (l1_index, l2) in translation.l2_tables().await? {
        map.claim(l2.cluster(), ClusterCount(1), ClusterUse::L2Table(l1_index))?;

        for (l2_index, data_cluster) in l2.host_clusters() {
            let guest_cluster = GuestCluster::from_table_indices(l1_index, l2_index, cb);
            map.claim(
                data_cluster,
                ClusterCount(1),
                ClusterUse::Data(guest_cluster.0),
            )?;
        }
    }

    let exact = allocator.header().nb_snapshots == 0;
    let allocated: HashMap<HostCluster, u64> =
        allocator.allocated_clusters().await?.into_iter().collect();

    for (cluster, what) in &map.uses {
        let refcount = allocated.get(cluster).copied().unwrap_or(0);
        if refcount == 0 || (exact && refcount != 1) {
            return Err(Error::ConsistencyViolation(format!(
                "Host cluster {cluster} ({what}) has refcount {refcount}"
            )));
        }
    }

    if exact {
        let mut leaked: Vec<HostCluster> = allocated
            .keys()
            .filter(|cluster| !map.uses.contains_key(cluster))
            .copied()
            .collect();
        if !leaked.is_empty() {
            leaked.sort();
            return Err(Error::ConsistencyViolation(format!(
                "{} leaked cluster(s), first: {}",
                leaked.len(),
                leaked[0]
            )));
        }
    }

    debug!(
        "Check passed: {} metadata and {} data clusters",
        map.report.metadata_clusters, map.report.data_clusters
    );
    Ok(map.report)
}
