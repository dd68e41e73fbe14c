//! Half-open ranges of sectors and their set algebra.
//!
//! Used to clamp traversal runs to the device, to pick out the clusters a discard fully covers,
//! and to tell which bytes of a cluster a write actually supplied.

use std::fmt::{self, Display, Formatter};
use std::ops::Range;

/// A contiguous run of sectors: `start..start + length`.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Extent {
    /// First sector.
    pub start: u64,

    /// Number of sectors.
    pub length: u64,
}

impl Extent {
    /// Create an extent covering `length` sectors from `start`.
    pub fn new(start: u64, length: u64) -> Self {
        Extent { start, length }
    }

    /// Create the extent covering `start..end`.
    ///
    /// An `end` before `start` yields an empty extent.
    pub fn from_bounds(start: u64, end: u64) -> Self {
        Extent {
            start,
            length: end.saturating_sub(start),
        }
    }

    /// The sectors spanning exactly `length` bytes from byte `offset`.
    ///
    /// Returns `None` unless both are multiples of `sector_size`.
    pub fn from_byte_range(offset: u64, length: u64, sector_size: u64) -> Option<Self> {
        if offset % sector_size != 0 || length % sector_size != 0 {
            return None;
        }
        Some(Extent::new(offset / sector_size, length / sector_size))
    }

    /// The bytes this extent spans, for sectors of `sector_size` bytes.
    pub fn byte_range(&self, sector_size: u64) -> Range<u64> {
        self.start * sector_size..self.end() * sector_size
    }

    /// One past the last sector.
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.length)
    }

    /// Whether this extent covers no sectors at all.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Whether `sector` lies inside this extent.
    pub fn contains(&self, sector: u64) -> bool {
        sector >= self.start && sector < self.end()
    }

    /// Whether `other` lies entirely inside this extent.
    pub fn covers(&self, other: &Extent) -> bool {
        other.is_empty() || (other.start >= self.start && other.end() <= self.end())
    }

    /// Whether both extents share at least one sector.
    pub fn overlaps(&self, other: &Extent) -> bool {
        self.intersect(other).is_some()
    }

    /// The sub-range both extents have in common.
    ///
    /// Returns `None` if they do not overlap (touching extents do not overlap).
    pub fn intersect(&self, other: &Extent) -> Option<Extent> {
        let start = self.start.max(other.start);
        let end = self.end().min(other.end());
        (start < end).then(|| Extent::from_bounds(start, end))
    }

    /// `self` with everything in `other` removed.
    ///
    /// Yields the part before `other` and the part after it, each only if non-empty, so the result
    /// holds zero, one, or two disjoint extents in ascending order.
    pub fn difference(&self, other: &Extent) -> Vec<Extent> {
        let Some(common) = self.intersect(other) else {
            return if self.is_empty() {
                Vec::new()
            } else {
                vec![*self]
            };
        };

        let mut result = Vec::with_capacity(2);
        if common.start > self.start {
            result.push(Extent::from_bounds(self.start, common.start));
        }
        if common.end() < self.end() {
            result.push(Extent::from_bounds(common.end(), self.end()));
        }
        result
    }

    /// If `next` directly follows this extent, return the combined extent.
    pub fn merge_adjacent(&self, next: &Extent) -> Option<Extent> {
        (self.end() == next.start).then(|| Extent::new(self.start, self.length + next.length))
    }
}

impl Display for Extent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn intersect_cases() {
        let a = Extent::new(10, 10);
        assert_eq!(a.intersect(&Extent::new(0, 5)), None);
        assert_eq!(a.intersect(&Extent::new(0, 10)), None);
        assert_eq!(a.intersect(&Extent::new(20, 5)), None);
        assert_eq!(a.intersect(&Extent::new(5, 10)), Some(Extent::new(10, 5)));
        assert_eq!(a.intersect(&Extent::new(12, 3)), Some(Extent::new(12, 3)));
        assert_eq!(a.intersect(&Extent::new(0, 100)), Some(a));
        assert_eq!(a.intersect(&Extent::new(15, 0)), None);
    }

    #[test]
    fn difference_cases() {
        let a = Extent::new(10, 10);
        assert_eq!(a.difference(&Extent::new(0, 5)), vec![a]);
        assert_eq!(a.difference(&Extent::new(0, 100)), vec![]);
        assert_eq!(a.difference(&Extent::new(0, 15)), vec![Extent::new(15, 5)]);
        assert_eq!(a.difference(&Extent::new(15, 15)), vec![Extent::new(10, 5)]);
        assert_eq!(
            a.difference(&Extent::new(12, 3)),
            vec![Extent::new(10, 2), Extent::new(15, 5)]
        );
        assert_eq!(Extent::new(3, 0).difference(&Extent::new(0, 1)), vec![]);
    }

    #[test]
    fn byte_conversion() {
        let e = Extent::from_byte_range(4096, 1024, 512).unwrap();
        assert_eq!(e, Extent::new(8, 2));
        assert_eq!(e.byte_range(512), 4096..5120);
        assert_eq!(Extent::from_byte_range(4096, 100, 512), None);
        assert_eq!(Extent::from_byte_range(100, 512, 512), None);
    }

    #[test]
    fn merge_and_cover() {
        let a = Extent::new(0, 8);
        assert_eq!(a.merge_adjacent(&Extent::new(8, 8)), Some(Extent::new(0, 16)));
        assert_eq!(a.merge_adjacent(&Extent::new(9, 8)), None);
        assert!(a.covers(&Extent::new(2, 6)));
        assert!(!a.covers(&Extent::new(2, 7)));
        assert!(a.contains(7));
        assert!(!a.contains(8));
    }

    fn extent() -> impl Strategy<Value = Extent> {
        (0u64..1000, 0u64..1000).prop_map(|(start, length)| Extent::new(start, length))
    }

    proptest! {
        #[test]
        fn intersection_and_difference_partition(a in extent(), b in extent()) {
            let common = a.intersect(&b);
            let rest = a.difference(&b);

            let covered: u64 = common.map(|c| c.length).unwrap_or(0)
                + rest.iter().map(|e| e.length).sum::<u64>();
            prop_assert_eq!(covered, a.length);

            for part in &rest {
                prop_assert!(a.covers(part));
                prop_assert!(!part.overlaps(&b));
                if let Some(common) = common {
                    prop_assert!(!part.overlaps(&common));
                }
            }
            if let Some(common) = common {
                prop_assert!(a.covers(&common) && b.covers(&common));
            }
        }
    }
}
