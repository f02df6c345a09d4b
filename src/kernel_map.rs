//! Kernel maps: per-kernel-offset lists of (input row, output row) pairs
//!
//! A [`KernelMap`] is the value result of neighbor search between two
//! coordinate maps. It stores only row indices, never coordinates, in a flat
//! CSR-style layout: two parallel row arrays plus a `volume + 1` offset table
//! delimiting the sub-range of each kernel index. Consumers may rely on the
//! total pair count and the per-kernel-index grouping; pairs from different
//! kernel indices carry no relative ordering guarantee.
//!
//! A kernel map stays valid for as long as the row numbering of both source
//! maps is unchanged.

use std::ops::Range;

/// Per-kernel-offset (input row, output row) pairs driving sparse convolution
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KernelMap {
    in_rows: Vec<u32>,
    out_rows: Vec<u32>,
    /// Exclusive prefix over per-kernel-index pair counts, length `volume + 1`
    offsets: Vec<usize>,
}

impl KernelMap {
    /// Assemble a kernel map from flat parts
    ///
    /// `offsets` must be non-decreasing, start at 0, and end at the pair
    /// count; both row arrays must have equal length.
    pub(crate) fn from_parts(in_rows: Vec<u32>, out_rows: Vec<u32>, offsets: Vec<usize>) -> Self {
        debug_assert_eq!(in_rows.len(), out_rows.len());
        debug_assert!(!offsets.is_empty());
        debug_assert_eq!(offsets[0], 0);
        debug_assert_eq!(*offsets.last().unwrap(), in_rows.len());
        debug_assert!(offsets.windows(2).all(|w| w[0] <= w[1]));
        Self {
            in_rows,
            out_rows,
            offsets,
        }
    }

    /// An empty kernel map with the given volume
    pub(crate) fn empty(volume: usize) -> Self {
        Self {
            in_rows: Vec::new(),
            out_rows: Vec::new(),
            offsets: vec![0; volume + 1],
        }
    }

    /// Total number of (in, out) pairs across all kernel indices
    #[inline]
    pub fn len(&self) -> usize {
        self.in_rows.len()
    }

    /// True if no kernel index holds any pair
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.in_rows.is_empty()
    }

    /// Number of kernel indices (the region volume)
    #[inline]
    pub fn volume(&self) -> usize {
        self.offsets.len() - 1
    }

    /// The flat pair range covered by kernel index `k`
    #[inline]
    pub fn range(&self, k: usize) -> Range<usize> {
        self.offsets[k]..self.offsets[k + 1]
    }

    /// Input rows for kernel index `k`
    #[inline]
    pub fn in_rows(&self, k: usize) -> &[u32] {
        &self.in_rows[self.range(k)]
    }

    /// Output rows for kernel index `k`
    #[inline]
    pub fn out_rows(&self, k: usize) -> &[u32] {
        &self.out_rows[self.range(k)]
    }

    /// Iterate (in row, out row) pairs for kernel index `k`
    pub fn pairs(&self, k: usize) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.in_rows(k)
            .iter()
            .copied()
            .zip(self.out_rows(k).iter().copied())
    }

    /// The transposed map: every (in, out) pair becomes (out, in)
    ///
    /// Swapping the two sides yields the backward (gradient) correspondence
    /// without re-running neighbor search.
    pub fn transposed(&self) -> KernelMap {
        KernelMap {
            in_rows: self.out_rows.clone(),
            out_rows: self.in_rows.clone(),
            offsets: self.offsets.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> KernelMap {
        // volume 3: k=0 holds 2 pairs, k=1 none, k=2 one pair
        KernelMap::from_parts(vec![0, 1, 4], vec![5, 6, 7], vec![0, 2, 2, 3])
    }

    #[test]
    fn test_ranges_and_pairs() {
        let map = sample();
        assert_eq!(map.len(), 3);
        assert_eq!(map.volume(), 3);
        assert_eq!(map.range(0), 0..2);
        assert_eq!(map.range(1), 2..2);
        assert_eq!(map.in_rows(2), &[4]);
        assert_eq!(map.out_rows(2), &[7]);
        let pairs: Vec<_> = map.pairs(0).collect();
        assert_eq!(pairs, vec![(0, 5), (1, 6)]);
    }

    #[test]
    fn test_transposed_swaps_sides() {
        let map = sample();
        let t = map.transposed();
        assert_eq!(t.len(), map.len());
        for k in 0..map.volume() {
            let fwd: Vec<_> = map.pairs(k).collect();
            let bwd: Vec<_> = t.pairs(k).map(|(a, b)| (b, a)).collect();
            assert_eq!(fwd, bwd);
        }
    }

    #[test]
    fn test_empty_map() {
        let map = KernelMap::empty(4);
        assert!(map.is_empty());
        assert_eq!(map.volume(), 4);
        for k in 0..4 {
            assert_eq!(map.range(k), 0..0);
        }
    }
}
