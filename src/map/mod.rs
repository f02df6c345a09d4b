//! Coordinate maps: hash-indexed mappings from coordinates to dense rows
//!
//! A coordinate map owns a contiguous row-major coordinate storage buffer
//! and a hash index from coordinate to row. Row indices are dense integers
//! `[0, size)` after every operation completes; derivation operations
//! (stride, prune, origin) construct new maps rather than mutating in place.
//!
//! The CPU and CUDA maps are two independent implementations of one
//! capability interface, selected at composition time via static dispatch.
//! The operation set and invariants are identical; only the execution engine
//! differs.

use crate::error::{Error, Result};
use crate::kernel_map::KernelMap;
use crate::region::KernelRegion;

#[cfg(feature = "cpu")]
mod cpu;
#[cfg(feature = "cuda")]
mod cuda;

#[cfg(feature = "cpu")]
pub use cpu::CpuCoordinateMap;
#[cfg(feature = "cuda")]
pub use cuda::CudaCoordinateMap;

/// The coordinate-map capability interface
///
/// Contracts shared by every backend:
///
/// - `insert` deduplicates: an equal coordinate keeps its existing row.
///   Exceeding the declared capacity is a precondition error.
/// - `find` drops unmatched queries silently, preserving query order among
///   matches.
/// - Derivation operations (`stride`, `stride_region`, `origin`, `prune`)
///   build fresh maps with dense row numbering.
/// - `stride_map` and `origin_map` require the target map to be the
///   corresponding derivation of the source; a missing match is an error,
///   not absence.
pub trait CoordinateMap: Sized {
    /// Execution context the map is constructed against (CPU or CUDA client)
    type Ctx: Clone;

    /// Create an empty map with a fixed capacity and coordinate size `D`
    ///
    /// `tensor_stride` has length `D - 1`. Capacity is an upper bound the
    /// caller must compute conservatively; it cannot grow later.
    fn with_capacity(
        ctx: &Self::Ctx,
        coordinate_size: usize,
        capacity: usize,
        tensor_stride: &[u32],
    ) -> Result<Self>;

    /// Insert a batch of coordinates from a flat `N x D` buffer
    ///
    /// Returns the map size after insertion.
    fn insert(&mut self, coordinates: &[i32]) -> Result<usize>;

    /// Insert a batch and return `(unique_map, inverse_map)`
    ///
    /// `unique_map[j]` is the original buffer position whose coordinate won
    /// row `j`; `inverse_map[i]` is the row of position `i`'s representative,
    /// so gathering unique coordinates through `inverse_map` reconstructs the
    /// original buffer.
    fn insert_and_map(&mut self, coordinates: &[i32]) -> Result<(Vec<u32>, Vec<u32>)>;

    /// Batch lookup: `(matched_query_positions, matched_rows)`
    ///
    /// Both outputs are parallel and ordered by query position; unmatched
    /// queries are omitted.
    fn find(&self, queries: &[i32]) -> Result<(Vec<u32>, Vec<u32>)>;

    /// Derive the coarsened map under per-dimension stride factors
    fn stride(&self, stride_factors: &[u32]) -> Result<Self>;

    /// Derive the map covering every region offset of every coordinate
    fn stride_region(&self, region: &KernelRegion) -> Result<Self>;

    /// Neighbor search: connect this (input) map to an output map
    fn kernel_map(&self, out: &Self, region: &KernelRegion) -> Result<KernelMap>;

    /// One-pair-per-row map onto an already-derived strided output map
    fn stride_map(&self, out: &Self) -> Result<KernelMap>;

    /// Collapse to one row per distinct batch index (spatial set to zero)
    fn origin(&self) -> Result<Self>;

    /// Fan-in map connecting every row to its batch's origin row
    fn origin_map(&self, origin: &Self) -> Result<KernelMap>;

    /// Keep-flagged compaction; returns the pruned map and the
    /// (old row, new row) correspondence as a volume-1 kernel map
    fn prune(&self, keep: &[bool]) -> Result<(Self, KernelMap)>;

    /// Materialize coordinates row-major into `dst` (length `size * D`)
    fn copy_coordinates(&self, dst: &mut [i32]) -> Result<()>;

    /// Number of valid rows
    fn size(&self) -> usize;

    /// Declared capacity
    fn capacity(&self) -> usize;

    /// Coordinate size `D`
    fn coordinate_size(&self) -> usize;

    /// Tensor stride (length `D - 1`)
    fn tensor_stride(&self) -> &[u32];
}

/// Validate a flat coordinate buffer against a map's coordinate size
///
/// Returns the row count.
pub(crate) fn check_buffer(buffer: &[i32], coordinate_size: usize) -> Result<usize> {
    if coordinate_size == 0 || buffer.len() % coordinate_size != 0 {
        return Err(Error::invalid_argument(
            "coordinates",
            format!(
                "buffer length {} is not a multiple of coordinate size {}",
                buffer.len(),
                coordinate_size
            ),
        ));
    }
    Ok(buffer.len() / coordinate_size)
}

/// Validate stride factors and produce the derived tensor stride
pub(crate) fn derived_tensor_stride(
    tensor_stride: &[u32],
    stride_factors: &[u32],
) -> Result<Vec<u32>> {
    if stride_factors.len() != tensor_stride.len() {
        return Err(Error::invalid_argument(
            "stride_factors",
            format!(
                "expected {} spatial factors, got {}",
                tensor_stride.len(),
                stride_factors.len()
            ),
        ));
    }
    if stride_factors.iter().any(|&f| f == 0) {
        return Err(Error::invalid_argument("stride_factors", "must be >= 1"));
    }
    Ok(tensor_stride
        .iter()
        .zip(stride_factors)
        .map(|(&t, &f)| t * f)
        .collect())
}

/// Validate a supported coordinate size
pub(crate) fn check_coordinate_size(coordinate_size: usize) -> Result<()> {
    if !(2..=crate::coordinate::MAX_COORDINATE_SIZE).contains(&coordinate_size) {
        return Err(Error::invalid_argument(
            "coordinate_size",
            format!(
                "must be in 2..={} (batch + spatial), got {}",
                crate::coordinate::MAX_COORDINATE_SIZE,
                coordinate_size
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_buffer() {
        assert_eq!(check_buffer(&[0, 1, 0, 2], 2).unwrap(), 2);
        assert!(check_buffer(&[0, 1, 0], 2).is_err());
        assert_eq!(check_buffer(&[], 3).unwrap(), 0);
    }

    #[test]
    fn test_derived_tensor_stride() {
        assert_eq!(derived_tensor_stride(&[1, 2], &[2, 2]).unwrap(), vec![2, 4]);
        assert!(derived_tensor_stride(&[1, 2], &[2]).is_err());
        assert!(derived_tensor_stride(&[1], &[0]).is_err());
    }

    #[test]
    fn test_check_coordinate_size_bounds() {
        assert!(check_coordinate_size(1).is_err());
        assert!(check_coordinate_size(2).is_ok());
        assert!(check_coordinate_size(8).is_ok());
        assert!(check_coordinate_size(9).is_err());
    }
}
