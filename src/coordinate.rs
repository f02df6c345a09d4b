//! Coordinate views and grid arithmetic
//!
//! A coordinate is an ordered tuple of `D` signed integers; the first
//! component is by convention the batch index and the remaining `D - 1`
//! components are spatial voxel indices. Coordinates are always views into a
//! coordinate map's row-major storage or a caller-provided buffer - they
//! never own memory.

use std::hash::{Hash, Hasher};

/// Maximum supported coordinate size (batch + spatial dimensions)
///
/// Bounded so device kernels can keep a coordinate in a fixed-size local
/// array and CPU scratch tuples stay inline.
pub const MAX_COORDINATE_SIZE: usize = 8;

/// A borrowed view of one coordinate tuple
///
/// Equality and hashing are structural over all `D` components: two
/// coordinates are the same point iff every component matches exactly.
#[derive(Clone, Copy, Debug)]
pub struct Coordinate<'a> {
    data: &'a [i32],
}

impl<'a> Coordinate<'a> {
    /// Wrap a slice of `D` components
    #[inline]
    pub fn new(data: &'a [i32]) -> Self {
        Self { data }
    }

    /// The coordinate size `D`
    #[inline]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Batch index (first component)
    #[inline]
    pub fn batch(&self) -> i32 {
        self.data[0]
    }

    /// Spatial components (everything after the batch index)
    #[inline]
    pub fn spatial(&self) -> &'a [i32] {
        &self.data[1..]
    }

    /// All `D` components
    #[inline]
    pub fn components(&self) -> &'a [i32] {
        self.data
    }
}

impl PartialEq for Coordinate<'_> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Eq for Coordinate<'_> {}

impl Hash for Coordinate<'_> {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.data.hash(state);
    }
}

/// Round `c` down to the nearest multiple of `s`
///
/// Floor semantics: negative coordinates round toward negative infinity,
/// so `floor_multiple(-3, 2) == -4`. A stride of zero leaves the component
/// unchanged (used by origin maps whose tensor stride is all zeros).
#[inline]
pub(crate) fn floor_multiple(c: i32, s: u32) -> i32 {
    if s <= 1 {
        return c;
    }
    c.div_euclid(s as i32) * s as i32
}

/// Snap the spatial components of `src` onto the grid given by `tensor_stride`
///
/// The batch component passes through unchanged. `dst` and `src` have length
/// `D`; `tensor_stride` has length `D - 1`.
#[inline]
pub(crate) fn snap_to_grid(src: &[i32], tensor_stride: &[u32], dst: &mut [i32]) {
    debug_assert_eq!(src.len(), dst.len());
    debug_assert_eq!(src.len(), tensor_stride.len() + 1);
    dst[0] = src[0];
    for (i, &s) in tensor_stride.iter().enumerate() {
        dst[i + 1] = floor_multiple(src[i + 1], s);
    }
}
