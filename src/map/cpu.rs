//! CPU coordinate map
//!
//! Sequential insertion through an `FxHashMap` index, with multi-threaded
//! (rayon) neighbor search for kernel-map construction. Insertion is never
//! parallel: the backing hash map is not insertion-thread-safe, and the
//! read-only parallel phases only ever share `&self`.
//!
//! The hash index owns small copies of its keys. The original engine keys
//! its table with pointers into the coordinate storage; in Rust that
//! self-borrow is expressed by keeping the dense row-major storage as the
//! single source of truth and letting the index hold inline `SmallVec`
//! copies for probing.

use std::ops::Range;
use std::sync::atomic::{AtomicU32, Ordering};

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::coordinate::snap_to_grid;
use crate::error::{Error, Result};
use crate::kernel_map::KernelMap;
use crate::map::{check_buffer, check_coordinate_size, derived_tensor_stride, CoordinateMap};
use crate::region::KernelRegion;
use crate::runtime::cpu::{CpuAllocator, CpuClient};
use crate::runtime::{Allocator, RuntimeClient};

#[cfg(feature = "rayon")]
use rayon::prelude::*;

/// Inline key type for the hash index; spills only past `MAX_COORDINATE_SIZE`
type CoordKey = SmallVec<[i32; crate::coordinate::MAX_COORDINATE_SIZE]>;

/// Fixed-capacity row-major coordinate storage
///
/// Backed by the client's injected allocator, so the allocation policy for
/// map storage is chosen at client construction. The buffer never grows:
/// capacity is a hard bound fixed at map creation.
struct CoordinateStore {
    allocator: CpuAllocator,
    ptr: u64,
    capacity_components: usize,
    len: usize,
}

impl CoordinateStore {
    fn with_capacity(client: &CpuClient, components: usize) -> Result<Self> {
        let allocator = client.allocator().clone();
        let bytes = components * std::mem::size_of::<i32>();
        let ptr = allocator.allocate(bytes);
        if bytes > 0 && ptr == 0 {
            return Err(Error::OutOfMemory { size: bytes });
        }
        Ok(Self {
            allocator,
            ptr,
            capacity_components: components,
            len: 0,
        })
    }

    #[inline]
    fn len(&self) -> usize {
        self.len
    }

    /// The written prefix of the buffer, `size * D` components
    #[inline]
    fn as_slice(&self) -> &[i32] {
        if self.len == 0 {
            return &[];
        }
        // The allocation is alive and at least `len` components long.
        unsafe { std::slice::from_raw_parts(self.ptr as *const i32, self.len) }
    }

    fn push_row(&mut self, coordinate: &[i32]) {
        debug_assert!(self.len + coordinate.len() <= self.capacity_components);
        unsafe {
            std::ptr::copy_nonoverlapping(
                coordinate.as_ptr(),
                (self.ptr as *mut i32).add(self.len),
                coordinate.len(),
            );
        }
        self.len += coordinate.len();
    }
}

impl Drop for CoordinateStore {
    fn drop(&mut self) {
        self.allocator.deallocate(
            self.ptr,
            self.capacity_components * std::mem::size_of::<i32>(),
        );
    }
}

/// Host-side coordinate map backed by an `FxHashMap` index
pub struct CpuCoordinateMap {
    client: CpuClient,
    coordinate_size: usize,
    capacity: usize,
    tensor_stride: Vec<u32>,
    /// Row-major storage, `size * coordinate_size` components
    coordinates: CoordinateStore,
    index: FxHashMap<CoordKey, u32>,
}

impl CpuCoordinateMap {
    /// The execution client this map was created against
    pub fn client(&self) -> &CpuClient {
        &self.client
    }

    /// The coordinate components of `row`
    #[inline]
    pub fn coordinate(&self, row: usize) -> &[i32] {
        let d = self.coordinate_size;
        &self.coordinates.as_slice()[row * d..(row + 1) * d]
    }

    /// Insert one coordinate, deduplicating
    ///
    /// Returns `(row, inserted)`: the existing row with `inserted == false`
    /// when an equal coordinate is already present.
    fn insert_one(&mut self, coordinate: &[i32]) -> Result<(u32, bool)> {
        debug_assert_eq!(coordinate.len(), self.coordinate_size);
        if let Some(&row) = self.index.get(coordinate) {
            return Ok((row, false));
        }
        let row = self.index.len();
        if row >= self.capacity {
            return Err(Error::capacity_exceeded(self.capacity, row + 1));
        }
        self.coordinates.push_row(coordinate);
        self.index.insert(CoordKey::from_slice(coordinate), row as u32);
        Ok((row as u32, true))
    }

    /// Probe every region offset around one output coordinate
    ///
    /// Calls `on_match(kernel_index, in_row)` for each neighbor present in
    /// this (input) map. Iteration order over kernel indices is the region's
    /// enumeration order.
    fn probe_region<F: FnMut(usize, u32)>(
        &self,
        out: &CpuCoordinateMap,
        region: &KernelRegion,
        out_row: usize,
        mut on_match: F,
    ) {
        let out_coord = out.coordinate(out_row);
        let mut shifted: CoordKey = CoordKey::from_slice(out_coord);
        for (k, offset) in region.iter().enumerate() {
            for (i, &o) in offset.iter().enumerate() {
                shifted[i + 1] = out_coord[i + 1] + o;
            }
            if let Some(&in_row) = self.index.get(shifted.as_slice()) {
                on_match(k, in_row);
            }
        }
    }

    /// Pointwise fast path: volume-1 non-custom regions probe the input map
    /// with each output coordinate directly, skipping offset iteration.
    fn kernel_map_pointwise(&self, out: &CpuCoordinateMap) -> KernelMap {
        let mut in_rows = Vec::with_capacity(out.size());
        let mut out_rows = Vec::with_capacity(out.size());
        for out_row in 0..out.size() {
            if let Some(&in_row) = self.index.get(out.coordinate(out_row)) {
                in_rows.push(in_row);
                out_rows.push(out_row as u32);
            }
        }
        let total = in_rows.len();
        KernelMap::from_parts(in_rows, out_rows, vec![0, total])
    }

    /// General two-pass kernel-map search
    ///
    /// Pass 1 counts matches per kernel index; an exclusive prefix sum over
    /// the counts yields per-index write bases into one flat buffer; pass 2
    /// re-walks the same iteration order and writes each pair at its
    /// reserved slot. Output rows are chunked across twice the worker count
    /// to balance hash-bucket skew; a relaxed atomic cursor per kernel index
    /// claims slots, so pairs within one kernel index carry no relative
    /// ordering guarantee.
    fn kernel_map_general(&self, out: &CpuCoordinateMap, region: &KernelRegion) -> KernelMap {
        let volume = region.volume();
        let n_out = out.size();
        let partitions = partition_ranges(n_out);

        let counts: Vec<AtomicU32> = (0..volume).map(|_| AtomicU32::new(0)).collect();
        for_each_partition(&partitions, |range| {
            for out_row in range {
                self.probe_region(out, region, out_row, |k, _| {
                    counts[k].fetch_add(1, Ordering::Relaxed);
                });
            }
        });

        let mut bases = Vec::with_capacity(volume + 1);
        let mut total = 0usize;
        bases.push(0);
        for count in &counts {
            total += count.load(Ordering::Relaxed) as usize;
            bases.push(total);
        }

        let cursors: Vec<AtomicU32> = (0..volume).map(|_| AtomicU32::new(0)).collect();
        let in_slots: Vec<AtomicU32> = (0..total).map(|_| AtomicU32::new(0)).collect();
        let out_slots: Vec<AtomicU32> = (0..total).map(|_| AtomicU32::new(0)).collect();
        for_each_partition(&partitions, |range| {
            for out_row in range {
                self.probe_region(out, region, out_row, |k, in_row| {
                    let pos = bases[k] + cursors[k].fetch_add(1, Ordering::Relaxed) as usize;
                    in_slots[pos].store(in_row, Ordering::Relaxed);
                    out_slots[pos].store(out_row as u32, Ordering::Relaxed);
                });
            }
        });

        let in_rows = in_slots.into_iter().map(AtomicU32::into_inner).collect();
        let out_rows = out_slots.into_iter().map(AtomicU32::into_inner).collect();
        KernelMap::from_parts(in_rows, out_rows, bases)
    }

    fn check_compatible(&self, other: &CpuCoordinateMap) -> Result<()> {
        if self.coordinate_size != other.coordinate_size {
            return Err(Error::coordinate_size_mismatch(
                self.coordinate_size,
                other.coordinate_size,
            ));
        }
        Ok(())
    }
}

impl CoordinateMap for CpuCoordinateMap {
    type Ctx = CpuClient;

    fn with_capacity(
        ctx: &CpuClient,
        coordinate_size: usize,
        capacity: usize,
        tensor_stride: &[u32],
    ) -> Result<Self> {
        check_coordinate_size(coordinate_size)?;
        if tensor_stride.len() != coordinate_size - 1 {
            return Err(Error::invalid_argument(
                "tensor_stride",
                format!(
                    "expected {} spatial strides, got {}",
                    coordinate_size - 1,
                    tensor_stride.len()
                ),
            ));
        }
        Ok(Self {
            client: ctx.clone(),
            coordinate_size,
            capacity,
            tensor_stride: tensor_stride.to_vec(),
            coordinates: CoordinateStore::with_capacity(ctx, capacity * coordinate_size)?,
            index: FxHashMap::with_capacity_and_hasher(capacity, Default::default()),
        })
    }

    fn insert(&mut self, coordinates: &[i32]) -> Result<usize> {
        let n = check_buffer(coordinates, self.coordinate_size)?;
        for i in 0..n {
            let d = self.coordinate_size;
            let coord = coordinates[i * d..(i + 1) * d].to_vec();
            self.insert_one(&coord)?;
        }
        Ok(self.size())
    }

    fn insert_and_map(&mut self, coordinates: &[i32]) -> Result<(Vec<u32>, Vec<u32>)> {
        let n = check_buffer(coordinates, self.coordinate_size)?;
        let d = self.coordinate_size;
        let mut unique_map = Vec::new();
        let mut inverse_map = Vec::with_capacity(n);
        for i in 0..n {
            let coord = coordinates[i * d..(i + 1) * d].to_vec();
            let (row, inserted) = self.insert_one(&coord)?;
            if inserted {
                unique_map.push(i as u32);
            }
            inverse_map.push(row);
        }
        Ok((unique_map, inverse_map))
    }

    fn find(&self, queries: &[i32]) -> Result<(Vec<u32>, Vec<u32>)> {
        let n = check_buffer(queries, self.coordinate_size)?;
        let d = self.coordinate_size;
        let mut positions = Vec::with_capacity(n);
        let mut rows = Vec::with_capacity(n);
        for i in 0..n {
            if let Some(&row) = self.index.get(&queries[i * d..(i + 1) * d]) {
                positions.push(i as u32);
                rows.push(row);
            }
        }
        Ok((positions, rows))
    }

    fn stride(&self, stride_factors: &[u32]) -> Result<Self> {
        let new_stride = derived_tensor_stride(&self.tensor_stride, stride_factors)?;
        // Worst case no coordinates collide: reserve the full input size.
        let mut derived = Self::with_capacity(
            &self.client,
            self.coordinate_size,
            self.size(),
            &new_stride,
        )?;
        let mut snapped: CoordKey = CoordKey::from_slice(&vec![0; self.coordinate_size]);
        for row in 0..self.size() {
            snap_to_grid(self.coordinate(row), &new_stride, &mut snapped);
            derived.insert_one(&snapped)?;
        }
        Ok(derived)
    }

    fn stride_region(&self, region: &KernelRegion) -> Result<Self> {
        if region.coordinate_size() != self.coordinate_size {
            return Err(Error::coordinate_size_mismatch(
                self.coordinate_size,
                region.coordinate_size(),
            ));
        }
        // Upper bound: every offset of every row lands on a distinct point.
        let mut derived = Self::with_capacity(
            &self.client,
            self.coordinate_size,
            self.size() * region.volume(),
            &self.tensor_stride,
        )?;
        let mut shifted: CoordKey = CoordKey::from_slice(&vec![0; self.coordinate_size]);
        for row in 0..self.size() {
            let coord = self.coordinate(row);
            for offset in region.iter() {
                shifted[0] = coord[0];
                for (i, &o) in offset.iter().enumerate() {
                    shifted[i + 1] = coord[i + 1] + o;
                }
                derived.insert_one(&shifted)?;
            }
        }
        Ok(derived)
    }

    fn kernel_map(&self, out: &Self, region: &KernelRegion) -> Result<KernelMap> {
        self.check_compatible(out)?;
        if region.coordinate_size() != self.coordinate_size {
            return Err(Error::coordinate_size_mismatch(
                self.coordinate_size,
                region.coordinate_size(),
            ));
        }
        if region.is_pointwise() {
            return Ok(self.kernel_map_pointwise(out));
        }
        Ok(self.kernel_map_general(out, region))
    }

    fn stride_map(&self, out: &Self) -> Result<KernelMap> {
        self.check_compatible(out)?;
        let n = self.size();
        let mut in_rows = Vec::with_capacity(n);
        let mut out_rows = Vec::with_capacity(n);
        let mut snapped: CoordKey = CoordKey::from_slice(&vec![0; self.coordinate_size]);
        for row in 0..n {
            snap_to_grid(self.coordinate(row), out.tensor_stride(), &mut snapped);
            let Some(&out_row) = out.index.get(snapped.as_slice()) else {
                // The output map must have been derived from this map.
                return Err(Error::CoordinateNotFound { row });
            };
            in_rows.push(row as u32);
            out_rows.push(out_row);
        }
        Ok(KernelMap::from_parts(in_rows, out_rows, vec![0, n]))
    }

    fn origin(&self) -> Result<Self> {
        let d = self.coordinate_size;
        let mut batches: Vec<i32> = (0..self.size()).map(|row| self.coordinate(row)[0]).collect();
        batches.sort_unstable();
        batches.dedup();

        let origin_stride = vec![0; d - 1];
        let mut origin =
            Self::with_capacity(&self.client, d, batches.len(), &origin_stride)?;
        let mut coord = vec![0i32; d];
        for batch in batches {
            coord[0] = batch;
            origin.insert_one(&coord)?;
        }
        Ok(origin)
    }

    fn origin_map(&self, origin: &Self) -> Result<KernelMap> {
        self.check_compatible(origin)?;
        let d = self.coordinate_size;
        let n = self.size();
        let mut in_rows = Vec::with_capacity(n);
        let mut out_rows = Vec::with_capacity(n);
        let mut key = vec![0i32; d];
        for row in 0..n {
            key[0] = self.coordinate(row)[0];
            let Some(&origin_row) = origin.index.get(key.as_slice()) else {
                return Err(Error::CoordinateNotFound { row });
            };
            in_rows.push(row as u32);
            out_rows.push(origin_row);
        }
        Ok(KernelMap::from_parts(in_rows, out_rows, vec![0, n]))
    }

    fn prune(&self, keep: &[bool]) -> Result<(Self, KernelMap)> {
        if keep.len() != self.size() {
            return Err(Error::invalid_argument(
                "keep",
                format!("expected {} flags, got {}", self.size(), keep.len()),
            ));
        }
        let kept = keep.iter().filter(|&&k| k).count();
        let mut pruned =
            Self::with_capacity(&self.client, self.coordinate_size, kept, &self.tensor_stride)?;
        let mut in_rows = Vec::with_capacity(kept);
        let mut out_rows = Vec::with_capacity(kept);
        for (row, &keep_row) in keep.iter().enumerate() {
            if !keep_row {
                continue;
            }
            let coord = self.coordinate(row).to_vec();
            let (new_row, _) = pruned.insert_one(&coord)?;
            in_rows.push(row as u32);
            out_rows.push(new_row);
        }
        let total = in_rows.len();
        Ok((
            pruned,
            KernelMap::from_parts(in_rows, out_rows, vec![0, total]),
        ))
    }

    fn copy_coordinates(&self, dst: &mut [i32]) -> Result<()> {
        if dst.len() != self.coordinates.len() {
            return Err(Error::invalid_argument(
                "dst",
                format!(
                    "expected {} components, got {}",
                    self.coordinates.len(),
                    dst.len()
                ),
            ));
        }
        dst.copy_from_slice(self.coordinates.as_slice());
        Ok(())
    }

    #[inline]
    fn size(&self) -> usize {
        self.index.len()
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    fn coordinate_size(&self) -> usize {
        self.coordinate_size
    }

    #[inline]
    fn tensor_stride(&self) -> &[u32] {
        &self.tensor_stride
    }
}

/// Split `[0, n)` into contiguous ranges, twice the worker count
fn partition_ranges(n: usize) -> Vec<Range<usize>> {
    #[cfg(feature = "rayon")]
    let partitions = (2 * rayon::current_num_threads()).max(1);
    #[cfg(not(feature = "rayon"))]
    let partitions = 1;

    let chunk = n.div_ceil(partitions).max(1);
    (0..n.div_ceil(chunk))
        .map(|p| p * chunk..((p + 1) * chunk).min(n))
        .collect()
}

#[cfg(feature = "rayon")]
fn for_each_partition<F>(ranges: &[Range<usize>], f: F)
where
    F: Fn(Range<usize>) + Send + Sync,
{
    ranges.par_iter().cloned().for_each(f);
}

#[cfg(not(feature = "rayon"))]
fn for_each_partition<F>(ranges: &[Range<usize>], f: F)
where
    F: Fn(Range<usize>) + Send + Sync,
{
    ranges.iter().cloned().for_each(f);
}
