//! CUDA coordinate map
//!
//! Device-resident implementation of the coordinate-map interface. Dense
//! coordinate storage and the hash table both live on the GPU; operations
//! launch kernels on the client's stream and synchronize at each phase
//! boundary where a host-side size gates the next launch.
//!
//! Duplicate tie-breaks (which of several equal input coordinates wins a
//! row, and row numbering of freshly inserted coordinates) are race
//! outcomes and may differ between runs; the resulting map is always valid.

mod hash;
mod launch;

use cudarc::driver::CudaSlice;

use crate::error::{Error, Result};
use crate::kernel_map::KernelMap;
use crate::map::{check_buffer, check_coordinate_size, derived_tensor_stride, CoordinateMap};
use crate::region::KernelRegion;
use crate::runtime::cuda::CudaClient;
use crate::runtime::{AllocGuard, Device, RuntimeClient};

use hash::{DeviceHashTable, EMPTY_SLOT};

/// Coordinate map backed by GPU memory
pub struct CudaCoordinateMap {
    client: CudaClient,
    coordinate_size: usize,
    capacity: usize,
    size: usize,
    tensor_stride: Vec<u32>,
    /// Dense row-major coordinate storage, `capacity * D` elements
    coordinates: CudaSlice<i32>,
    table: DeviceHashTable,
}

impl CudaCoordinateMap {
    /// The client this map launches on
    pub fn client(&self) -> &CudaClient {
        &self.client
    }

    fn upload_i32(&self, host: &[i32]) -> Result<CudaSlice<i32>> {
        Ok(self.client.stream().memcpy_stod(host)?)
    }

    /// Staged batch insert: claim slots, scan-compact the staged entries,
    /// rewrite slots to final rows. Returns the source input position of
    /// each new row, ordered by row.
    fn staged_insert(&mut self, input: &CudaSlice<i32>, n: usize) -> Result<Vec<u32>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let d = self.coordinate_size as u32;
        let table_size = self.table.table_size();
        let mask = self.table.mask();
        let stream = self.client.stream().clone();

        // Overflow flag, raised by the staging kernel when the batch holds
        // more distinct coordinates than the table has slots.
        let overflow = AllocGuard::new(self.client.allocator(), std::mem::size_of::<u32>())?;
        launch::zero_device_u32(&self.client, overflow.ptr())?;

        launch::insert_stage(
            &self.client,
            input,
            n,
            self.table.slots_mut(),
            mask,
            &self.coordinates,
            d,
            overflow.ptr(),
        )?;
        stream.synchronize()?;

        if launch::read_device_u32(&self.client, overflow.ptr())? != 0 {
            // Roll the claimed slots back so the map stays usable.
            launch::clear_staged(&self.client, self.table.slots_mut(), table_size)?;
            stream.synchronize()?;
            return Err(Error::capacity_exceeded(self.capacity, self.size + n));
        }

        let mut flags = stream.alloc_zeros::<u32>(table_size)?;
        launch::mark_staged(&self.client, self.table.slots(), &mut flags, table_size)?;
        stream.synchronize()?;
        let (scan, n_new) = launch::exclusive_scan_u32(&self.client, &flags, table_size)?;

        if self.size + n_new > self.capacity {
            // Roll the claimed slots back so the map stays usable.
            launch::clear_staged(&self.client, self.table.slots_mut(), table_size)?;
            stream.synchronize()?;
            return Err(Error::capacity_exceeded(self.capacity, self.size + n_new));
        }
        if n_new == 0 {
            return Ok(Vec::new());
        }

        let mut unique_src = stream.alloc_zeros::<u32>(n_new)?;
        launch::finalize_staged(
            &self.client,
            self.table.slots_mut(),
            &scan,
            input,
            &mut self.coordinates,
            &mut unique_src,
            self.size as u32,
            table_size,
            d,
        )?;
        stream.synchronize()?;
        self.size += n_new;

        Ok(stream.memcpy_dtov(&unique_src)?)
    }

    /// Probe this map's table for each query row; `EMPTY_SLOT` marks a miss
    fn lookup_rows(&self, queries: &CudaSlice<i32>, n: usize) -> Result<Vec<u32>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let stream = self.client.stream();
        let mut rows = stream.alloc_zeros::<u32>(n)?;
        launch::find_rows(
            &self.client,
            queries,
            n,
            self.table.slots(),
            self.table.mask(),
            &self.coordinates,
            self.coordinate_size as u32,
            &mut rows,
        )?;
        stream.synchronize()?;
        Ok(stream.memcpy_dtov(&rows)?)
    }

    fn kernel_map_pointwise(&self, out: &CudaCoordinateMap) -> Result<KernelMap> {
        let rows = self.lookup_rows(&out.coordinates, out.size)?;
        let mut in_rows = Vec::with_capacity(out.size);
        let mut out_rows = Vec::with_capacity(out.size);
        for (out_row, &in_row) in rows.iter().enumerate() {
            if in_row != EMPTY_SLOT {
                in_rows.push(in_row);
                out_rows.push(out_row as u32);
            }
        }
        let total = in_rows.len();
        Ok(KernelMap::from_parts(in_rows, out_rows, vec![0, total]))
    }

    fn kernel_map_general(
        &self,
        out: &CudaCoordinateMap,
        region: &KernelRegion,
    ) -> Result<KernelMap> {
        let d = self.coordinate_size as u32;
        let volume = region.volume();
        let n_out = out.size;
        let stream = self.client.stream();

        let offsets = self.upload_i32(region.offset_table())?;
        let mut counts = stream.alloc_zeros::<u32>(volume)?;
        launch::kernel_map_count(
            &self.client,
            &out.coordinates,
            n_out,
            self.table.slots(),
            self.table.mask(),
            &self.coordinates,
            d,
            &offsets,
            volume as u32,
            &mut counts,
        )?;
        stream.synchronize()?;

        let (bases, total) = launch::exclusive_scan_u32(&self.client, &counts, volume)?;
        if total == 0 {
            return Ok(KernelMap::empty(volume));
        }

        let mut cursors = stream.alloc_zeros::<u32>(volume)?;
        let mut in_rows = stream.alloc_zeros::<u32>(total)?;
        let mut out_rows = stream.alloc_zeros::<u32>(total)?;
        launch::kernel_map_fill(
            &self.client,
            &out.coordinates,
            n_out,
            self.table.slots(),
            self.table.mask(),
            &self.coordinates,
            d,
            &offsets,
            volume as u32,
            &bases,
            &mut cursors,
            &mut in_rows,
            &mut out_rows,
        )?;
        stream.synchronize()?;

        let in_rows = stream.memcpy_dtov(&in_rows)?;
        let out_rows = stream.memcpy_dtov(&out_rows)?;
        let bases = stream.memcpy_dtov(&bases)?;
        let offsets = bases.into_iter().map(|b| b as usize).collect();
        Ok(KernelMap::from_parts(in_rows, out_rows, offsets))
    }

    fn check_compatible(&self, other: &CudaCoordinateMap) -> Result<()> {
        if self.coordinate_size != other.coordinate_size {
            return Err(Error::coordinate_size_mismatch(
                self.coordinate_size,
                other.coordinate_size,
            ));
        }
        if !self.client.device().is_same(other.client.device()) {
            return Err(Error::invalid_argument(
                "map",
                "maps live on different CUDA devices",
            ));
        }
        Ok(())
    }
}

impl CoordinateMap for CudaCoordinateMap {
    type Ctx = CudaClient;

    fn with_capacity(
        ctx: &Self::Ctx,
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
        let table = DeviceHashTable::new(ctx, capacity)?;
        let coordinates = ctx
            .stream()
            .alloc_zeros::<i32>((capacity * coordinate_size).max(1))?;
        ctx.stream().synchronize()?;
        Ok(Self {
            client: ctx.clone(),
            coordinate_size,
            capacity,
            size: 0,
            tensor_stride: tensor_stride.to_vec(),
            coordinates,
            table,
        })
    }

    fn insert(&mut self, coordinates: &[i32]) -> Result<usize> {
        let n = check_buffer(coordinates, self.coordinate_size)?;
        if n == 0 {
            return Ok(self.size);
        }
        let input = self.upload_i32(coordinates)?;
        self.staged_insert(&input, n)?;
        Ok(self.size)
    }

    fn insert_and_map(&mut self, coordinates: &[i32]) -> Result<(Vec<u32>, Vec<u32>)> {
        let n = check_buffer(coordinates, self.coordinate_size)?;
        if n == 0 {
            return Ok((Vec::new(), Vec::new()));
        }
        let input = self.upload_i32(coordinates)?;
        let unique_map = self.staged_insert(&input, n)?;
        // Every input is present after the insert, so the probe cannot miss.
        let inverse_map = self.lookup_rows(&input, n)?;
        Ok((unique_map, inverse_map))
    }

    fn find(&self, queries: &[i32]) -> Result<(Vec<u32>, Vec<u32>)> {
        let n = check_buffer(queries, self.coordinate_size)?;
        if n == 0 {
            return Ok((Vec::new(), Vec::new()));
        }
        let stream = self.client.stream();
        let input = self.upload_i32(queries)?;
        let mut rows = stream.alloc_zeros::<u32>(n)?;
        launch::find_rows(
            &self.client,
            &input,
            n,
            self.table.slots(),
            self.table.mask(),
            &self.coordinates,
            self.coordinate_size as u32,
            &mut rows,
        )?;

        let mut flags = stream.alloc_zeros::<u32>(n)?;
        launch::mark_found(&self.client, &rows, n, &mut flags)?;
        stream.synchronize()?;
        let (scan, total) = launch::exclusive_scan_u32(&self.client, &flags, n)?;
        if total == 0 {
            return Ok((Vec::new(), Vec::new()));
        }

        let mut found_queries = stream.alloc_zeros::<u32>(total)?;
        let mut found_rows = stream.alloc_zeros::<u32>(total)?;
        launch::compact_found(
            &self.client,
            &rows,
            n,
            &scan,
            &mut found_queries,
            &mut found_rows,
        )?;
        stream.synchronize()?;
        Ok((
            stream.memcpy_dtov(&found_queries)?,
            stream.memcpy_dtov(&found_rows)?,
        ))
    }

    fn stride(&self, stride_factors: &[u32]) -> Result<Self> {
        let new_stride = derived_tensor_stride(&self.tensor_stride, stride_factors)?;
        let mut derived =
            Self::with_capacity(&self.client, self.coordinate_size, self.size, &new_stride)?;
        if self.size == 0 {
            return Ok(derived);
        }
        let stream = self.client.stream();
        let stride_dev = stream.memcpy_stod(&new_stride)?;
        let mut snapped = stream.alloc_zeros::<i32>(self.size * self.coordinate_size)?;
        launch::stride_snap(
            &self.client,
            &self.coordinates,
            self.size,
            self.coordinate_size as u32,
            &stride_dev,
            &mut snapped,
        )?;
        stream.synchronize()?;
        derived.staged_insert(&snapped, self.size)?;
        Ok(derived)
    }

    fn stride_region(&self, region: &KernelRegion) -> Result<Self> {
        if region.coordinate_size() != self.coordinate_size {
            return Err(Error::coordinate_size_mismatch(
                self.coordinate_size,
                region.coordinate_size(),
            ));
        }
        let volume = region.volume();
        let mut derived = Self::with_capacity(
            &self.client,
            self.coordinate_size,
            self.size * volume,
            &self.tensor_stride,
        )?;
        if self.size == 0 {
            return Ok(derived);
        }
        let stream = self.client.stream();
        let offsets = self.upload_i32(region.offset_table())?;
        let mut expanded =
            stream.alloc_zeros::<i32>(self.size * volume * self.coordinate_size)?;
        launch::region_expand(
            &self.client,
            &self.coordinates,
            self.size,
            self.coordinate_size as u32,
            &offsets,
            volume as u32,
            &mut expanded,
        )?;
        stream.synchronize()?;
        derived.staged_insert(&expanded, self.size * volume)?;
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
            self.kernel_map_pointwise(out)
        } else {
            self.kernel_map_general(out, region)
        }
    }

    fn stride_map(&self, out: &Self) -> Result<KernelMap> {
        self.check_compatible(out)?;
        let n = self.size;
        if n == 0 {
            return Ok(KernelMap::empty(1));
        }
        let stream = self.client.stream();
        let stride_dev = stream.memcpy_stod(out.tensor_stride())?;
        let mut snapped = stream.alloc_zeros::<i32>(n * self.coordinate_size)?;
        launch::stride_snap(
            &self.client,
            &self.coordinates,
            n,
            self.coordinate_size as u32,
            &stride_dev,
            &mut snapped,
        )?;
        stream.synchronize()?;
        let rows = out.lookup_rows(&snapped, n)?;
        let mut out_rows = Vec::with_capacity(n);
        for (row, &out_row) in rows.iter().enumerate() {
            if out_row == EMPTY_SLOT {
                return Err(Error::CoordinateNotFound { row });
            }
            out_rows.push(out_row);
        }
        let in_rows = (0..n as u32).collect();
        Ok(KernelMap::from_parts(in_rows, out_rows, vec![0, n]))
    }

    fn origin(&self) -> Result<Self> {
        let d = self.coordinate_size;
        let mut coords = vec![0; self.size * d];
        self.copy_coordinates(&mut coords)?;
        let mut batches: Vec<i32> = coords.chunks_exact(d).map(|c| c[0]).collect();
        batches.sort_unstable();
        batches.dedup();

        let origin_stride = vec![0; d - 1];
        let mut origin =
            Self::with_capacity(&self.client, d, batches.len(), &origin_stride)?;
        let mut origin_coords = vec![0i32; batches.len() * d];
        for (i, &b) in batches.iter().enumerate() {
            origin_coords[i * d] = b;
        }
        if !batches.is_empty() {
            let input = self.upload_i32(&origin_coords)?;
            origin.staged_insert(&input, batches.len())?;
        }
        Ok(origin)
    }

    fn origin_map(&self, origin: &Self) -> Result<KernelMap> {
        self.check_compatible(origin)?;
        let n = self.size;
        if n == 0 {
            return Ok(KernelMap::empty(1));
        }
        let stream = self.client.stream();
        let mut rows = stream.alloc_zeros::<u32>(n)?;
        launch::origin_lookup(
            &self.client,
            &self.coordinates,
            n,
            self.coordinate_size as u32,
            origin.table.slots(),
            origin.table.mask(),
            &origin.coordinates,
            &mut rows,
        )?;
        stream.synchronize()?;
        let rows = stream.memcpy_dtov(&rows)?;
        let mut out_rows = Vec::with_capacity(n);
        for (row, &origin_row) in rows.iter().enumerate() {
            if origin_row == EMPTY_SLOT {
                return Err(Error::CoordinateNotFound { row });
            }
            out_rows.push(origin_row);
        }
        let in_rows = (0..n as u32).collect();
        Ok(KernelMap::from_parts(in_rows, out_rows, vec![0, n]))
    }

    fn prune(&self, keep: &[bool]) -> Result<(Self, KernelMap)> {
        if keep.len() != self.size {
            return Err(Error::invalid_argument(
                "keep",
                format!("expected {} flags, got {}", self.size, keep.len()),
            ));
        }
        let d = self.coordinate_size;
        let mut coords = vec![0; self.size * d];
        self.copy_coordinates(&mut coords)?;

        let mut kept_coords = Vec::new();
        let mut old_rows = Vec::new();
        for (row, &keep_row) in keep.iter().enumerate() {
            if keep_row {
                kept_coords.extend_from_slice(&coords[row * d..(row + 1) * d]);
                old_rows.push(row as u32);
            }
        }
        let kept = old_rows.len();

        let mut pruned = Self::with_capacity(&self.client, d, kept, &self.tensor_stride)?;
        if kept == 0 {
            return Ok((pruned, KernelMap::empty(1)));
        }
        let input = self.upload_i32(&kept_coords)?;
        pruned.staged_insert(&input, kept)?;
        // Rows in the pruned map come from the insert race; recover the
        // correspondence with a lookup of the kept coordinates.
        let new_rows = pruned.lookup_rows(&input, kept)?;
        Ok((
            pruned,
            KernelMap::from_parts(old_rows, new_rows, vec![0, kept]),
        ))
    }

    fn copy_coordinates(&self, dst: &mut [i32]) -> Result<()> {
        let expected = self.size * self.coordinate_size;
        if dst.len() != expected {
            return Err(Error::invalid_argument(
                "dst",
                format!("expected {} elements, got {}", expected, dst.len()),
            ));
        }
        if expected == 0 {
            return Ok(());
        }
        let stream = self.client.stream();
        let view = self.coordinates.slice(0..expected);
        let host = stream.memcpy_dtov(&view)?;
        dst.copy_from_slice(&host);
        Ok(())
    }

    fn size(&self) -> usize {
        self.size
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn coordinate_size(&self) -> usize {
        self.coordinate_size
    }

    fn tensor_stride(&self) -> &[u32] {
        &self.tensor_stride
    }
}
