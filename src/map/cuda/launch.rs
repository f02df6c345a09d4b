//! PTX loading, module caching, and kernel launchers
//!
//! PTX files are compiled by `build.rs` with nvcc and loaded on first use;
//! modules are cached per `(device, module)` so concurrent streams share
//! compiled code. Launchers are thin typed wrappers over
//! `stream.launch_builder`, one per kernel in `kernels/`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use cudarc::driver::safe::{CudaFunction, CudaModule, LaunchConfig};
use cudarc::driver::{CudaSlice, PushKernelArg};
use cudarc::nvrtc::Ptx;

use crate::error::{Error, Result};
use crate::runtime::cuda::CudaClient;
use crate::runtime::{Device, RuntimeClient};

/// Directory containing compiled PTX files (set by build.rs)
const KERNEL_DIR: &str = env!("CUDA_KERNEL_DIR");

/// Block size for elementwise kernels
const BLOCK_SIZE: u32 = 256;

/// Scan block size; must match SCAN_BLOCK_SIZE in scan.cu
const SCAN_BLOCK_SIZE: u32 = 512;

/// Shared-memory budget for staging region offset tables
const SMEM_LIMIT_BYTES: u32 = 48 * 1024;

/// Cache for loaded CUDA modules, keyed by (device index, module name)
static MODULE_CACHE: OnceLock<Mutex<HashMap<(usize, &'static str), Arc<CudaModule>>>> =
    OnceLock::new();

fn get_or_load_module(client: &CudaClient, module_name: &'static str) -> Result<Arc<CudaModule>> {
    let cache = MODULE_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = cache.lock().map_err(|e| {
        Error::Internal(format!("module cache lock poisoned: {}", e))
    })?;

    let key = (client.device().id(), module_name);
    if let Some(module) = guard.get(&key) {
        return Ok(module.clone());
    }

    let ptx = Ptx::from_file(format!("{}/{}.ptx", KERNEL_DIR, module_name));
    let module = client.context().load_module(ptx).map_err(|e| {
        Error::Internal(format!(
            "failed to load CUDA module '{}': {:?}; check that build.rs compiled the kernels",
            module_name, e
        ))
    })?;

    guard.insert(key, module.clone());
    Ok(module)
}

fn get_function(client: &CudaClient, module: &'static str, name: &str) -> Result<CudaFunction> {
    let loaded = get_or_load_module(client, module)?;
    loaded.load_function(name).map_err(|e| {
        Error::Internal(format!(
            "kernel '{}' not found in module '{}': {:?}",
            name, module, e
        ))
    })
}

#[inline]
fn grid_for(n: usize, block: u32) -> u32 {
    ((n as u32) + block - 1) / block
}

#[inline]
fn config(grid: u32, block: u32, shared_mem_bytes: u32) -> LaunchConfig {
    LaunchConfig {
        grid_dim: (grid.max(1), 1, 1),
        block_dim: (block, 1, 1),
        shared_mem_bytes,
    }
}

/// Reset every slot of a hash table to `EMPTY_SLOT`
pub(super) fn table_reset(
    client: &CudaClient,
    slots: &mut CudaSlice<u32>,
    table_size: usize,
) -> Result<()> {
    let func = get_function(client, "coordinate_map", "table_reset")?;
    let n = table_size as u32;
    let cfg = config(grid_for(table_size, BLOCK_SIZE), BLOCK_SIZE, 0);
    let mut builder = client.stream().launch_builder(&func);
    builder.arg(slots);
    builder.arg(&n);
    unsafe { builder.launch(cfg) }?;
    Ok(())
}

/// Phase 1 of insert: claim slots for input rows via atomicCAS
///
/// Duplicate inputs converge on the winner's staged slot; inputs equal to an
/// already-finalized row stop at that slot. `overflow_ptr` is a device u32
/// the kernel raises when a thread exhausts the table without placing its
/// coordinate.
#[allow(clippy::too_many_arguments)]
pub(super) fn insert_stage(
    client: &CudaClient,
    input: &CudaSlice<i32>,
    n: usize,
    slots: &mut CudaSlice<u32>,
    mask: u32,
    stored: &CudaSlice<i32>,
    d: u32,
    overflow_ptr: u64,
) -> Result<()> {
    if n == 0 {
        return Ok(());
    }
    let func = get_function(client, "coordinate_map", "insert_stage")?;
    let n_u = n as u32;
    let cfg = config(grid_for(n, BLOCK_SIZE), BLOCK_SIZE, 0);
    let mut builder = client.stream().launch_builder(&func);
    builder.arg(input);
    builder.arg(&n_u);
    builder.arg(slots);
    builder.arg(&mask);
    builder.arg(stored);
    builder.arg(&d);
    builder.arg(&overflow_ptr);
    unsafe { builder.launch(cfg) }?;
    Ok(())
}

/// Zero a device u32 held behind a raw allocator handle
pub(super) fn zero_device_u32(client: &CudaClient, ptr: u64) -> Result<()> {
    unsafe {
        let result =
            cudarc::driver::sys::cuMemsetD32Async(ptr, 0, 1, client.stream().cu_stream());
        if result != cudarc::driver::sys::CUresult::CUDA_SUCCESS {
            return Err(Error::Backend(format!(
                "cuMemsetD32Async failed for ptr 0x{:x}: {:?}",
                ptr, result
            )));
        }
    }
    Ok(())
}

/// Read back a device u32 held behind a raw allocator handle
pub(super) fn read_device_u32(client: &CudaClient, ptr: u64) -> Result<u32> {
    let mut value = 0u32;
    unsafe {
        let result = cudarc::driver::sys::cuMemcpyDtoHAsync_v2(
            (&mut value as *mut u32).cast(),
            ptr,
            std::mem::size_of::<u32>(),
            client.stream().cu_stream(),
        );
        if result != cudarc::driver::sys::CUresult::CUDA_SUCCESS {
            return Err(Error::Backend(format!(
                "cuMemcpyDtoHAsync failed for ptr 0x{:x}: {:?}",
                ptr, result
            )));
        }
    }
    client.stream().synchronize()?;
    Ok(value)
}

/// Write a 0/1 flag per table slot marking staged entries
pub(super) fn mark_staged(
    client: &CudaClient,
    slots: &CudaSlice<u32>,
    flags: &mut CudaSlice<u32>,
    table_size: usize,
) -> Result<()> {
    let func = get_function(client, "coordinate_map", "mark_staged")?;
    let n = table_size as u32;
    let cfg = config(grid_for(table_size, BLOCK_SIZE), BLOCK_SIZE, 0);
    let mut builder = client.stream().launch_builder(&func);
    builder.arg(slots);
    builder.arg(flags);
    builder.arg(&n);
    unsafe { builder.launch(cfg) }?;
    Ok(())
}

/// Roll staged slots back to empty (capacity-exceeded recovery path)
pub(super) fn clear_staged(
    client: &CudaClient,
    slots: &mut CudaSlice<u32>,
    table_size: usize,
) -> Result<()> {
    let func = get_function(client, "coordinate_map", "clear_staged")?;
    let n = table_size as u32;
    let cfg = config(grid_for(table_size, BLOCK_SIZE), BLOCK_SIZE, 0);
    let mut builder = client.stream().launch_builder(&func);
    builder.arg(slots);
    builder.arg(&n);
    unsafe { builder.launch(cfg) }?;
    Ok(())
}

/// Phase 3 of insert: rewrite staged slots to final row indices
///
/// `scan` is the exclusive scan of the staged flags; each staged slot `t`
/// becomes row `old_size + scan[t]`, its coordinate is copied into dense
/// storage, and `unique_src[scan[t]]` records the source input row.
#[allow(clippy::too_many_arguments)]
pub(super) fn finalize_staged(
    client: &CudaClient,
    slots: &mut CudaSlice<u32>,
    scan: &CudaSlice<u32>,
    input: &CudaSlice<i32>,
    stored: &mut CudaSlice<i32>,
    unique_src: &mut CudaSlice<u32>,
    old_size: u32,
    table_size: usize,
    d: u32,
) -> Result<()> {
    let func = get_function(client, "coordinate_map", "finalize_staged")?;
    let n = table_size as u32;
    let cfg = config(grid_for(table_size, BLOCK_SIZE), BLOCK_SIZE, 0);
    let mut builder = client.stream().launch_builder(&func);
    builder.arg(slots);
    builder.arg(scan);
    builder.arg(input);
    builder.arg(stored);
    builder.arg(unique_src);
    builder.arg(&old_size);
    builder.arg(&n);
    builder.arg(&d);
    unsafe { builder.launch(cfg) }?;
    Ok(())
}

/// Probe the table for each query row; writes the row index or `EMPTY_SLOT`
#[allow(clippy::too_many_arguments)]
pub(super) fn find_rows(
    client: &CudaClient,
    queries: &CudaSlice<i32>,
    n: usize,
    slots: &CudaSlice<u32>,
    mask: u32,
    stored: &CudaSlice<i32>,
    d: u32,
    rows: &mut CudaSlice<u32>,
) -> Result<()> {
    if n == 0 {
        return Ok(());
    }
    let func = get_function(client, "coordinate_map", "find_rows")?;
    let n_u = n as u32;
    let cfg = config(grid_for(n, BLOCK_SIZE), BLOCK_SIZE, 0);
    let mut builder = client.stream().launch_builder(&func);
    builder.arg(queries);
    builder.arg(&n_u);
    builder.arg(slots);
    builder.arg(&mask);
    builder.arg(stored);
    builder.arg(&d);
    builder.arg(rows);
    unsafe { builder.launch(cfg) }?;
    Ok(())
}

/// Write a 0/1 flag per query marking hits
pub(super) fn mark_found(
    client: &CudaClient,
    rows: &CudaSlice<u32>,
    n: usize,
    flags: &mut CudaSlice<u32>,
) -> Result<()> {
    if n == 0 {
        return Ok(());
    }
    let func = get_function(client, "coordinate_map", "mark_found")?;
    let n_u = n as u32;
    let cfg = config(grid_for(n, BLOCK_SIZE), BLOCK_SIZE, 0);
    let mut builder = client.stream().launch_builder(&func);
    builder.arg(rows);
    builder.arg(&n_u);
    builder.arg(flags);
    unsafe { builder.launch(cfg) }?;
    Ok(())
}

/// Compact hit queries into dense (query index, row) arrays, preserving
/// query order
#[allow(clippy::too_many_arguments)]
pub(super) fn compact_found(
    client: &CudaClient,
    rows: &CudaSlice<u32>,
    n: usize,
    scan: &CudaSlice<u32>,
    found_queries: &mut CudaSlice<u32>,
    found_rows: &mut CudaSlice<u32>,
) -> Result<()> {
    if n == 0 {
        return Ok(());
    }
    let func = get_function(client, "coordinate_map", "compact_found")?;
    let n_u = n as u32;
    let cfg = config(grid_for(n, BLOCK_SIZE), BLOCK_SIZE, 0);
    let mut builder = client.stream().launch_builder(&func);
    builder.arg(rows);
    builder.arg(&n_u);
    builder.arg(scan);
    builder.arg(found_queries);
    builder.arg(found_rows);
    unsafe { builder.launch(cfg) }?;
    Ok(())
}

/// Snap spatial components of each coordinate down to a stride grid
pub(super) fn stride_snap(
    client: &CudaClient,
    src: &CudaSlice<i32>,
    n: usize,
    d: u32,
    stride: &CudaSlice<u32>,
    dst: &mut CudaSlice<i32>,
) -> Result<()> {
    if n == 0 {
        return Ok(());
    }
    let func = get_function(client, "coordinate_map", "stride_snap")?;
    let n_u = n as u32;
    let cfg = config(grid_for(n, BLOCK_SIZE), BLOCK_SIZE, 0);
    let mut builder = client.stream().launch_builder(&func);
    builder.arg(src);
    builder.arg(&n_u);
    builder.arg(&d);
    builder.arg(stride);
    builder.arg(dst);
    unsafe { builder.launch(cfg) }?;
    Ok(())
}

/// Emit `volume` shifted copies of each coordinate, one per region offset
#[allow(clippy::too_many_arguments)]
pub(super) fn region_expand(
    client: &CudaClient,
    src: &CudaSlice<i32>,
    n: usize,
    d: u32,
    offsets: &CudaSlice<i32>,
    volume: u32,
    dst: &mut CudaSlice<i32>,
) -> Result<()> {
    if n == 0 {
        return Ok(());
    }
    let total = n * volume as usize;
    let func = get_function(client, "coordinate_map", "region_expand")?;
    let n_u = n as u32;
    let cfg = config(grid_for(total, BLOCK_SIZE), BLOCK_SIZE, 0);
    let mut builder = client.stream().launch_builder(&func);
    builder.arg(src);
    builder.arg(&n_u);
    builder.arg(&d);
    builder.arg(offsets);
    builder.arg(&volume);
    builder.arg(dst);
    unsafe { builder.launch(cfg) }?;
    Ok(())
}

/// Shared-memory element count for a region offset table, 0 if it does not
/// fit in the budget
fn region_smem_elems(volume: u32, d: u32) -> u32 {
    let elems = volume * (d - 1);
    if elems * 4 <= SMEM_LIMIT_BYTES {
        elems
    } else {
        0
    }
}

/// Count pass of the two-pass kernel map: per-kernel-index match counts
#[allow(clippy::too_many_arguments)]
pub(super) fn kernel_map_count(
    client: &CudaClient,
    out_coords: &CudaSlice<i32>,
    n_out: usize,
    slots: &CudaSlice<u32>,
    mask: u32,
    in_coords: &CudaSlice<i32>,
    d: u32,
    offsets: &CudaSlice<i32>,
    volume: u32,
    counts: &mut CudaSlice<u32>,
) -> Result<()> {
    if n_out == 0 {
        return Ok(());
    }
    let total = n_out * volume as usize;
    let smem_elems = region_smem_elems(volume, d);
    let func = get_function(client, "coordinate_map", "kernel_map_count")?;
    let n_u = n_out as u32;
    let cfg = config(grid_for(total, BLOCK_SIZE), BLOCK_SIZE, smem_elems * 4);
    let mut builder = client.stream().launch_builder(&func);
    builder.arg(out_coords);
    builder.arg(&n_u);
    builder.arg(slots);
    builder.arg(&mask);
    builder.arg(in_coords);
    builder.arg(&d);
    builder.arg(offsets);
    builder.arg(&volume);
    builder.arg(&smem_elems);
    builder.arg(counts);
    unsafe { builder.launch(cfg) }?;
    Ok(())
}

/// Fill pass of the two-pass kernel map: scatter pairs into scanned ranges
#[allow(clippy::too_many_arguments)]
pub(super) fn kernel_map_fill(
    client: &CudaClient,
    out_coords: &CudaSlice<i32>,
    n_out: usize,
    slots: &CudaSlice<u32>,
    mask: u32,
    in_coords: &CudaSlice<i32>,
    d: u32,
    offsets: &CudaSlice<i32>,
    volume: u32,
    bases: &CudaSlice<u32>,
    cursors: &mut CudaSlice<u32>,
    in_rows: &mut CudaSlice<u32>,
    out_rows: &mut CudaSlice<u32>,
) -> Result<()> {
    if n_out == 0 {
        return Ok(());
    }
    let total = n_out * volume as usize;
    let smem_elems = region_smem_elems(volume, d);
    let func = get_function(client, "coordinate_map", "kernel_map_fill")?;
    let n_u = n_out as u32;
    let cfg = config(grid_for(total, BLOCK_SIZE), BLOCK_SIZE, smem_elems * 4);
    let mut builder = client.stream().launch_builder(&func);
    builder.arg(out_coords);
    builder.arg(&n_u);
    builder.arg(slots);
    builder.arg(&mask);
    builder.arg(in_coords);
    builder.arg(&d);
    builder.arg(offsets);
    builder.arg(&volume);
    builder.arg(&smem_elems);
    builder.arg(bases);
    builder.arg(cursors);
    builder.arg(in_rows);
    builder.arg(out_rows);
    unsafe { builder.launch(cfg) }?;
    Ok(())
}

/// Probe an origin table with the batch index of each row
#[allow(clippy::too_many_arguments)]
pub(super) fn origin_lookup(
    client: &CudaClient,
    coords: &CudaSlice<i32>,
    n: usize,
    d: u32,
    slots: &CudaSlice<u32>,
    mask: u32,
    origin_coords: &CudaSlice<i32>,
    rows: &mut CudaSlice<u32>,
) -> Result<()> {
    if n == 0 {
        return Ok(());
    }
    let func = get_function(client, "coordinate_map", "origin_lookup")?;
    let n_u = n as u32;
    let cfg = config(grid_for(n, BLOCK_SIZE), BLOCK_SIZE, 0);
    let mut builder = client.stream().launch_builder(&func);
    builder.arg(coords);
    builder.arg(&n_u);
    builder.arg(&d);
    builder.arg(slots);
    builder.arg(&mask);
    builder.arg(origin_coords);
    builder.arg(rows);
    unsafe { builder.launch(cfg) }?;
    Ok(())
}

/// Exclusive scan of `n` u32 values on device
///
/// Returns the `n + 1` element scan (last element is the total) plus the
/// total read back to the host. Single-block for `n <= 512`; otherwise
/// per-block scans with block sums scanned on device when they fit in one
/// block and on the host when they do not.
pub(super) fn exclusive_scan_u32(
    client: &CudaClient,
    input: &CudaSlice<u32>,
    n: usize,
) -> Result<(CudaSlice<u32>, usize)> {
    let stream = client.stream();
    let mut output = stream.alloc_zeros::<u32>(n + 1)?;

    if n == 0 {
        stream.synchronize()?;
        return Ok((output, 0));
    }

    if n <= SCAN_BLOCK_SIZE as usize {
        let func = get_function(client, "scan", "exclusive_scan_u32")?;
        let n_u = n as u32;
        let cfg = config(1, SCAN_BLOCK_SIZE, 0);
        let mut builder = stream.launch_builder(&func);
        builder.arg(input);
        builder.arg(&mut output);
        builder.arg(&n_u);
        unsafe { builder.launch(cfg) }?;
    } else {
        let num_blocks = grid_for(n, SCAN_BLOCK_SIZE);
        let mut block_sums = stream.alloc_zeros::<u32>(num_blocks as usize)?;

        let func_step1 = get_function(client, "scan", "scan_blocks_u32_step1")?;
        let n_u = n as u32;
        let cfg = config(num_blocks, SCAN_BLOCK_SIZE, 0);
        let mut builder = stream.launch_builder(&func_step1);
        builder.arg(input);
        builder.arg(&mut output);
        builder.arg(&mut block_sums);
        builder.arg(&n_u);
        unsafe { builder.launch(cfg) }?;
        stream.synchronize()?;

        // Scan the block sums: one block if they fit, host round trip if not.
        let scanned_sums = if num_blocks <= SCAN_BLOCK_SIZE {
            let mut scanned = stream.alloc_zeros::<u32>(num_blocks as usize + 1)?;
            let func_scan = get_function(client, "scan", "exclusive_scan_u32")?;
            let cfg = config(1, SCAN_BLOCK_SIZE, 0);
            let mut builder = stream.launch_builder(&func_scan);
            builder.arg(&block_sums);
            builder.arg(&mut scanned);
            builder.arg(&num_blocks);
            unsafe { builder.launch(cfg) }?;
            scanned
        } else {
            let sums = stream.memcpy_dtov(&block_sums)?;
            let mut scanned = Vec::with_capacity(sums.len() + 1);
            let mut acc = 0u32;
            scanned.push(0);
            for s in sums {
                acc += s;
                scanned.push(acc);
            }
            stream.memcpy_stod(&scanned)?
        };
        stream.synchronize()?;

        let func_step3 = get_function(client, "scan", "add_block_offsets_u32_step3")?;
        let cfg = config(num_blocks, SCAN_BLOCK_SIZE, 0);
        let mut builder = stream.launch_builder(&func_step3);
        builder.arg(&mut output);
        builder.arg(&scanned_sums);
        builder.arg(&n_u);
        unsafe { builder.launch(cfg) }?;
    }

    stream.synchronize()?;
    let tail = output.slice(n..n + 1);
    let total = stream.memcpy_dtov(&tail)?[0] as usize;
    Ok((output, total))
}
