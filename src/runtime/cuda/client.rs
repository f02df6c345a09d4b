//! CUDA client and stream-ordered allocator

use std::sync::Arc;

use cudarc::driver::safe::{CudaContext, CudaStream};

use super::device::CudaDevice;
use super::runtime::CudaRuntime;
use crate::error::Result;
use crate::runtime::{Allocator, RuntimeClient};

/// CUDA runtime client
///
/// Owns the CUDA context and stream for a device. All kernel launches and
/// memory transfers for a coordinate map go through this client's stream;
/// launching on another stream breaks ordering.
#[derive(Clone)]
pub struct CudaClient {
    /// GPU device index
    pub(crate) device: CudaDevice,

    /// CUDA context for this device
    pub(crate) context: Arc<CudaContext>,

    /// Stream on which all kernels launch
    pub(crate) stream: Arc<CudaStream>,

    /// Stream-ordered allocator
    pub(crate) allocator: CudaAllocator,
}

impl std::fmt::Debug for CudaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CudaClient")
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

impl CudaClient {
    /// Create a new client for a device, initializing context and stream
    pub fn new(device: CudaDevice) -> Result<Self> {
        let context = CudaContext::new(device.index)?;
        context.bind_to_thread()?;
        let stream = context.new_stream()?;

        let allocator = CudaAllocator {
            stream: stream.clone(),
        };

        Ok(Self {
            device,
            context,
            stream,
            allocator,
        })
    }

    /// The CUDA stream all launches for this client must use
    #[inline]
    pub fn stream(&self) -> &Arc<CudaStream> {
        &self.stream
    }

    /// The CUDA context for this device
    #[inline]
    pub fn context(&self) -> &Arc<CudaContext> {
        &self.context
    }
}

impl RuntimeClient<CudaRuntime> for CudaClient {
    fn device(&self) -> &CudaDevice {
        &self.device
    }

    fn synchronize(&self) {
        if let Err(e) = self.stream.synchronize() {
            eprintln!("[sparsegrid::cuda] stream synchronize failed: {:?}", e);
        }
    }

    fn allocator(&self) -> &CudaAllocator {
        &self.allocator
    }
}

/// Stream-ordered CUDA allocator
///
/// Uses `cuMemAllocAsync` / `cuMemFreeAsync` so memory operations order with
/// kernel execution on the owning stream. Allocation failure is reported as
/// a null handle; `AllocGuard` turns that into `Err(OutOfMemory)`.
#[derive(Clone)]
pub struct CudaAllocator {
    stream: Arc<CudaStream>,
}

impl Allocator for CudaAllocator {
    fn allocate(&self, size_bytes: usize) -> u64 {
        if size_bytes == 0 {
            return 0;
        }

        unsafe {
            let mut ptr: u64 = 0;
            let result =
                cudarc::driver::sys::cuMemAllocAsync(&mut ptr, size_bytes, self.stream.cu_stream());

            if result != cudarc::driver::sys::CUresult::CUDA_SUCCESS {
                log_cuda_memory_error("cuMemAllocAsync", size_bytes as u64, result);
                return 0;
            }

            ptr
        }
    }

    fn deallocate(&self, ptr: u64, _size_bytes: usize) {
        if ptr == 0 {
            return;
        }

        unsafe {
            // Context already torn down: the driver reclaims the memory.
            if !is_cuda_context_valid() {
                return;
            }

            let result = cudarc::driver::sys::cuMemFreeAsync(ptr, self.stream.cu_stream());

            // Deallocation errors are typically benign; log, don't panic.
            if result != cudarc::driver::sys::CUresult::CUDA_SUCCESS
                && result != cudarc::driver::sys::CUresult::CUDA_ERROR_ILLEGAL_ADDRESS
            {
                log_cuda_memory_error("cuMemFreeAsync", ptr, result);
            }
        }
    }
}

/// Check if the CUDA context on the current thread is valid.
///
/// # Safety
///
/// Calls the CUDA driver API directly. Safe to call at any time; the result
/// is only valid for the current thread's context state.
#[inline]
unsafe fn is_cuda_context_valid() -> bool {
    let mut ctx: cudarc::driver::sys::CUcontext = std::ptr::null_mut();
    // SAFETY: cuCtxGetCurrent is safe to call at any time and writes to the provided pointer.
    let result = unsafe { cudarc::driver::sys::cuCtxGetCurrent(&mut ctx) };
    result == cudarc::driver::sys::CUresult::CUDA_SUCCESS && !ctx.is_null()
}

/// Log a CUDA memory operation failure.
#[cold]
#[inline(never)]
fn log_cuda_memory_error(operation: &str, detail: u64, result: cudarc::driver::sys::CUresult) {
    eprintln!(
        "[sparsegrid::cuda] {} failed (0x{:x}): {:?}",
        operation, detail, result
    );
}
