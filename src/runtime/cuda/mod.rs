//! CUDA runtime implementation
//!
//! GPU acceleration for coordinate maps via NVIDIA CUDA using cudarc.
//!
//! - `CudaDevice` - identifies a CUDA GPU
//! - `CudaClient` - owns context and stream, launches kernels
//! - `CudaRuntime` - implements the generic `Runtime` trait
//!
//! # Thread Safety
//!
//! Clients are cached per device and are `Clone`; the underlying context and
//! stream are reference-counted. CUDA calls must happen on a thread the
//! context is bound to, or after `context.bind_to_thread()`.

mod cache;
mod client;
mod device;
mod runtime;

pub use client::{CudaAllocator, CudaClient};
pub use device::CudaDevice;
pub use runtime::CudaRuntime;
