//! CPU runtime implementation
//!
//! The CPU runtime uses standard heap allocation and backs the host-side
//! coordinate map. All operations are synchronous; `synchronize` is a no-op.

mod client;
mod device;
mod runtime;

pub use client::{CpuAllocator, CpuClient};
pub use device::CpuDevice;
pub use runtime::CpuRuntime;
