//! CUDA runtime adapter

use super::cache::get_or_create_client;
use super::client::{CudaAllocator, CudaClient};
use super::device::CudaDevice;
use crate::runtime::Runtime;

/// CUDA runtime
///
/// Ties the CUDA device, client, and stream-ordered allocator types together
/// under the generic `Runtime` interface.
#[derive(Clone, Debug, Default)]
pub struct CudaRuntime;

impl Runtime for CudaRuntime {
    type Device = CudaDevice;
    type Client = CudaClient;
    type Allocator = CudaAllocator;

    fn name() -> &'static str {
        "cuda"
    }

    fn default_device() -> Self::Device {
        CudaDevice::new(0)
    }

    fn default_client(device: &Self::Device) -> Self::Client {
        get_or_create_client(device)
    }
}
