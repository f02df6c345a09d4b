//! Global client cache for the CUDA runtime

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock, PoisonError};

use super::client::CudaClient;
use super::device::CudaDevice;

/// Global client cache: device index -> cached CudaClient
///
/// Caches clients per device to avoid creating a new CUDA context and stream
/// on every operation.
static CLIENT_CACHE: OnceLock<Mutex<HashMap<usize, CudaClient>>> = OnceLock::new();

/// Get or create a cached CudaClient for a device.
pub(super) fn get_or_create_client(device: &CudaDevice) -> CudaClient {
    let cache = CLIENT_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    // Cache operations are idempotent, so recovering the guard after a panic
    // in another thread is sound.
    let mut guard = cache.lock().unwrap_or_else(PoisonError::into_inner);

    if let Some(client) = guard.get(&device.index) {
        return client.clone();
    }

    let client = CudaClient::new(device.clone()).expect("Failed to create CUDA client");
    guard.insert(device.index, client.clone());

    client
}
