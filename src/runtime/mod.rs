//! Execution backends for coordinate maps
//!
//! This module defines the `Runtime` trait and provides implementations for
//! the CPU and CUDA backends.
//!
//! # Architecture
//!
//! ```text
//! Runtime (backend identity)
//! ├── Device (identifies a specific CPU/GPU)
//! ├── Client (dispatches operations, owns context/stream)
//! └── Allocator (injected bulk allocation policy)
//! ```
//!
//! Static dispatch via generics: a coordinate map is parameterized over its
//! client type at composition time, with no runtime virtual dispatch.

mod allocator;

#[cfg(feature = "cpu")]
pub mod cpu;

#[cfg(feature = "cuda")]
pub mod cuda;

pub use allocator::{AllocGuard, Allocator, DefaultAllocator};

/// Core trait for compute backends
///
/// `Runtime` ties together the device, client, and allocator types of one
/// backend. Memory is addressed through opaque `u64` handles so the same
/// allocator interface covers host pointers and device pointers.
pub trait Runtime: Clone + Send + Sync + 'static {
    /// Device identifier type
    type Device: Device;

    /// Client for dispatching operations
    type Client: RuntimeClient<Self>;

    /// Memory allocator type
    type Allocator: Allocator;

    /// Human-readable name of this runtime
    fn name() -> &'static str;

    /// Get the default device
    fn default_device() -> Self::Device;

    /// Get the default client for a device
    fn default_client(device: &Self::Device) -> Self::Client;
}

/// Trait for device identification
pub trait Device: Clone + Send + Sync + 'static {
    /// Unique identifier for this device
    fn id(&self) -> usize;

    /// Check if two devices are the same
    fn is_same(&self, other: &Self) -> bool {
        self.id() == other.id()
    }

    /// Human-readable name
    fn name(&self) -> String {
        format!("Device({})", self.id())
    }
}

/// Trait for runtime clients that handle operation dispatch
pub trait RuntimeClient<R: Runtime>: Clone + Send + Sync {
    /// Get the device this client operates on
    fn device(&self) -> &R::Device;

    /// Synchronize: wait for all pending operations to complete
    fn synchronize(&self);

    /// Get the allocator for this client
    fn allocator(&self) -> &R::Allocator;
}
