//! # sparsegrid
//!
//! **Coordinate maps and kernel maps for sparse voxel convolution.**
//!
//! sparsegrid manages the integer coordinate sets behind sparse tensors in
//! point-cloud and voxel deep learning: dedup-inserting quantized
//! coordinates, deriving strided and pruned coordinate sets, and building
//! the (input row, output row) kernel maps a sparse convolution gathers
//! and scatters through. The same API runs on CPU and CUDA backends.
//!
//! ## Core concepts
//!
//! - **Coordinate**: `D` integers, a batch index followed by `D - 1`
//!   spatial components on a stride grid.
//! - **Coordinate map**: a bidirectional mapping between coordinates and
//!   dense row indices `[0, size)`, one per tensor stride level.
//! - **Kernel map**: flat (input row, output row) pairs grouped by kernel
//!   offset index, driving gather/scatter in a sparse convolution.
//! - **Manager**: a registry of maps keyed by tensor stride plus label,
//!   with cached kernel maps connecting them.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use sparsegrid::prelude::*;
//!
//! let client = CpuRuntime::default_client(&CpuRuntime::default_device());
//! let mut manager: CoordinateMapManager<CpuCoordinateMap> =
//!     CoordinateMapManager::new(client, 4);
//!
//! // Batched (b, x, y, z) coordinates, one row per point.
//! let (key, unique, inverse) = manager.insert_and_map(&coords, &[1, 1, 1], "")?;
//! let down = manager.stride(&key, &[2, 2, 2])?;
//! let km = manager.kernel_map(&key, &down, &[3, 3, 3], &[1, 1, 1],
//!                             RegionType::HyperCube, None)?;
//! ```
//!
//! ## Feature Flags
//!
//! - `cpu` (default): CPU backend
//! - `rayon` (default): multi-threaded CPU kernel-map construction
//! - `cuda`: NVIDIA CUDA backend (requires the CUDA Toolkit at build time)

#![warn(missing_docs)]

pub mod coordinate;
pub mod error;
pub mod kernel_map;
pub mod manager;
pub mod map;
pub mod region;
pub mod runtime;

pub use coordinate::{Coordinate, MAX_COORDINATE_SIZE};
pub use error::{Error, Result};
pub use kernel_map::KernelMap;
pub use manager::{CoordinateMapKey, CoordinateMapManager};
pub use map::CoordinateMap;
pub use region::{KernelRegion, RegionType};

#[cfg(feature = "cpu")]
pub use map::CpuCoordinateMap;
#[cfg(feature = "cuda")]
pub use map::CudaCoordinateMap;

/// Default runtime: CUDA when enabled, CPU otherwise
#[cfg(feature = "cuda")]
pub type DefaultRuntime = runtime::cuda::CudaRuntime;

/// Default runtime: CUDA when enabled, CPU otherwise
#[cfg(all(feature = "cpu", not(feature = "cuda")))]
pub type DefaultRuntime = runtime::cpu::CpuRuntime;

/// Commonly used types in one import
pub mod prelude {
    pub use crate::coordinate::Coordinate;
    pub use crate::error::{Error, Result};
    pub use crate::kernel_map::KernelMap;
    pub use crate::manager::{CoordinateMapKey, CoordinateMapManager};
    pub use crate::map::CoordinateMap;
    pub use crate::region::{KernelRegion, RegionType};
    pub use crate::runtime::{Device, Runtime, RuntimeClient};

    #[cfg(feature = "cpu")]
    pub use crate::map::CpuCoordinateMap;
    #[cfg(feature = "cpu")]
    pub use crate::runtime::cpu::{CpuClient, CpuDevice, CpuRuntime};

    #[cfg(feature = "cuda")]
    pub use crate::map::CudaCoordinateMap;
    #[cfg(feature = "cuda")]
    pub use crate::runtime::cuda::{CudaClient, CudaDevice, CudaRuntime};
}
