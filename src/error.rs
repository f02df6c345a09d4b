//! Error types for sparsegrid

use thiserror::Error;

/// Result type alias using sparsegrid's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in coordinate-map operations
#[derive(Error, Debug)]
pub enum Error {
    /// Coordinate dimensionality mismatch between a map and a buffer
    #[error("Coordinate size mismatch: map has D = {expected}, buffer implies D = {got}")]
    CoordinateSizeMismatch {
        /// Coordinate size of the map
        expected: usize,
        /// Coordinate size implied by the input
        got: usize,
    },

    /// Insertion would exceed the map's declared capacity
    ///
    /// Capacity is a hard precondition: callers must reserve a conservative
    /// upper bound before inserting (input size for `stride`, input size x
    /// kernel volume for `stride_region`).
    #[error("Capacity exceeded: capacity {capacity}, attempted size {attempted}")]
    CapacityExceeded {
        /// Declared capacity of the map
        capacity: usize,
        /// Size the operation attempted to reach
        attempted: usize,
    },

    /// A coordinate required to exist was not found
    ///
    /// Raised by `stride_map` and `origin_map` when the output map was not
    /// derived from the input. Plain queries signal absence by omission, not
    /// by this error.
    #[error("Coordinate at row {row} has no match in the target map")]
    CoordinateNotFound {
        /// Row index of the unmatched coordinate in the source map
        row: usize,
    },

    /// No coordinate map is registered under the given key
    #[error("No coordinate map for key {key}")]
    MapNotFound {
        /// Display form of the missing key
        key: String,
    },

    /// Invalid argument provided to an operation
    #[error("Invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// The argument name
        arg: &'static str,
        /// Reason for invalidity
        reason: String,
    },

    /// Out of memory
    #[error("Out of memory: failed to allocate {size} bytes")]
    OutOfMemory {
        /// Requested size in bytes
        size: usize,
    },

    /// Backend-specific error
    #[error("Backend error: {0}")]
    Backend(String),

    /// CUDA-specific error
    #[cfg(feature = "cuda")]
    #[error("CUDA error: {0}")]
    Cuda(#[from] cudarc::driver::DriverError),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a coordinate size mismatch error
    pub fn coordinate_size_mismatch(expected: usize, got: usize) -> Self {
        Self::CoordinateSizeMismatch { expected, got }
    }

    /// Create a capacity exceeded error
    pub fn capacity_exceeded(capacity: usize, attempted: usize) -> Self {
        Self::CapacityExceeded {
            capacity,
            attempted,
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(arg: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            arg,
            reason: reason.into(),
        }
    }
}
