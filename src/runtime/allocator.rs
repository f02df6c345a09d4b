//! Memory allocator trait and default implementation
//!
//! Coordinate maps never assume a specific allocator beyond bulk
//! allocate/deallocate of raw bytes with a known size; the policy (arena,
//! pooled, or system) is injected at client construction.

/// Memory allocator trait for runtime backends
pub trait Allocator: Clone + Send + Sync {
    /// Allocate zeroed memory of the given size
    ///
    /// Returns an opaque pointer handle usable with the owning runtime.
    fn allocate(&self, size_bytes: usize) -> u64;

    /// Deallocate memory
    fn deallocate(&self, ptr: u64, size_bytes: usize);
}

/// Default allocator that delegates to a pair of functions
///
/// Wraps the runtime's raw allocate/deallocate so backends can share one
/// allocator type while fixing the policy per device.
#[derive(Clone, Debug)]
pub struct DefaultAllocator<D> {
    device: D,
    allocate_fn: fn(usize, &D) -> u64,
    deallocate_fn: fn(u64, usize, &D),
}

impl<D: Clone + Send + Sync> DefaultAllocator<D> {
    /// Create a new default allocator
    pub fn new(
        device: D,
        allocate_fn: fn(usize, &D) -> u64,
        deallocate_fn: fn(u64, usize, &D),
    ) -> Self {
        Self {
            device,
            allocate_fn,
            deallocate_fn,
        }
    }

    /// Get the device this allocator is associated with
    pub fn device(&self) -> &D {
        &self.device
    }
}

impl<D: Clone + Send + Sync> Allocator for DefaultAllocator<D> {
    fn allocate(&self, size_bytes: usize) -> u64 {
        (self.allocate_fn)(size_bytes, &self.device)
    }

    fn deallocate(&self, ptr: u64, size_bytes: usize) {
        (self.deallocate_fn)(ptr, size_bytes, &self.device)
    }
}

/// RAII wrapper around one allocation from an [`Allocator`]
///
/// Scratch buffers inside an operation hold their memory through a guard so
/// every early-return path releases it. Allocators signal failure with a
/// null handle; the guard converts that into `Err(OutOfMemory)`.
pub struct AllocGuard<'a, A: Allocator> {
    allocator: &'a A,
    ptr: u64,
    size_bytes: usize,
}

impl<A: Allocator> std::fmt::Debug for AllocGuard<'_, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocGuard")
            .field("ptr", &self.ptr)
            .field("size_bytes", &self.size_bytes)
            .finish_non_exhaustive()
    }
}

impl<'a, A: Allocator> AllocGuard<'a, A> {
    /// Allocate `size_bytes` through `allocator`, owning the result
    pub fn new(allocator: &'a A, size_bytes: usize) -> crate::error::Result<Self> {
        let ptr = allocator.allocate(size_bytes);
        if size_bytes > 0 && ptr == 0 {
            return Err(crate::error::Error::OutOfMemory { size: size_bytes });
        }
        Ok(Self {
            allocator,
            ptr,
            size_bytes,
        })
    }

    /// Opaque pointer handle of the allocation
    #[inline]
    pub fn ptr(&self) -> u64 {
        self.ptr
    }

    /// Size of the allocation in bytes
    #[inline]
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }
}

impl<A: Allocator> Drop for AllocGuard<'_, A> {
    fn drop(&mut self) {
        self.allocator.deallocate(self.ptr, self.size_bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Counts live allocations; returns null above a fixed budget.
    #[derive(Clone)]
    struct CountingAllocator {
        live: Arc<AtomicUsize>,
        budget: usize,
    }

    impl Allocator for CountingAllocator {
        fn allocate(&self, size_bytes: usize) -> u64 {
            if size_bytes == 0 {
                return 0;
            }
            if size_bytes > self.budget {
                return 0;
            }
            self.live.fetch_add(1, Ordering::SeqCst);
            0xdead_0000
        }

        fn deallocate(&self, ptr: u64, _size_bytes: usize) {
            if ptr != 0 {
                self.live.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn test_default_allocator_trait_bounds() {
        fn assert_allocator<A: Allocator>() {}
        assert_allocator::<DefaultAllocator<()>>();
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let live = Arc::new(AtomicUsize::new(0));
        let allocator = CountingAllocator {
            live: live.clone(),
            budget: 1024,
        };
        {
            let guard = AllocGuard::new(&allocator, 64).unwrap();
            assert_ne!(guard.ptr(), 0);
            assert_eq!(guard.size_bytes(), 64);
            assert_eq!(live.load(Ordering::SeqCst), 1);
        }
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_guard_surfaces_out_of_memory() {
        let allocator = CountingAllocator {
            live: Arc::new(AtomicUsize::new(0)),
            budget: 16,
        };
        let err = AllocGuard::new(&allocator, 32).unwrap_err();
        assert!(matches!(err, crate::error::Error::OutOfMemory { size: 32 }));
        // Zero-size allocations are represented by the null handle.
        let empty = AllocGuard::new(&allocator, 0).unwrap();
        assert_eq!(empty.ptr(), 0);
    }
}
