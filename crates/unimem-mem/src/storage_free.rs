//! Free callback for off-heap buffers owned by storage.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use unimem_core::buffer::{FreeMemory, MemoryOwner, RawAllocation};
use unimem_core::lease::StorageLease;

/// Frees the raw memory once, then gives the object's storage bytes back
/// through its lease.
pub struct StorageFree {
    allocation: Arc<RawAllocation>,
    lease: Arc<StorageLease>,
    bytes: u64,
}

impl StorageFree {
    pub fn new(allocation: Arc<RawAllocation>, lease: Arc<StorageLease>, bytes: u64) -> Self {
        Self {
            allocation,
            lease,
            bytes,
        }
    }

    pub fn lease(&self) -> &Arc<StorageLease> {
        &self.lease
    }

    fn release(&self) {
        // The reservation may already be gone: dropped, cleared, or its
        // accountant torn down.
        let released = catch_unwind(AssertUnwindSafe(|| self.lease.release(self.bytes)));
        if released.is_err() {
            let _ = catch_unwind(AssertUnwindSafe(|| {
                tracing::warn!(
                    object = %self.lease.name(),
                    bytes = self.bytes,
                    "storage release failed while freeing buffer"
                );
            }));
        }
    }
}

impl FreeMemory for StorageFree {
    fn owner(&self) -> MemoryOwner {
        MemoryOwner::Storage
    }

    fn allocation(&self) -> &Arc<RawAllocation> {
        &self.allocation
    }

    fn run(&self) {
        if self.allocation.free() {
            self.release();
        }
    }

    fn detach(self: Box<Self>) -> Arc<RawAllocation> {
        self.release();
        self.allocation
    }
}
