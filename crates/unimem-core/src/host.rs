//! Boundary interfaces of the host runtime consumed by the accountant.
//!
//! Implemented by `unimem-host` (in-process host, system allocator) and by
//! the advanced accountant itself, which doubles as the host's memory manager.

use std::sync::{Arc, RwLock};

use crate::accountant::MemoryAccountant;
use crate::buffer::{Buffer, FreeMemory, RawAllocation};
use crate::error::Result;
use crate::id::{BlockId, TaskId};
use crate::mode::MemoryMode;

/// The generic memory manager a host environment is configured with.
pub trait HostMemoryManager: Send + Sync + 'static {
    /// Block-scoped storage acquisition.
    fn acquire_storage_memory(&self, block: Option<BlockId>, num_bytes: u64, mode: MemoryMode)
        -> bool;

    fn release_storage_memory(&self, num_bytes: u64, mode: MemoryMode);

    /// Returns the bytes actually granted, which may be less than requested.
    fn acquire_execution_memory(&self, num_bytes: u64, task: TaskId, mode: MemoryMode) -> u64;

    fn release_execution_memory(&self, num_bytes: u64, task: TaskId, mode: MemoryMode);

    /// End-of-task cleanup; returns the bytes that were still held.
    fn release_all_execution_memory_for_task(&self, task: TaskId) -> u64;

    /// This manager viewed through the Accountant Contract, if it satisfies it.
    fn as_accountant(self: Arc<Self>) -> Option<Arc<dyn MemoryAccountant>> {
        None
    }
}

/// Per-task view of execution memory.
pub trait TaskMemoryManager: Send + Sync {
    fn task_id(&self) -> TaskId;

    /// Returns the bytes actually granted, which may be less than requested.
    fn acquire_execution_memory(&self, num_bytes: u64, mode: MemoryMode) -> u64;

    fn release_execution_memory(&self, num_bytes: u64, mode: MemoryMode) -> Result<()>;
}

pub trait TaskContext: Send + Sync {
    fn task_id(&self) -> TaskId;

    fn memory_manager(&self) -> Arc<dyn TaskMemoryManager>;
}

/// An initialized host execution environment.
pub trait HostEnvironment: Send + Sync {
    fn memory_manager(&self) -> Arc<dyn HostMemoryManager>;

    /// Task running on the calling thread, if any.
    fn current_task(&self) -> Option<Arc<dyn TaskContext>>;
}

/// "Is the host environment initialized, and if so, which one."
pub trait HostLookup: Send + Sync {
    fn environment(&self) -> Option<Arc<dyn HostEnvironment>>;
}

/// Settable host lookup: empty during process bring-up, filled once the host
/// environment exists.
#[derive(Default)]
pub struct HostSlot {
    env: RwLock<Option<Arc<dyn HostEnvironment>>>,
}

impl HostSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, env: Arc<dyn HostEnvironment>) {
        let mut slot = self.env.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(env);
    }

    pub fn uninstall(&self) -> Option<Arc<dyn HostEnvironment>> {
        let mut slot = self.env.write().unwrap_or_else(|e| e.into_inner());
        slot.take()
    }
}

impl HostLookup for HostSlot {
    fn environment(&self) -> Option<Arc<dyn HostEnvironment>> {
        self.env.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Eviction policy of the storage layer. It decides what to evict; the
/// accountant only asks for space.
pub trait Evictor: Send + Sync {
    /// Try to free `space` bytes of `mode` storage; returns bytes freed.
    fn evict_blocks_to_free_space(&self, block: Option<BlockId>, space: u64, mode: MemoryMode)
        -> u64;
}

/// Builds the free callback for a raw allocation the allocator is about to
/// wrap in a buffer.
pub type FreeMemoryFactory<'a> = Box<dyn FnOnce(Arc<RawAllocation>) -> Box<dyn FreeMemory> + 'a>;

/// Allocation capability. The accountant never allocates raw memory itself.
pub trait BufferAllocator: Send + Sync {
    /// Whether this allocator hands out direct (off-heap) memory it manages.
    fn is_managed_direct(&self) -> bool;

    fn allocate(&self, size: usize, owner: &str) -> Result<Buffer>;

    /// Allocate direct memory whose reclamation runs the callback `free` builds.
    fn allocate_custom(&self, size: usize, owner: &str, free: FreeMemoryFactory<'_>)
        -> Result<Buffer>;
}
