//! Convenient re-exports for downstream crates.

pub use crate::accountant::{MemoryAccountant, ObjectReservation};
pub use crate::buffer::{Buffer, ByteOrder, FreeMemory, MemoryOwner, RawAllocation, RawMemory};
pub use crate::config::AccountantConfig;
pub use crate::error::{Error, Result};
pub use crate::host::{
    BufferAllocator, Evictor, FreeMemoryFactory, HostEnvironment, HostLookup, HostMemoryManager,
    HostSlot, TaskContext, TaskMemoryManager,
};
pub use crate::id::{BlockId, TaskId};
pub use crate::lease::StorageLease;
pub use crate::mode::{MemoryMode, PoolKind};
pub use crate::plugin::{AccountantFactory, PluginTable, UNIFIED_ACCOUNTANT_KEY};
pub use crate::stats::{MemoryStats, PoolSnapshot, StatsSink};
pub use crate::tracker::MemoryTracker;
