//! Delegate accountant: memory accounting disabled.
//!
//! Storage acquisitions are forwarded to the host's block-scoped memory
//! manager when a host environment is up, and always granted otherwise.
//! There is no per-object ledger and no pool, so every query reports zero.

use std::sync::{Arc, RwLock};

use tracing::debug;

use unimem_core::accountant::MemoryAccountant;
use unimem_core::buffer::{Buffer, MemoryOwner};
use unimem_core::error::{Error, Result};
use unimem_core::host::HostLookup;
use unimem_core::id::BlockId;
use unimem_core::mode::MemoryMode;
use unimem_core::stats::StatsSink;
use unimem_core::tracker::MemoryTracker;

pub struct DelegateAccountant {
    host: Arc<dyn HostLookup>,
    stats: RwLock<Option<Arc<dyn StatsSink>>>,
}

impl DelegateAccountant {
    pub fn new(host: Arc<dyn HostLookup>) -> Self {
        Self {
            host,
            stats: RwLock::new(None),
        }
    }

    pub fn has_stats(&self) -> bool {
        self.stats
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

impl MemoryAccountant for DelegateAccountant {
    fn name(&self) -> &'static str {
        "delegate"
    }

    fn acquire_storage_memory_for_object(
        &self,
        _name: &str,
        block: Option<BlockId>,
        num_bytes: u64,
        mode: MemoryMode,
        _tracker: Option<&MemoryTracker>,
        _should_evict: bool,
    ) -> bool {
        match self.host.environment() {
            Some(env) => env
                .memory_manager()
                .acquire_storage_memory(block, num_bytes, mode),
            None => true,
        }
    }

    fn drop_storage_memory_for_object(&self, _name: &str, _mode: MemoryMode, _ignore: u64) -> u64 {
        0
    }

    fn release_storage_memory_for_object(&self, _name: &str, num_bytes: u64, mode: MemoryMode) {
        if let Some(env) = self.host.environment() {
            env.memory_manager().release_storage_memory(num_bytes, mode);
        }
    }

    fn storage_pool_memory_used(&self, _mode: MemoryMode) -> u64 {
        0
    }

    fn storage_pool_size(&self, _mode: MemoryMode) -> u64 {
        0
    }

    fn execution_pool_used_memory(&self, _mode: MemoryMode) -> u64 {
        0
    }

    fn execution_pool_size(&self, _mode: MemoryMode) -> u64 {
        0
    }

    fn off_heap_memory(&self, _name: &str) -> u64 {
        0
    }

    fn has_off_heap(&self) -> bool {
        false
    }

    /// Nothing is charged anywhere, so relabelling only checks provenance.
    fn change_off_heap_owner_to_storage(
        &self,
        buffer: &mut Buffer,
        allow_non_allocator: bool,
    ) -> Result<()> {
        match buffer.memory_owner() {
            Some(MemoryOwner::Unaccounted) if !allow_non_allocator => {
                Err(Error::InvalidOwnershipTransfer {
                    owner: buffer.owner_name().to_string(),
                    address: buffer.address().unwrap_or(0),
                })
            }
            _ => Ok(()),
        }
    }

    fn should_stop_recovery(&self) -> bool {
        false
    }

    fn init_memory_stats(&self, stats: Arc<dyn StatsSink>) {
        *self.stats.write().unwrap_or_else(|e| e.into_inner()) = Some(stats);
    }

    fn log_stats(&self) {
        debug!("memory accounting disabled; no pool statistics");
    }

    fn clear(&self) {}

    fn close(&self) {}
}
