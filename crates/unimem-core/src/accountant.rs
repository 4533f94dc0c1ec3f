//! The Accountant Contract.
//!
//! Concrete accountants live elsewhere (`unimem-mem` for the advanced one,
//! `unimem-exec` for the delegate). The host's storage and task layers only
//! ever talk to this trait; pool internals are never reached into directly.
//!
//! Every operation must tolerate absent objects and zero-byte inputs without
//! failing.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::buffer::Buffer;
use crate::error::Result;
use crate::id::BlockId;
use crate::mode::MemoryMode;
use crate::stats::StatsSink;
use crate::tracker::MemoryTracker;

/// A named storage reservation, looked up and dropped by name.
///
/// `generation` tells apart successive reservations under the same name: a
/// name that is dropped and acquired again gets a new one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectReservation {
    pub name: String,
    pub mode: MemoryMode,
    pub bytes: u64,
    #[serde(default)]
    pub generation: u64,
}

pub trait MemoryAccountant: Send + Sync + 'static {
    /// Stable name for logs.
    fn name(&self) -> &'static str;

    /// Reserve `num_bytes` of `mode` storage memory for the object `name`.
    ///
    /// Returns true iff the reservation holds afterwards. With
    /// `should_evict == false` no eviction side effects happen, and a request
    /// that does not fit leaves pool state untouched. Repeated acquisitions
    /// for the same name are additive.
    fn acquire_storage_memory_for_object(
        &self,
        name: &str,
        block: Option<BlockId>,
        num_bytes: u64,
        mode: MemoryMode,
        tracker: Option<&MemoryTracker>,
        should_evict: bool,
    ) -> bool;

    /// Remove the whole reservation of `name`, returning the released bytes
    /// minus `ignore_num_bytes` (a live portion the caller accounts for
    /// separately).
    fn drop_storage_memory_for_object(
        &self,
        name: &str,
        mode: MemoryMode,
        ignore_num_bytes: u64,
    ) -> u64;

    /// Release `num_bytes` from `name`, clamping at zero.
    fn release_storage_memory_for_object(&self, name: &str, num_bytes: u64, mode: MemoryMode);

    /// Release `num_bytes` from `name` only while its reservation is still
    /// `generation`. Returns whether anything was released.
    ///
    /// Accountants without generations release by name.
    fn release_storage_reservation(
        &self,
        name: &str,
        num_bytes: u64,
        mode: MemoryMode,
        _generation: u64,
    ) -> bool {
        self.release_storage_memory_for_object(name, num_bytes, mode);
        true
    }

    fn storage_pool_memory_used(&self, mode: MemoryMode) -> u64;

    fn storage_pool_size(&self, mode: MemoryMode) -> u64;

    fn execution_pool_used_memory(&self, mode: MemoryMode) -> u64;

    fn execution_pool_size(&self, mode: MemoryMode) -> u64;

    /// Off-heap bytes currently attributed to `name` (0 if unknown).
    fn off_heap_memory(&self, name: &str) -> u64;

    fn has_off_heap(&self) -> bool;

    /// Relabel an allocated off-heap buffer as storage-owned without moving
    /// its bytes. Buffers not produced by the accountant's allocator are only
    /// accepted (as freshly accounted memory) when `allow_non_allocator` is set.
    fn change_off_heap_owner_to_storage(
        &self,
        buffer: &mut Buffer,
        allow_non_allocator: bool,
    ) -> Result<()>;

    /// Polled by long recovery/replay loops; true means stop early.
    fn should_stop_recovery(&self) -> bool;

    fn init_memory_stats(&self, stats: Arc<dyn StatsSink>);

    fn log_stats(&self);

    /// Drop every reservation and ledger entry.
    fn clear(&self);

    /// Release held resources. Later calls fail safely: acquisitions are
    /// refused and queries report zero.
    fn close(&self);

    /// Outstanding per-object reservations. Accountants without a per-object
    /// ledger report none.
    fn object_reservations(&self) -> Vec<ObjectReservation> {
        Vec::new()
    }

    /// Take over reservations made by another accountant (the bootstrap one)
    /// for memory that is still live. Returns the reservations as charged
    /// here, with this accountant's generations.
    fn adopt_reservations(&self, _reservations: &[ObjectReservation]) -> Vec<ObjectReservation> {
        Vec::new()
    }

    /// Move every outstanding reservation to `successor` and empty this
    /// ledger. Returns the number of reservations moved.
    fn hand_over(&self, successor: &Arc<dyn MemoryAccountant>) -> usize {
        let reservations = self.object_reservations();
        if reservations.is_empty() {
            return 0;
        }
        successor.adopt_reservations(&reservations);
        self.clear();
        reservations.len()
    }
}
