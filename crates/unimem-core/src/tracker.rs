//! Batching tracker for objects that acquire storage memory in many small
//! steps (e.g. while loading a cached table).
//!
//! The advanced accountant reserves `num_bytes + batch_bytes` when it can and
//! parks the surplus here as prepaid bytes; later small acquisitions for the
//! same object are served from the surplus without touching the pool.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::accountant::MemoryAccountant;
use crate::mode::MemoryMode;

#[derive(Debug)]
pub struct MemoryTracker {
    name: String,
    batch_bytes: u64,
    prepaid: AtomicU64,
    acquired: AtomicU64,
}

impl MemoryTracker {
    pub fn new(name: impl Into<String>, batch_bytes: u64) -> Self {
        Self {
            name: name.into(),
            batch_bytes,
            prepaid: AtomicU64::new(0),
            acquired: AtomicU64::new(0),
        }
    }

    /// Object the prepaid bytes are charged to.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn batch_bytes(&self) -> u64 {
        self.batch_bytes
    }

    pub fn prepaid(&self) -> u64 {
        self.prepaid.load(Ordering::Acquire)
    }

    /// Bytes handed out to callers through this tracker.
    pub fn total_acquired(&self) -> u64 {
        self.acquired.load(Ordering::Acquire)
    }

    /// Serve `num_bytes` from the prepaid surplus.
    pub fn take_prepaid(&self, num_bytes: u64) -> bool {
        let taken = self
            .prepaid
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                cur.checked_sub(num_bytes)
            })
            .is_ok();
        if taken {
            self.acquired.fetch_add(num_bytes, Ordering::AcqRel);
        }
        taken
    }

    pub fn add_prepaid(&self, num_bytes: u64) {
        self.prepaid.fetch_add(num_bytes, Ordering::AcqRel);
    }

    pub fn record_acquired(&self, num_bytes: u64) {
        self.acquired.fetch_add(num_bytes, Ordering::AcqRel);
    }

    /// Give unused prepaid bytes back to `accountant`; returns the amount.
    pub fn release_unused(&self, accountant: &dyn MemoryAccountant, mode: MemoryMode) -> u64 {
        let unused = self.prepaid.swap(0, Ordering::AcqRel);
        if unused > 0 {
            accountant.release_storage_memory_for_object(&self.name, unused, mode);
        }
        unused
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepaid_serves_until_exhausted() {
        let tracker = MemoryTracker::new("t1", 100);
        assert!(!tracker.take_prepaid(1));
        tracker.add_prepaid(100);
        assert!(tracker.take_prepaid(60));
        assert!(!tracker.take_prepaid(60));
        assert!(tracker.take_prepaid(40));
        assert_eq!(tracker.prepaid(), 0);
        assert_eq!(tracker.total_acquired(), 100);
    }
}
