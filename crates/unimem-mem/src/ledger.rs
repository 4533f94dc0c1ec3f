//! Pool Ledger: one capacity/used counter per (pool kind × memory mode).
//!
//! Counters are atomics updated with compare-exchange loops, so concurrent
//! acquisitions never observe a negative or over-capacity balance.

use std::sync::atomic::{AtomicU64, Ordering};

use unimem_core::config::AccountantConfig;
use unimem_core::mode::{MemoryMode, PoolKind};
use unimem_core::stats::PoolSnapshot;

use crate::tracking::PeakTracker;

#[derive(Debug)]
pub struct Pool {
    kind: PoolKind,
    mode: MemoryMode,
    capacity: u64,
    used: AtomicU64,
    peak: PeakTracker,
}

impl Pool {
    fn new(kind: PoolKind, mode: MemoryMode, capacity: u64) -> Self {
        Self {
            kind,
            mode,
            capacity,
            used: AtomicU64::new(0),
            peak: PeakTracker::new(),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    pub fn available(&self) -> u64 {
        self.capacity.saturating_sub(self.used())
    }

    /// All-or-nothing acquisition.
    pub fn try_acquire(&self, bytes: u64) -> bool {
        loop {
            let cur = self.used.load(Ordering::Relaxed);
            let next = cur.saturating_add(bytes);
            if next > self.capacity {
                return false;
            }
            if self
                .used
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.peak.record_used(next);
                return true;
            }
        }
    }

    /// Grant as much of `bytes` as fits; returns the granted amount.
    pub fn acquire_up_to(&self, bytes: u64) -> u64 {
        loop {
            let cur = self.used.load(Ordering::Relaxed);
            let granted = bytes.min(self.capacity.saturating_sub(cur));
            if granted == 0 {
                return 0;
            }
            let next = cur + granted;
            if self
                .used
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.peak.record_used(next);
                return granted;
            }
        }
    }

    /// Charge bytes that already exist (ownership relabel, boot hand-over)
    /// without a capacity check.
    pub fn force_acquire(&self, bytes: u64) {
        let prev = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |cur| {
                Some(cur.saturating_add(bytes))
            })
            .unwrap_or_else(|cur| cur);
        self.peak.record_used(prev.saturating_add(bytes));
    }

    /// Release up to `bytes`, clamping at zero; returns the released amount.
    pub fn release(&self, bytes: u64) -> u64 {
        let prev = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |cur| {
                Some(cur.saturating_sub(bytes))
            })
            .unwrap_or_else(|cur| cur);
        prev.min(bytes)
    }

    fn reset(&self) {
        self.used.store(0, Ordering::Release);
        self.peak.reset();
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            kind: self.kind,
            mode: self.mode,
            used: self.used(),
            capacity: self.capacity,
            peak: self.peak.peak(),
        }
    }
}

#[derive(Debug)]
pub struct PoolLedger {
    pools: [Pool; 4],
}

impl PoolLedger {
    pub fn new(config: &AccountantConfig) -> Self {
        let pool = |kind, mode| Pool::new(kind, mode, config.capacity(kind, mode));
        Self {
            pools: [
                pool(PoolKind::Storage, MemoryMode::OnHeap),
                pool(PoolKind::Storage, MemoryMode::OffHeap),
                pool(PoolKind::Execution, MemoryMode::OnHeap),
                pool(PoolKind::Execution, MemoryMode::OffHeap),
            ],
        }
    }

    pub fn pool(&self, kind: PoolKind, mode: MemoryMode) -> &Pool {
        let idx = match (kind, mode) {
            (PoolKind::Storage, MemoryMode::OnHeap) => 0,
            (PoolKind::Storage, MemoryMode::OffHeap) => 1,
            (PoolKind::Execution, MemoryMode::OnHeap) => 2,
            (PoolKind::Execution, MemoryMode::OffHeap) => 3,
        };
        &self.pools[idx]
    }

    pub fn storage(&self, mode: MemoryMode) -> &Pool {
        self.pool(PoolKind::Storage, mode)
    }

    pub fn execution(&self, mode: MemoryMode) -> &Pool {
        self.pool(PoolKind::Execution, mode)
    }

    pub fn pools(&self) -> impl Iterator<Item = &Pool> {
        self.pools.iter()
    }

    pub fn reset(&self) {
        self.pools.iter().for_each(Pool::reset);
    }
}
