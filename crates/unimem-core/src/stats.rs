//! Memory statistics sink.
//!
//! The accountant publishes a [`PoolSnapshot`] whenever a pool changes. Wire a
//! real metrics backend by implementing [`StatsSink`]; [`MemoryStats`] keeps
//! the latest values in atomics.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::mode::{MemoryMode, PoolKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub kind: PoolKind,
    pub mode: MemoryMode,
    pub used: u64,
    pub capacity: u64,
    pub peak: u64,
}

impl PoolSnapshot {
    pub fn available(&self) -> u64 {
        self.capacity.saturating_sub(self.used)
    }
}

pub trait StatsSink: Send + Sync {
    fn record_pool(&self, snapshot: PoolSnapshot);
}

#[derive(Debug, Default)]
struct PoolCell {
    used: AtomicU64,
    capacity: AtomicU64,
    peak: AtomicU64,
}

/// Latest published value of every pool.
#[derive(Debug, Default)]
pub struct MemoryStats {
    cells: [PoolCell; 4],
    updates: AtomicU64,
}

fn slot(kind: PoolKind, mode: MemoryMode) -> usize {
    match (kind, mode) {
        (PoolKind::Storage, MemoryMode::OnHeap) => 0,
        (PoolKind::Storage, MemoryMode::OffHeap) => 1,
        (PoolKind::Execution, MemoryMode::OnHeap) => 2,
        (PoolKind::Execution, MemoryMode::OffHeap) => 3,
    }
}

impl MemoryStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pool(&self, kind: PoolKind, mode: MemoryMode) -> PoolSnapshot {
        let cell = &self.cells[slot(kind, mode)];
        PoolSnapshot {
            kind,
            mode,
            used: cell.used.load(Ordering::Relaxed),
            capacity: cell.capacity.load(Ordering::Relaxed),
            peak: cell.peak.load(Ordering::Relaxed),
        }
    }

    /// Number of snapshots received so far.
    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }

    /// Format memory size for display.
    pub fn format_bytes(bytes: u64) -> String {
        const KB: u64 = 1024;
        const MB: u64 = KB * 1024;
        const GB: u64 = MB * 1024;

        if bytes >= GB {
            format!("{:.2} GB", bytes as f64 / GB as f64)
        } else if bytes >= MB {
            format!("{:.2} MB", bytes as f64 / MB as f64)
        } else if bytes >= KB {
            format!("{:.2} KB", bytes as f64 / KB as f64)
        } else {
            format!("{} B", bytes)
        }
    }
}

impl StatsSink for MemoryStats {
    fn record_pool(&self, snapshot: PoolSnapshot) {
        let cell = &self.cells[slot(snapshot.kind, snapshot.mode)];
        cell.used.store(snapshot.used, Ordering::Relaxed);
        cell.capacity.store(snapshot.capacity, Ordering::Relaxed);
        cell.peak.fetch_max(snapshot.peak, Ordering::Relaxed);
        self.updates.fetch_add(1, Ordering::Relaxed);
    }
}
