//! Accountant configuration that embedders can serialize/deserialize.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::mode::{MemoryMode, PoolKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountantConfig {
    /// Mode used for plain (unaccounted) allocations and as the default pool mode.
    pub memory_mode: MemoryMode,

    /// Pool capacities (bytes).
    pub storage_on_heap_bytes: u64,
    pub execution_on_heap_bytes: u64,
    pub storage_off_heap_bytes: u64,
    pub execution_off_heap_bytes: u64,

    /// Number of cores the execution budget is sized for. The bootstrap
    /// accountant always runs with a single core.
    pub num_cores: usize,

    /// Execution budget granted per core when the execution pools are sized
    /// from `num_cores` (bootstrap accountant).
    pub per_core_execution_bytes: u64,

    /// Build the bootstrap accountant eagerly when the registry is created
    /// instead of on first use during bring-up.
    pub boot_armed: bool,

    /// Lightweight deployment: never use the advanced accountant.
    pub connector_mode: bool,

    /// Granularity allocation sizes are rounded up to.
    pub allocation_alignment: u64,

    /// Fixed bookkeeping overhead added to every off-heap allocation.
    pub per_object_overhead: u64,

    /// Fraction of a mode's total capacity above which long recovery loops
    /// are asked to stop.
    pub critical_used_fraction: f64,
}

impl Default for AccountantConfig {
    fn default() -> Self {
        Self {
            memory_mode: MemoryMode::OffHeap,
            storage_on_heap_bytes: 256 * 1024 * 1024, // 256 MiB
            execution_on_heap_bytes: 256 * 1024 * 1024,
            storage_off_heap_bytes: 512 * 1024 * 1024, // 512 MiB
            execution_off_heap_bytes: 512 * 1024 * 1024,
            num_cores: 4,
            per_core_execution_bytes: 64 * 1024 * 1024,
            boot_armed: false,
            connector_mode: false,
            allocation_alignment: 8,
            per_object_overhead: 16,
            critical_used_fraction: 0.9,
        }
    }
}

impl AccountantConfig {
    /// Create a config from environment variables, falling back to defaults.
    ///
    /// Environment variables:
    /// - `UNIMEM_MEMORY_MODE`: `ON_HEAP` or `OFF_HEAP`
    /// - `UNIMEM_STORAGE_ON_HEAP_BYTES`, `UNIMEM_EXECUTION_ON_HEAP_BYTES`
    /// - `UNIMEM_STORAGE_OFF_HEAP_BYTES`, `UNIMEM_EXECUTION_OFF_HEAP_BYTES`
    /// - `UNIMEM_NUM_CORES`: cores the execution budget is sized for
    /// - `UNIMEM_PER_CORE_EXECUTION_BYTES`
    /// - `UNIMEM_BOOT_ARMED`, `UNIMEM_CONNECTOR_MODE`: `true`/`false`
    /// - `UNIMEM_ALLOCATION_ALIGNMENT`, `UNIMEM_PER_OBJECT_OVERHEAD`
    /// - `UNIMEM_CRITICAL_USED_FRACTION`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(s) = std::env::var("UNIMEM_MEMORY_MODE") {
            if let Some(v) = MemoryMode::parse(&s) {
                cfg.memory_mode = v;
            }
        }

        read_parsed("UNIMEM_STORAGE_ON_HEAP_BYTES", &mut cfg.storage_on_heap_bytes);
        read_parsed("UNIMEM_EXECUTION_ON_HEAP_BYTES", &mut cfg.execution_on_heap_bytes);
        read_parsed("UNIMEM_STORAGE_OFF_HEAP_BYTES", &mut cfg.storage_off_heap_bytes);
        read_parsed("UNIMEM_EXECUTION_OFF_HEAP_BYTES", &mut cfg.execution_off_heap_bytes);
        read_parsed("UNIMEM_NUM_CORES", &mut cfg.num_cores);
        read_parsed("UNIMEM_PER_CORE_EXECUTION_BYTES", &mut cfg.per_core_execution_bytes);
        read_parsed("UNIMEM_BOOT_ARMED", &mut cfg.boot_armed);
        read_parsed("UNIMEM_CONNECTOR_MODE", &mut cfg.connector_mode);
        read_parsed("UNIMEM_ALLOCATION_ALIGNMENT", &mut cfg.allocation_alignment);
        read_parsed("UNIMEM_PER_OBJECT_OVERHEAD", &mut cfg.per_object_overhead);
        read_parsed("UNIMEM_CRITICAL_USED_FRACTION", &mut cfg.critical_used_fraction);

        cfg
    }

    /// Configuration of the accountant used before the host environment
    /// exists: one core, execution pools sized from the per-core budget.
    pub fn bootstrap(&self) -> Self {
        let execution = self.per_core_execution_bytes;
        Self {
            num_cores: 1,
            execution_on_heap_bytes: execution,
            execution_off_heap_bytes: execution,
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.allocation_alignment == 0 {
            return Err(Error::Config("allocation_alignment must be > 0".into()));
        }
        if self.num_cores == 0 {
            return Err(Error::Config("num_cores must be > 0".into()));
        }
        if !(self.critical_used_fraction > 0.0 && self.critical_used_fraction <= 1.0) {
            return Err(Error::Config(format!(
                "critical_used_fraction must be in (0, 1], got {}",
                self.critical_used_fraction
            )));
        }
        Ok(())
    }

    pub fn capacity(&self, kind: PoolKind, mode: MemoryMode) -> u64 {
        match (kind, mode) {
            (PoolKind::Storage, MemoryMode::OnHeap) => self.storage_on_heap_bytes,
            (PoolKind::Storage, MemoryMode::OffHeap) => self.storage_off_heap_bytes,
            (PoolKind::Execution, MemoryMode::OnHeap) => self.execution_on_heap_bytes,
            (PoolKind::Execution, MemoryMode::OffHeap) => self.execution_off_heap_bytes,
        }
    }

    /// Round `size` up to the allocation granularity.
    pub fn rounded_allocation_size(&self, size: u64) -> u64 {
        let align = self.allocation_alignment.max(1);
        size.div_ceil(align).saturating_mul(align)
    }

    /// Bytes charged to execution memory for an off-heap allocation of `size`.
    pub fn accounted_allocation_size(&self, size: u64) -> u64 {
        self.rounded_allocation_size(size)
            .saturating_add(self.per_object_overhead)
    }
}

fn read_parsed<T: std::str::FromStr>(var: &str, slot: &mut T) {
    if let Ok(s) = std::env::var(var) {
        if let Ok(v) = s.trim().parse::<T>() {
            *slot = v;
        }
    }
}
