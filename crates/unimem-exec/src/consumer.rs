//! Execution Memory Consumer: a per-task proxy reserving and releasing bytes
//! against the execution pool through the task's memory manager.
//!
//! A consumer belongs to exactly one task and is never handed to another.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use unimem_core::error::Result;
use unimem_core::host::TaskMemoryManager;
use unimem_core::id::TaskId;
use unimem_core::mode::MemoryMode;

pub struct ExecutionMemoryConsumer {
    task_mm: Arc<dyn TaskMemoryManager>,
    mode: MemoryMode,
    used: AtomicU64,
}

impl ExecutionMemoryConsumer {
    pub fn new(task_mm: Arc<dyn TaskMemoryManager>, mode: MemoryMode) -> Self {
        Self {
            task_mm,
            mode,
            used: AtomicU64::new(0),
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_mm.task_id()
    }

    pub fn mode(&self) -> MemoryMode {
        self.mode
    }

    /// Bytes currently reserved through this consumer.
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    /// Returns the granted amount, which may be less than `num_bytes`.
    pub fn acquire_memory(&self, num_bytes: u64) -> u64 {
        if num_bytes == 0 {
            return 0;
        }
        let granted = self.task_mm.acquire_execution_memory(num_bytes, self.mode);
        self.used.fetch_add(granted, Ordering::AcqRel);
        granted
    }

    /// Release up to `num_bytes`, clamped to what this consumer holds.
    pub fn free_memory(&self, num_bytes: u64) -> Result<()> {
        let prev = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                Some(cur.saturating_sub(num_bytes))
            })
            .unwrap_or_else(|cur| cur);
        let released = prev.min(num_bytes);
        if released > 0 {
            self.task_mm.release_execution_memory(released, self.mode)?;
        }
        Ok(())
    }

    /// Release the whole reservation; returns the bytes released.
    pub fn free_all(&self) -> Result<u64> {
        let held = self.used.swap(0, Ordering::AcqRel);
        if held > 0 {
            self.task_mm.release_execution_memory(held, self.mode)?;
        }
        Ok(held)
    }
}

impl std::fmt::Debug for ExecutionMemoryConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionMemoryConsumer")
            .field("task", &self.task_id())
            .field("mode", &self.mode)
            .field("used", &self.used())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Task manager with a fixed budget.
    struct Budget {
        left: Mutex<u64>,
    }

    impl TaskMemoryManager for Budget {
        fn task_id(&self) -> TaskId {
            TaskId::new(7)
        }

        fn acquire_execution_memory(&self, num_bytes: u64, _mode: MemoryMode) -> u64 {
            let mut left = self.left.lock().unwrap();
            let granted = num_bytes.min(*left);
            *left -= granted;
            granted
        }

        fn release_execution_memory(&self, num_bytes: u64, _mode: MemoryMode) -> Result<()> {
            *self.left.lock().unwrap() += num_bytes;
            Ok(())
        }
    }

    fn consumer(budget: u64) -> (Arc<Budget>, ExecutionMemoryConsumer) {
        let mm = Arc::new(Budget {
            left: Mutex::new(budget),
        });
        let c = ExecutionMemoryConsumer::new(mm.clone(), MemoryMode::OffHeap);
        (mm, c)
    }

    #[test]
    fn partial_grant_is_tracked() {
        let (mm, c) = consumer(100);
        assert_eq!(c.acquire_memory(60), 60);
        assert_eq!(c.acquire_memory(60), 40);
        assert_eq!(c.used(), 100);
        assert_eq!(*mm.left.lock().unwrap(), 0);
        assert_eq!(c.task_id(), TaskId::new(7));
    }

    #[test]
    fn free_memory_clamps_to_held() {
        let (mm, c) = consumer(100);
        c.acquire_memory(30);
        c.free_memory(50).unwrap();
        assert_eq!(c.used(), 0);
        assert_eq!(*mm.left.lock().unwrap(), 100);
    }

    #[test]
    fn free_all_is_idempotent() {
        let (mm, c) = consumer(100);
        c.acquire_memory(80);
        assert_eq!(c.free_all().unwrap(), 80);
        assert_eq!(c.free_all().unwrap(), 0);
        assert_eq!(*mm.left.lock().unwrap(), 100);
    }
}
