//! In-process host environment.
//!
//! Tasks are bound to the thread that begins them. Ending a task (dropping
//! its `TaskGuard`) hands any execution memory it still holds back to the
//! host memory manager.

use std::cell::RefCell;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use unimem_core::config::AccountantConfig;
use unimem_core::error::Result;
use unimem_core::host::{HostEnvironment, HostMemoryManager, TaskContext, TaskMemoryManager};
use unimem_core::id::{BlockId, TaskId};
use unimem_core::mode::{MemoryMode, PoolKind};

thread_local! {
    static CURRENT_TASK: RefCell<Option<Arc<LocalTask>>> = const { RefCell::new(None) };
}

pub struct LocalHost {
    memory_manager: Arc<dyn HostMemoryManager>,
    next_task: AtomicU64,
}

impl LocalHost {
    pub fn new(memory_manager: Arc<dyn HostMemoryManager>) -> Arc<Self> {
        Arc::new(Self {
            memory_manager,
            next_task: AtomicU64::new(1),
        })
    }

    /// Start a task on the calling thread. Tasks nest; the previous one is
    /// restored when the guard drops.
    pub fn begin_task(&self) -> TaskGuard {
        let id = TaskId::new(self.next_task.fetch_add(1, Ordering::Relaxed));
        let task = Arc::new(LocalTask {
            id,
            memory: Arc::new(LocalTaskMemoryManager {
                task: id,
                host: Arc::clone(&self.memory_manager),
            }),
        });
        let previous = CURRENT_TASK.with(|c| c.borrow_mut().replace(Arc::clone(&task)));
        debug!(task = %id, "task started");
        TaskGuard {
            task,
            previous,
            _thread_bound: PhantomData,
        }
    }
}

impl HostEnvironment for LocalHost {
    fn memory_manager(&self) -> Arc<dyn HostMemoryManager> {
        Arc::clone(&self.memory_manager)
    }

    fn current_task(&self) -> Option<Arc<dyn TaskContext>> {
        CURRENT_TASK.with(|c| c.borrow().clone().map(|t| t as Arc<dyn TaskContext>))
    }
}

/// Ends its task when dropped.
pub struct TaskGuard {
    task: Arc<LocalTask>,
    previous: Option<Arc<LocalTask>>,
    _thread_bound: PhantomData<*const ()>,
}

impl TaskGuard {
    pub fn task_id(&self) -> TaskId {
        self.task.id
    }

    pub fn task(&self) -> &Arc<LocalTask> {
        &self.task
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_TASK.with(|c| *c.borrow_mut() = previous);
        let leaked = self
            .task
            .memory
            .host
            .release_all_execution_memory_for_task(self.task.id);
        debug!(task = %self.task.id, leaked, "task finished");
    }
}

pub struct LocalTask {
    id: TaskId,
    memory: Arc<LocalTaskMemoryManager>,
}

impl TaskContext for LocalTask {
    fn task_id(&self) -> TaskId {
        self.id
    }

    fn memory_manager(&self) -> Arc<dyn TaskMemoryManager> {
        self.memory.clone()
    }
}

/// Task-scoped view over the host memory manager.
pub struct LocalTaskMemoryManager {
    task: TaskId,
    host: Arc<dyn HostMemoryManager>,
}

impl TaskMemoryManager for LocalTaskMemoryManager {
    fn task_id(&self) -> TaskId {
        self.task
    }

    fn acquire_execution_memory(&self, num_bytes: u64, mode: MemoryMode) -> u64 {
        self.host.acquire_execution_memory(num_bytes, self.task, mode)
    }

    fn release_execution_memory(&self, num_bytes: u64, mode: MemoryMode) -> Result<()> {
        self.host.release_execution_memory(num_bytes, self.task, mode);
        Ok(())
    }
}

fn mode_index(mode: MemoryMode) -> usize {
    match mode {
        MemoryMode::OnHeap => 0,
        MemoryMode::OffHeap => 1,
    }
}

/// Generic host memory manager with fixed pool limits and no per-object
/// accounting. It does not satisfy the accountant contract.
#[derive(Debug)]
pub struct StaticMemoryManager {
    storage_limit: [u64; 2],
    execution_limit: [u64; 2],
    storage_used: [AtomicU64; 2],
    execution: Mutex<HashMap<(TaskId, MemoryMode), u64>>,
}

impl StaticMemoryManager {
    pub fn new(config: &AccountantConfig) -> Self {
        let limit = |kind| {
            [
                config.capacity(kind, MemoryMode::OnHeap),
                config.capacity(kind, MemoryMode::OffHeap),
            ]
        };
        Self {
            storage_limit: limit(PoolKind::Storage),
            execution_limit: limit(PoolKind::Execution),
            storage_used: [AtomicU64::new(0), AtomicU64::new(0)],
            execution: Mutex::new(HashMap::new()),
        }
    }

    pub fn storage_used(&self, mode: MemoryMode) -> u64 {
        self.storage_used[mode_index(mode)].load(Ordering::Acquire)
    }

    pub fn execution_used(&self, mode: MemoryMode) -> u64 {
        let map = self.execution.lock().unwrap_or_else(|e| e.into_inner());
        map.iter()
            .filter(|((_, m), _)| *m == mode)
            .map(|(_, bytes)| *bytes)
            .sum()
    }
}

impl HostMemoryManager for StaticMemoryManager {
    fn acquire_storage_memory(
        &self,
        _block: Option<BlockId>,
        num_bytes: u64,
        mode: MemoryMode,
    ) -> bool {
        let idx = mode_index(mode);
        let limit = self.storage_limit[idx];
        self.storage_used[idx]
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |cur| {
                cur.checked_add(num_bytes).filter(|next| *next <= limit)
            })
            .is_ok()
    }

    fn release_storage_memory(&self, num_bytes: u64, mode: MemoryMode) {
        let _ = self.storage_used[mode_index(mode)].fetch_update(
            Ordering::AcqRel,
            Ordering::Relaxed,
            |cur| Some(cur.saturating_sub(num_bytes)),
        );
    }

    fn acquire_execution_memory(&self, num_bytes: u64, task: TaskId, mode: MemoryMode) -> u64 {
        let mut map = self.execution.lock().unwrap_or_else(|e| e.into_inner());
        let used: u64 = map
            .iter()
            .filter(|((_, m), _)| *m == mode)
            .map(|(_, bytes)| *bytes)
            .sum();
        let granted = num_bytes.min(self.execution_limit[mode_index(mode)].saturating_sub(used));
        if granted > 0 {
            *map.entry((task, mode)).or_insert(0) += granted;
        }
        granted
    }

    fn release_execution_memory(&self, num_bytes: u64, task: TaskId, mode: MemoryMode) {
        let mut map = self.execution.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(held) = map.get_mut(&(task, mode)) {
            *held = held.saturating_sub(num_bytes);
            if *held == 0 {
                map.remove(&(task, mode));
            }
        }
    }

    fn release_all_execution_memory_for_task(&self, task: TaskId) -> u64 {
        let mut map = self.execution.lock().unwrap_or_else(|e| e.into_inner());
        let mut released = 0;
        map.retain(|(t, _), bytes| {
            if *t == task {
                released += *bytes;
                false
            } else {
                true
            }
        });
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unimem_mem::UnifiedAccountant;

    fn small_config() -> AccountantConfig {
        AccountantConfig {
            storage_off_heap_bytes: 1000,
            execution_off_heap_bytes: 1000,
            ..AccountantConfig::default()
        }
    }

    #[test]
    fn static_manager_is_not_an_accountant() {
        let mm: Arc<dyn HostMemoryManager> = Arc::new(StaticMemoryManager::new(&small_config()));
        assert!(mm.as_accountant().is_none());
    }

    #[test]
    fn static_manager_enforces_storage_limit() {
        let mm = StaticMemoryManager::new(&small_config());
        assert!(mm.acquire_storage_memory(None, 600, MemoryMode::OffHeap));
        assert!(!mm.acquire_storage_memory(None, 600, MemoryMode::OffHeap));
        mm.release_storage_memory(1000, MemoryMode::OffHeap);
        assert_eq!(mm.storage_used(MemoryMode::OffHeap), 0);
    }

    #[test]
    fn current_task_follows_guard_lifetime() {
        let host = LocalHost::new(Arc::new(StaticMemoryManager::new(&small_config())));
        assert!(host.current_task().is_none());
        let outer = host.begin_task();
        assert_eq!(host.current_task().unwrap().task_id(), outer.task_id());
        {
            let inner = host.begin_task();
            assert_eq!(host.current_task().unwrap().task_id(), inner.task_id());
        }
        assert_eq!(host.current_task().unwrap().task_id(), outer.task_id());
        drop(outer);
        assert!(host.current_task().is_none());
    }

    #[test]
    fn other_threads_do_not_see_the_task() {
        let host = LocalHost::new(Arc::new(StaticMemoryManager::new(&small_config())));
        let _guard = host.begin_task();
        let remote = Arc::clone(&host);
        let seen = std::thread::spawn(move || remote.current_task().is_some())
            .join()
            .expect("Thread panicked");
        assert!(!seen);
    }

    #[test]
    fn ending_a_task_releases_its_execution_memory() {
        let mm = Arc::new(StaticMemoryManager::new(&small_config()));
        let host = LocalHost::new(mm.clone());
        let guard = host.begin_task();
        let task_mm = host.current_task().unwrap().memory_manager();
        assert_eq!(task_mm.acquire_execution_memory(700, MemoryMode::OffHeap), 700);
        assert_eq!(task_mm.acquire_execution_memory(700, MemoryMode::OffHeap), 300);
        assert_eq!(mm.execution_used(MemoryMode::OffHeap), 1000);
        drop(guard);
        assert_eq!(mm.execution_used(MemoryMode::OffHeap), 0);
    }

    #[test]
    fn unified_accountant_serves_as_host_manager() {
        let acc = UnifiedAccountant::new(small_config()).unwrap();
        let host = LocalHost::new(acc.clone());
        let guard = host.begin_task();
        let task_mm = host.current_task().unwrap().memory_manager();
        assert_eq!(task_mm.acquire_execution_memory(400, MemoryMode::OffHeap), 400);
        assert_eq!(acc.task_memory(guard.task_id(), MemoryMode::OffHeap), 400);
        task_mm.release_execution_memory(100, MemoryMode::OffHeap).unwrap();
        assert_eq!(acc.task_memory(guard.task_id(), MemoryMode::OffHeap), 300);
        drop(guard);
        use unimem_core::accountant::MemoryAccountant;
        assert_eq!(acc.execution_pool_used_memory(MemoryMode::OffHeap), 0);
    }
}
