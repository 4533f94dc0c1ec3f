//! The advanced accountant: storage and execution pools per memory mode, a
//! per-object storage ledger, and per-task execution bookkeeping.
//!
//! It is also the host's memory manager (`HostMemoryManager`), which is how
//! the registry recognises it when the host environment comes up.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use tracing::{debug, info};

use unimem_core::accountant::{MemoryAccountant, ObjectReservation};
use unimem_core::buffer::{Buffer, MemoryOwner};
use unimem_core::config::AccountantConfig;
use unimem_core::error::{Error, Result};
use unimem_core::host::{Evictor, HostMemoryManager};
use unimem_core::id::{BlockId, TaskId};
use unimem_core::lease::StorageLease;
use unimem_core::mode::{MemoryMode, PoolKind};
use unimem_core::plugin::{PluginTable, UNIFIED_ACCOUNTANT_KEY};
use unimem_core::stats::StatsSink;
use unimem_core::tracker::MemoryTracker;

use crate::ledger::PoolLedger;
use crate::storage_free::StorageFree;

/// Object name block-scoped host storage acquisitions are charged to.
pub const HOST_STORAGE_OBJECT: &str = "__host_storage__";

type ObjectKey = (String, MemoryMode);

/// Storage held by one object. A new entry gets a new generation.
#[derive(Debug, Clone, Copy)]
struct ObjectEntry {
    bytes: u64,
    generation: u64,
}

pub struct UnifiedAccountant {
    config: AccountantConfig,
    ledger: PoolLedger,
    objects: Mutex<HashMap<ObjectKey, ObjectEntry>>,
    generations: AtomicU64,
    /// Leases of storage-owned buffers charged here. Lock after `objects`.
    leases: Mutex<Vec<Weak<StorageLease>>>,
    tasks: Mutex<HashMap<(TaskId, MemoryMode), u64>>,
    evictor: RwLock<Option<Arc<dyn Evictor>>>,
    stats: RwLock<Option<Arc<dyn StatsSink>>>,
    closed: AtomicBool,
    me: Weak<UnifiedAccountant>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl UnifiedAccountant {
    pub fn new(config: AccountantConfig) -> Result<Arc<Self>> {
        config.validate()?;
        debug!(
            num_cores = config.num_cores,
            storage_off_heap = config.storage_off_heap_bytes,
            execution_off_heap = config.execution_off_heap_bytes,
            "creating unified memory accountant"
        );
        Ok(Arc::new_cyclic(|me| Self {
            ledger: PoolLedger::new(&config),
            config,
            objects: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(1),
            leases: Mutex::new(Vec::new()),
            tasks: Mutex::new(HashMap::new()),
            evictor: RwLock::new(None),
            stats: RwLock::new(None),
            closed: AtomicBool::new(false),
            me: me.clone(),
        }))
    }

    /// Constructor registered in the plugin table.
    pub fn factory(config: &AccountantConfig) -> Result<Arc<dyn MemoryAccountant>> {
        let accountant: Arc<dyn MemoryAccountant> = Self::new(config.clone())?;
        Ok(accountant)
    }

    /// Register this implementation under its well-known key.
    pub fn register(table: &mut PluginTable) {
        table.register(UNIFIED_ACCOUNTANT_KEY, Self::factory);
    }

    pub fn config(&self) -> &AccountantConfig {
        &self.config
    }

    pub fn ledger(&self) -> &PoolLedger {
        &self.ledger
    }

    pub fn set_evictor(&self, evictor: Arc<dyn Evictor>) {
        *self.evictor.write().unwrap_or_else(|e| e.into_inner()) = Some(evictor);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Storage bytes held by `name` in `mode`.
    pub fn object_memory(&self, name: &str, mode: MemoryMode) -> u64 {
        lock(&self.objects)
            .get(&(name.to_string(), mode))
            .map_or(0, |e| e.bytes)
    }

    /// Generation of the live reservation of `name` in `mode`.
    pub fn object_generation(&self, name: &str, mode: MemoryMode) -> Option<u64> {
        lock(&self.objects)
            .get(&(name.to_string(), mode))
            .map(|e| e.generation)
    }

    /// Add `num_bytes` to the entry of `name`, creating it if needed.
    /// Returns the entry's generation.
    fn charge(
        &self,
        objects: &mut HashMap<ObjectKey, ObjectEntry>,
        name: &str,
        mode: MemoryMode,
        num_bytes: u64,
    ) -> u64 {
        let entry = objects
            .entry((name.to_string(), mode))
            .or_insert_with(|| ObjectEntry {
                bytes: 0,
                generation: self.generations.fetch_add(1, Ordering::Relaxed),
            });
        entry.bytes += num_bytes;
        entry.generation
    }

    /// Release from `name` under the object lock; `generation` restricts the
    /// release to one specific reservation.
    fn release_entry(
        &self,
        name: &str,
        num_bytes: u64,
        mode: MemoryMode,
        generation: Option<u64>,
    ) -> bool {
        let mut objects = lock(&self.objects);
        let key = (name.to_string(), mode);
        let Some(entry) = objects.get_mut(&key) else {
            return false;
        };
        if generation.is_some_and(|g| g != entry.generation) {
            return false;
        }
        let released = num_bytes.min(entry.bytes);
        entry.bytes -= released;
        if entry.bytes == 0 {
            objects.remove(&key);
        }
        self.ledger.storage(mode).release(released);
        drop(objects);
        self.publish(PoolKind::Storage, mode);
        true
    }

    fn reservations_of(objects: &HashMap<ObjectKey, ObjectEntry>) -> Vec<ObjectReservation> {
        let mut out: Vec<_> = objects
            .iter()
            .map(|((name, mode), entry)| ObjectReservation {
                name: name.clone(),
                mode: *mode,
                bytes: entry.bytes,
                generation: entry.generation,
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Execution bytes held by `task` in `mode`.
    pub fn task_memory(&self, task: TaskId, mode: MemoryMode) -> u64 {
        lock(&self.tasks).get(&(task, mode)).copied().unwrap_or(0)
    }

    fn publish(&self, kind: PoolKind, mode: MemoryMode) {
        let sink = self.stats.read().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(sink) = sink {
            sink.record_pool(self.ledger.pool(kind, mode).snapshot());
        }
    }

    fn publish_all(&self) {
        for kind in PoolKind::ALL {
            for mode in MemoryMode::ALL {
                self.publish(kind, mode);
            }
        }
    }

    /// Reserve under the object lock so the ledger and the pool move together.
    /// Leaves all state untouched when the request does not fit.
    fn try_reserve(
        &self,
        name: &str,
        num_bytes: u64,
        mode: MemoryMode,
        tracker: Option<&MemoryTracker>,
    ) -> bool {
        let pool = self.ledger.storage(mode);
        let mut objects = lock(&self.objects);

        if let Some(t) = tracker.filter(|t| t.batch_bytes() > 0) {
            let batched = num_bytes.saturating_add(t.batch_bytes());
            if pool.try_acquire(batched) {
                self.charge(&mut objects, name, mode, batched);
                t.add_prepaid(t.batch_bytes());
                t.record_acquired(num_bytes);
                return true;
            }
        }

        if !pool.try_acquire(num_bytes) {
            return false;
        }
        self.charge(&mut objects, name, mode, num_bytes);
        if let Some(t) = tracker {
            t.record_acquired(num_bytes);
        }
        true
    }

    /// Charge bytes that already exist to `name`, bypassing the capacity check.
    /// Returns the reservation's generation.
    fn force_reserve(&self, name: &str, num_bytes: u64, mode: MemoryMode) -> u64 {
        let mut objects = lock(&self.objects);
        self.ledger.storage(mode).force_acquire(num_bytes);
        let generation = self.charge(&mut objects, name, mode, num_bytes);
        drop(objects);
        self.publish(PoolKind::Storage, mode);
        generation
    }

    /// Force-charge `num_bytes` to `name` and lease them to one buffer.
    fn reserve_leased(&self, name: &str, num_bytes: u64, mode: MemoryMode) -> Arc<StorageLease> {
        let mut objects = lock(&self.objects);
        self.ledger.storage(mode).force_acquire(num_bytes);
        let generation = self.charge(&mut objects, name, mode, num_bytes);
        let me: Weak<dyn MemoryAccountant> = self.me.clone();
        let lease = Arc::new(StorageLease::new(me, name, mode, generation));
        let mut leases = lock(&self.leases);
        leases.retain(|l| l.strong_count() > 0);
        leases.push(Arc::downgrade(&lease));
        drop(leases);
        drop(objects);
        self.publish(PoolKind::Storage, mode);
        lease
    }

    /// Live leases of buffers charged here.
    pub fn lease_count(&self) -> usize {
        lock(&self.leases).iter().filter(|l| l.strong_count() > 0).count()
    }
}

impl MemoryAccountant for UnifiedAccountant {
    fn name(&self) -> &'static str {
        "unified"
    }

    fn acquire_storage_memory_for_object(
        &self,
        name: &str,
        block: Option<BlockId>,
        num_bytes: u64,
        mode: MemoryMode,
        tracker: Option<&MemoryTracker>,
        should_evict: bool,
    ) -> bool {
        if self.is_closed() {
            return false;
        }
        if num_bytes == 0 {
            return true;
        }
        // Prepaid bytes are charged to the tracker's object; only use them
        // for that same object.
        let tracker = tracker.filter(|t| t.name() == name);
        if tracker.is_some_and(|t| t.take_prepaid(num_bytes)) {
            return true;
        }

        if self.try_reserve(name, num_bytes, mode, tracker) {
            self.publish(PoolKind::Storage, mode);
            return true;
        }
        if !should_evict {
            return false;
        }

        let evictor = self.evictor.read().unwrap_or_else(|e| e.into_inner()).clone();
        let Some(evictor) = evictor else {
            return false;
        };
        let shortfall = num_bytes.saturating_sub(self.ledger.storage(mode).available());
        let freed = evictor.evict_blocks_to_free_space(block, shortfall, mode);
        debug!(object = name, shortfall, freed, %mode, "evicted storage blocks");

        let granted = self.try_reserve(name, num_bytes, mode, tracker);
        self.publish(PoolKind::Storage, mode);
        granted
    }

    fn drop_storage_memory_for_object(
        &self,
        name: &str,
        mode: MemoryMode,
        ignore_num_bytes: u64,
    ) -> u64 {
        let mut objects = lock(&self.objects);
        let Some(entry) = objects.remove(&(name.to_string(), mode)) else {
            return 0;
        };
        self.ledger.storage(mode).release(entry.bytes);
        drop(objects);
        self.publish(PoolKind::Storage, mode);
        entry.bytes.saturating_sub(ignore_num_bytes)
    }

    fn release_storage_memory_for_object(&self, name: &str, num_bytes: u64, mode: MemoryMode) {
        if num_bytes > 0 {
            self.release_entry(name, num_bytes, mode, None);
        }
    }

    fn release_storage_reservation(
        &self,
        name: &str,
        num_bytes: u64,
        mode: MemoryMode,
        generation: u64,
    ) -> bool {
        self.release_entry(name, num_bytes, mode, Some(generation))
    }

    fn storage_pool_memory_used(&self, mode: MemoryMode) -> u64 {
        if self.is_closed() {
            return 0;
        }
        self.ledger.storage(mode).used()
    }

    fn storage_pool_size(&self, mode: MemoryMode) -> u64 {
        if self.is_closed() {
            return 0;
        }
        self.ledger.storage(mode).capacity()
    }

    fn execution_pool_used_memory(&self, mode: MemoryMode) -> u64 {
        if self.is_closed() {
            return 0;
        }
        self.ledger.execution(mode).used()
    }

    fn execution_pool_size(&self, mode: MemoryMode) -> u64 {
        if self.is_closed() {
            return 0;
        }
        self.ledger.execution(mode).capacity()
    }

    fn off_heap_memory(&self, name: &str) -> u64 {
        self.object_memory(name, MemoryMode::OffHeap)
    }

    fn has_off_heap(&self) -> bool {
        self.config.storage_off_heap_bytes > 0 || self.config.execution_off_heap_bytes > 0
    }

    fn change_off_heap_owner_to_storage(
        &self,
        buffer: &mut Buffer,
        allow_non_allocator: bool,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        // Already freed: no bytes left to charge.
        if !buffer.is_live() {
            return Ok(());
        }
        match buffer.memory_owner() {
            // Heap buffers have nothing off-heap to relabel.
            None | Some(MemoryOwner::Storage) => return Ok(()),
            Some(MemoryOwner::Execution) => {}
            Some(MemoryOwner::Unaccounted) if allow_non_allocator => {}
            Some(MemoryOwner::Unaccounted) => {
                return Err(Error::InvalidOwnershipTransfer {
                    owner: buffer.owner_name().to_string(),
                    address: buffer.address().unwrap_or(0),
                })
            }
        }

        let name = buffer.owner_name().to_string();
        let bytes = self.config.accounted_allocation_size(buffer.len() as u64);
        buffer.replace_free(|old| {
            // Settles the execution reservation (if any) before storage is charged.
            let allocation = old.detach();
            let lease = self.reserve_leased(&name, bytes, MemoryMode::OffHeap);
            Box::new(StorageFree::new(allocation, lease, bytes))
        });
        debug!(object = %name, bytes, "off-heap buffer relabelled to storage");
        Ok(())
    }

    fn should_stop_recovery(&self) -> bool {
        if self.is_closed() {
            return true;
        }
        MemoryMode::ALL.iter().any(|&mode| {
            let storage = self.ledger.storage(mode);
            let execution = self.ledger.execution(mode);
            let capacity = storage.capacity().saturating_add(execution.capacity());
            let used = storage.used().saturating_add(execution.used());
            capacity > 0 && used as f64 >= self.config.critical_used_fraction * capacity as f64
        })
    }

    fn init_memory_stats(&self, stats: Arc<dyn StatsSink>) {
        *self.stats.write().unwrap_or_else(|e| e.into_inner()) = Some(stats);
        self.publish_all();
    }

    fn log_stats(&self) {
        for pool in self.ledger.pools() {
            let snap = pool.snapshot();
            info!(
                accountant = self.name(),
                pool = %snap.kind,
                mode = %snap.mode,
                used = snap.used,
                capacity = snap.capacity,
                peak = snap.peak,
                "memory pool"
            );
        }
        let objects = lock(&self.objects).len();
        let tasks = lock(&self.tasks).len();
        info!(accountant = self.name(), objects, tasks, "memory ledger");
    }

    fn clear(&self) {
        let mut objects = lock(&self.objects);
        let mut tasks = lock(&self.tasks);
        objects.clear();
        tasks.clear();
        self.ledger.reset();
        drop(tasks);
        drop(objects);
        self.publish_all();
        debug!(accountant = self.name(), "ledger cleared");
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.clear();
            debug!(accountant = self.name(), "closed");
        }
    }

    fn object_reservations(&self) -> Vec<ObjectReservation> {
        Self::reservations_of(&lock(&self.objects))
    }

    fn adopt_reservations(&self, reservations: &[ObjectReservation]) -> Vec<ObjectReservation> {
        let adopted: Vec<_> = reservations
            .iter()
            .filter(|r| r.bytes > 0)
            .map(|r| ObjectReservation {
                generation: self.force_reserve(&r.name, r.bytes, r.mode),
                ..r.clone()
            })
            .collect();
        if !adopted.is_empty() {
            debug!(count = adopted.len(), "adopted boot-time reservations");
        }
        adopted
    }

    /// Moves the reservations and retargets the leases of buffers still
    /// charged here, so their frees release from `successor`.
    fn hand_over(&self, successor: &Arc<dyn MemoryAccountant>) -> usize {
        let mut objects = lock(&self.objects);
        if objects.is_empty() {
            return 0;
        }
        let reservations = Self::reservations_of(&objects);
        let adopted = successor.adopt_reservations(&reservations);
        let target = Arc::downgrade(successor);

        let mut leases = lock(&self.leases);
        let mut retargeted = 0;
        for lease in leases.drain(..).filter_map(|l| l.upgrade()) {
            let (name, mode, generation) = (lease.name(), lease.mode(), lease.generation());
            let held_here = reservations
                .iter()
                .any(|r| r.name == name && r.mode == mode && r.generation == generation);
            if !held_here {
                continue;
            }
            if let Some(moved) = adopted.iter().find(|a| a.name == name && a.mode == mode) {
                lease.retarget(target.clone(), moved.generation);
                retargeted += 1;
            }
        }
        drop(leases);

        objects.clear();
        lock(&self.tasks).clear();
        self.ledger.reset();
        drop(objects);
        self.publish_all();
        debug!(
            accountant = self.name(),
            reservations = reservations.len(),
            leases = retargeted,
            "handed over storage reservations"
        );
        reservations.len()
    }
}

impl HostMemoryManager for UnifiedAccountant {
    fn acquire_storage_memory(
        &self,
        block: Option<BlockId>,
        num_bytes: u64,
        mode: MemoryMode,
    ) -> bool {
        self.acquire_storage_memory_for_object(HOST_STORAGE_OBJECT, block, num_bytes, mode, None, true)
    }

    fn release_storage_memory(&self, num_bytes: u64, mode: MemoryMode) {
        self.release_storage_memory_for_object(HOST_STORAGE_OBJECT, num_bytes, mode);
    }

    fn acquire_execution_memory(&self, num_bytes: u64, task: TaskId, mode: MemoryMode) -> u64 {
        if self.is_closed() || num_bytes == 0 {
            return 0;
        }
        let mut tasks = lock(&self.tasks);
        let granted = self.ledger.execution(mode).acquire_up_to(num_bytes);
        if granted > 0 {
            *tasks.entry((task, mode)).or_insert(0) += granted;
        }
        drop(tasks);
        self.publish(PoolKind::Execution, mode);
        granted
    }

    fn release_execution_memory(&self, num_bytes: u64, task: TaskId, mode: MemoryMode) {
        let mut tasks = lock(&self.tasks);
        let Some(held) = tasks.get_mut(&(task, mode)) else {
            return;
        };
        let released = num_bytes.min(*held);
        *held -= released;
        if *held == 0 {
            tasks.remove(&(task, mode));
        }
        self.ledger.execution(mode).release(released);
        drop(tasks);
        self.publish(PoolKind::Execution, mode);
    }

    fn release_all_execution_memory_for_task(&self, task: TaskId) -> u64 {
        let mut tasks = lock(&self.tasks);
        let mut total = 0;
        for mode in MemoryMode::ALL {
            if let Some(held) = tasks.remove(&(task, mode)) {
                self.ledger.execution(mode).release(held);
                total += held;
            }
        }
        drop(tasks);
        if total > 0 {
            debug!(%task, bytes = total, "released leftover execution memory");
            self.publish_all();
        }
        total
    }

    fn as_accountant(self: Arc<Self>) -> Option<Arc<dyn MemoryAccountant>> {
        Some(self)
    }
}
