//! Accountant resolution across process phases.

use std::sync::Arc;
use std::thread;

use unimem_core::config::AccountantConfig;
use unimem_core::MemoryAccountant;
use unimem_core::host::{BufferAllocator, HostSlot};
use unimem_core::mode::MemoryMode;
use unimem_core::plugin::PluginTable;
use unimem_exec::{AccountantKind, AccountantRegistry};
use unimem_host::{LocalHost, StaticMemoryManager, SystemAllocator};
use unimem_mem::UnifiedAccountant;

fn config() -> AccountantConfig {
    AccountantConfig {
        storage_off_heap_bytes: 1000,
        execution_off_heap_bytes: 1000,
        ..AccountantConfig::default()
    }
}

#[test]
fn test_boot_then_host_without_accountant() {
    let slot = Arc::new(HostSlot::new());
    let registry = AccountantRegistry::new(config(), slot.clone()).expect("registry");

    assert_eq!(registry.memory_manager().kind(), AccountantKind::Bootstrap);

    slot.install(LocalHost::new(Arc::new(StaticMemoryManager::new(&config()))));
    registry.reset_memory_manager();
    assert_eq!(registry.memory_manager().kind(), AccountantKind::Delegate);
}

#[test]
fn test_host_with_accountant_resolves_advanced() {
    let slot = Arc::new(HostSlot::new());
    let registry = AccountantRegistry::new(config(), slot.clone()).expect("registry");
    let acc = UnifiedAccountant::new(config()).expect("accountant");
    slot.install(LocalHost::new(acc.clone()));

    let resolved = registry.memory_manager();
    assert_eq!(resolved.kind(), AccountantKind::Advanced);
    assert!(resolved.acquire_storage_memory_for_object(
        "rdd_1_0",
        None,
        100,
        MemoryMode::OffHeap,
        None,
        false
    ));
    assert_eq!(acc.object_memory("rdd_1_0", MemoryMode::OffHeap), 100);
}

#[test]
fn test_resolution_is_stable_across_threads() {
    let slot = Arc::new(HostSlot::new());
    let registry = Arc::new(AccountantRegistry::new(config(), slot.clone()).expect("registry"));
    slot.install(LocalHost::new(UnifiedAccountant::new(config()).expect("accountant")));

    let first = registry.memory_manager();
    let mut handles = vec![];
    for _ in 0..8 {
        let registry = Arc::clone(&registry);
        handles.push(thread::spawn(move || {
            (0..100).map(|_| registry.memory_manager()).collect::<Vec<_>>()
        }));
    }
    for h in handles {
        for resolved in h.join().expect("Thread panicked") {
            assert!(resolved.same_as(&first));
        }
    }
}

#[test]
fn test_fallback_without_advanced_accountant() {
    let registry = AccountantRegistry::with_plugins(
        config(),
        PluginTable::new(),
        Arc::new(HostSlot::new()),
    )
    .expect("registry");
    let acc = registry.memory_manager();
    assert_eq!(acc.kind(), AccountantKind::Delegate);

    for (i, bytes) in [0u64, 1, 1000, 1 << 40].into_iter().enumerate() {
        for mode in MemoryMode::ALL {
            assert!(acc.acquire_storage_memory_for_object(
                &format!("obj-{i}"),
                None,
                bytes,
                mode,
                None,
                i % 2 == 0
            ));
            assert_eq!(acc.storage_pool_memory_used(mode), 0);
            assert_eq!(acc.storage_pool_size(mode), 0);
            assert_eq!(acc.execution_pool_used_memory(mode), 0);
            assert_eq!(acc.execution_pool_size(mode), 0);
        }
    }
    assert!(!acc.has_off_heap());
}

#[test]
fn test_boot_armed_from_json_config() {
    let mut cfg = config();
    cfg.boot_armed = true;
    cfg.num_cores = 8;
    let json = serde_json::to_string(&cfg).expect("serialize");
    let cfg: AccountantConfig = serde_json::from_str(&json).expect("deserialize");

    let registry = AccountantRegistry::new(cfg.clone(), Arc::new(HostSlot::new())).expect("registry");
    let boot = registry.bootstrap().expect("bootstrap built eagerly");
    assert_eq!(
        boot.execution_pool_size(MemoryMode::OnHeap),
        cfg.per_core_execution_bytes
    );
    assert!(registry.memory_manager().kind() == AccountantKind::Bootstrap);
}

#[test]
fn test_boot_storage_buffer_released_after_hand_over() {
    let slot = Arc::new(HostSlot::new());
    let registry = AccountantRegistry::new(config(), slot.clone()).expect("registry");
    let alloc = SystemAllocator::new();

    let boot = registry.memory_manager();
    assert_eq!(boot.kind(), AccountantKind::Bootstrap);
    let mut buf = alloc.allocate(100, "broadcast_0").expect("allocate");
    boot.change_off_heap_owner_to_storage(&mut buf, true)
        .expect("relabel");
    assert_eq!(boot.off_heap_memory("broadcast_0"), 120);

    let acc = UnifiedAccountant::new(config()).expect("accountant");
    slot.install(LocalHost::new(acc.clone()));
    assert_eq!(registry.memory_manager().kind(), AccountantKind::Advanced);
    assert_eq!(acc.object_memory("broadcast_0", MemoryMode::OffHeap), 120);
    assert_eq!(boot.storage_pool_memory_used(MemoryMode::OffHeap), 0);

    drop(buf);
    assert_eq!(alloc.memory().frees(), 1);
    assert_eq!(acc.object_memory("broadcast_0", MemoryMode::OffHeap), 0);
    assert_eq!(acc.storage_pool_memory_used(MemoryMode::OffHeap), 0);
    assert_eq!(boot.storage_pool_memory_used(MemoryMode::OffHeap), 0);
}

#[test]
fn test_boot_buffers_freed_during_hand_over_are_not_leaked() {
    let slot = Arc::new(HostSlot::new());
    let registry = Arc::new(AccountantRegistry::new(config(), slot.clone()).expect("registry"));
    let alloc = SystemAllocator::new();
    let boot = registry.memory_manager();

    let buffers: Vec<_> = (0..16)
        .map(|i| {
            let mut buf = alloc.allocate(8, &format!("broadcast_{i}")).expect("allocate");
            boot.change_off_heap_owner_to_storage(&mut buf, true)
                .expect("relabel");
            buf
        })
        .collect();
    assert_eq!(boot.storage_pool_memory_used(MemoryMode::OffHeap), 16 * 24);

    let acc = UnifiedAccountant::new(config()).expect("accountant");
    slot.install(LocalHost::new(acc.clone()));
    thread::scope(|s| {
        s.spawn(|| drop(buffers));
        s.spawn(|| assert_eq!(registry.memory_manager().kind(), AccountantKind::Advanced));
    });

    assert_eq!(alloc.memory().frees(), 16);
    assert_eq!(registry.memory_manager().kind(), AccountantKind::Advanced);
    assert_eq!(acc.storage_pool_memory_used(MemoryMode::OffHeap), 0);
    assert_eq!(boot.storage_pool_memory_used(MemoryMode::OffHeap), 0);
}

#[test]
fn test_cached_accountant_under_concurrent_reset() {
    let slot = Arc::new(HostSlot::new());
    let registry = Arc::new(AccountantRegistry::new(config(), slot.clone()).expect("registry"));
    slot.install(LocalHost::new(UnifiedAccountant::new(config()).expect("accountant")));

    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..1000 {
                    assert_eq!(registry.memory_manager().kind(), AccountantKind::Advanced);
                }
            });
        }
        s.spawn(|| {
            for _ in 0..100 {
                registry.reset_memory_manager();
            }
        });
    });
    assert_eq!(registry.memory_manager().kind(), AccountantKind::Advanced);
}
