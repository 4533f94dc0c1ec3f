//! Accountant Registry.
//!
//! Resolves which accountant serves the process right now:
//!
//! - no advanced accountant linked (or connector mode): the delegate, always;
//! - host environment up and its memory manager is an accountant: that one,
//!   cached until [`AccountantRegistry::reset_memory_manager`];
//! - host environment up without one: the delegate;
//! - no host environment yet: the single-core bootstrap accountant.
//!
//! The registry is an owned value. Construct one at process start and pass it
//! (or an `Arc` of it) to whatever needs memory accounting.

use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwapOption;
use once_cell::sync::OnceCell;
use tracing::{debug, warn};

use unimem_core::accountant::MemoryAccountant;
use unimem_core::buffer::Buffer;
use unimem_core::config::AccountantConfig;
use unimem_core::error::{Error, Result};
use unimem_core::host::{BufferAllocator, HostLookup};
use unimem_core::plugin::{PluginTable, UNIFIED_ACCOUNTANT_KEY};

use crate::delegate::DelegateAccountant;
use crate::metrics;
use crate::offheap;

/// Plugin table holding every accountant compiled into this build.
pub fn linked_plugins() -> PluginTable {
    #[allow(unused_mut)]
    let mut table = PluginTable::new();
    #[cfg(feature = "unified")]
    unimem_mem::UnifiedAccountant::register(&mut table);
    table
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccountantKind {
    Advanced,
    Delegate,
    Bootstrap,
}

impl fmt::Display for AccountantKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AccountantKind::Advanced => "advanced",
            AccountantKind::Delegate => "delegate",
            AccountantKind::Bootstrap => "bootstrap",
        })
    }
}

/// The accountant chosen by one resolution.
#[derive(Clone)]
pub enum ResolvedAccountant {
    Advanced(Arc<dyn MemoryAccountant>),
    Delegate(Arc<DelegateAccountant>),
    Bootstrap(Arc<dyn MemoryAccountant>),
}

impl ResolvedAccountant {
    pub fn kind(&self) -> AccountantKind {
        match self {
            ResolvedAccountant::Advanced(_) => AccountantKind::Advanced,
            ResolvedAccountant::Delegate(_) => AccountantKind::Delegate,
            ResolvedAccountant::Bootstrap(_) => AccountantKind::Bootstrap,
        }
    }

    pub fn into_arc(self) -> Arc<dyn MemoryAccountant> {
        match self {
            ResolvedAccountant::Advanced(a) | ResolvedAccountant::Bootstrap(a) => a,
            ResolvedAccountant::Delegate(d) => d,
        }
    }

    /// Same variant and same instance.
    pub fn same_as(&self, other: &ResolvedAccountant) -> bool {
        self.kind() == other.kind() && self.as_ptr() as *const () == other.as_ptr() as *const ()
    }

    fn as_ptr(&self) -> *const dyn MemoryAccountant {
        let accountant: &dyn MemoryAccountant = &**self;
        accountant
    }
}

impl Deref for ResolvedAccountant {
    type Target = dyn MemoryAccountant;

    fn deref(&self) -> &Self::Target {
        match self {
            ResolvedAccountant::Advanced(a) | ResolvedAccountant::Bootstrap(a) => a.as_ref(),
            ResolvedAccountant::Delegate(d) => d.as_ref(),
        }
    }
}

impl fmt::Debug for ResolvedAccountant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedAccountant")
            .field("kind", &self.kind())
            .field("name", &self.name())
            .finish()
    }
}

pub struct AccountantRegistry {
    config: AccountantConfig,
    plugins: PluginTable,
    host: Arc<dyn HostLookup>,
    advanced_loadable: OnceCell<bool>,
    bootstrap: OnceCell<Arc<dyn MemoryAccountant>>,
    delegate: OnceCell<Arc<DelegateAccountant>>,
    /// Cached advanced accountant; loaded without locking.
    current: ArcSwapOption<Arc<dyn MemoryAccountant>>,
    /// Serializes resolution and reset.
    resolve_lock: Mutex<()>,
}

impl AccountantRegistry {
    /// Registry over the accountants linked into this build.
    pub fn new(config: AccountantConfig, host: Arc<dyn HostLookup>) -> Result<Self> {
        Self::with_plugins(config, linked_plugins(), host)
    }

    pub fn with_plugins(
        config: AccountantConfig,
        plugins: PluginTable,
        host: Arc<dyn HostLookup>,
    ) -> Result<Self> {
        config.validate()?;
        let registry = Self {
            config,
            plugins,
            host,
            advanced_loadable: OnceCell::new(),
            bootstrap: OnceCell::new(),
            delegate: OnceCell::new(),
            current: ArcSwapOption::empty(),
            resolve_lock: Mutex::new(()),
        };
        if registry.config.boot_armed && registry.advanced_loadable() {
            registry.bootstrap_accountant()?;
        }
        Ok(registry)
    }

    pub fn config(&self) -> &AccountantConfig {
        &self.config
    }

    pub fn host(&self) -> &Arc<dyn HostLookup> {
        &self.host
    }

    /// Whether an advanced accountant is linked in. Checked once; a missing
    /// registration is logged once and never re-checked.
    pub fn advanced_loadable(&self) -> bool {
        *self.advanced_loadable.get_or_init(|| {
            let present = self.plugins.contains(UNIFIED_ACCOUNTANT_KEY);
            if !present {
                let reason = Error::PluginUnavailable {
                    key: UNIFIED_ACCOUNTANT_KEY,
                };
                warn!(error = %reason, "memory accounting disabled, using delegate accountant");
            }
            present
        })
    }

    /// The bootstrap accountant, if it has been built.
    pub fn bootstrap(&self) -> Option<&Arc<dyn MemoryAccountant>> {
        self.bootstrap.get()
    }

    /// The accountant to use right now.
    pub fn memory_manager(&self) -> ResolvedAccountant {
        if self.advanced_loadable.get() == Some(&true) {
            if let Some(current) = self.cached() {
                return ResolvedAccountant::Advanced(current);
            }
        }
        self.resolve_slow()
    }

    fn cached(&self) -> Option<Arc<dyn MemoryAccountant>> {
        self.current.load().as_deref().map(Arc::clone)
    }

    fn resolve_slow(&self) -> ResolvedAccountant {
        let _guard = self.resolve_lock.lock().unwrap_or_else(|e| e.into_inner());
        let resolved = self.resolve_locked();
        debug!(kind = %resolved.kind(), accountant = resolved.name(), "resolved memory accountant");
        metrics::record_resolution(resolved.kind(), resolved.name());
        resolved
    }

    fn resolve_locked(&self) -> ResolvedAccountant {
        if !self.advanced_loadable() || self.config.connector_mode {
            return self.delegate();
        }
        if let Some(current) = self.cached() {
            return ResolvedAccountant::Advanced(current);
        }
        let Some(env) = self.host.environment() else {
            return match self.bootstrap_accountant() {
                Ok(bootstrap) => ResolvedAccountant::Bootstrap(Arc::clone(bootstrap)),
                Err(e) => {
                    warn!(error = %e, "bootstrap accountant unavailable, using delegate accountant");
                    self.delegate()
                }
            };
        };
        match env.memory_manager().as_accountant() {
            Some(advanced) => {
                self.hand_over_bootstrap(&advanced);
                self.current.store(Some(Arc::new(Arc::clone(&advanced))));
                ResolvedAccountant::Advanced(advanced)
            }
            None => self.delegate(),
        }
    }

    fn delegate(&self) -> ResolvedAccountant {
        let delegate = self
            .delegate
            .get_or_init(|| Arc::new(DelegateAccountant::new(Arc::clone(&self.host))));
        ResolvedAccountant::Delegate(Arc::clone(delegate))
    }

    fn bootstrap_accountant(&self) -> Result<&Arc<dyn MemoryAccountant>> {
        self.bootstrap.get_or_try_init(|| {
            let factory = self
                .plugins
                .lookup(UNIFIED_ACCOUNTANT_KEY)
                .ok_or(Error::PluginUnavailable {
                    key: UNIFIED_ACCOUNTANT_KEY,
                })?;
            let config = self.config.bootstrap();
            debug!(
                execution_off_heap = config.execution_off_heap_bytes,
                "creating bootstrap accountant"
            );
            factory(&config)
        })
    }

    /// Move reservations made during boot to the accountant that takes over.
    fn hand_over_bootstrap(&self, advanced: &Arc<dyn MemoryAccountant>) {
        let Some(bootstrap) = self.bootstrap.get() else {
            return;
        };
        if Arc::ptr_eq(bootstrap, advanced) {
            return;
        }
        let moved = bootstrap.hand_over(advanced);
        if moved > 0 {
            debug!(count = moved, "handed boot reservations to advanced accountant");
        }
    }

    /// Forget the cached advanced accountant and empty the bootstrap ledger;
    /// the next access resolves again.
    pub fn reset_memory_manager(&self) {
        let _guard = self.resolve_lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(bootstrap) = self.bootstrap.get() {
            bootstrap.clear();
        }
        self.current.store(None);
        debug!("memory accountant reset");
    }

    /// Allocate `size` bytes for `owner`, charged to the current task's
    /// execution memory when `allocator` manages direct memory.
    pub fn allocate_execution_memory(
        &self,
        size: usize,
        owner: &str,
        allocator: &dyn BufferAllocator,
    ) -> Result<Buffer> {
        offheap::allocate_execution_memory(&self.config, self.host.as_ref(), size, owner, allocator)
    }
}

impl fmt::Debug for AccountantRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountantRegistry")
            .field("plugins", &self.plugins)
            .field("advanced_loadable", &self.advanced_loadable.get())
            .field("bootstrap", &self.bootstrap.get().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unimem_core::host::HostSlot;
    use unimem_core::mode::MemoryMode;
    use unimem_host::{LocalHost, StaticMemoryManager};
    use unimem_mem::UnifiedAccountant;

    fn config() -> AccountantConfig {
        AccountantConfig {
            storage_off_heap_bytes: 1000,
            ..AccountantConfig::default()
        }
    }

    fn table() -> PluginTable {
        let mut t = PluginTable::new();
        UnifiedAccountant::register(&mut t);
        t
    }

    #[test]
    fn boot_phase_resolves_bootstrap() {
        let registry =
            AccountantRegistry::with_plugins(config(), table(), Arc::new(HostSlot::new())).unwrap();
        let first = registry.memory_manager();
        assert_eq!(first.kind(), AccountantKind::Bootstrap);
        assert!(first.same_as(&registry.memory_manager()));
        assert_eq!(
            first.execution_pool_size(MemoryMode::OffHeap),
            config().per_core_execution_bytes
        );
    }

    #[test]
    fn boot_armed_builds_bootstrap_eagerly() {
        let cfg = AccountantConfig {
            boot_armed: true,
            ..config()
        };
        let registry =
            AccountantRegistry::with_plugins(cfg, table(), Arc::new(HostSlot::new())).unwrap();
        assert!(registry.bootstrap().is_some());

        let lazy =
            AccountantRegistry::with_plugins(config(), table(), Arc::new(HostSlot::new())).unwrap();
        assert!(lazy.bootstrap().is_none());
    }

    #[test]
    fn missing_plugin_always_delegates() {
        let slot = Arc::new(HostSlot::new());
        let registry =
            AccountantRegistry::with_plugins(config(), PluginTable::new(), slot.clone()).unwrap();
        assert_eq!(registry.memory_manager().kind(), AccountantKind::Delegate);

        let acc = UnifiedAccountant::new(config()).unwrap();
        slot.install(LocalHost::new(acc));
        registry.reset_memory_manager();
        assert_eq!(registry.memory_manager().kind(), AccountantKind::Delegate);
        assert!(!registry.advanced_loadable());
        assert!(registry.bootstrap().is_none());
    }

    #[test]
    fn host_accountant_is_cached_until_reset() {
        let slot = Arc::new(HostSlot::new());
        let registry =
            AccountantRegistry::with_plugins(config(), table(), slot.clone()).unwrap();
        let acc = UnifiedAccountant::new(config()).unwrap();
        slot.install(LocalHost::new(acc.clone()));

        let first = registry.memory_manager();
        assert_eq!(first.kind(), AccountantKind::Advanced);
        assert!(first.same_as(&registry.memory_manager()));

        // The cached reference survives the host going away, until reset.
        slot.uninstall();
        assert_eq!(registry.memory_manager().kind(), AccountantKind::Advanced);
        registry.reset_memory_manager();
        assert_eq!(registry.memory_manager().kind(), AccountantKind::Bootstrap);
    }

    #[test]
    fn host_without_accountant_delegates() {
        let slot = Arc::new(HostSlot::new());
        let registry =
            AccountantRegistry::with_plugins(config(), table(), slot.clone()).unwrap();
        slot.install(LocalHost::new(Arc::new(StaticMemoryManager::new(&config()))));
        assert_eq!(registry.memory_manager().kind(), AccountantKind::Delegate);
    }

    #[test]
    fn connector_mode_delegates() {
        let cfg = AccountantConfig {
            connector_mode: true,
            ..config()
        };
        let registry =
            AccountantRegistry::with_plugins(cfg, table(), Arc::new(HostSlot::new())).unwrap();
        assert_eq!(registry.memory_manager().kind(), AccountantKind::Delegate);
    }

    #[test]
    fn boot_reservations_move_to_advanced_accountant() {
        let slot = Arc::new(HostSlot::new());
        let registry =
            AccountantRegistry::with_plugins(config(), table(), slot.clone()).unwrap();
        let boot = registry.memory_manager();
        assert!(boot.acquire_storage_memory_for_object(
            "broadcast_0",
            None,
            300,
            MemoryMode::OffHeap,
            None,
            false
        ));

        let acc = UnifiedAccountant::new(config()).unwrap();
        slot.install(LocalHost::new(acc.clone()));
        let advanced = registry.memory_manager();
        assert_eq!(advanced.kind(), AccountantKind::Advanced);
        assert_eq!(acc.object_memory("broadcast_0", MemoryMode::OffHeap), 300);
        assert_eq!(boot.storage_pool_memory_used(MemoryMode::OffHeap), 0);
    }

    #[test]
    fn reset_clears_bootstrap_ledger() {
        let registry =
            AccountantRegistry::with_plugins(config(), table(), Arc::new(HostSlot::new())).unwrap();
        let boot = registry.memory_manager();
        assert!(boot.acquire_storage_memory_for_object(
            "a",
            None,
            10,
            MemoryMode::OnHeap,
            None,
            false
        ));
        registry.reset_memory_manager();
        assert_eq!(boot.storage_pool_memory_used(MemoryMode::OnHeap), 0);
        assert!(registry.memory_manager().same_as(&boot));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let cfg = AccountantConfig {
            allocation_alignment: 0,
            ..config()
        };
        let err = AccountantRegistry::with_plugins(cfg, table(), Arc::new(HostSlot::new()))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
