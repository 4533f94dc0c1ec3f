//! Link-time registration of accountant implementations.
//!
//! An implementation that is compiled in registers a constructor under a
//! well-known key; the registry checks for the key once and caches the answer.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::accountant::MemoryAccountant;
use crate::config::AccountantConfig;
use crate::error::Result;

/// Key the advanced accountant registers under.
pub const UNIFIED_ACCOUNTANT_KEY: &str = "unimem.mem.UnifiedAccountant";

pub type AccountantFactory = fn(&AccountantConfig) -> Result<Arc<dyn MemoryAccountant>>;

#[derive(Clone, Default)]
pub struct PluginTable {
    factories: HashMap<&'static str, AccountantFactory>,
}

impl PluginTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the factory previously registered under `key`, if any.
    pub fn register(
        &mut self,
        key: &'static str,
        factory: AccountantFactory,
    ) -> Option<AccountantFactory> {
        self.factories.insert(key, factory)
    }

    pub fn lookup(&self, key: &str) -> Option<AccountantFactory> {
        self.factories.get(key).copied()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.factories.contains_key(key)
    }
}

impl fmt::Debug for PluginTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.factories.keys().collect();
        keys.sort();
        f.debug_struct("PluginTable").field("keys", &keys).finish()
    }
}
