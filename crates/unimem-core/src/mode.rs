//! Memory modes and pool kinds.
//!
//! Every (pool kind × memory mode) pair is an independent pool with its own
//! capacity and used-bytes counter.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemoryMode {
    OnHeap,
    OffHeap,
}

impl MemoryMode {
    pub const ALL: [MemoryMode; 2] = [MemoryMode::OnHeap, MemoryMode::OffHeap];

    pub fn as_str(self) -> &'static str {
        match self {
            MemoryMode::OnHeap => "ON_HEAP",
            MemoryMode::OffHeap => "OFF_HEAP",
        }
    }

    /// Parse the spelling used by config files and environment variables.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "ON_HEAP" | "ONHEAP" => Some(MemoryMode::OnHeap),
            "OFF_HEAP" | "OFFHEAP" => Some(MemoryMode::OffHeap),
            _ => None,
        }
    }
}

impl fmt::Display for MemoryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PoolKind {
    /// Long-lived cached data.
    Storage,
    /// Transient per-task working sets.
    Execution,
}

impl PoolKind {
    pub const ALL: [PoolKind; 2] = [PoolKind::Storage, PoolKind::Execution];

    pub fn as_str(self) -> &'static str {
        match self {
            PoolKind::Storage => "STORAGE",
            PoolKind::Execution => "EXECUTION",
        }
    }
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_config_spellings() {
        assert_eq!(MemoryMode::parse("off_heap"), Some(MemoryMode::OffHeap));
        assert_eq!(MemoryMode::parse("OFF-HEAP"), Some(MemoryMode::OffHeap));
        assert_eq!(MemoryMode::parse(" ON_HEAP "), Some(MemoryMode::OnHeap));
        assert_eq!(MemoryMode::parse("disk"), None);
    }

    #[test]
    fn serde_uses_screaming_case() {
        let json = serde_json::to_string(&MemoryMode::OffHeap).unwrap();
        assert_eq!(json, "\"OFF_HEAP\"");
        let kind: PoolKind = serde_json::from_str("\"EXECUTION\"").unwrap();
        assert_eq!(kind, PoolKind::Execution);
    }
}
