#![forbid(unsafe_code)]
//! unimem-mem: the advanced (unified) memory accountant.
//!
//! Implements the Accountant Contract from `unimem-core` over a Pool Ledger of
//! storage/execution pools per memory mode, with named per-object storage
//! reservations and per-task execution bookkeeping. Registers itself in a
//! `PluginTable` under `UNIFIED_ACCOUNTANT_KEY`.

pub mod ledger;
pub mod storage_free;
pub mod tracking;
pub mod unified;

pub use ledger::{Pool, PoolLedger};
pub use storage_free::StorageFree;
pub use tracking::PeakTracker;
pub use unified::{UnifiedAccountant, HOST_STORAGE_OBJECT};
