//! unimem-core: types, configuration, errors, and the Accountant Contract.
//!
//! Only interfaces live here. The advanced accountant is in `unimem-mem`, the
//! registry and off-heap lifecycle are in `unimem-exec`, and concrete host
//! collaborators (allocators, task contexts) are in `unimem-host`.

#![deny(unsafe_code)]

pub mod accountant;
pub mod buffer;
pub mod config;
pub mod error;
pub mod host;
pub mod id;
pub mod lease;
pub mod mode;
pub mod plugin;
pub mod prelude;
pub mod stats;
pub mod tracker;

pub use accountant::{MemoryAccountant, ObjectReservation};
pub use error::{Error, Result};
pub use lease::StorageLease;
pub use mode::{MemoryMode, PoolKind};
