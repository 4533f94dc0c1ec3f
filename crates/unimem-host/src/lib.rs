//! unimem-host: concrete host collaborators.
//!
//! - `alloc`: a system allocator handing out direct (off-heap) memory and a
//!   heap allocator that does not manage direct memory.
//! - `local`: an in-process host environment with thread-bound task contexts
//!   and a static memory manager that does no per-object accounting.
//!
//! Embedders with their own runtime implement the `unimem-core::host` traits
//! directly; these are what tests and single-process deployments use.

#![deny(unsafe_code)]

pub mod alloc;
pub mod local;

pub use alloc::{HeapAllocator, SystemAllocator, SystemMemory};
pub use local::{LocalHost, LocalTask, LocalTaskMemoryManager, StaticMemoryManager, TaskGuard};
