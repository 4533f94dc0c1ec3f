#![forbid(unsafe_code)]
//! unimem-exec: accountant resolution and the execution-memory allocation path.
//!
//! - `registry`: picks the advanced, delegate or bootstrap accountant from
//!   process state and caches the answer.
//! - `delegate`: the "accounting disabled" accountant.
//! - `consumer` / `offheap`: per-task execution reservations backing direct
//!   buffers, released exactly once when the buffer is freed.

pub mod consumer;
pub mod delegate;
pub mod failpoints;
pub mod metrics;
pub mod offheap;
pub mod registry;

pub use consumer::ExecutionMemoryConsumer;
pub use delegate::DelegateAccountant;
pub use offheap::{allocate_execution_memory, ExecutionFree};
pub use registry::{linked_plugins, AccountantKind, AccountantRegistry, ResolvedAccountant};
