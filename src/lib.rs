//! unimem: a pluggable unified memory accountant.
//!
//! Facade over the workspace crates; see each crate for details.

pub use unimem_core;
pub use unimem_exec;
pub use unimem_host;
pub use unimem_mem;

pub use unimem_core::prelude::*;
pub use unimem_exec::{AccountantKind, AccountantRegistry, ResolvedAccountant};
