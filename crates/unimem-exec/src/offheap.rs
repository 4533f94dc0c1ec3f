//! Execution-memory allocation path for direct buffers.
//!
//! A direct buffer allocated inside a task is backed by an execution
//! reservation of `accounted_allocation_size(size)` bytes. The reservation is
//! taken before the raw allocation and handed back by the buffer's free
//! callback, which runs at most once per address.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, warn};

use unimem_core::buffer::{Buffer, ByteOrder, FreeMemory, MemoryOwner, RawAllocation};
use unimem_core::config::AccountantConfig;
use unimem_core::error::{Error, Result};
use unimem_core::host::{BufferAllocator, HostLookup, TaskContext};
use unimem_core::mode::MemoryMode;

use crate::consumer::ExecutionMemoryConsumer;
use crate::fail_point;
use crate::metrics;

/// Allocate `size` bytes for `owner`.
///
/// With a managed-direct allocator and a task on the calling thread the
/// buffer is charged to the task's off-heap execution memory; a reservation
/// that cannot be granted in full is rolled back and reported as
/// [`Error::LowMemory`]. Otherwise this is a plain, unaccounted allocation.
/// Either way the buffer comes back little-endian.
pub fn allocate_execution_memory(
    config: &AccountantConfig,
    host: &dyn HostLookup,
    size: usize,
    owner: &str,
    allocator: &dyn BufferAllocator,
) -> Result<Buffer> {
    let task = if allocator.is_managed_direct() {
        host.environment().and_then(|env| env.current_task())
    } else {
        None
    };
    let buffer = match task {
        Some(task) => allocate_accounted(config, task.as_ref(), size, owner, allocator)?,
        None => allocator.allocate(size, owner)?,
    };
    Ok(buffer.with_order(ByteOrder::LittleEndian))
}

fn allocate_accounted(
    config: &AccountantConfig,
    task: &dyn TaskContext,
    size: usize,
    owner: &str,
    allocator: &dyn BufferAllocator,
) -> Result<Buffer> {
    let total = config.accounted_allocation_size(size as u64);
    let consumer = Arc::new(ExecutionMemoryConsumer::new(
        task.memory_manager(),
        MemoryMode::OffHeap,
    ));
    let granted = consumer.acquire_memory(total);
    if granted < total {
        if let Err(e) = consumer.free_all() {
            warn!(owner, granted, error = %e, "rolling back partial execution grant failed");
        }
        debug!(owner, requested = total, granted, task = %task.task_id(), "low execution memory");
        return Err(Error::LowMemory {
            owner: owner.to_string(),
            requested: total,
        });
    }

    let bound = Arc::clone(&consumer);
    let allocated = allocator.allocate_custom(
        size,
        owner,
        Box::new(move |allocation: Arc<RawAllocation>| -> Box<dyn FreeMemory> {
            Box::new(ExecutionFree::new(allocation, bound))
        }),
    );
    match allocated {
        Ok(buffer) => {
            metrics::record_allocation(owner, size, total);
            Ok(buffer)
        }
        Err(e) => {
            // The raw allocation failed after the reservation was granted.
            if let Err(release) = consumer.free_all() {
                warn!(owner, error = %release, "releasing reservation of failed allocation");
            }
            Err(e)
        }
    }
}

/// Free callback of an execution-owned direct buffer.
pub struct ExecutionFree {
    allocation: Arc<RawAllocation>,
    consumer: Arc<ExecutionMemoryConsumer>,
}

impl ExecutionFree {
    pub fn new(allocation: Arc<RawAllocation>, consumer: Arc<ExecutionMemoryConsumer>) -> Self {
        Self {
            allocation,
            consumer,
        }
    }

    pub fn consumer(&self) -> &Arc<ExecutionMemoryConsumer> {
        &self.consumer
    }

    /// Hand the consumer's whole reservation back. Never unwinds.
    fn release_reservation(&self) {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            fail_point!("panic_execution_free");
            self.consumer.free_all()
        }));
        let failure = match outcome {
            Ok(Ok(_)) => return,
            Ok(Err(e)) => e,
            Err(payload) => Error::Cleanup(panic_message(payload.as_ref())),
        };
        let _ = catch_unwind(AssertUnwindSafe(|| {
            warn!(
                error = %failure,
                size = self.allocation.size(),
                "failed to release execution memory while freeing buffer"
            );
        }));
    }
}

impl FreeMemory for ExecutionFree {
    fn owner(&self) -> MemoryOwner {
        MemoryOwner::Execution
    }

    fn allocation(&self) -> &Arc<RawAllocation> {
        &self.allocation
    }

    fn run(&self) {
        if self.allocation.free() {
            self.release_reservation();
        }
    }

    fn detach(self: Box<Self>) -> Arc<RawAllocation> {
        self.release_reservation();
        self.allocation
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic during release".to_string()
    }
}
