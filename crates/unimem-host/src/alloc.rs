//! Allocators.
//!
//! `SystemAllocator` hands out zeroed direct memory from the global allocator
//! and counts live bytes and frees, so callers (and tests) can check that a
//! raw address is released exactly once.
//!
//! The only module of the crate that talks to the global allocator directly.

#![allow(unsafe_code)]

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::trace;

use unimem_core::buffer::{Buffer, RawAllocation, RawMemory, UnaccountedFree};
use unimem_core::error::{Error, Result};
use unimem_core::host::{BufferAllocator, FreeMemoryFactory};

/// Alignment of every direct allocation.
pub const DIRECT_ALIGN: usize = 8;

/// Raw memory source backed by the global allocator.
#[derive(Debug, Default)]
pub struct SystemMemory {
    live_bytes: AtomicUsize,
    allocations: AtomicU64,
    frees: AtomicU64,
}

impl SystemMemory {
    fn allocate_raw(&self, size: usize, owner: &str) -> Result<NonNull<u8>> {
        let address = if size == 0 {
            NonNull::<u64>::dangling().cast::<u8>()
        } else {
            let layout = Layout::from_size_align(size, DIRECT_ALIGN).map_err(|_| Error::Alloc {
                owner: owner.to_string(),
                bytes: size,
            })?;
            // SAFETY: layout has non-zero size.
            let ptr = unsafe { alloc_zeroed(layout) };
            NonNull::new(ptr).ok_or_else(|| Error::Alloc {
                owner: owner.to_string(),
                bytes: size,
            })?
        };
        self.live_bytes.fetch_add(size, Ordering::AcqRel);
        self.allocations.fetch_add(1, Ordering::AcqRel);
        trace!(owner, size, "direct allocation");
        Ok(address)
    }

    /// Bytes currently allocated and not yet freed.
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Acquire)
    }

    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Acquire)
    }

    /// Physical frees performed so far.
    pub fn frees(&self) -> u64 {
        self.frees.load(Ordering::Acquire)
    }
}

impl RawMemory for SystemMemory {
    unsafe fn free_raw(&self, address: NonNull<u8>, size: usize) {
        if size > 0 {
            // SAFETY: caller guarantees `address` came from `allocate_raw` with
            // this size, which used exactly this layout.
            let layout = Layout::from_size_align_unchecked(size, DIRECT_ALIGN);
            dealloc(address.as_ptr(), layout);
        }
        self.live_bytes.fetch_sub(size, Ordering::AcqRel);
        self.frees.fetch_add(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Clone, Default)]
pub struct SystemAllocator {
    memory: Arc<SystemMemory>,
}

impl SystemAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn memory(&self) -> &Arc<SystemMemory> {
        &self.memory
    }

    fn raw_allocation(&self, size: usize, owner: &str) -> Result<Arc<RawAllocation>> {
        let address = self.memory.allocate_raw(size, owner)?;
        let memory: Arc<dyn RawMemory> = self.memory.clone();
        // SAFETY: `address` was just produced by `memory` for `size` bytes and
        // is owned by nothing else yet.
        Ok(Arc::new(unsafe { RawAllocation::new(address, size, memory) }))
    }
}

impl BufferAllocator for SystemAllocator {
    fn is_managed_direct(&self) -> bool {
        true
    }

    fn allocate(&self, size: usize, owner: &str) -> Result<Buffer> {
        let allocation = self.raw_allocation(size, owner)?;
        Ok(Buffer::direct(Box::new(UnaccountedFree::new(allocation)), owner))
    }

    fn allocate_custom(
        &self,
        size: usize,
        owner: &str,
        free: FreeMemoryFactory<'_>,
    ) -> Result<Buffer> {
        let allocation = self.raw_allocation(size, owner)?;
        Ok(Buffer::direct(free(allocation), owner))
    }
}

/// Plain heap buffers; does not manage direct memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapAllocator;

impl BufferAllocator for HeapAllocator {
    fn is_managed_direct(&self) -> bool {
        false
    }

    fn allocate(&self, size: usize, owner: &str) -> Result<Buffer> {
        Ok(Buffer::heap(vec![0u8; size], owner))
    }

    fn allocate_custom(
        &self,
        size: usize,
        owner: &str,
        _free: FreeMemoryFactory<'_>,
    ) -> Result<Buffer> {
        // Heap memory is reclaimed by its owner; there is nothing to hook.
        Err(Error::Alloc {
            owner: owner.to_string(),
            bytes: size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unimem_core::buffer::{FreeMemory, MemoryOwner};

    #[test]
    fn direct_buffer_is_zeroed_and_freed_on_drop() {
        let alloc = SystemAllocator::new();
        let mut buf = alloc.allocate(100, "t").unwrap();
        assert!(buf.is_direct());
        assert_eq!(buf.len(), 100);
        assert!(buf.as_slice().iter().all(|b| *b == 0));
        assert_eq!(buf.memory_owner(), Some(MemoryOwner::Unaccounted));
        buf.as_mut_slice()[99] = 7;
        assert_eq!(alloc.memory().live_bytes(), 100);
        drop(buf);
        assert_eq!(alloc.memory().live_bytes(), 0);
        assert_eq!(alloc.memory().frees(), 1);
    }

    #[test]
    fn zero_sized_direct_allocation() {
        let alloc = SystemAllocator::new();
        let buf = alloc.allocate(0, "t").unwrap();
        assert!(buf.is_empty());
        assert!(buf.address().is_some());
        drop(buf);
        assert_eq!(alloc.memory().frees(), 1);
    }

    #[test]
    fn custom_free_callback_is_installed() {
        let alloc = SystemAllocator::new();
        let buf = alloc
            .allocate_custom(
                16,
                "t",
                Box::new(|allocation: Arc<RawAllocation>| -> Box<dyn FreeMemory> {
                    Box::new(UnaccountedFree::new(allocation))
                }),
            )
            .unwrap();
        assert_eq!(buf.len(), 16);
        drop(buf);
        assert_eq!(alloc.memory().frees(), 1);
    }

    #[test]
    fn heap_allocator_refuses_custom_free() {
        let heap = HeapAllocator;
        assert!(!heap.is_managed_direct());
        let buf = heap.allocate(8, "t").unwrap();
        assert!(!buf.is_direct());
        let factory: FreeMemoryFactory<'_> =
            Box::new(|a| -> Box<dyn FreeMemory> { Box::new(UnaccountedFree::new(a)) });
        let err = heap.allocate_custom(8, "t", factory).unwrap_err();
        assert!(matches!(err, Error::Alloc { bytes: 8, .. }));
    }
}
