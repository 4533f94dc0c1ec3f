//! Buffers handed out by allocators, and the deferred free-callback contract.
//!
//! A direct (off-heap) buffer owns a [`RawAllocation`] through a
//! [`FreeMemory`] callback. Dropping the buffer is the reclamation point: the
//! callback frees the raw address at most once and then settles whatever
//! reservation it was bound to.
//!
//! This is the only module of the crate that touches raw memory. A direct
//! buffer never hands out bytes after its allocation has been freed.

#![allow(unsafe_code)]

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    LittleEndian,
    BigEndian,
}

impl ByteOrder {
    pub fn native() -> Self {
        if cfg!(target_endian = "little") {
            ByteOrder::LittleEndian
        } else {
            ByteOrder::BigEndian
        }
    }
}

/// Which pool an off-heap buffer is currently charged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryOwner {
    Execution,
    Storage,
    /// Not charged anywhere: plain allocations and foreign memory.
    Unaccounted,
}

/// Raw memory source able to give back what it handed out.
pub trait RawMemory: Send + Sync {
    /// # Safety
    /// `address` must have been produced by this source for exactly `size`
    /// bytes, and must not be freed twice.
    unsafe fn free_raw(&self, address: NonNull<u8>, size: usize);
}

/// A raw allocation guarded by a single-use "try-free" flag.
pub struct RawAllocation {
    address: AtomicUsize,
    size: usize,
    memory: Arc<dyn RawMemory>,
}

impl RawAllocation {
    /// # Safety
    /// `address` must point to `size` live bytes produced by `memory`, and
    /// nothing else may free them.
    pub unsafe fn new(address: NonNull<u8>, size: usize, memory: Arc<dyn RawMemory>) -> Self {
        Self {
            address: AtomicUsize::new(address.as_ptr() as usize),
            size,
            memory,
        }
    }

    /// Current address, or 0 once freed.
    pub fn address(&self) -> usize {
        self.address.load(Ordering::Acquire)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Claim the address for freeing. Returns it on the first call and 0 on
    /// every later call.
    pub fn try_free(&self) -> usize {
        self.address.swap(0, Ordering::AcqRel)
    }

    /// Free the raw memory if this call won the try-free guard.
    pub fn free(&self) -> bool {
        match NonNull::new(self.try_free() as *mut u8) {
            Some(address) => {
                // SAFETY: the address came from `memory` with this size
                // (constructor contract) and try_free hands it out once.
                unsafe { self.memory.free_raw(address, self.size) };
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for RawAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawAllocation")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("size", &self.size)
            .finish()
    }
}

/// Deferred free routine attached to a direct buffer.
///
/// `run` may be invoked from any thread, more than once, and must never
/// panic past its boundary.
pub trait FreeMemory: Send + Sync {
    fn owner(&self) -> MemoryOwner;

    fn allocation(&self) -> &Arc<RawAllocation>;

    /// Free the raw memory (at most once) and release the bound reservation.
    fn run(&self);

    /// Settle this callback's reservation without freeing the memory, so the
    /// allocation can be rebound to another owner.
    fn detach(self: Box<Self>) -> Arc<RawAllocation>;
}

/// Free callback for memory nobody is charged for.
pub struct UnaccountedFree {
    allocation: Arc<RawAllocation>,
}

impl UnaccountedFree {
    pub fn new(allocation: Arc<RawAllocation>) -> Self {
        Self { allocation }
    }
}

impl FreeMemory for UnaccountedFree {
    fn owner(&self) -> MemoryOwner {
        MemoryOwner::Unaccounted
    }

    fn allocation(&self) -> &Arc<RawAllocation> {
        &self.allocation
    }

    fn run(&self) {
        self.allocation.free();
    }

    fn detach(self: Box<Self>) -> Arc<RawAllocation> {
        self.allocation
    }
}

enum Data {
    Heap(Vec<u8>),
    Direct {
        base: NonNull<u8>,
        len: usize,
        free: Option<Box<dyn FreeMemory>>,
    },
}

/// Byte buffer, either heap-backed or over a raw off-heap allocation.
pub struct Buffer {
    data: Data,
    order: ByteOrder,
    owner: String,
}

// SAFETY: a direct buffer is the only handle to its memory; the free callback
// is Send + Sync and never touches the bytes.
unsafe impl Send for Buffer {}

impl Buffer {
    pub fn heap(bytes: Vec<u8>, owner: impl Into<String>) -> Self {
        Self {
            data: Data::Heap(bytes),
            order: ByteOrder::native(),
            owner: owner.into(),
        }
    }

    /// Wrap a live raw allocation. The callback is run when the buffer drops.
    pub fn direct(free: Box<dyn FreeMemory>, owner: impl Into<String>) -> Self {
        let allocation = free.allocation();
        let (base, len) = match NonNull::new(allocation.address() as *mut u8) {
            Some(base) => (base, allocation.size()),
            None => (NonNull::dangling(), 0),
        };
        Self {
            data: Data::Direct {
                base,
                len,
                free: Some(free),
            },
            order: ByteOrder::native(),
            owner: owner.into(),
        }
    }

    pub fn with_order(mut self, order: ByteOrder) -> Self {
        self.order = order;
        self
    }

    pub fn order(&self) -> ByteOrder {
        self.order
    }

    pub fn owner_name(&self) -> &str {
        &self.owner
    }

    pub fn is_direct(&self) -> bool {
        matches!(self.data, Data::Direct { .. })
    }

    pub fn len(&self) -> usize {
        match &self.data {
            Data::Heap(v) => v.len(),
            Data::Direct { len, .. } if self.is_live() => *len,
            Data::Direct { .. } => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn address(&self) -> Option<usize> {
        match &self.data {
            Data::Heap(_) => None,
            Data::Direct { base, .. } => Some(base.as_ptr() as usize),
        }
    }

    /// Whether the bytes are still allocated. Heap buffers always are.
    pub fn is_live(&self) -> bool {
        match &self.data {
            Data::Heap(_) => true,
            Data::Direct { free, .. } => free
                .as_ref()
                .is_some_and(|f| f.allocation().address() != 0),
        }
    }

    fn free_callback(&self) -> Option<&dyn FreeMemory> {
        match &self.data {
            Data::Direct { free, .. } => free.as_deref(),
            Data::Heap(_) => None,
        }
    }

    pub fn memory_owner(&self) -> Option<MemoryOwner> {
        self.free_callback().map(|f| f.owner())
    }

    /// Swap the free callback. Returns false for heap buffers.
    pub fn replace_free(
        &mut self,
        rebind: impl FnOnce(Box<dyn FreeMemory>) -> Box<dyn FreeMemory>,
    ) -> bool {
        match &mut self.data {
            Data::Direct { free, .. } => match free.take() {
                Some(old) => {
                    *free = Some(rebind(old));
                    true
                }
                None => false,
            },
            Data::Heap(_) => false,
        }
    }

    /// Free the memory now instead of at drop. The buffer is empty afterwards.
    pub fn release(&mut self) {
        if let Data::Direct { free, len, .. } = &mut self.data {
            if let Some(free) = free.take() {
                free.run();
            }
            *len = 0;
        }
    }

    /// Take the free callback out, consuming the buffer. The caller becomes
    /// responsible for running it. `None` for heap buffers.
    pub fn into_free_callback(mut self) -> Option<Box<dyn FreeMemory>> {
        match &mut self.data {
            Data::Direct { free, .. } => free.take(),
            Data::Heap(_) => None,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.data {
            Data::Heap(v) => v,
            Data::Direct { .. } if !self.is_live() => &[],
            // SAFETY: the callback is still attached and its allocation not
            // freed, so base..base+len is allocated.
            Data::Direct { base, len, .. } => unsafe {
                std::slice::from_raw_parts(base.as_ptr(), *len)
            },
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        if !self.is_live() {
            return &mut [];
        }
        match &mut self.data {
            Data::Heap(v) => v,
            // SAFETY: as above, and `&mut self` makes the access exclusive.
            Data::Direct { base, len, .. } => unsafe {
                std::slice::from_raw_parts_mut(base.as_ptr(), *len)
            },
        }
    }

    /// Read a u64 at `index` in this buffer's byte order.
    pub fn get_u64(&self, index: usize) -> Option<u64> {
        let end = index.checked_add(8)?;
        let bytes: [u8; 8] = self.as_slice().get(index..end)?.try_into().ok()?;
        Some(match self.order {
            ByteOrder::LittleEndian => u64::from_le_bytes(bytes),
            ByteOrder::BigEndian => u64::from_be_bytes(bytes),
        })
    }

    /// Write a u64 at `index` in this buffer's byte order.
    pub fn put_u64(&mut self, index: usize, value: u64) -> Option<()> {
        let end = index.checked_add(8)?;
        let bytes = match self.order {
            ByteOrder::LittleEndian => value.to_le_bytes(),
            ByteOrder::BigEndian => value.to_be_bytes(),
        };
        self.as_mut_slice().get_mut(index..end)?.copy_from_slice(&bytes);
        Some(())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Data::Direct { free, .. } = &mut self.data {
            if let Some(free) = free.take() {
                free.run();
            }
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("owner", &self.owner)
            .field("direct", &self.is_direct())
            .field("len", &self.len())
            .field("order", &self.order)
            .field("memory_owner", &self.memory_owner())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Leaks nothing: hands out boxed slices and counts frees.
    #[derive(Default)]
    struct CountingMemory {
        frees: AtomicUsize,
    }

    impl CountingMemory {
        fn alloc(self: &Arc<Self>, size: usize) -> Arc<RawAllocation> {
            let boxed: Box<[u8]> = vec![0u8; size.max(1)].into_boxed_slice();
            let ptr = NonNull::new(Box::into_raw(boxed) as *mut u8).unwrap();
            let memory: Arc<dyn RawMemory> = self.clone();
            Arc::new(unsafe { RawAllocation::new(ptr, size.max(1), memory) })
        }
    }

    impl RawMemory for CountingMemory {
        unsafe fn free_raw(&self, address: NonNull<u8>, size: usize) {
            let slice = std::ptr::slice_from_raw_parts_mut(address.as_ptr(), size);
            drop(Box::from_raw(slice));
            self.frees.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn try_free_hands_out_address_once() {
        let memory = Arc::new(CountingMemory::default());
        let alloc = memory.alloc(32);
        let addr = alloc.address();
        assert_ne!(addr, 0);
        assert!(alloc.free());
        assert!(!alloc.free());
        assert_eq!(alloc.try_free(), 0);
        assert_eq!(alloc.address(), 0);
        assert_eq!(memory.frees.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_direct_buffer_runs_free_callback() {
        let memory = Arc::new(CountingMemory::default());
        let buf = Buffer::direct(Box::new(UnaccountedFree::new(memory.alloc(64))), "t");
        assert!(buf.is_direct());
        assert_eq!(buf.len(), 64);
        assert_eq!(buf.memory_owner(), Some(MemoryOwner::Unaccounted));
        drop(buf);
        assert_eq!(memory.frees.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn u64_access_respects_byte_order() {
        let mut buf = Buffer::heap(vec![0u8; 16], "t").with_order(ByteOrder::LittleEndian);
        buf.put_u64(0, 0x0102_0304_0506_0708).unwrap();
        assert_eq!(buf.as_slice()[0], 0x08);
        assert_eq!(buf.get_u64(0), Some(0x0102_0304_0506_0708));

        let mut be = Buffer::heap(vec![0u8; 8], "t").with_order(ByteOrder::BigEndian);
        be.put_u64(0, 1).unwrap();
        assert_eq!(be.as_slice()[7], 1);
        assert_eq!(be.get_u64(1), None);
        assert!(be.put_u64(4, 1).is_none());
    }

    #[test]
    fn released_buffer_exposes_no_bytes() {
        let memory = Arc::new(CountingMemory::default());
        let mut buf = Buffer::direct(Box::new(UnaccountedFree::new(memory.alloc(64))), "t");
        buf.as_mut_slice()[0] = 1;
        buf.release();
        assert_eq!(memory.frees.load(Ordering::SeqCst), 1);
        assert!(!buf.is_live());
        assert_eq!(buf.len(), 0);
        assert!(buf.as_slice().is_empty());
        assert!(buf.as_mut_slice().is_empty());
        assert_eq!(buf.get_u64(0), None);
        assert_eq!(buf.memory_owner(), None);
        drop(buf);
        assert_eq!(memory.frees.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn freed_allocation_hides_buffer_bytes() {
        let memory = Arc::new(CountingMemory::default());
        let mut buf = Buffer::direct(Box::new(UnaccountedFree::new(memory.alloc(64))), "t");
        // Run the callback without detaching it from the buffer.
        assert!(buf.replace_free(|old| {
            old.run();
            old
        }));
        assert_eq!(memory.frees.load(Ordering::SeqCst), 1);
        assert_eq!(buf.memory_owner(), Some(MemoryOwner::Unaccounted));
        assert_eq!(buf.len(), 0);
        assert!(buf.as_slice().is_empty());
        assert!(buf.as_mut_slice().is_empty());
        drop(buf);
        assert_eq!(memory.frees.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_runs_free_once() {
        let memory = Arc::new(CountingMemory::default());
        let buf = Buffer::direct(Box::new(UnaccountedFree::new(memory.alloc(16))), "t");
        let free = buf.into_free_callback().expect("direct buffer");
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| free.run());
            }
        });
        assert_eq!(memory.frees.load(Ordering::SeqCst), 1);
        assert_eq!(free.allocation().address(), 0);
    }

    #[test]
    fn replace_free_only_applies_to_direct_buffers() {
        let mut heap = Buffer::heap(vec![1, 2, 3], "t");
        assert!(!heap.replace_free(|f| f));
        assert_eq!(heap.memory_owner(), None);

        let memory = Arc::new(CountingMemory::default());
        let mut direct = Buffer::direct(Box::new(UnaccountedFree::new(memory.alloc(8))), "t");
        assert!(direct.replace_free(|old| Box::new(UnaccountedFree::new(old.detach()))));
        drop(direct);
        assert_eq!(memory.frees.load(Ordering::SeqCst), 1);
    }
}
