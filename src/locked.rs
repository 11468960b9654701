//! Sharing a heap behind a lock, and plugging it into Rust's allocator traits.

use super::*;
use core::{alloc::GlobalAlloc, ptr};

mod mutex;
use mutex::Mutex;
pub use mutex::{Lock, SingleThreadedLock};
#[cfg(feature = "spin")]
pub use mutex::SpinLock;

/// A [`SegregatedHeap`] behind a lock of type `L`.
///
/// This is the single mutual-exclusion boundary the heap needs to be shared:
/// every operation takes the lock for its whole duration. It implements both
/// the `Allocator` and [`GlobalAlloc`] traits. With a `SpinLock` (cargo
/// feature `spin`) it is `Sync`.
///
/// ```ignore
/// let heap = LockedHeap::new(
///     SegregatedHeap::new(ReservedSource::new(Global, 1 << 20), Config::DEFAULT),
///     SpinLock::new(),
/// );
/// let mut v = allocator_api2::vec::Vec::new_in(&heap);
/// v.extend_from_slice(b"hello");
/// ```
///
/// Allocations with an alignment greater than [`ALIGNMENT`] always fail.
pub struct LockedHeap<S, L>
where
    S: HeapSource,
    L: Lock,
{
    heap: Mutex<SegregatedHeap<S>, L>,
}

impl<S, L> LockedHeap<S, L>
where
    S: HeapSource,
    L: Lock,
{
    /// Wrap the given heap with the given lock.
    #[inline]
    pub const fn new(heap: SegregatedHeap<S>, lock: L) -> Self {
        LockedHeap {
            heap: Mutex::new(heap, lock),
        }
    }

    /// Run `f` with exclusive access to the heap.
    ///
    /// `f` must not call back into this `LockedHeap`: see [`Lock`].
    pub fn with_heap<R>(&self, f: impl FnOnce(&mut SegregatedHeap<S>) -> R) -> R {
        let mut heap = self.heap.lock();
        f(&mut heap)
    }

    /// Get an exclusive reference to the heap without locking.
    #[inline]
    pub fn get_mut(&mut self) -> &mut SegregatedHeap<S> {
        self.heap.get_mut()
    }

    /// Unwrap the heap.
    #[inline]
    pub fn into_inner(self) -> SegregatedHeap<S> {
        self.heap.into_inner()
    }

    /// Resize through the `Allocator` API, with its zero-size conventions.
    unsafe fn resize_allocation(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        if new_layout.align() > ALIGNMENT {
            return Err(AllocError);
        }
        if old_layout.size() == 0 {
            return self.allocate(new_layout);
        }
        if new_layout.size() == 0 {
            self.deallocate(ptr, old_layout);
            return Ok(dangling(new_layout));
        }

        let mut heap = self.heap.lock();
        let new = heap.resize(Some(ptr), new_layout.size()).ok_or(AllocError)?;
        Ok(NonNull::slice_from_raw_parts(new, heap.usable_size(new)))
    }
}

impl<S, L> core::fmt::Debug for LockedHeap<S, L>
where
    S: HeapSource,
    L: Lock,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LockedHeap").finish_non_exhaustive()
    }
}

/// A well-aligned, non-null pointer for zero-sized allocations. These never
/// touch the heap.
#[inline]
fn dangling(layout: Layout) -> NonNull<[u8]> {
    // Safety: alignments are never zero.
    let ptr = unsafe { NonNull::new_unchecked(layout.align() as *mut u8) };
    NonNull::slice_from_raw_parts(ptr, 0)
}

unsafe impl<S, L> Allocator for LockedHeap<S, L>
where
    S: HeapSource,
    L: Lock,
{
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.align() > ALIGNMENT {
            return Err(AllocError);
        }
        if layout.size() == 0 {
            return Ok(dangling(layout));
        }

        let mut heap = self.heap.lock();
        let ptr = heap.allocate(layout.size()).ok_or(AllocError)?;
        // Safety: `ptr` was just allocated.
        let len = unsafe { heap.usable_size(ptr) };
        Ok(NonNull::slice_from_raw_parts(ptr, len))
    }

    fn allocate_zeroed(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.align() > ALIGNMENT {
            return Err(AllocError);
        }
        if layout.size() == 0 {
            return Ok(dangling(layout));
        }

        let mut heap = self.heap.lock();
        let ptr = heap.zero_allocate(1, layout.size()).ok_or(AllocError)?;
        // Safety: `ptr` was just allocated, and its entire payload is zeroed.
        let len = unsafe { heap.usable_size(ptr) };
        Ok(NonNull::slice_from_raw_parts(ptr, len))
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() == 0 {
            return;
        }
        self.heap.lock().free(Some(ptr));
    }

    #[inline]
    unsafe fn grow(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        self.resize_allocation(ptr, old_layout, new_layout)
    }

    unsafe fn grow_zeroed(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        let new = self.resize_allocation(ptr, old_layout, new_layout)?;
        let fresh = new.len() - old_layout.size();
        new.cast::<u8>()
            .add(old_layout.size())
            .write_bytes(0, fresh);
        Ok(new)
    }

    #[inline]
    unsafe fn shrink(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        self.resize_allocation(ptr, old_layout, new_layout)
    }
}

unsafe impl<S, L> GlobalAlloc for LockedHeap<S, L>
where
    S: HeapSource,
    L: Lock,
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }
        self.heap
            .lock()
            .allocate(layout.size())
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }
        self.heap
            .lock()
            .zero_allocate(1, layout.size())
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        // Release the lock before logging: the logger may allocate.
        let result = self.heap.lock().try_free(NonNull::new(ptr));
        if let Err(e) = result {
            log::error!("ignoring invalid deallocation of {ptr:p}: {e}");
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }
        let result = self.heap.lock().try_resize(NonNull::new(ptr), new_size);
        match result {
            Ok(new) => new.map_or(ptr::null_mut(), NonNull::as_ptr),
            Err(e) => {
                log::error!("ignoring invalid reallocation of {ptr:p}: {e}");
                ptr::null_mut()
            }
        }
    }
}
