//! The segregated-fit heap.
//!
//! The heap is one contiguous region obtained from a [`HeapSource`]:
//!
//! ```text
//! +----------+----------+---------+---------+-----+---------+----------+
//! | padding  | prologue | block 0 | block 1 | ... | block n | epilogue |
//! +----------+----------+---------+---------+-----+---------+----------+
//! ^ aligned    (size 0,                                       (size 0,
//!               allocated)                                     allocated)
//! ```
//!
//! The zero-sized, always-allocated prologue and epilogue mean coalescing
//! never has to special-case the ends of the heap. Growing the heap turns the
//! old epilogue into the header of a new free block and writes a new epilogue
//! after it.
//!
//! Free blocks live in size-class bins (see `bins`) and are merged with their
//! free neighbors as soon as they are freed, so no two free blocks are ever
//! physically adjacent.

use super::*;
use bins::Bins;
use block::{Block, WORD_SIZE};
use core::{cmp, fmt, ptr};

/// A pointer handed to [`SegregatedHeap::try_free`] (or `resize`) that is
/// certainly not a live allocation from that heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FreeError {
    /// The pointer is not aligned like every payload this heap hands out.
    Misaligned {
        /// The offending address.
        address: usize,
    },

    /// The pointer does not point into this heap.
    OutOfBounds {
        /// The offending address.
        address: usize,
    },

    /// The pointer's block is not allocated; most likely a double free.
    NotAllocated {
        /// The offending address.
        address: usize,
    },

    /// The pointer's block header does not describe an allocated block inside
    /// the heap, or the following block does not agree that it is allocated.
    CorruptHeader {
        /// The offending address.
        address: usize,
        /// The size recorded in the header.
        size: usize,
    },
}

impl fmt::Display for FreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            FreeError::Misaligned { address } => {
                write!(f, "{address:#x} is not {ALIGNMENT}-byte aligned")
            }
            FreeError::OutOfBounds { address } => {
                write!(f, "{address:#x} is not inside the heap")
            }
            FreeError::NotAllocated { address } => {
                write!(f, "{address:#x} is not allocated (double free?)")
            }
            FreeError::CorruptHeader { address, size } => write!(
                f,
                "{address:#x} has a corrupt block header (size = {size:#x})"
            ),
        }
    }
}

/// The ends of an initialized heap.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Bounds {
    /// The first real block, right after the prologue. Equal to `epilogue`
    /// while the heap has no blocks.
    pub(crate) first: Block,
    /// The current epilogue header.
    pub(crate) epilogue: Block,
}

/// A heap allocator with segregated free lists, splitting, and boundary-tag
/// coalescing.
///
/// * Every payload is [`ALIGNMENT`]-byte aligned.
///
/// * Allocated blocks carry a single word of overhead: their header. Footers
///   are only kept for free blocks.
///
/// * Free blocks are kept in [`NUM_SIZE_CLASSES`] power-of-two size classes
///   and found with a bounded best-fit search (see [`Config`]).
///
/// * When nothing fits, the heap grows through its [`HeapSource`] by at least
///   [`Config::chunk_size`] bytes. It never shrinks.
///
/// This type takes `&mut self` everywhere and does no locking of its own. Wrap
/// it in a [`LockedHeap`] to share it or to use it through the `Allocator` and
/// `GlobalAlloc` traits.
pub struct SegregatedHeap<S>
where
    S: HeapSource,
{
    source: S,
    config: Config,
    pub(crate) bins: Bins,
    pub(crate) bounds: Option<Bounds>,
    heap_size: usize,
}

// Safety: all of the heap's raw pointers point into memory owned by `source`,
// so the heap can move between threads whenever its source can.
unsafe impl<S> Send for SegregatedHeap<S> where S: HeapSource + Send {}

impl<S> fmt::Debug for SegregatedHeap<S>
where
    S: HeapSource,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegregatedHeap")
            .field("config", &self.config)
            .field("heap_size", &self.heap_size)
            .field("bounds", &self.bounds)
            .finish_non_exhaustive()
    }
}

cfg_if! {
    if #[cfg(feature = "check_invariants")] {
        fn assert_consistent<S: HeapSource>(heap: &SegregatedHeap<S>, when: &str) {
            if let Err(violation) = heap.check() {
                panic!("heap inconsistent {when}: {violation}");
            }
        }
    } else {
        #[inline(always)]
        fn assert_consistent<S: HeapSource>(_heap: &SegregatedHeap<S>, _when: &str) {}
    }
}

/// The block size needed to satisfy a request for `size` payload bytes.
#[inline]
fn adjusted_size(size: usize) -> Option<usize> {
    let size = size.checked_add(WORD_SIZE + ALIGNMENT - 1)? & !(ALIGNMENT - 1);
    Some(cmp::max(size, MIN_BLOCK_SIZE))
}

impl<S> SegregatedHeap<S>
where
    S: HeapSource,
{
    /// Create a new, empty heap that grows through `source`.
    ///
    /// Nothing is requested from the source until the first allocation.
    #[inline]
    pub const fn new(source: S, config: Config) -> Self {
        SegregatedHeap {
            source,
            config,
            bins: Bins::new(),
            bounds: None,
            heap_size: 0,
        }
    }

    /// Get this heap's configuration.
    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get a shared reference to the heap source.
    #[inline]
    pub fn source(&self) -> &S {
        &self.source
    }

    /// The total number of bytes obtained from the heap source so far.
    #[inline]
    pub fn heap_size(&self) -> usize {
        self.heap_size
    }

    /// Allocate at least `size` bytes.
    ///
    /// Returns `None` when `size` is zero or the heap source is exhausted. The
    /// returned pointer is [`ALIGNMENT`]-byte aligned and remains valid until
    /// it is passed to [`free`](Self::free) or [`resize`](Self::resize).
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        assert_consistent(self, "before allocate");

        if size == 0 {
            return None;
        }
        let asize = adjusted_size(size)?;

        if self.bounds.is_none() {
            if let Err(e) = self.init() {
                log::debug!("failed to initialize heap: {e}");
                if self.bounds.is_none() {
                    return None;
                }
            }
        }

        // Safety: the heap is initialized and the bins are well-formed.
        let fit = unsafe { self.bins.find_fit(asize, self.config.best_fit_threshold) };
        let block = match fit {
            Some(block) => block,
            None => {
                let grow_by = cmp::max(asize, self.config.effective_chunk_size());
                // Safety: the heap is initialized.
                match unsafe { self.extend(grow_by) } {
                    Ok(block) => block,
                    Err(e) => {
                        log::debug!("cannot allocate {size} bytes: {e}");
                        return None;
                    }
                }
            }
        };

        // Safety: `block` is free, binned, and at least `asize` bytes.
        unsafe { self.place(block, asize) };

        assert_consistent(self, "after allocate");
        Some(block.payload())
    }

    /// Allocate zero-filled room for `count` elements of `element_size` bytes
    /// each.
    ///
    /// Returns `None` if the total size overflows, is zero, or cannot be
    /// allocated.
    pub fn zero_allocate(&mut self, count: usize, element_size: usize) -> Option<NonNull<u8>> {
        let Some(total) = count.checked_mul(element_size) else {
            log::debug!("zero_allocate({count}, {element_size}) overflows");
            return None;
        };
        let ptr = self.allocate(total)?;
        // Safety: `ptr` was just allocated and its whole payload belongs to
        // us.
        unsafe {
            let len = Block::from_payload(ptr).payload_size();
            ptr.write_bytes(0, len);
        }
        Some(ptr)
    }

    /// Free an allocation, panicking if `ptr` is detectably not a live
    /// allocation from this heap. Freeing `None` does nothing.
    ///
    /// ### Safety
    ///
    /// `ptr` must be `None` or a pointer returned by this heap that has not
    /// been freed since. The checks done here catch common mistakes such as
    /// double frees and stray pointers, but a pointer into the middle of a
    /// live allocation whose preceding bytes happen to look like a valid
    /// block can get past them and corrupt the heap.
    ///
    /// ### Panics
    ///
    /// When [`try_free`](Self::try_free) would return an error.
    pub unsafe fn free(&mut self, ptr: Option<NonNull<u8>>) {
        if let Err(e) = self.try_free(ptr) {
            panic!("invalid free: {e}");
        }
    }

    /// Free an allocation, or report why `ptr` cannot be a live allocation
    /// from this heap. On error the heap is left untouched.
    ///
    /// ### Safety
    ///
    /// Same as [`free`](Self::free).
    pub unsafe fn try_free(&mut self, ptr: Option<NonNull<u8>>) -> Result<(), FreeError> {
        let Some(ptr) = ptr else {
            return Ok(());
        };
        assert_consistent(self, "before free");

        let block = self.block_for_payload(ptr)?;
        self.release(block);

        assert_consistent(self, "after free");
        Ok(())
    }

    /// Resize an allocation to `size` bytes, moving it, and return the new
    /// pointer.
    ///
    /// * A `size` of zero frees `ptr` and returns `None`.
    ///
    /// * A `ptr` of `None` is the same as [`allocate(size)`](Self::allocate).
    ///
    /// * Otherwise the first `min(size, old usable size)` bytes are copied to a
    ///   fresh allocation and the old one is freed. If the fresh allocation
    ///   fails, `None` is returned and `ptr` is left untouched and live.
    ///
    /// ### Safety
    ///
    /// Same as [`free`](Self::free).
    ///
    /// ### Panics
    ///
    /// When [`try_resize`](Self::try_resize) would return an error.
    pub unsafe fn resize(&mut self, ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
        match self.try_resize(ptr, size) {
            Ok(new) => new,
            Err(e) => panic!("invalid resize: {e}"),
        }
    }

    /// Like [`resize`](Self::resize) but reports an invalid `ptr` instead of
    /// panicking.
    ///
    /// ### Safety
    ///
    /// Same as [`free`](Self::free).
    pub unsafe fn try_resize(
        &mut self,
        ptr: Option<NonNull<u8>>,
        size: usize,
    ) -> Result<Option<NonNull<u8>>, FreeError> {
        if size == 0 {
            self.try_free(ptr)?;
            return Ok(None);
        }
        let Some(old) = ptr else {
            return Ok(self.allocate(size));
        };

        let old_block = self.block_for_payload(old)?;
        let Some(new) = self.allocate(size) else {
            return Ok(None);
        };
        debug_assert_ne!(new, old);

        let to_copy = cmp::min(old_block.payload_size(), size);
        ptr::copy_nonoverlapping(old.as_ptr().cast_const(), new.as_ptr(), to_copy);
        self.release(old_block);

        assert_consistent(self, "after resize");
        Ok(Some(new))
    }

    /// The number of bytes usable through `ptr`, which is at least the size
    /// it was allocated with.
    ///
    /// ### Safety
    ///
    /// `ptr` must be a live allocation from this heap.
    ///
    /// ### Panics
    ///
    /// If `ptr` is detectably not a live allocation from this heap.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        match self.block_for_payload(ptr) {
            Ok(block) => block.payload_size(),
            Err(e) => panic!("invalid pointer: {e}"),
        }
    }

    /// Find the allocated block for `ptr`, rejecting pointers that cannot have
    /// come from this heap.
    unsafe fn block_for_payload(&self, ptr: NonNull<u8>) -> Result<Block, FreeError> {
        let address = ptr.as_ptr() as usize;
        if address % ALIGNMENT != 0 {
            return Err(FreeError::Misaligned { address });
        }
        let Some(bounds) = self.bounds else {
            return Err(FreeError::OutOfBounds { address });
        };
        if address < bounds.first.payload().as_ptr() as usize || address >= bounds.epilogue.addr()
        {
            return Err(FreeError::OutOfBounds { address });
        }

        let block = Block::from_payload(ptr);
        let header = block.header();
        if !header.is_allocated() {
            return Err(FreeError::NotAllocated { address });
        }
        let size = header.size();
        if size < MIN_BLOCK_SIZE || size > bounds.epilogue.addr() - block.addr() {
            return Err(FreeError::CorruptHeader { address, size });
        }
        // An allocated block's successor always records it as allocated.
        if !block.next().is_prev_allocated() {
            return Err(FreeError::CorruptHeader { address, size });
        }
        Ok(block)
    }

    /// Lay down the prologue and epilogue, then grow by one chunk.
    ///
    /// The heap counts as initialized as soon as the prologue and epilogue
    /// exist, even if growing by the first chunk fails.
    fn init(&mut self) -> Result<(), GrowError> {
        let start = self.source.grow_heap(ALIGNMENT)?;
        debug_assert_eq!(start.as_ptr() as usize % ALIGNMENT, 0);

        // Safety: the source just gave us `ALIGNMENT` bytes at `start`; the
        // prologue and epilogue take up its last two words.
        unsafe {
            let prologue = Block::from_header_ptr(start.add(ALIGNMENT - 2 * WORD_SIZE));
            let epilogue = Block::from_header_ptr(start.add(ALIGNMENT - WORD_SIZE));
            prologue.write_header(0, true, true);
            epilogue.write_header(0, true, true);
            self.bounds = Some(Bounds {
                first: epilogue,
                epilogue,
            });
        }
        self.heap_size = ALIGNMENT;
        log::debug!("initialized heap at {start:p}");

        // Safety: the heap is now initialized.
        unsafe { self.extend(self.config.effective_chunk_size())? };
        Ok(())
    }

    /// Grow the heap by `size` bytes, turning the new space into a free block
    /// (merged with a free block that ended the heap, if any) and returning
    /// it.
    ///
    /// ### Safety
    ///
    /// The heap must be initialized. `size` must be a multiple of
    /// [`ALIGNMENT`] and at least [`MIN_BLOCK_SIZE`].
    unsafe fn extend(&mut self, size: usize) -> Result<Block, GrowError> {
        debug_assert_eq!(size % ALIGNMENT, 0);
        debug_assert!(size >= MIN_BLOCK_SIZE);
        let Some(bounds) = self.bounds else {
            unreachable!("extending an uninitialized heap");
        };

        let new_space = self.source.grow_heap(size)?;
        debug_assert_eq!(
            new_space,
            bounds.epilogue.payload(),
            "heap source must return contiguous regions"
        );

        // The old epilogue header becomes the new block's header.
        let block = Block::from_payload(new_space);
        let prev_allocated = block.is_prev_allocated();
        block.write_header(size, false, prev_allocated);
        block.write_footer(size);

        let epilogue = block.next();
        epilogue.write_header(0, true, false);
        self.bounds = Some(Bounds {
            first: bounds.first,
            epilogue,
        });
        self.heap_size += size;
        log::debug!("grew heap by {size} bytes to {} bytes", self.heap_size);

        Ok(self.coalesce(block))
    }

    /// Allocate `asize` bytes out of the free `block`, splitting off the
    /// remainder as a new free block when it is big enough to stand alone.
    ///
    /// ### Safety
    ///
    /// `block` must be free, in its bin, and at least `asize` bytes.
    unsafe fn place(&mut self, block: Block, asize: usize) {
        let size = block.size();
        debug_assert!(!block.is_allocated());
        debug_assert!(size >= asize);

        self.bins.remove(block);
        let prev_allocated = block.is_prev_allocated();

        let rest_size = size - asize;
        if rest_size >= MIN_BLOCK_SIZE {
            block.write_header(asize, true, prev_allocated);
            let rest = block.next();
            rest.write_header(rest_size, false, true);
            rest.write_footer(rest_size);
            log::trace!("split {block:?}: {asize} bytes allocated, {rest_size} bytes free");
            self.coalesce(rest);
        } else {
            log::trace!("placed {asize} bytes in {block:?} of {size} bytes");
            block.write_header(size, true, prev_allocated);
        }
    }

    /// Mark an allocated block free and coalesce it.
    ///
    /// ### Safety
    ///
    /// `block` must be an allocated block of this heap.
    unsafe fn release(&mut self, block: Block) {
        let size = block.size();
        let prev_allocated = block.is_prev_allocated();
        block.write_header(size, false, prev_allocated);
        block.write_footer(size);
        block.next().set_prev_allocated(false);
        self.coalesce(block);
    }

    /// Merge a free, unbinned block with its free neighbors and insert the
    /// result into its bin. Returns the merged block.
    ///
    /// ### Safety
    ///
    /// `block` must be free with a valid header and footer, must not be in any
    /// bin, and its successor's "previous is allocated" bit must be clear.
    unsafe fn coalesce(&mut self, block: Block) -> Block {
        let prev_allocated = block.is_prev_allocated();
        let next = block.next();
        let next_allocated = next.is_allocated();
        let mut size = block.size();

        let merged = match (prev_allocated, next_allocated) {
            (true, true) => block,

            (true, false) => {
                log::trace!("coalescing {block:?} with next {next:?}");
                self.bins.remove(next);
                size += next.size();
                block.write_header(size, false, true);
                block.write_footer(size);
                block
            }

            (false, true) => {
                let prev = block.prev();
                log::trace!("coalescing {block:?} with previous {prev:?}");
                self.bins.remove(prev);
                size += prev.size();
                prev.write_header(size, false, prev.is_prev_allocated());
                prev.write_footer(size);
                prev
            }

            (false, false) => {
                let prev = block.prev();
                log::trace!("coalescing {block:?} with previous {prev:?} and next {next:?}");
                self.bins.remove(prev);
                self.bins.remove(next);
                size += prev.size() + next.size();
                prev.write_header(size, false, prev.is_prev_allocated());
                prev.write_footer(size);
                prev
            }
        };

        self.bins.insert(merged);
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{boxed::Box, vec, vec::Vec};

    const MIB: usize = 1 << 20;

    fn new_heap(capacity: usize) -> SegregatedHeap<SliceSource<'static>> {
        new_heap_with(capacity, Config::default())
    }

    fn new_heap_with(capacity: usize, config: Config) -> SegregatedHeap<SliceSource<'static>> {
        let _ = env_logger::try_init();
        let memory: &'static mut [u8] = Box::leak(vec![0u8; capacity].into_boxed_slice());
        SegregatedHeap::new(SliceSource::new(memory), config)
    }

    fn addr(p: NonNull<u8>) -> usize {
        p.as_ptr() as usize
    }

    #[test]
    fn zero_size_allocations_are_null() {
        let mut heap = new_heap(MIB);
        assert_eq!(heap.allocate(0), None);
        assert_eq!(heap.heap_size(), 0, "no side effects");
        assert_eq!(heap.zero_allocate(0, 8), None);
        assert_eq!(heap.zero_allocate(8, 0), None);
    }

    #[test]
    fn allocations_are_aligned_and_big_enough() {
        let mut heap = new_heap(MIB);
        for size in [1, 7, 8, 9, 15, 16, 17, 24, 31, 32, 100, 1000, 4000, 5000] {
            let p = heap.allocate(size).unwrap();
            assert_eq!(addr(p) % ALIGNMENT, 0);
            assert!(unsafe { heap.usable_size(p) } >= size);
        }
        heap.check().unwrap();
    }

    #[test]
    fn live_allocations_do_not_overlap() {
        let mut heap = new_heap(MIB);
        let mut live: Vec<(usize, usize)> = Vec::new();
        for i in 0..200 {
            let size = (i * 37) % 700 + 1;
            let p = heap.allocate(size).unwrap();
            let start = addr(p);
            let end = start + unsafe { heap.usable_size(p) };
            for &(s, e) in &live {
                assert!(end <= s || e <= start);
            }
            live.push((start, end));
        }
        heap.check().unwrap();
    }

    #[test]
    fn free_then_allocate_reuses_address() {
        let mut heap = new_heap(MIB);
        let _a = heap.allocate(100).unwrap();
        let b = heap.allocate(100).unwrap();
        let _c = heap.allocate(100).unwrap();
        unsafe { heap.free(Some(b)) };
        assert_eq!(heap.allocate(100), Some(b));
        heap.check().unwrap();
    }

    #[test]
    fn freeing_neighbors_coalesces_them() {
        let mut heap = new_heap(MIB);
        let a = heap.allocate(5000).unwrap();
        let b = heap.allocate(5000).unwrap();
        unsafe {
            heap.free(Some(a));
            heap.free(Some(b));
        }
        let stats = heap.check().unwrap();
        // Everything is free again, so the whole heap is a single free block.
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.allocated_blocks, 0);
        assert!(stats.largest_free_block >= 2 * 5008);
        assert_eq!(stats.free_bytes, heap.heap_size() - ALIGNMENT);
    }

    #[test]
    fn coalesces_in_every_direction() {
        let mut heap = new_heap(MIB);
        let ptrs: Vec<_> = (0..5).map(|_| heap.allocate(64).unwrap()).collect();
        // Keep a guard allocation so the tail free block stays separate.
        let _guard = heap.allocate(64).unwrap();
        let before = heap.check().unwrap().free_blocks;

        unsafe {
            // Neither neighbor free.
            heap.free(Some(ptrs[1]));
            assert_eq!(heap.check().unwrap().free_blocks, before + 1);
            // Previous neighbor free.
            heap.free(Some(ptrs[2]));
            assert_eq!(heap.check().unwrap().free_blocks, before + 1);
            // Next neighbor free.
            heap.free(Some(ptrs[0]));
            assert_eq!(heap.check().unwrap().free_blocks, before + 1);
            // Both neighbors free.
            heap.free(Some(ptrs[4]));
            assert_eq!(heap.check().unwrap().free_blocks, before + 2);
            heap.free(Some(ptrs[3]));
            assert_eq!(heap.check().unwrap().free_blocks, before + 1);
        }

        let stats = heap.check().unwrap();
        assert!(stats.largest_free_block >= 5 * 80);
    }

    #[test]
    fn zero_allocate_is_zeroed() {
        let mut heap = new_heap(MIB);
        // Dirty some memory first so zeroing is not a coincidence.
        let p = heap.allocate(40).unwrap();
        unsafe {
            p.write_bytes(0xAA, 40);
            heap.free(Some(p));
        }

        let z = heap.zero_allocate(10, 4).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(z.as_ptr(), 40) };
        assert!(bytes.iter().all(|b| *b == 0));
        assert!(unsafe { heap.usable_size(z) } >= 40);
    }

    #[test]
    fn zero_allocate_overflow_fails_without_allocating() {
        let mut heap = new_heap(MIB);
        assert_eq!(heap.zero_allocate(usize::MAX / 2, 3), None);
        assert_eq!(heap.zero_allocate(2, usize::MAX), None);
        assert_eq!(heap.heap_size(), 0);
    }

    #[test]
    fn resize_preserves_contents() {
        let mut heap = new_heap(MIB);
        let p = heap.allocate(100).unwrap();
        unsafe {
            for i in 0..100 {
                p.add(i).write(i as u8);
            }

            let bigger = heap.resize(Some(p), 1000).unwrap();
            for i in 0..100 {
                assert_eq!(bigger.add(i).read(), i as u8);
            }

            let smaller = heap.resize(Some(bigger), 10).unwrap();
            for i in 0..10 {
                assert_eq!(smaller.add(i).read(), i as u8);
            }
        }
        heap.check().unwrap();
    }

    #[test]
    fn resize_null_allocates_and_resize_zero_frees() {
        let mut heap = new_heap(MIB);
        let p = unsafe { heap.resize(None, 64) }.unwrap();
        assert!(unsafe { heap.usable_size(p) } >= 64);

        assert_eq!(unsafe { heap.resize(Some(p), 0) }, None);
        assert_eq!(
            unsafe { heap.try_free(Some(p)) },
            Err(FreeError::NotAllocated { address: addr(p) })
        );
        assert_eq!(heap.check().unwrap().allocated_blocks, 0);
    }

    #[test]
    fn failed_resize_leaves_original_alone() {
        let mut heap = new_heap(8192);
        let p = heap.allocate(64).unwrap();
        unsafe {
            p.write_bytes(0x5A, 64);
            assert_eq!(heap.resize(Some(p), 1 << 20), None);
            let bytes = core::slice::from_raw_parts(p.as_ptr(), 64);
            assert!(bytes.iter().all(|b| *b == 0x5A));
            assert!(heap.usable_size(p) >= 64);
            heap.free(Some(p));
        }
        heap.check().unwrap();
    }

    #[test]
    fn large_requests_grow_by_exactly_the_request() {
        let mut heap = new_heap(MIB);
        let _small = heap.allocate(16).unwrap();
        let before = heap.heap_size();

        // Bigger than the chunk and than any free block.
        let _big = heap.allocate(10_000).unwrap();
        let grown = heap.heap_size() - before;
        assert_eq!(grown, adjusted_size(10_000).unwrap());
    }

    #[test]
    fn small_requests_grow_by_a_chunk() {
        let mut heap = new_heap_with(MIB, Config::default().with_chunk_size(1024));
        assert!(heap.allocate(16).is_some());
        assert_eq!(heap.heap_size(), ALIGNMENT + 1024);
        // Use up the rest of the first chunk, then some.
        for _ in 0..64 {
            heap.allocate(16).unwrap();
        }
        assert_eq!((heap.heap_size() - ALIGNMENT) % 1024, 0);
        heap.check().unwrap();
    }

    #[test]
    fn exhaustion_returns_none_and_keeps_heap_valid() {
        let mut heap = new_heap(16 * 1024);
        let mut ptrs = Vec::new();
        while let Some(p) = heap.allocate(1000) {
            ptrs.push(p);
        }
        assert!(!ptrs.is_empty());
        heap.check().unwrap();

        for p in ptrs {
            unsafe { heap.free(Some(p)) };
        }
        let stats = heap.check().unwrap();
        assert_eq!(stats.free_blocks, 1);
    }

    #[test]
    fn source_too_small_to_initialize() {
        let mut heap = new_heap(8);
        assert_eq!(heap.allocate(1), None);
        assert_eq!(heap.allocate(1), None);
    }

    #[test]
    fn detects_bad_frees() {
        let mut heap = new_heap(MIB);
        let p = heap.allocate(64).unwrap();
        unsafe {
            let misaligned = NonNull::new_unchecked(p.as_ptr().add(1));
            assert_eq!(
                heap.try_free(Some(misaligned)),
                Err(FreeError::Misaligned {
                    address: addr(misaligned)
                })
            );

            #[repr(align(16))]
            struct Outside([u8; 16]);
            let mut outside = Outside([0; 16]);
            let outside = NonNull::from(&mut outside).cast::<u8>();
            assert_eq!(
                heap.try_free(Some(outside)),
                Err(FreeError::OutOfBounds {
                    address: addr(outside)
                })
            );

            assert_eq!(heap.try_free(None), Ok(()));
            assert_eq!(heap.try_free(Some(p)), Ok(()));
            assert_eq!(
                heap.try_free(Some(p)),
                Err(FreeError::NotAllocated { address: addr(p) })
            );
        }
        heap.check().unwrap();
    }

    #[test]
    fn rejects_interior_pointer_with_forged_header() {
        let mut heap = new_heap(MIB);
        let p = heap.zero_allocate(1, 200).unwrap();
        unsafe {
            // A plausible allocated header inside `p`'s payload, whose
            // would-be successor is zeroed client data.
            let forged = 48 | 0b11;
            p.add(WORD_SIZE).cast::<usize>().write(forged);
            let interior = p.add(2 * WORD_SIZE);
            assert_eq!(
                heap.try_free(Some(interior)),
                Err(FreeError::CorruptHeader {
                    address: addr(interior),
                    size: 48,
                })
            );
        }
        heap.check().unwrap();
        unsafe { heap.free(Some(p)) };
        assert_eq!(heap.check().unwrap().allocated_blocks, 0);
    }

    #[test]
    #[should_panic(expected = "invalid free")]
    fn double_free_panics() {
        let mut heap = new_heap(MIB);
        let p = heap.allocate(64).unwrap();
        unsafe {
            heap.free(Some(p));
            heap.free(Some(p));
        }
    }

    #[test]
    fn pure_first_fit_still_works() {
        let mut heap = new_heap_with(MIB, Config::default().with_best_fit_threshold(0));
        let ptrs: Vec<_> = (1..50).map(|i| heap.allocate(i * 24).unwrap()).collect();
        for p in ptrs.iter().step_by(2) {
            unsafe { heap.free(Some(*p)) };
        }
        for i in 1..25 {
            heap.allocate(i * 16).unwrap();
        }
        heap.check().unwrap();
    }
}
