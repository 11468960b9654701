//! Where the heap's bytes come from.
//!
//! The heap only ever asks for more memory at its end, so a source is little
//! more than a break pointer over some reserved region, like `sbrk`.

use super::*;
use core::{fmt, marker::PhantomData};

/// A heap source could not satisfy a growth request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GrowError {
    /// There are not enough bytes left in the source.
    Exhausted {
        /// The number of bytes requested.
        requested: usize,
        /// The number of bytes that were still available.
        available: usize,
    },

    /// The source failed to reserve its backing region.
    ReserveFailed {
        /// The size of the region it tried to reserve.
        capacity: usize,
    },
}

impl fmt::Display for GrowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GrowError::Exhausted {
                requested,
                available,
            } => write!(
                f,
                "heap source exhausted: requested {requested} bytes but only {available} are available"
            ),
            GrowError::ReserveFailed { capacity } => {
                write!(f, "failed to reserve a {capacity}-byte heap region")
            }
        }
    }
}

/// A monotonically growing region of memory backing a [`SegregatedHeap`].
///
/// # Safety
///
/// Implementations must uphold the following:
///
/// * A successful `grow_heap(delta)` returns a pointer to `delta` bytes that
///   are valid for reads and writes, exclusively owned by the caller, and live
///   for as long as the source does.
///
/// * Each successful call returns the address directly following the region
///   returned by the previous successful call: the heap is one contiguous
///   range.
///
/// * The first region starts on an [`ALIGNMENT`]-byte boundary.
///
/// * A failed call does not change the source.
pub unsafe trait HeapSource {
    /// Extend the heap by `delta` bytes, returning the start of the new bytes.
    fn grow_heap(&mut self, delta: usize) -> Result<NonNull<u8>, GrowError>;
}

/// Round `addr` up to the heap alignment.
#[inline]
fn align_up(addr: usize) -> Option<usize> {
    Some(addr.checked_add(ALIGNMENT - 1)? & !(ALIGNMENT - 1))
}

/// A heap source that carves the heap out of a borrowed byte slice.
///
/// Keeps a raw pointer rather than the slice itself, so handing out a new
/// region never invalidates pointers into earlier ones.
///
/// Useful for `no_std` environments with a static arena, and for tests.
#[derive(Debug)]
pub struct SliceSource<'a> {
    base: *mut u8,
    capacity: usize,
    brk: usize,
    _slice: PhantomData<&'a mut [u8]>,
}

// Safety: the source has exclusive access to its slice, so sending it between
// threads is no different from sending the `&mut [u8]` itself.
unsafe impl Send for SliceSource<'_> {}

impl<'a> SliceSource<'a> {
    /// Create a new source over the given memory.
    ///
    /// The start of the slice is rounded up to [`ALIGNMENT`], so up to
    /// `ALIGNMENT - 1` leading bytes may go unused.
    pub fn new(memory: &'a mut [u8]) -> Self {
        let start = memory.as_mut_ptr();
        let len = memory.len();
        let padding = align_up(start as usize).map_or(len, |aligned| aligned - start as usize);
        let (base, capacity) = if padding >= len {
            (start, 0)
        } else {
            // Safety: `padding < len`, so this stays inside the slice.
            (unsafe { start.add(padding) }, len - padding)
        };
        SliceSource {
            base,
            capacity,
            brk: 0,
            _slice: PhantomData,
        }
    }

    /// The number of bytes not yet handed out.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.capacity - self.brk
    }
}

unsafe impl HeapSource for SliceSource<'_> {
    fn grow_heap(&mut self, delta: usize) -> Result<NonNull<u8>, GrowError> {
        if delta > self.remaining() {
            return Err(GrowError::Exhausted {
                requested: delta,
                available: self.remaining(),
            });
        }
        // Safety: `brk <= capacity`, so this is in bounds or one past the end,
        // and `base` is derived from a slice pointer and is never null.
        let ptr = unsafe { NonNull::new_unchecked(self.base.add(self.brk)) };
        self.brk += delta;
        Ok(ptr)
    }
}

/// A heap source that reserves a fixed-capacity region from an inner
/// allocator the first time the heap grows, then hands it out piece by piece.
///
/// The region is returned to the inner allocator when the source is dropped.
pub struct ReservedSource<A>
where
    A: Allocator,
{
    inner: A,
    capacity: usize,
    region: Option<NonNull<u8>>,
    brk: usize,
}

// Safety: the reserved region is exclusively owned by the source.
unsafe impl<A> Send for ReservedSource<A> where A: Allocator + Send {}

impl<A> ReservedSource<A>
where
    A: Allocator,
{
    /// Create a new source that will reserve `capacity` bytes from `inner`.
    ///
    /// Nothing is reserved until the first growth request.
    #[inline]
    pub const fn new(inner: A, capacity: usize) -> Self {
        ReservedSource {
            inner,
            capacity,
            region: None,
            brk: 0,
        }
    }

    /// Get a shared reference to the inner allocator.
    #[inline]
    pub fn inner(&self) -> &A {
        &self.inner
    }

    /// The total capacity of this source.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The number of bytes not yet handed out.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.capacity - self.brk
    }

    fn layout(&self) -> Option<Layout> {
        Layout::from_size_align(self.capacity, ALIGNMENT).ok()
    }

    fn region(&mut self) -> Result<NonNull<u8>, GrowError> {
        if let Some(region) = self.region {
            return Ok(region);
        }

        let reserve_failed = GrowError::ReserveFailed {
            capacity: self.capacity,
        };
        let layout = self.layout().ok_or(reserve_failed)?;
        if layout.size() == 0 {
            return Err(reserve_failed);
        }
        let region = self.inner.allocate(layout).map_err(|_| reserve_failed)?;
        let region = region.cast::<u8>();
        log::debug!(
            "reserved {} bytes for the heap at {region:p}",
            self.capacity
        );
        self.region = Some(region);
        Ok(region)
    }
}

unsafe impl<A> HeapSource for ReservedSource<A>
where
    A: Allocator,
{
    fn grow_heap(&mut self, delta: usize) -> Result<NonNull<u8>, GrowError> {
        if delta > self.remaining() {
            return Err(GrowError::Exhausted {
                requested: delta,
                available: self.remaining(),
            });
        }
        let region = self.region()?;
        // Safety: `brk + delta <= capacity`, so this is within the region.
        let ptr = unsafe { region.add(self.brk) };
        self.brk += delta;
        Ok(ptr)
    }
}

impl<A> Drop for ReservedSource<A>
where
    A: Allocator,
{
    fn drop(&mut self) {
        if let (Some(region), Some(layout)) = (self.region.take(), self.layout()) {
            // Safety: the region was allocated from `inner` with this layout
            // and the source is going away, so nothing can use it anymore.
            unsafe { self.inner.deallocate(region, layout) };
        }
    }
}

impl<A> fmt::Debug for ReservedSource<A>
where
    A: Allocator,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReservedSource")
            .field("capacity", &self.capacity)
            .field("region", &self.region.map(|r| r.as_ptr()))
            .field("brk", &self.brk)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec;

    #[test]
    fn slice_source_is_aligned_and_contiguous() {
        let mut memory = vec![0u8; 1024 + ALIGNMENT];
        let mut source = SliceSource::new(&mut memory[3..]);

        let a = source.grow_heap(ALIGNMENT).unwrap();
        assert_eq!(a.as_ptr() as usize % ALIGNMENT, 0);

        let b = source.grow_heap(256).unwrap();
        assert_eq!(b.as_ptr() as usize, a.as_ptr() as usize + ALIGNMENT);

        let c = source.grow_heap(32).unwrap();
        assert_eq!(c.as_ptr() as usize, b.as_ptr() as usize + 256);
    }

    #[test]
    fn slice_source_exhaustion_leaves_it_unchanged() {
        let mut memory = vec![0u8; 256];
        let mut source = SliceSource::new(&mut memory);
        let remaining = source.remaining();

        let err = source.grow_heap(remaining + 16).unwrap_err();
        assert_eq!(
            err,
            GrowError::Exhausted {
                requested: remaining + 16,
                available: remaining,
            }
        );
        assert_eq!(source.remaining(), remaining);
        assert!(source.grow_heap(remaining).is_ok());
        assert_eq!(source.remaining(), 0);
    }

    #[test]
    fn tiny_slice_has_no_capacity() {
        let mut memory = [0u8; 4];
        let mut source = SliceSource::new(&mut memory[1..]);
        assert!(source.grow_heap(16).is_err());
    }

    #[test]
    #[cfg(feature = "allocator_api2")]
    fn reserved_source_reserves_lazily() {
        let mut source = ReservedSource::new(allocator_api2::alloc::Global, 4096);
        assert!(source.region.is_none());

        let a = source.grow_heap(16).unwrap();
        assert_eq!(a.as_ptr() as usize % ALIGNMENT, 0);
        let b = source.grow_heap(4080).unwrap();
        assert_eq!(b.as_ptr() as usize, a.as_ptr() as usize + 16);
        assert!(matches!(
            source.grow_heap(16),
            Err(GrowError::Exhausted { available: 0, .. })
        ));
    }

    #[test]
    #[cfg(feature = "allocator_api2")]
    fn zero_capacity_fails_to_reserve() {
        let mut source = ReservedSource::new(allocator_api2::alloc::Global, 0);
        assert_eq!(
            source.grow_heap(0),
            Err(GrowError::ReserveFailed { capacity: 0 })
        );
    }
}
