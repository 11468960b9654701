//! Block layout and the header/footer word codec.
//!
//! Every block starts with a one-word header and its size is a multiple of
//! [`ALIGNMENT`]. Payloads start right after the header, so headers live one
//! word before an alignment boundary:
//!
//! ```text
//!            allocated block                       free block
//!   +-------------------------------+   +-------------------------------+
//!   | header: size | prev | alloc=1 |   | header: size | prev | alloc=0 |
//!   +-------------------------------+   +-------------------------------+ <- payload
//!   |                               |   | next free block               |
//!   |        client payload         |   | previous free block           |
//!   |                               |   | ...                           |
//!   |                               |   | footer: size | alloc=0        |
//!   +-------------------------------+   +-------------------------------+
//! ```
//!
//! Allocated blocks carry no footer. Instead, writing an allocated header sets
//! the `prev` bit in the header of the physically next block, so that block
//! never has to look at a footer that is not there. Consequently
//! [`Block::prev`] may only be used when the `prev` bit is clear.

use super::*;
use core::mem;

pub(crate) type Word = usize;

pub(crate) const WORD_SIZE: usize = mem::size_of::<Word>();

const ALLOCATED_BIT: Word = 0b01;
const PREV_ALLOCATED_BIT: Word = 0b10;
const SIZE_MASK: Word = !(ALIGNMENT as Word - 1);

/// A packed header or footer word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header(Word);

impl Header {
    /// Pack a size and allocation state into a header word.
    #[inline]
    pub(crate) const fn pack(size: usize, allocated: bool) -> Self {
        debug_assert!(size % ALIGNMENT == 0);
        if allocated {
            Header(size | ALLOCATED_BIT)
        } else {
            Header(size)
        }
    }

    #[inline]
    pub(crate) const fn with_prev_allocated(self, prev_allocated: bool) -> Self {
        if prev_allocated {
            Header(self.0 | PREV_ALLOCATED_BIT)
        } else {
            Header(self.0 & !PREV_ALLOCATED_BIT)
        }
    }

    #[inline]
    pub(crate) const fn size(self) -> usize {
        self.0 & SIZE_MASK
    }

    #[inline]
    pub(crate) const fn is_allocated(self) -> bool {
        self.0 & ALLOCATED_BIT != 0
    }

    #[inline]
    pub(crate) const fn is_prev_allocated(self) -> bool {
        self.0 & PREV_ALLOCATED_BIT != 0
    }
}

impl core::fmt::Debug for Header {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Header")
            .field("size", &self.size())
            .field("allocated", &self.is_allocated())
            .field("prev_allocated", &self.is_prev_allocated())
            .finish()
    }
}

/// A handle to a block, pointing at its header word.
///
/// This is a plain address. All accessors are `unsafe`: the caller must
/// guarantee that the handle points at a valid header inside the heap and that
/// no other live reference aliases the words being read or written. The
/// free-list accessors additionally require the block to be free, because for
/// allocated blocks those words belong to the client.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct Block(NonNull<Word>);

impl core::fmt::Debug for Block {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Block({:#x})", self.addr())
    }
}

impl Block {
    #[inline]
    pub(crate) fn from_header_ptr(ptr: NonNull<u8>) -> Self {
        debug_assert_eq!(ptr.as_ptr() as usize % WORD_SIZE, 0);
        Block(ptr.cast())
    }

    /// Get the block whose payload starts at `payload`.
    ///
    /// ### Safety
    ///
    /// `payload` must be at least one word past the start of the heap region.
    #[inline]
    pub(crate) unsafe fn from_payload(payload: NonNull<u8>) -> Self {
        Block(payload.cast::<Word>().sub(1))
    }

    #[inline]
    pub(crate) fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline]
    pub(crate) fn payload(self) -> NonNull<u8> {
        // Safety: the header is one word and the payload directly follows it,
        // still inside the block.
        unsafe { self.0.add(1).cast() }
    }

    #[inline]
    pub(crate) unsafe fn header(self) -> Header {
        Header(self.0.read())
    }

    #[inline]
    pub(crate) unsafe fn size(self) -> usize {
        self.header().size()
    }

    #[inline]
    pub(crate) unsafe fn is_allocated(self) -> bool {
        self.header().is_allocated()
    }

    #[inline]
    pub(crate) unsafe fn is_prev_allocated(self) -> bool {
        self.header().is_prev_allocated()
    }

    /// Bytes available to the client when this block is allocated.
    #[inline]
    pub(crate) unsafe fn payload_size(self) -> usize {
        self.size() - WORD_SIZE
    }

    /// Write this block's header.
    ///
    /// When `allocated` is true this also sets the "previous is allocated" bit
    /// on the physically next block, which is what lets allocated blocks go
    /// without a footer.
    ///
    /// ### Safety
    ///
    /// The block must lie within the heap and, when `allocated` is true and
    /// `size` is non-zero, so must the word at `self + size`.
    #[inline]
    pub(crate) unsafe fn write_header(self, size: usize, allocated: bool, prev_allocated: bool) {
        let header = Header::pack(size, allocated).with_prev_allocated(prev_allocated);
        self.0.write(header.0);

        if allocated {
            let next = self.next();
            // The epilogue is zero-sized and is its own successor.
            if next != self {
                next.set_prev_allocated(true);
            }
        }
    }

    /// Write this block's footer, mirroring its size and a clear allocated bit.
    ///
    /// ### Safety
    ///
    /// The block must be free and its header must already hold `size`.
    #[inline]
    pub(crate) unsafe fn write_footer(self, size: usize) {
        debug_assert!(!self.is_allocated());
        debug_assert_eq!(self.size(), size);
        self.footer_ptr().write(Header::pack(size, false).0);
    }

    #[inline]
    pub(crate) unsafe fn footer(self) -> Header {
        Header(self.footer_ptr().read())
    }

    #[inline]
    unsafe fn footer_ptr(self) -> NonNull<Word> {
        self.0.byte_add(self.size() - WORD_SIZE)
    }

    /// Update only the "previous is allocated" bit of this block's header.
    #[inline]
    pub(crate) unsafe fn set_prev_allocated(self, prev_allocated: bool) {
        let header = self.header().with_prev_allocated(prev_allocated);
        self.0.write(header.0);
    }

    /// The physically next block.
    #[inline]
    pub(crate) unsafe fn next(self) -> Block {
        Block(self.0.byte_add(self.size()))
    }

    /// The physically previous block, found through its footer.
    ///
    /// ### Safety
    ///
    /// The previous block must be free, i.e. this block's "previous is
    /// allocated" bit must be clear. Otherwise the word before this header is
    /// client payload.
    #[inline]
    pub(crate) unsafe fn prev(self) -> Block {
        debug_assert!(!self.is_prev_allocated());
        let footer = Header(self.0.sub(1).read());
        Block(self.0.byte_sub(footer.size()))
    }

    // Free-list node view. The first two payload words of a free block hold
    // the `next` and `previous` links of its bin's list.

    #[inline]
    unsafe fn link_ptr(self, index: usize) -> *mut Option<Block> {
        debug_assert!(!self.is_allocated());
        self.0.add(1 + index).as_ptr().cast()
    }

    #[inline]
    pub(crate) unsafe fn next_free(self) -> Option<Block> {
        self.link_ptr(0).read()
    }

    #[inline]
    pub(crate) unsafe fn set_next_free(self, next: Option<Block>) {
        self.link_ptr(0).write(next);
    }

    #[inline]
    pub(crate) unsafe fn prev_free(self) -> Option<Block> {
        self.link_ptr(1).read()
    }

    #[inline]
    pub(crate) unsafe fn set_prev_free(self, prev: Option<Block>) {
        self.link_ptr(1).write(prev);
    }
}

const _: () = assert!(mem::size_of::<Option<Block>>() == WORD_SIZE);
