//! Heap consistency checking.
//!
//! Not used on any allocation path. Tests call [`SegregatedHeap::check`]
//! directly, and the `check_invariants` feature calls it around every public
//! operation.

use super::*;
use bins::classify;
use block::{Block, Header, WORD_SIZE};
use core::fmt;

/// Summary statistics about a heap, gathered by walking every block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Total bytes obtained from the heap source.
    pub heap_size: usize,
    /// Number of allocated blocks.
    pub allocated_blocks: usize,
    /// Bytes in allocated blocks, including their headers.
    pub allocated_bytes: usize,
    /// Number of free blocks.
    pub free_blocks: usize,
    /// Bytes in free blocks, including their headers and footers.
    pub free_bytes: usize,
    /// The size of the largest free block, or zero if there is none.
    pub largest_free_block: usize,
    /// The number of free blocks in each size class.
    pub bin_lengths: [usize; NUM_SIZE_CLASSES],
}

/// An inconsistency found in a heap's internal data structures.
///
/// Any of these means the heap is corrupt, usually because a client wrote out
/// of bounds of an allocation or freed something it should not have.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Violation {
    /// A block's payload is not [`ALIGNMENT`]-byte aligned.
    Misaligned {
        /// The block's header address.
        block: usize,
    },

    /// A block's size is too small, not a multiple of [`ALIGNMENT`], or runs
    /// past the end of the heap.
    BadSize {
        /// The block's header address.
        block: usize,
        /// The size in its header.
        size: usize,
    },

    /// A free block's footer does not mirror its header.
    FooterMismatch {
        /// The block's header address.
        block: usize,
        /// The size in its header.
        header_size: usize,
        /// The size in its footer.
        footer_size: usize,
    },

    /// A block's "previous is allocated" bit disagrees with the previous
    /// block.
    PrevAllocatedMismatch {
        /// The block's header address.
        block: usize,
        /// Whether the previous block is actually allocated.
        prev_allocated: bool,
    },

    /// Two physically adjacent blocks are both free.
    AdjacentFree {
        /// The header address of the second free block.
        block: usize,
    },

    /// The epilogue is not a zero-sized allocated block.
    BadEpilogue {
        /// The epilogue's header address.
        block: usize,
    },

    /// A bin links to an address outside the heap.
    BinnedOutOfBounds {
        /// The size class.
        bin: usize,
        /// The linked address.
        block: usize,
    },

    /// A bin contains an allocated block.
    BinnedAllocated {
        /// The size class.
        bin: usize,
        /// The block's header address.
        block: usize,
    },

    /// A bin contains a block from another size class.
    WrongBin {
        /// The size class of the bin the block is in.
        bin: usize,
        /// The block's header address.
        block: usize,
        /// The block's size.
        size: usize,
    },

    /// A bin's next and previous links do not mirror each other.
    BrokenLink {
        /// The size class.
        bin: usize,
        /// The header address of the block whose links are broken.
        block: usize,
    },

    /// The number of free blocks in the heap and in the bins differ, so some
    /// free block is not binned.
    UnbinnedFree {
        /// Free blocks found by walking the heap.
        in_heap: usize,
        /// Free blocks found by walking the bins.
        in_bins: usize,
    },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Violation::Misaligned { block } => {
                write!(f, "block {block:#x}: payload is not {ALIGNMENT}-byte aligned")
            }
            Violation::BadSize { block, size } => {
                write!(f, "block {block:#x}: bad size {size:#x}")
            }
            Violation::FooterMismatch {
                block,
                header_size,
                footer_size,
            } => write!(
                f,
                "block {block:#x}: header size {header_size:#x} but footer size {footer_size:#x}"
            ),
            Violation::PrevAllocatedMismatch {
                block,
                prev_allocated,
            } => write!(
                f,
                "block {block:#x}: previous block allocated = {prev_allocated}, but header disagrees"
            ),
            Violation::AdjacentFree { block } => {
                write!(f, "block {block:#x}: free and follows another free block")
            }
            Violation::BadEpilogue { block } => write!(f, "bad epilogue at {block:#x}"),
            Violation::BinnedOutOfBounds { bin, block } => {
                write!(f, "bin {bin}: links to {block:#x}, outside the heap")
            }
            Violation::BinnedAllocated { bin, block } => {
                write!(f, "bin {bin}: block {block:#x} is allocated")
            }
            Violation::WrongBin { bin, block, size } => write!(
                f,
                "bin {bin}: block {block:#x} of size {size:#x} belongs in bin {}",
                classify(size)
            ),
            Violation::BrokenLink { bin, block } => {
                write!(f, "bin {bin}: links around block {block:#x} are not symmetric")
            }
            Violation::UnbinnedFree { in_heap, in_bins } => write!(
                f,
                "{in_heap} free blocks in the heap but {in_bins} free blocks in bins"
            ),
        }
    }
}

impl<S> SegregatedHeap<S>
where
    S: HeapSource,
{
    /// Verify the heap's invariants, returning statistics about it or the first
    /// violation found.
    ///
    /// Checks every bin's links and membership, then walks every block from
    /// the prologue to the epilogue checking alignment, sizes, footers, the
    /// "previous is allocated" bits, and that coalescing left no two free
    /// blocks adjacent.
    pub fn check(&self) -> Result<HeapStats, Violation> {
        let mut stats = HeapStats {
            heap_size: self.heap_size(),
            ..HeapStats::default()
        };
        let Some(bounds) = self.bounds else {
            return Ok(stats);
        };

        // Safety: every block is bounds-checked before we read from it, and
        // nothing else can touch the heap while we hold `&self`.
        unsafe {
            let in_bins = self.check_bins(bounds.first, bounds.epilogue, &mut stats)?;
            self.walk_heap(bounds.first, bounds.epilogue, &mut stats)?;
            if in_bins != stats.free_blocks {
                return Err(Violation::UnbinnedFree {
                    in_heap: stats.free_blocks,
                    in_bins,
                });
            }
        }

        Ok(stats)
    }

    /// Gather statistics about the heap.
    ///
    /// ### Panics
    ///
    /// If the heap is inconsistent (see [`check`](Self::check)).
    pub fn stats(&self) -> HeapStats {
        match self.check() {
            Ok(stats) => stats,
            Err(violation) => panic!("heap inconsistent: {violation}"),
        }
    }

    unsafe fn check_bins(
        &self,
        first: Block,
        epilogue: Block,
        stats: &mut HeapStats,
    ) -> Result<usize, Violation> {
        let in_heap = |block: Block| {
            block.addr() >= first.addr()
                && block.addr() < epilogue.addr()
                && block.payload().as_ptr() as usize % ALIGNMENT == 0
        };
        let mut total = 0;

        for bin in 0..NUM_SIZE_CLASSES {
            let mut prev: Option<Block> = None;
            let mut cursor = self.bins.head(bin);
            let mut len = 0;

            while let Some(block) = cursor {
                if !in_heap(block) {
                    return Err(Violation::BinnedOutOfBounds {
                        bin,
                        block: block.addr(),
                    });
                }
                if block.is_allocated() {
                    return Err(Violation::BinnedAllocated {
                        bin,
                        block: block.addr(),
                    });
                }
                let size = block.size();
                if classify(size) != bin {
                    return Err(Violation::WrongBin {
                        bin,
                        block: block.addr(),
                        size,
                    });
                }
                // A list that loops back revisits some node with a different
                // predecessor, so this also guarantees the walk ends.
                if block.prev_free() != prev {
                    return Err(Violation::BrokenLink {
                        bin,
                        block: block.addr(),
                    });
                }

                len += 1;
                prev = Some(block);
                cursor = block.next_free();
            }

            stats.bin_lengths[bin] = len;
            total += len;
        }

        Ok(total)
    }

    unsafe fn walk_heap(
        &self,
        first: Block,
        epilogue: Block,
        stats: &mut HeapStats,
    ) -> Result<(), Violation> {
        // The prologue counts as allocated.
        let mut prev_allocated = true;
        let mut block = first;

        while block != epilogue {
            let addr = block.addr();
            if block.payload().as_ptr() as usize % ALIGNMENT != 0 {
                return Err(Violation::Misaligned { block: addr });
            }

            let header = block.header();
            let size = header.size();
            if size < MIN_BLOCK_SIZE || size > epilogue.addr() - addr {
                return Err(Violation::BadSize { block: addr, size });
            }
            if header.is_prev_allocated() != prev_allocated {
                return Err(Violation::PrevAllocatedMismatch {
                    block: addr,
                    prev_allocated,
                });
            }

            if header.is_allocated() {
                stats.allocated_blocks += 1;
                stats.allocated_bytes += size;
            } else {
                if !prev_allocated {
                    return Err(Violation::AdjacentFree { block: addr });
                }
                let footer = block.footer();
                if footer != Header::pack(size, false) {
                    return Err(Violation::FooterMismatch {
                        block: addr,
                        header_size: size,
                        footer_size: footer.size(),
                    });
                }
                stats.free_blocks += 1;
                stats.free_bytes += size;
                stats.largest_free_block = stats.largest_free_block.max(size);
            }

            prev_allocated = header.is_allocated();
            block = block.next();
        }

        let header = epilogue.header();
        if header.size() != 0 || !header.is_allocated() {
            return Err(Violation::BadEpilogue {
                block: epilogue.addr(),
            });
        }
        if header.is_prev_allocated() != prev_allocated {
            return Err(Violation::PrevAllocatedMismatch {
                block: epilogue.addr(),
                prev_allocated,
            });
        }

        Ok(())
    }
}
