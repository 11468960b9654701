//! Segregated free lists.
//!
//! Free blocks are kept in [`NUM_SIZE_CLASSES`] bins keyed by power-of-two size
//! class. Each bin is an intrusive, doubly-linked, most-recently-freed-first
//! list whose nodes live in the payloads of the free blocks themselves.

use super::*;
use block::Block;

/// The smallest size that is not in the first size class.
const FIRST_CLASS_LIMIT: usize = 32;

/// Get the size class for a block of the given size.
///
/// Class 0 holds everything below 32 bytes, class `k` for `1 <= k <= 10` holds
/// `[2^(k+4), 2^(k+5))`, and the last class holds everything else.
#[inline]
pub(crate) fn classify(size: usize) -> usize {
    if size < FIRST_CLASS_LIMIT {
        return 0;
    }
    let log2 = size.ilog2() as usize;
    core::cmp::min(log2 - 4, NUM_SIZE_CLASSES - 1)
}

/// The heads of every size class's free list.
#[derive(Debug)]
pub(crate) struct Bins {
    heads: [Option<Block>; NUM_SIZE_CLASSES],
}

impl Bins {
    pub(crate) const fn new() -> Self {
        Bins {
            heads: [None; NUM_SIZE_CLASSES],
        }
    }

    #[inline]
    pub(crate) fn head(&self, class: usize) -> Option<Block> {
        self.heads[class]
    }

    /// Push a free block onto the front of its size class's list.
    ///
    /// ### Safety
    ///
    /// The block must be free, have a valid header, and not already be in any
    /// list.
    pub(crate) unsafe fn insert(&mut self, block: Block) {
        let class = classify(block.size());
        let head = self.heads[class];

        block.set_prev_free(None);
        block.set_next_free(head);
        if let Some(head) = head {
            head.set_prev_free(Some(block));
        }
        self.heads[class] = Some(block);
    }

    /// Unlink a free block from its size class's list.
    ///
    /// ### Safety
    ///
    /// The block must currently be in the list for its size class. Its header
    /// size must not have changed since it was inserted.
    pub(crate) unsafe fn remove(&mut self, block: Block) {
        let class = classify(block.size());
        let next = block.next_free();
        let prev = block.prev_free();

        match (prev, next) {
            (None, None) => {
                debug_assert_eq!(self.heads[class], Some(block));
                self.heads[class] = None;
            }
            (None, Some(next)) => {
                debug_assert_eq!(self.heads[class], Some(block));
                next.set_prev_free(None);
                self.heads[class] = Some(next);
            }
            (Some(prev), None) => {
                prev.set_next_free(None);
            }
            (Some(prev), Some(next)) => {
                prev.set_next_free(Some(next));
                next.set_prev_free(Some(prev));
            }
        }
    }

    /// Iterate over the blocks in one size class's list, head first.
    ///
    /// ### Safety
    ///
    /// The list must not be modified while the iterator is alive, and every
    /// node in it must be a valid free block.
    pub(crate) unsafe fn iter(&self, class: usize) -> BinIter {
        BinIter {
            next: self.heads[class],
        }
    }
}

pub(crate) struct BinIter {
    next: Option<Block>,
}

impl Iterator for BinIter {
    type Item = Block;

    #[inline]
    fn next(&mut self) -> Option<Block> {
        let block = self.next?;
        // Safety: upheld by the contract of `Bins::iter`.
        self.next = unsafe { block.next_free() };
        Some(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use block::{Word, WORD_SIZE};
    use std::{vec, vec::Vec};

    #[test]
    fn size_classes() {
        assert_eq!(classify(16), 0);
        assert_eq!(classify(31), 0);
        assert_eq!(classify(32), 1);
        assert_eq!(classify(48), 1);
        assert_eq!(classify(63), 1);
        assert_eq!(classify(64), 2);
        assert_eq!(classify(127), 2);
        assert_eq!(classify(128), 3);
        assert_eq!(classify(4095), 7);
        assert_eq!(classify(4096), 8);
        assert_eq!(classify(8192), 9);
        assert_eq!(classify(16383), 9);
        assert_eq!(classify(16384), 10);
        assert_eq!(classify(32767), 10);
        assert_eq!(classify(32768), 11);
        assert_eq!(classify(1 << 40), 11);
        assert_eq!(classify(usize::MAX & !15), 11);
    }

    /// Lay out `n` free blocks of `size` bytes back to back.
    fn free_blocks(words: &mut [Word], n: usize, size: usize) -> Vec<Block> {
        (0..n)
            .map(|i| {
                let block =
                    Block::from_header_ptr(NonNull::from(&mut words[i * size / WORD_SIZE]).cast());
                unsafe {
                    block.write_header(size, false, true);
                    block.write_footer(size);
                }
                block
            })
            .collect()
    }

    fn contents(bins: &Bins, class: usize) -> Vec<Block> {
        unsafe { bins.iter(class).collect() }
    }

    #[test]
    fn insert_is_lifo() {
        let mut words = vec![0; 64];
        let blocks = free_blocks(&mut words, 3, 64);
        let mut bins = Bins::new();
        unsafe {
            for b in &blocks {
                bins.insert(*b);
            }
        }
        assert_eq!(contents(&bins, 2), [blocks[2], blocks[1], blocks[0]]);
        assert!(contents(&bins, 1).is_empty());
    }

    #[test]
    fn remove_every_position() {
        let mut words = vec![0; 128];
        let blocks = free_blocks(&mut words, 5, 64);
        let mut bins = Bins::new();
        unsafe {
            for b in &blocks {
                bins.insert(*b);
            }

            // Interior.
            bins.remove(blocks[2]);
            assert_eq!(contents(&bins, 2), [blocks[4], blocks[3], blocks[1], blocks[0]]);

            // Tail.
            bins.remove(blocks[0]);
            assert_eq!(contents(&bins, 2), [blocks[4], blocks[3], blocks[1]]);

            // Head.
            bins.remove(blocks[4]);
            assert_eq!(contents(&bins, 2), [blocks[3], blocks[1]]);
            assert_eq!(blocks[3].prev_free(), None);

            bins.remove(blocks[1]);
            assert_eq!(contents(&bins, 2), [blocks[3]]);

            // Sole element.
            bins.remove(blocks[3]);
            assert!(contents(&bins, 2).is_empty());
            assert_eq!(bins.head(2), None);
        }
    }

    #[test]
    fn links_stay_symmetric() {
        let mut words = vec![0; 128];
        let blocks = free_blocks(&mut words, 4, 64);
        let mut bins = Bins::new();
        unsafe {
            for b in &blocks {
                bins.insert(*b);
            }
            bins.remove(blocks[1]);
            for b in bins.iter(2) {
                if let Some(next) = b.next_free() {
                    assert_eq!(next.prev_free(), Some(b));
                }
                if let Some(prev) = b.prev_free() {
                    assert_eq!(prev.next_free(), Some(b));
                }
            }
        }
    }
}
