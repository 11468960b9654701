//! Searching the bins for a free block that fits.
//!
//! We use a hybrid first- and best-fit search. Starting at the requested
//! size's class and moving towards larger classes, the first block that is
//! large enough becomes the candidate. Then we look at up to
//! `best_fit_threshold` more blocks in the same bin and adopt any strictly
//! smaller block that still fits. This bounds the search while avoiding the
//! worst fragmentation of pure first-fit.

use super::*;
use bins::{classify, Bins};
use block::Block;

impl Bins {
    /// Find a free block of at least `size` bytes, or `None` if no bin at or
    /// above `size`'s class has one.
    ///
    /// The block is not removed from its bin.
    ///
    /// ### Safety
    ///
    /// Every list must be well-formed and hold only valid free blocks.
    pub(crate) unsafe fn find_fit(&self, size: usize, best_fit_threshold: usize) -> Option<Block> {
        for class in classify(size)..NUM_SIZE_CLASSES {
            let mut blocks = self.iter(class);

            let Some(mut best) = blocks.by_ref().find(|b| b.size() >= size) else {
                continue;
            };

            // Refine within this same bin, but only for a bounded number of
            // blocks.
            let mut best_size = best.size();
            for block in blocks.take(best_fit_threshold) {
                if best_size == size {
                    break;
                }
                let block_size = block.size();
                if block_size >= size && block_size < best_size {
                    best = block;
                    best_size = block_size;
                }
            }

            return Some(best);
        }

        None
    }
}
