use super::*;

/// Tunable parameters for a [`SegregatedHeap`].
///
/// The defaults are reasonable for general-purpose workloads, but nothing makes
/// them optimal; benchmark your own.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// The minimum number of bytes to request from the heap source whenever no
    /// free block fits an allocation.
    ///
    /// Larger chunks amortize growth; requests larger than a chunk grow the
    /// heap by exactly the (adjusted) request size.
    pub chunk_size: usize,

    /// How many further blocks to examine in a bin after finding the first
    /// block that fits, looking for a tighter fit.
    ///
    /// Zero means pure first-fit.
    pub best_fit_threshold: usize,
}

impl Default for Config {
    #[inline]
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl Config {
    /// The default configuration: 4KiB chunks and a best-fit threshold of 25.
    pub const DEFAULT: Config = Config {
        chunk_size: 4096,
        best_fit_threshold: 25,
    };

    /// Set the heap growth chunk size.
    #[inline]
    pub const fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Set the best-fit refinement threshold.
    #[inline]
    pub const fn with_best_fit_threshold(mut self, best_fit_threshold: usize) -> Self {
        self.best_fit_threshold = best_fit_threshold;
        self
    }

    /// The chunk size actually used: rounded up to the alignment and never
    /// smaller than a minimum block.
    #[inline]
    pub(crate) const fn effective_chunk_size(&self) -> usize {
        let rounded = self.chunk_size.saturating_add(ALIGNMENT - 1) & !(ALIGNMENT - 1);
        if rounded < MIN_BLOCK_SIZE {
            MIN_BLOCK_SIZE
        } else {
            rounded
        }
    }
}
