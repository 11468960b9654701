#![doc = include_str!("../README.md")]
#![no_std]
#![deny(missing_docs)]
#![cfg_attr(feature = "allocator_api", feature(allocator_api))]

#[cfg(test)]
extern crate std;

use cfg_if::cfg_if;
use core::{alloc::Layout, ptr::NonNull};

mod bins;
mod block;
mod check;
mod config;
mod fit;
mod heap;
mod locked;
mod source;

pub use check::{HeapStats, Violation};
pub use config::Config;
pub use heap::{FreeError, SegregatedHeap};
pub use locked::{Lock, LockedHeap, SingleThreadedLock};
#[cfg(feature = "spin")]
pub use locked::SpinLock;
pub use source::{GrowError, HeapSource, ReservedSource, SliceSource};

cfg_if! {
    if #[cfg(feature = "allocator_api")] {
        pub use core::alloc::{AllocError, Allocator};
    } else if #[cfg(feature = "allocator_api2")] {
        pub use allocator_api2::alloc::{AllocError, Allocator};
    } else {
        compile_error!("Must enable one of the `allocator_api` or `allocator_api2` cargo features");
    }
}

/// The alignment of every payload handed out by the heap, in bytes.
///
/// Every block size is a multiple of this, too.
pub const ALIGNMENT: usize = 16;

/// The number of segregated size classes.
pub const NUM_SIZE_CLASSES: usize = 12;

/// The smallest block the heap will ever carve out, in bytes.
///
/// A free block must hold its header, the two free-list links, and its footer.
pub const MIN_BLOCK_SIZE: usize = 4 * block::WORD_SIZE;

const _: () = assert!(MIN_BLOCK_SIZE % ALIGNMENT == 0);
const _: () = assert!(ALIGNMENT.is_power_of_two());
