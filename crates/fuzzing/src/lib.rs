//! Shared fuzzing and testing infrastructure for `segfit`.

use allocator_api2::alloc::Global;
use mutatis::{mutators as m, DefaultMutate, Generate, Mutate};
use segfit::{Config, HeapSource, ReservedSource, SegregatedHeap, ALIGNMENT};
use std::{collections::BTreeMap, ptr::NonNull};

/// The size of a test request, in bytes.
//
// A newtype so that we can give it a default mutator that keeps requests
// within something the test heap could plausibly satisfy.
#[derive(Clone, Copy, Debug, Default, bincode::Encode, bincode::Decode)]
pub struct Size {
    bytes: usize,
}

impl Size {
    /// Create a new `Size` of the given number of bytes.
    pub fn new(bytes: usize) -> Self {
        Size { bytes }
    }
}

impl DefaultMutate for Size {
    type DefaultMutate = SizeMutator;
}

/// A mutator for `Size`s with a configurable maximum.
#[derive(Debug)]
pub struct SizeMutator {
    pub max: usize,
}

impl Default for SizeMutator {
    fn default() -> Self {
        // Large enough to reach the top size classes and to force growth by
        // more than a default chunk.
        Self { max: 40_000 }
    }
}

impl Mutate<Size> for SizeMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, size: &mut Size) -> mutatis::Result<()> {
        c.mutation(|ctx| {
            let max = if ctx.shrink() { size.bytes } else { self.max };
            size.bytes = ctx.rng().gen_index(max.saturating_add(1)).unwrap();
            Ok(())
        })?;

        // Bias towards small requests, which is where most blocks live.
        if !c.shrink() {
            c.mutation(|ctx| {
                size.bytes = ctx.rng().gen_index(129).unwrap();
                Ok(())
            })?;
        }

        Ok(())
    }
}

impl Generate<Size> for SizeMutator {
    fn generate(&mut self, context: &mut mutatis::Context) -> mutatis::Result<Size> {
        let bytes = m::range(0..=self.max).generate(context)?;
        Ok(Size { bytes })
    }
}

/// A test operation.
#[derive(Clone, Debug, Mutate, bincode::Encode, bincode::Decode)]
pub enum Op {
    Allocate {
        id: u32,
        size: Size,
    },
    Free {
        id: u32,
    },
    Resize {
        id: u32,
        size: Size,
    },
    ZeroAllocate {
        id: u32,
        count: u8,
        element_size: Size,
    },
}

impl Op {
    fn id_mut(&mut self) -> &mut u32 {
        match self {
            Op::Allocate { id, .. }
            | Op::Free { id }
            | Op::Resize { id, .. }
            | Op::ZeroAllocate { id, .. } => id,
        }
    }
}

impl Generate<Op> for OpMutator {
    fn generate(&mut self, ctx: &mut mutatis::Context) -> mutatis::Result<Op> {
        let choices: &[fn(&mut mutatis::Context) -> mutatis::Result<Op>] = &[
            |ctx| {
                Ok(Op::Allocate {
                    id: ctx.rng().gen_u32(),
                    size: m::default::<Size>().generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::Free {
                    id: ctx.rng().gen_u32(),
                })
            },
            |ctx| {
                Ok(Op::Resize {
                    id: ctx.rng().gen_u32(),
                    size: m::default::<Size>().generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::ZeroAllocate {
                    id: ctx.rng().gen_u32(),
                    count: ctx.rng().gen_u8(),
                    element_size: m::default::<Size>().generate(ctx)?,
                })
            },
        ];

        let f = ctx.rng().choose(choices).unwrap();
        f(ctx)
    }
}

/// A sequence of test operations to perform.
#[derive(Clone, Debug, Default, bincode::Encode, bincode::Decode)]
pub struct Ops {
    ops: Vec<Op>,
}

impl DefaultMutate for Ops {
    type DefaultMutate = OpsMutator;
}

#[derive(Default)]
pub struct OpsMutator;

impl Mutate<Ops> for OpsMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, ops: &mut Ops) -> mutatis::Result<()> {
        // Completely random mutations on a single-element basis.
        m::default::<Vec<Op>>().mutate(c, &mut ops.ops)?;

        fn alloc_positions_and_ids(ops: &Ops) -> impl Iterator<Item = (usize, u32)> + '_ {
            ops.ops.iter().enumerate().filter_map(|(i, op)| match op {
                Op::Allocate { id, .. } | Op::ZeroAllocate { id, .. } => Some((i, *id)),
                _ => None,
            })
        }

        // Retarget an operation to an existing `id`.
        c.mutation(|ctx| {
            let num_allocs = alloc_positions_and_ids(ops).count();
            if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                let (_, new_id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                let op_index = ctx.rng().gen_index(ops.ops.len()).unwrap();
                *ops.ops[op_index].id_mut() = new_id;
            }
            Ok(())
        })?;

        // Free an existing allocation at some later point.
        if !c.shrink() {
            c.mutation(|ctx| {
                let num_allocs = alloc_positions_and_ids(ops).count();
                if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                    let (op_index, id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                    let free_index =
                        op_index + 1 + ctx.rng().gen_index(ops.ops.len() - op_index).unwrap();
                    ops.ops.insert(free_index, Op::Free { id });
                }
                Ok(())
            })?;
        }

        // Resize an existing allocation at some later point.
        if !c.shrink() {
            c.mutation(|ctx| {
                let num_allocs = alloc_positions_and_ids(ops).count();
                if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                    let (op_index, id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                    let size = m::default::<Size>().generate(ctx)?;
                    let resize_index =
                        op_index + 1 + ctx.rng().gen_index(ops.ops.len() - op_index).unwrap();
                    ops.ops.insert(resize_index, Op::Resize { id, size });
                }
                Ok(())
            })?;
        }

        Ok(())
    }
}

/// A whole fuzz case: heap tuning plus the operations to run against it.
#[derive(Clone, Debug, Default, Mutate, bincode::Encode, bincode::Decode)]
pub struct Case {
    /// Chunk size, in units of [`ALIGNMENT`] bytes.
    pub chunk_units: u16,
    pub best_fit_threshold: u8,
    pub ops: Ops,
}

impl Case {
    /// The heap configuration for this case. Zero chunk units mean the
    /// default chunk size.
    pub fn config(&self) -> Config {
        let config = Config::DEFAULT.with_best_fit_threshold(usize::from(self.best_fit_threshold));
        match self.chunk_units {
            0 => config,
            units => config.with_chunk_size(usize::from(units) * ALIGNMENT),
        }
    }

    /// Remove the last operation, returning whether there was one to remove.
    pub fn pop(&mut self) -> bool {
        self.ops.pop()
    }

    /// Run this case against a fresh heap of at most `heap_limit` bytes.
    pub fn run(&self, heap_limit: usize) -> Result<(), String> {
        log::debug!("running with {:?}", self.config());
        let mut heap = SegregatedHeap::new(ReservedSource::new(Global, heap_limit), self.config());
        self.ops.run_with_heap(&mut heap)
    }
}

macro_rules! ensure {
    ( $cond:expr , $msg:expr $( , $args:expr )* $(,)? ) => {{
        let cond = $cond;
        if !cond {
            let msg = format!($msg $( , $args )* );
            let str_cond = stringify!($cond);
            return Err(format!("check failed: `{str_cond}`: {msg}"));
        }
    }};
}

impl Ops {
    /// Create a new `Ops` from the given test operations.
    pub fn new(ops: impl IntoIterator<Item = Op>) -> Self {
        let ops = ops.into_iter().collect();
        Ops { ops }
    }

    /// Remove the last operation, returning whether there was one to remove.
    pub fn pop(&mut self) -> bool {
        self.ops.pop().is_some()
    }

    /// Run these test operations against a fresh heap of at most `heap_limit`
    /// bytes.
    pub fn run(&self, heap_limit: usize) -> Result<(), String> {
        let mut heap = SegregatedHeap::new(ReservedSource::new(Global, heap_limit), Config::DEFAULT);
        self.run_with_heap(&mut heap)
    }

    /// Run these test operations against the given heap.
    ///
    /// Every live allocation the ops create is freed again before returning.
    pub fn run_with_heap<S>(&self, heap: &mut SegregatedHeap<S>) -> Result<(), String>
    where
        S: HeapSource,
    {
        log::debug!("========== Running test operations ==========");

        let mut live = LiveMap::default();

        // Interpret each op and check that our invariants are upheld and
        // properties are maintained as we go!
        for op in &self.ops {
            log::debug!("Running {op:?}");

            match op {
                Op::Allocate { id, size } => {
                    let size = size.bytes;
                    match heap.allocate(size) {
                        None => ensure!(
                            size == 0 || heap.source_exhausted_for(size),
                            "allocating {size} bytes failed with room to spare",
                        ),
                        Some(ptr) => {
                            ensure!(size != 0, "zero-sized allocation returned {ptr:p}");
                            let alloc = live.check_new(heap, ptr, size)?;
                            alloc.fill(LIVE_POISON_PATTERN);
                            if let Some(old) = live.insert(*id, alloc) {
                                free(heap, *id, old);
                            }
                        }
                    }
                }

                Op::Free { id } => {
                    if let Some(alloc) = live.remove(*id) {
                        ensure!(
                            alloc.contents().iter().all(|b| *b == LIVE_POISON_PATTERN),
                            "live allocation id{id} was clobbered",
                        );
                        free(heap, *id, alloc);
                    }
                }

                Op::Resize { id, size } => {
                    let size = size.bytes;
                    let Some(old) = live.remove(*id) else {
                        continue;
                    };

                    if size == 0 {
                        let result = unsafe { heap.resize(Some(old.ptr), 0) };
                        ensure!(result.is_none(), "resizing to zero returned a pointer");
                        continue;
                    }

                    match unsafe { heap.resize(Some(old.ptr), size) } {
                        None => {
                            // The original must be untouched.
                            ensure!(
                                old.contents().iter().all(|b| *b == LIVE_POISON_PATTERN),
                                "failed resize of id{id} modified the original allocation",
                            );
                            live.insert(*id, old);
                        }
                        Some(ptr) => {
                            let alloc = live.check_new(heap, ptr, size)?;
                            let kept = std::cmp::min(old.size, size);
                            ensure!(
                                alloc.contents()[..kept]
                                    .iter()
                                    .all(|b| *b == LIVE_POISON_PATTERN),
                                "resize of id{id} did not preserve the first {kept} bytes",
                            );
                            alloc.fill(LIVE_POISON_PATTERN);
                            live.insert(*id, alloc);
                        }
                    }
                }

                Op::ZeroAllocate {
                    id,
                    count,
                    element_size,
                } => {
                    let count = usize::from(*count);
                    let Some(size) = count.checked_mul(element_size.bytes) else {
                        let heap_size = heap.heap_size();
                        let result = heap.zero_allocate(count, element_size.bytes);
                        ensure!(
                            result.is_none(),
                            "zero-allocating an overflowing {count} x {} bytes succeeded",
                            element_size.bytes,
                        );
                        ensure!(
                            heap.heap_size() == heap_size,
                            "an overflowing zero-allocation grew the heap",
                        );
                        continue;
                    };
                    match heap.zero_allocate(count, element_size.bytes) {
                        None => ensure!(
                            size == 0 || heap.source_exhausted_for(size),
                            "zero-allocating {size} bytes failed with room to spare",
                        ),
                        Some(ptr) => {
                            ensure!(size != 0, "zero-sized allocation returned {ptr:p}");
                            let alloc = live.check_new(heap, ptr, size)?;
                            ensure!(
                                alloc.contents().iter().all(|b| *b == 0),
                                "supposedly zeroed block of memory contains non-zero byte",
                            );
                            alloc.fill(LIVE_POISON_PATTERN);
                            if let Some(old) = live.insert(*id, alloc) {
                                free(heap, *id, old);
                            }
                        }
                    }
                }
            }

            if let Err(violation) = heap.check() {
                return Err(format!("heap inconsistent after {op:?}: {violation}"));
            }
        }

        // Finally, free any remaining live allocations.
        for (id, alloc) in std::mem::take(&mut live.map) {
            free(heap, id, alloc);
        }

        let stats = heap.check().map_err(|v| format!("heap inconsistent at exit: {v}"))?;
        ensure!(
            stats.allocated_blocks == 0,
            "{} blocks still allocated after freeing everything",
            stats.allocated_blocks,
        );
        ensure!(
            stats.free_blocks <= 1,
            "free space is split across {} blocks after freeing everything",
            stats.free_blocks,
        );

        Ok(())
    }
}

/// Poison and free a live allocation.
fn free<S>(heap: &mut SegregatedHeap<S>, id: u32, alloc: LiveAlloc)
where
    S: HeapSource,
{
    log::debug!("freeing id{id} -> {alloc:?}");
    alloc.fill(FREE_POISON_PATTERN);
    unsafe { heap.free(Some(alloc.ptr)) };
}

/// Whether a failed request may be blamed on the heap having no room left.
trait Exhaustion {
    fn source_exhausted_for(&self, size: usize) -> bool;
}

impl<S> Exhaustion for SegregatedHeap<S>
where
    S: HeapSource,
{
    fn source_exhausted_for(&self, size: usize) -> bool {
        // A request only fails when no free block fits its adjusted size,
        // which is at most `size + 2 * ALIGNMENT - 8` and never below 32.
        self.check().map_or(true, |stats| {
            stats.largest_free_block < std::cmp::max(size.saturating_add(2 * ALIGNMENT), 32)
        })
    }
}

// We fill live memory with a poison pattern so that any allocator write into
// a live block shows up, and freed memory with another so that handing out
// memory that is still in use shows up too.
const LIVE_POISON_PATTERN: u8 = 0xAA;
const FREE_POISON_PATTERN: u8 = 0xFF;

/// A currently-live allocation.
struct LiveAlloc {
    ptr: NonNull<u8>,
    /// Requested size.
    size: usize,
    /// Usable size reported by the heap. All of it is filled with
    /// `LIVE_POISON_PATTERN`.
    usable: usize,
}

impl LiveAlloc {
    /// Fill the whole usable region with the given byte.
    fn fill(&self, byte: u8) {
        unsafe { self.ptr.as_ptr().write_bytes(byte, self.usable) };
    }

    fn contents(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.usable) }
    }
}

impl std::fmt::Debug for LiveAlloc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let LiveAlloc { ptr, size, usable } = self;
        f.debug_struct("LiveAlloc")
            .field("ptr", &format!("{ptr:p}"))
            .field("size", &size)
            .field("usable", &usable)
            .finish()
    }
}

/// The set of currently-live allocations, keyed by ID.
#[derive(Default)]
struct LiveMap {
    map: BTreeMap<u32, LiveAlloc>,
}

impl LiveMap {
    /// Insert a new live allocation, returning any previous allocation with
    /// the same ID so that it can be freed.
    fn insert(&mut self, id: u32, alloc: LiveAlloc) -> Option<LiveAlloc> {
        self.map.insert(id, alloc)
    }

    fn remove(&mut self, id: u32) -> Option<LiveAlloc> {
        self.map.remove(&id)
    }

    /// Check the properties every fresh allocation must have.
    fn check_new<S>(
        &self,
        heap: &SegregatedHeap<S>,
        ptr: NonNull<u8>,
        size: usize,
    ) -> Result<LiveAlloc, String>
    where
        S: HeapSource,
    {
        let usable = unsafe { heap.usable_size(ptr) };
        log::debug!("new allocation: {{ address: {ptr:p}, size: {size}, usable: {usable} }}");

        ensure!(
            ptr.as_ptr() as usize % ALIGNMENT == 0,
            "allocation at {ptr:p} is not {ALIGNMENT}-byte aligned",
        );
        ensure!(
            size <= usable,
            "usable size {usable} is less than the requested {size} bytes",
        );

        let start = ptr.as_ptr() as usize;
        let end = start + usable;
        for other in self.map.values() {
            let other_start = other.ptr.as_ptr() as usize;
            let other_end = other_start + other.usable;
            ensure!(
                end <= other_start || other_end <= start,
                "two distinct live allocations should never overlap",
            );
        }

        Ok(LiveAlloc { ptr, size, usable })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mutatis::check::{Check, CheckError, CheckFailure};

    fn size(bytes: usize) -> Size {
        Size::new(bytes)
    }

    #[test]
    fn run_ops() {
        let _ = env_logger::try_init();

        let seed_corpus = [
            // Empty.
            Ops::default(),
            // Simple allocate/free pair.
            Ops::new([
                Op::Allocate {
                    id: 0,
                    size: size(8),
                },
                Op::Free { id: 0 },
            ]),
            // Zero-sized requests.
            Ops::new([
                Op::Allocate {
                    id: 0,
                    size: size(0),
                },
                Op::ZeroAllocate {
                    id: 1,
                    count: 0,
                    element_size: size(8),
                },
            ]),
            // Two neighbors freed in both orders, so they coalesce.
            Ops::new([
                Op::Allocate {
                    id: 0,
                    size: size(5000),
                },
                Op::Allocate {
                    id: 1,
                    size: size(5000),
                },
                Op::Free { id: 1 },
                Op::Free { id: 0 },
                Op::Allocate {
                    id: 2,
                    size: size(9000),
                },
            ]),
            // Grow, shrink, then resize to zero.
            Ops::new([
                Op::ZeroAllocate {
                    id: 0,
                    count: 10,
                    element_size: size(4),
                },
                Op::Resize {
                    id: 0,
                    size: size(4000),
                },
                Op::Resize {
                    id: 0,
                    size: size(17),
                },
                Op::Resize {
                    id: 0,
                    size: size(0),
                },
            ]),
            // A request larger than the whole heap.
            Ops::new([Op::Allocate {
                id: 0,
                size: size(usize::MAX / 2),
            }]),
            // A zero-allocation whose total size overflows.
            Ops::new([Op::ZeroAllocate {
                id: 0,
                count: 255,
                element_size: size(usize::MAX / 16),
            }]),
        ];

        match Check::new().iters(100_000).shrink_iters(1).run_with(
            m::default::<Ops>(),
            seed_corpus,
            |ops| {
                let megabyte = 1 << 20;
                ops.run(megabyte)
            },
        ) {
            Ok(()) => {}
            Err(CheckError::Failed(CheckFailure { value, message, .. })) => {
                panic!("test failure: {message}: {value:#?}")
            }
            Err(e) => panic!("check error: {e}"),
        }
    }

    #[test]
    fn overflowing_zero_allocate_is_rejected() {
        let _ = env_logger::try_init();
        let ops = Ops::new([
            Op::Allocate {
                id: 0,
                size: size(64),
            },
            Op::ZeroAllocate {
                id: 1,
                count: 255,
                element_size: size(usize::MAX / 16),
            },
            Op::ZeroAllocate {
                id: 2,
                count: 2,
                element_size: size(usize::MAX),
            },
            Op::Free { id: 0 },
        ]);
        ops.run(1 << 20).unwrap();
    }

    #[test]
    fn shrinking_the_largest_size() {
        // Shrinking may only ever pick sizes up to the current one, which must
        // not overflow when the current size is `usize::MAX`.
        let mut session = mutatis::Session::new().seed(7).shrink(true);
        let mut size = Size::new(usize::MAX);
        for _ in 0..100 {
            let _ = session.mutate(&mut size);
        }
    }
}
