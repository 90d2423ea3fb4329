//! Boundary-tag allocator implementation.
//!
//! The arena is partitioned into chunks that are either free or in use. Every
//! chunk starts with a one-word *boundary tag* holding the chunk size, with
//! the lowest bit set while the chunk is in use. The payload handed to the
//! caller starts right after the tag, so the tag can be found again from the
//! payload address alone.
//!
//! # Memory Layout
//!
//! ```text
//! chunk:
//! ┌──────────────────────┬────────────────────────────────────┐
//! │ tag: size | USED_BIT │ payload (returned to the caller)   │
//! └──────────────────────┴────────────────────────────────────┘
//! ^ offset               ^ offset + TAG_SIZE
//! ```
//!
//! The tag is not trusted on its own. A block table kept outside the arena is
//! the authoritative record; on every free the tag in the arena is compared
//! with the table entry, so a caller that scribbled over the tag gets a
//! [`DeallocError::CorruptTag`] instead of a corrupted heap.
//!
//! # Algorithm
//!
//! - **Allocation**: the free chunks whose payload can hold the request are
//!   handed to the configured [`SelectionPolicy`]. The chosen chunk is split
//!   when the remainder can still hold a minimal chunk.
//! - **Deallocation**: the chunk is looked up from its tag, validated, marked
//!   free and then coalesced.
//! - **Coalescing**: the block table is sorted by address and neighbouring
//!   *free* chunks are merged in a single linear pass. Chunks in use are never
//!   merged.
//!
//! # Usage Example
//!
//! ```rust
//! use arena_alloc::{ArenaAllocator as _, SelectionPolicy, boundary_tag::BoundaryTagAllocator};
//!
//! let mut allocator = BoundaryTagAllocator::new(1024, SelectionPolicy::BestFit).unwrap();
//! let ptr = allocator.allocate(100).unwrap();
//! unsafe {
//!     ptr.write_bytes(0xaa, 100);
//!     allocator.deallocate(ptr, 100).unwrap();
//! }
//! assert_eq!(allocator.free_blocks().len(), 1);
//! ```
//!
//! # Performance Characteristics
//!
//! - **Allocation**: O(n) where n is the number of chunks
//! - **Deallocation**: O(n) for the coalescing pass
//! - **Memory Overhead**: one word per chunk inside the arena

use alloc::vec::Vec;
use core::ptr::NonNull;

use log::{debug, trace, warn};
use snafu::{OptionExt as _, ensure};

use crate::{
    ArenaAllocator,
    arena::{Arena, WORD_SIZE, align_to_word},
    block::{BlockDescriptor, BlockState},
    error::{
        AdjacentFreeSnafu, ArenaError, BlockOutOfArenaSnafu, CorruptTagSnafu, DeallocError,
        DoubleFreeSnafu, ForeignPointerSnafu, GapSnafu, IncompleteCoverSnafu, InvariantError,
        MisalignedBlockSnafu, OverlapSnafu, SizeMismatchSnafu, TagMismatchSnafu, TooSmallSnafu,
        UnknownBlockSnafu, ZeroSizeSnafu,
    },
    policy::SelectionPolicy,
    stats::AllocStats,
};

/// Size of the boundary tag preceding every payload.
pub const TAG_SIZE: usize = WORD_SIZE;

/// Smallest chunk worth keeping: a tag and one word of payload.
pub const MIN_BLOCK_SIZE: usize = TAG_SIZE + WORD_SIZE;

/// Set in a tag while its chunk is in use. Chunk sizes are multiples of
/// [`WORD_SIZE`], so the bit is never part of the size.
const USED_BIT: usize = 1;

fn encode_tag(block: &BlockDescriptor) -> usize {
    let used = if block.state.is_used() { USED_BIT } else { 0 };
    block.size | used
}

/// A first/best/worst-fit allocator over a single arena using boundary tags.
///
/// # Thread Safety
///
/// This allocator is `Send` but not `Sync`. It can be moved between threads but
/// requires external synchronization for concurrent access.
pub struct BoundaryTagAllocator {
    arena: Arena,
    policy: SelectionPolicy,
    /// Every chunk of the arena, sorted by offset.
    blocks: Vec<BlockDescriptor>,
}

impl BoundaryTagAllocator {
    /// Creates an allocator managing an arena of `total_size` bytes.
    ///
    /// `total_size` is rounded down to a multiple of [`WORD_SIZE`]. The whole
    /// arena starts out as one free chunk.
    pub fn new(total_size: usize, policy: SelectionPolicy) -> Result<Self, ArenaError> {
        ensure!(total_size > 0, ZeroSizeSnafu);
        let usable = total_size - total_size % WORD_SIZE;
        ensure!(
            usable >= MIN_BLOCK_SIZE,
            TooSmallSnafu {
                size: total_size,
                minimum: MIN_BLOCK_SIZE,
            }
        );
        if usable != total_size {
            debug!("boundary-tag arena rounded down from {total_size} to {usable} bytes");
        }

        let arena = Arena::new(usable)?;
        let initial = BlockDescriptor::free(0, usable);
        arena.write_word(initial.offset, encode_tag(&initial));

        Ok(Self {
            arena,
            policy,
            blocks: alloc::vec![initial],
        })
    }

    /// Returns every chunk of the arena in address order.
    pub fn blocks(&self) -> impl Iterator<Item = BlockDescriptor> + '_ {
        self.blocks.iter().copied()
    }

    fn write_tag(&self, block: &BlockDescriptor) {
        self.arena.write_word(block.offset, encode_tag(block));
    }

    /// Finds the chunk whose payload starts at `payload` and checks that it
    /// may be freed with `size`.
    fn find_used(&self, payload: usize, size: usize) -> Result<usize, DeallocError> {
        ensure!(
            payload >= TAG_SIZE && payload.is_multiple_of(WORD_SIZE),
            UnknownBlockSnafu { offset: payload }
        );
        let offset = payload - TAG_SIZE;

        let index = match self.blocks.binary_search_by_key(&offset, |b| b.offset) {
            Ok(index) => index,
            Err(next) => {
                // `offset` points into the middle of the chunk before `next`.
                let inside_free = next
                    .checked_sub(1)
                    .is_some_and(|i| self.blocks[i].state.is_free());
                ensure!(!inside_free, DoubleFreeSnafu { offset: payload });
                return UnknownBlockSnafu { offset: payload }.fail();
            }
        };

        let block = &self.blocks[index];
        let BlockState::Used { requested } = block.state else {
            return DoubleFreeSnafu { offset: payload }.fail();
        };

        let expected = encode_tag(block);
        let found = self.arena.read_word(offset);
        ensure!(
            found == expected,
            CorruptTagSnafu {
                offset,
                expected,
                found,
            }
        );
        ensure!(
            size == requested,
            SizeMismatchSnafu {
                offset: payload,
                expected: requested,
                actual: size,
            }
        );

        Ok(index)
    }

    /// Merges every pair of neighbouring free chunks.
    fn coalesce(&mut self) {
        self.blocks.sort_unstable_by_key(|b| b.offset);

        let before = self.blocks.len();
        let arena = &self.arena;
        self.blocks.dedup_by(|next, prev| {
            if prev.state.is_free() && next.state.is_free() && prev.is_adjacent_to(next) {
                prev.size += next.size;
                arena.write_word(prev.offset, encode_tag(prev));
                true
            } else {
                false
            }
        });

        let merged = before - self.blocks.len();
        if merged > 0 {
            debug!("coalesced {merged} free chunk(s)");
        }
    }
}

impl ArenaAllocator for BoundaryTagAllocator {
    fn name(&self) -> &'static str {
        "Boundary Tag Allocator"
    }

    fn policy(&self) -> SelectionPolicy {
        self.policy
    }

    fn arena(&self) -> &Arena {
        &self.arena
    }

    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            warn!("zero-sized allocation request");
            return None;
        }
        let needed = align_to_word(size)?.checked_add(TAG_SIZE)?;

        let candidates = self
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.state.is_free() && b.size >= needed)
            .map(|(i, b)| (i, b.size));
        let Some(index) = self.policy.select(candidates) else {
            trace!("allocate({size}): no free chunk of {needed} bytes");
            return None;
        };

        let mut block = self.blocks[index];
        let remainder = block.size - needed;
        if remainder >= MIN_BLOCK_SIZE {
            block.size = needed;
            let rest = BlockDescriptor::free(block.end(), remainder);
            self.write_tag(&rest);
            self.blocks.insert(index + 1, rest);
            debug!("split chunk {:#x}: {needed} + {remainder} bytes", block.offset);
        }
        block.state = BlockState::Used { requested: size };
        self.write_tag(&block);
        self.blocks[index] = block;

        let ptr = self.arena.ptr_at(block.offset + TAG_SIZE);
        trace!(
            "allocate({size}) = {ptr:p} (chunk {:#x}+{})",
            block.offset, block.size
        );
        Some(ptr)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), DeallocError> {
        let index = self
            .arena
            .offset_of(ptr)
            .context(ForeignPointerSnafu {
                addr: ptr.addr().get(),
            })
            .and_then(|payload| self.find_used(payload, size))
            .inspect_err(|err| warn!("rejected free of {ptr:p}: {err}"))?;

        let block = &mut self.blocks[index];
        block.state = BlockState::Free;
        let block = *block;
        self.write_tag(&block);
        trace!("deallocate({ptr:p}, {size}) (chunk {:#x}+{})", block.offset, block.size);

        self.coalesce();
        Ok(())
    }

    fn free_blocks(&self) -> Vec<BlockDescriptor> {
        self.blocks
            .iter()
            .filter(|b| b.state.is_free())
            .copied()
            .collect()
    }

    fn check_invariants(&self) -> Result<(), InvariantError> {
        let arena_size = self.arena.size();
        let mut expected = 0;
        let mut prev: Option<&BlockDescriptor> = None;

        for block in &self.blocks {
            if let Some(prev) = prev {
                ensure!(
                    block.offset >= expected,
                    OverlapSnafu {
                        offset: prev.offset,
                        end: expected,
                        next: block.offset,
                    }
                );
            }
            ensure!(
                block.offset == expected,
                GapSnafu {
                    expected,
                    found: block.offset,
                }
            );
            ensure!(
                block.size >= MIN_BLOCK_SIZE && block.size.is_multiple_of(WORD_SIZE),
                MisalignedBlockSnafu {
                    offset: block.offset,
                    size: block.size,
                }
            );
            ensure!(
                block.end() <= arena_size,
                BlockOutOfArenaSnafu {
                    offset: block.offset,
                    size: block.size,
                    arena_size,
                }
            );
            if let Some(prev) = prev {
                ensure!(
                    !(prev.state.is_free() && block.state.is_free()),
                    AdjacentFreeSnafu {
                        offset: prev.offset,
                        next: block.offset,
                    }
                );
            }

            let tag = self.arena.read_word(block.offset);
            ensure!(
                tag == encode_tag(block),
                TagMismatchSnafu {
                    offset: block.offset,
                    expected: encode_tag(block),
                    found: tag,
                }
            );

            expected = block.end();
            prev = Some(block);
        }

        ensure!(
            expected == arena_size,
            IncompleteCoverSnafu {
                covered: expected,
                arena_size,
            }
        );
        Ok(())
    }

    fn stats(&self) -> AllocStats {
        let mut stats = AllocStats::with_name(self.name());
        stats.total = self.arena.size();
        for block in &self.blocks {
            if block.state.is_free() {
                stats.free += block.size;
                stats.free_blocks += 1;
            } else {
                stats.live_allocations += 1;
            }
        }
        stats.in_use = stats.total - stats.free;
        stats
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;
    use crate::arena;

    struct TestAllocator {
        allocator: BoundaryTagAllocator,
    }

    impl TestAllocator {
        fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
            let ptr = self.allocator.allocate(size)?;
            unsafe {
                ptr.write_bytes(0x33, size);
            }
            self.allocator.check_invariants().unwrap();
            Some(ptr)
        }

        unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) {
            unsafe {
                for i in 0..size {
                    assert_eq!(ptr.add(i).read(), 0x33);
                }
                ptr.write_bytes(0x55, size);
                self.allocator.deallocate(ptr, size).unwrap();
            }
            self.allocator.check_invariants().unwrap();
        }

        fn offset(&self, ptr: NonNull<u8>) -> usize {
            self.allocator.arena().offset_of(ptr).unwrap()
        }
    }

    fn with_test_allocator<F>(size: usize, policy: SelectionPolicy, test_fn: F)
    where
        F: FnOnce(&mut TestAllocator),
    {
        let allocator = BoundaryTagAllocator::new(size, policy).unwrap();
        allocator.check_invariants().unwrap();
        test_fn(&mut TestAllocator { allocator });
    }

    #[test]
    fn test_construction() {
        assert!(matches!(
            BoundaryTagAllocator::new(0, SelectionPolicy::FirstFit),
            Err(ArenaError::ZeroSize { .. })
        ));
        assert!(matches!(
            BoundaryTagAllocator::new(MIN_BLOCK_SIZE - 1, SelectionPolicy::FirstFit),
            Err(ArenaError::TooSmall { .. })
        ));

        let allocator = BoundaryTagAllocator::new(1024 + 3, SelectionPolicy::FirstFit).unwrap();
        assert_eq!(allocator.arena().size(), 1024);
        assert_eq!(allocator.free_blocks(), vec![BlockDescriptor::free(0, 1024)]);
    }

    #[test]
    fn test_basic_allocation() {
        with_test_allocator(1024, SelectionPolicy::FirstFit, |allocator| unsafe {
            let ptr = allocator.allocate(64).unwrap();
            assert_eq!(allocator.offset(ptr), TAG_SIZE);
            allocator.deallocate(ptr, 64);
        });
    }

    #[test]
    fn test_three_allocations_merge_back_in_any_order() {
        let sizes = [100, 200, 50];
        let orders = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];

        for order in orders {
            with_test_allocator(1024, SelectionPolicy::FirstFit, |allocator| unsafe {
                let ptrs = sizes.map(|size| allocator.allocate(size).unwrap());

                let ranges: Vec<_> = allocator
                    .allocator
                    .blocks()
                    .filter(|block| block.state.is_used())
                    .map(|block| block.range())
                    .collect();
                assert_eq!(ranges.len(), sizes.len());
                for (ptr, size) in ptrs.iter().zip(sizes) {
                    let offset = allocator.offset(*ptr);
                    assert!(
                        ranges
                            .iter()
                            .any(|range| range.contains(&offset) && offset + size <= range.end)
                    );
                }
                for (i, a) in ranges.iter().enumerate() {
                    for b in &ranges[i + 1..] {
                        assert!(a.end <= b.start || b.end <= a.start);
                    }
                }

                for i in order {
                    allocator.deallocate(ptrs[i], sizes[i]);
                }
                assert_eq!(
                    allocator.allocator.free_blocks(),
                    vec![BlockDescriptor::free(0, 1024)]
                );
            });
        }
    }

    /// Leaves free chunks of 128 and 64 bytes, separated by chunks in use, in
    /// front of the free tail.
    fn make_holes(allocator: &mut TestAllocator) {
        unsafe {
            let a = allocator.allocate(128 - TAG_SIZE).unwrap();
            let _b = allocator.allocate(WORD_SIZE).unwrap();
            let c = allocator.allocate(64 - TAG_SIZE).unwrap();
            let _d = allocator.allocate(WORD_SIZE).unwrap();
            allocator.deallocate(a, 128 - TAG_SIZE);
            allocator.deallocate(c, 64 - TAG_SIZE);
        }
        let free: Vec<_> = allocator
            .allocator
            .free_blocks()
            .iter()
            .map(|b| (b.offset, b.size))
            .collect();
        let tail = 128 + 64 + 2 * MIN_BLOCK_SIZE;
        assert_eq!(
            free,
            vec![(0, 128), (128 + MIN_BLOCK_SIZE, 64), (tail, 1024 - tail)]
        );
    }

    #[test]
    fn test_selection_policies() {
        let expected = [
            (SelectionPolicy::FirstFit, 0),
            (SelectionPolicy::BestFit, 128 + MIN_BLOCK_SIZE),
            (SelectionPolicy::WorstFit, 128 + 64 + 2 * MIN_BLOCK_SIZE),
        ];
        for (policy, chunk) in expected {
            with_test_allocator(1024, policy, |allocator| {
                make_holes(allocator);
                let ptr = allocator.allocate(40).unwrap();
                assert_eq!(allocator.offset(ptr), chunk + TAG_SIZE, "{policy}");
            });
        }
    }

    #[test]
    fn test_used_neighbours_are_not_merged() {
        with_test_allocator(1024, SelectionPolicy::FirstFit, |allocator| unsafe {
            let a = allocator.allocate(32).unwrap();
            let b = allocator.allocate(32).unwrap();
            let c = allocator.allocate(32).unwrap();
            allocator.deallocate(b, 32);

            let states: Vec<_> = allocator.allocator.blocks().map(|b| b.state).collect();
            assert_eq!(
                states,
                vec![
                    BlockState::Used { requested: 32 },
                    BlockState::Free,
                    BlockState::Used { requested: 32 },
                    BlockState::Free,
                ]
            );

            allocator.deallocate(a, 32);
            allocator.deallocate(c, 32);
            assert_eq!(allocator.allocator.blocks().count(), 1);
        });
    }

    #[test]
    fn test_small_remainder_is_not_split() {
        with_test_allocator(64, SelectionPolicy::FirstFit, |allocator| unsafe {
            let size = 64 - TAG_SIZE - WORD_SIZE;
            let ptr = allocator.allocate(size).unwrap();
            let blocks: Vec<_> = allocator.allocator.blocks().collect();
            assert_eq!(blocks, vec![BlockDescriptor::used(0, 64, size)]);
            assert!(allocator.allocate(1).is_none());
            allocator.deallocate(ptr, size);
        });
    }

    #[test]
    fn test_out_of_memory() {
        with_test_allocator(1024, SelectionPolicy::FirstFit, |allocator| unsafe {
            assert!(allocator.allocate(1024).is_none());
            assert!(allocator.allocate(0).is_none());

            let ptr = allocator.allocate(1024 - TAG_SIZE).unwrap();
            assert!(allocator.allocate(1).is_none());
            allocator.deallocate(ptr, 1024 - TAG_SIZE);

            assert!(allocator.allocator.allocate(usize::MAX).is_none());
        });
    }

    #[test]
    fn test_round_trip_restores_index() {
        with_test_allocator(1024, SelectionPolicy::BestFit, |allocator| unsafe {
            let keep = allocator.allocate(100).unwrap();
            let before = allocator.allocator.free_blocks();
            let ptr = allocator.allocate(24).unwrap();
            allocator.deallocate(ptr, 24);
            assert_eq!(allocator.allocator.free_blocks(), before);
            allocator.deallocate(keep, 100);
        });
    }

    #[test]
    fn test_reallocation_after_full_deallocation() {
        with_test_allocator(1024, SelectionPolicy::WorstFit, |allocator| unsafe {
            let mut ptrs = Vec::new();
            while let Some(ptr) = allocator.allocate(40) {
                ptrs.push(ptr);
            }
            assert_eq!(ptrs.len(), 1024 / (align_to_word(40).unwrap() + TAG_SIZE));

            for ptr in ptrs.into_iter().rev() {
                allocator.deallocate(ptr, 40);
            }
            assert_eq!(allocator.allocator.free_blocks().len(), 1);
        });
    }

    #[test]
    fn test_invalid_frees_are_rejected() {
        with_test_allocator(1024, SelectionPolicy::FirstFit, |allocator| unsafe {
            let a = allocator.allocate(64).unwrap();
            let b = allocator.allocate(64).unwrap();
            let snapshot: Vec<_> = allocator.allocator.blocks().collect();

            let inner = &mut allocator.allocator;
            assert!(matches!(
                inner.deallocate(a, 63),
                Err(DeallocError::SizeMismatch {
                    expected: 64,
                    actual: 63,
                    ..
                })
            ));
            assert!(matches!(
                inner.deallocate(a.add(WORD_SIZE), 64),
                Err(DeallocError::UnknownBlock { .. })
            ));
            assert!(matches!(
                inner.deallocate(a.add(1), 64),
                Err(DeallocError::UnknownBlock { .. })
            ));
            let mut local = 0_u8;
            assert!(matches!(
                inner.deallocate(NonNull::from(&mut local), 1),
                Err(DeallocError::ForeignPointer { .. })
            ));
            assert_eq!(inner.blocks().collect::<Vec<_>>(), snapshot);

            allocator.deallocate(a, 64);
            allocator.deallocate(b, 64);
        });
    }

    #[test]
    fn test_double_free() {
        with_test_allocator(1024, SelectionPolicy::FirstFit, |allocator| unsafe {
            let a = allocator.allocate(64).unwrap();
            let b = allocator.allocate(64).unwrap();
            let c = allocator.allocate(64).unwrap();

            allocator.deallocate(b, 64);
            assert!(matches!(
                allocator.allocator.deallocate(b, 64),
                Err(DeallocError::DoubleFree { .. })
            ));

            // `b` is merged into `a` and now lies inside a free chunk.
            allocator.deallocate(a, 64);
            assert!(matches!(
                allocator.allocator.deallocate(b, 64),
                Err(DeallocError::DoubleFree { .. })
            ));

            allocator.deallocate(c, 64);
            allocator.allocator.check_invariants().unwrap();
        });
    }

    #[test]
    fn test_corrupt_tag() {
        with_test_allocator(1024, SelectionPolicy::FirstFit, |allocator| unsafe {
            let ptr = allocator.allocate(64).unwrap();
            let tag = allocator.offset(ptr) - TAG_SIZE;
            let original = allocator.allocator.arena().read_word(tag);

            arena::fill(allocator.allocator.arena(), tag, TAG_SIZE, 0xee);
            assert!(matches!(
                allocator.allocator.check_invariants(),
                Err(InvariantError::TagMismatch { .. })
            ));
            assert!(matches!(
                allocator.allocator.deallocate(ptr, 64),
                Err(DeallocError::CorruptTag { .. })
            ));

            allocator.allocator.arena().write_word(tag, original);
            allocator.deallocate(ptr, 64);
        });
    }

    #[test]
    fn test_stats() {
        with_test_allocator(1024, SelectionPolicy::FirstFit, |allocator| unsafe {
            let ptr = allocator.allocate(100).unwrap();
            let stats = allocator.allocator.stats();
            assert_eq!(stats.total, 1024);
            assert_eq!(stats.in_use, 104 + TAG_SIZE);
            assert_eq!(stats.free, 1024 - 104 - TAG_SIZE);
            assert_eq!(stats.free_blocks, 1);
            assert_eq!(stats.live_allocations, 1);
            allocator.deallocate(ptr, 100);
        });
    }
}
