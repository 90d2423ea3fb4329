//! Buddy system allocator implementation.
//!
//! The arena is managed as a binary tree of power-of-two blocks. A block of
//! *level* `l` is `2^l` bytes long and always starts at an offset that is a
//! multiple of `2^l`. Splitting a block yields two halves, its *buddies*, and
//! the buddy of any block is found by flipping a single offset bit:
//!
//! ```text
//! level 10: [0                                             1024)
//! level  9: [0                    512)[512                 1024)
//! level  8: [0        256)[256    512)
//! level  7: [0 128)[128 256)
//!
//! buddy_of(0, 128)   = 128
//! buddy_of(256, 256) = 0
//! ```
//!
//! # Algorithm
//!
//! - **Allocation**: the request is rounded up to the next power of two (but
//!   at least one word) to get the required level `L`. The non-empty levels
//!   `L..=max_level` are the candidates; `first-fit` and `best-fit` take the
//!   lowest of them, `worst-fit` the highest. The block with the lowest offset
//!   at that level is split until it is down to level `L`, pushing each upper
//!   half onto the free set one level below.
//! - **Deallocation**: while the buddy of the returned block is free at the
//!   same level, the two are merged and the search continues one level up.
//!   The whole-arena block has no buddy, so merging stops at `max_level`.
//!
//! The arena is rounded *down* to a power of two. Bytes past that are never
//! part of any block.
//!
//! # Usage Example
//!
//! ```rust
//! use arena_alloc::{ArenaAllocator as _, SelectionPolicy, buddy::BuddyAllocator};
//!
//! let mut allocator = BuddyAllocator::new(1024, SelectionPolicy::FirstFit).unwrap();
//! let ptr = allocator.allocate(100).unwrap();
//! assert_eq!(allocator.free_blocks().len(), 3);
//!
//! unsafe { allocator.deallocate(ptr, 100).unwrap() };
//! assert_eq!(allocator.free_blocks().len(), 1);
//! ```
//!
//! # Performance Characteristics
//!
//! - **Allocation**: O(log n) splits, each O(log n) in the free sets
//! - **Deallocation**: O(log n) merges
//! - **Memory Overhead**: none inside the arena; internal fragmentation of up
//!   to half of each block

use alloc::{
    collections::{BTreeMap, BTreeSet},
    vec::Vec,
};
use core::{iter, ptr::NonNull};

use arrayvec::ArrayVec;
use log::{debug, trace, warn};
use snafu::{OptionExt as _, ensure};

use crate::{
    ArenaAllocator,
    arena::{Arena, WORD_SIZE},
    block::BlockDescriptor,
    error::{
        ArenaError, BlockOutOfArenaSnafu, DeallocError, DoubleFreeSnafu, ForeignPointerSnafu,
        GapSnafu, IncompleteCoverSnafu, InvariantError, MisalignedBlockSnafu, OverlapSnafu,
        SizeMismatchSnafu, TooSmallSnafu, UnknownBlockSnafu, UnmergedBuddiesSnafu, ZeroSizeSnafu,
        ZeroSizedFreeSnafu,
    },
    policy::SelectionPolicy,
    stats::AllocStats,
};

/// Level of the smallest block: one word.
pub const MIN_LEVEL: u32 = WORD_SIZE.trailing_zeros();

/// Upper bound on the number of levels of any arena.
const MAX_LEVELS: usize = usize::BITS as usize;

/// Returns the offset of the buddy of the `size`-byte block at `offset`.
///
/// `offset` must be a multiple of `size`, and `size` a power of two.
///
/// ```
/// use arena_alloc::buddy::buddy_of;
///
/// assert_eq!(buddy_of(0, 128), 128);
/// assert_eq!(buddy_of(384, 128), 256);
/// assert_eq!(buddy_of(buddy_of(384, 128), 128), 384);
/// ```
#[must_use]
pub const fn buddy_of(offset: usize, size: usize) -> usize {
    offset ^ size
}

const fn block_size(level: u32) -> usize {
    1 << level
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Allocation {
    level: u32,
    requested: usize,
}

/// A power-of-two buddy system allocator.
///
/// # Thread Safety
///
/// This allocator is `Send` but not `Sync`. It can be moved between threads but
/// requires external synchronization for concurrent access.
pub struct BuddyAllocator {
    arena: Arena,
    policy: SelectionPolicy,
    max_level: u32,
    /// Free block offsets, indexed by level.
    levels: ArrayVec<BTreeSet<usize>, MAX_LEVELS>,
    /// Blocks in use, keyed by offset.
    live: BTreeMap<usize, Allocation>,
}

impl BuddyAllocator {
    /// Creates an allocator over the largest power of two not exceeding
    /// `total_size`.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError::ZeroSize`] if `total_size` is zero and
    /// [`ArenaError::TooSmall`] if it cannot hold a single word.
    pub fn new(total_size: usize, policy: SelectionPolicy) -> Result<Self, ArenaError> {
        ensure!(total_size > 0, ZeroSizeSnafu);
        let max_level = total_size.ilog2();
        ensure!(
            max_level >= MIN_LEVEL,
            TooSmallSnafu {
                size: total_size,
                minimum: WORD_SIZE,
            }
        );
        let size = block_size(max_level);
        if size != total_size {
            debug!("buddy arena rounded down from {total_size} to {size} bytes");
        }

        let arena = Arena::new(size)?;
        let mut levels: ArrayVec<BTreeSet<usize>, MAX_LEVELS> =
            iter::repeat_with(BTreeSet::new)
                .take(max_level as usize + 1)
                .collect();
        levels[max_level as usize].insert(0);

        Ok(Self {
            arena,
            policy,
            max_level,
            levels,
            live: BTreeMap::new(),
        })
    }

    /// Level of the whole-arena block.
    #[must_use]
    pub fn max_level(&self) -> u32 {
        self.max_level
    }

    /// Returns the level of the smallest block that can hold `size` bytes.
    #[must_use]
    pub fn level_for(size: usize) -> Option<u32> {
        let size = size.checked_next_power_of_two()?;
        Some(size.ilog2().max(MIN_LEVEL))
    }

    /// Returns the offsets of the free blocks at `level`, in address order.
    pub fn free_at(&self, level: u32) -> impl Iterator<Item = usize> + '_ {
        self.levels
            .get(level as usize)
            .into_iter()
            .flat_map(|set| set.iter().copied())
    }

    /// Returns every block of the arena, free and in use, in address order.
    #[must_use]
    pub fn blocks(&self) -> Vec<BlockDescriptor> {
        let mut blocks = self.free_blocks();
        blocks.extend(self.live.iter().map(|(&offset, alloc)| {
            BlockDescriptor::used(offset, block_size(alloc.level), alloc.requested)
        }));
        blocks.sort_unstable_by_key(|b| b.offset);
        blocks
    }

    fn free_set(&mut self, level: u32) -> &mut BTreeSet<usize> {
        &mut self.levels[level as usize]
    }

    /// Returns `true` if `offset` lies inside a free block.
    fn is_inside_free_block(&self, offset: usize) -> bool {
        (0..=self.max_level).any(|level| {
            self.levels[level as usize]
                .range(..=offset)
                .next_back()
                .is_some_and(|&start| offset < start + block_size(level))
        })
    }

    fn validate_free(&self, ptr: NonNull<u8>, size: usize) -> Result<(usize, u32), DeallocError> {
        let offset = self.arena.offset_of(ptr).context(ForeignPointerSnafu {
            addr: ptr.addr().get(),
        })?;
        ensure!(size > 0, ZeroSizedFreeSnafu { offset });

        let Some(alloc) = self.live.get(&offset) else {
            ensure!(!self.is_inside_free_block(offset), DoubleFreeSnafu { offset });
            return UnknownBlockSnafu { offset }.fail();
        };
        ensure!(
            Self::level_for(size) == Some(alloc.level),
            SizeMismatchSnafu {
                offset,
                expected: alloc.requested,
                actual: size,
            }
        );
        Ok((offset, alloc.level))
    }
}

impl ArenaAllocator for BuddyAllocator {
    fn name(&self) -> &'static str {
        "Buddy Allocator"
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
        let target = Self::level_for(size).filter(|&level| level <= self.max_level)?;

        // Lower levels are smaller blocks, so best fit is the lowest
        // non-empty level, the same level first fit reaches.
        let candidates = (target..=self.max_level)
            .filter(|&level| !self.levels[level as usize].is_empty())
            .map(|level| (level, block_size(level)));
        let Some(mut level) = self.policy.select(candidates) else {
            trace!("allocate({size}): no free block at level {target} or above");
            return None;
        };

        let offset = self.free_set(level).pop_first()?;
        while level > target {
            level -= 1;
            let upper = offset + block_size(level);
            self.free_set(level).insert(upper);
            debug!("split block {offset:#x} at level {}, buddy {upper:#x}", level + 1);
        }
        self.live.insert(
            offset,
            Allocation {
                level: target,
                requested: size,
            },
        );

        let ptr = self.arena.ptr_at(offset);
        trace!("allocate({size}) = {ptr:p} (level {target})");
        Some(ptr)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), DeallocError> {
        let (mut offset, mut level) = self
            .validate_free(ptr, size)
            .inspect_err(|err| warn!("rejected free of {ptr:p}: {err}"))?;
        self.live.remove(&offset);

        while level < self.max_level {
            let buddy = buddy_of(offset, block_size(level));
            if !self.free_set(level).remove(&buddy) {
                break;
            }
            debug!("merge block {offset:#x} with buddy {buddy:#x} at level {level}");
            offset = offset.min(buddy);
            level += 1;
        }
        self.free_set(level).insert(offset);

        trace!("deallocate({ptr:p}, {size}) (free at level {level})");
        Ok(())
    }

    fn free_blocks(&self) -> Vec<BlockDescriptor> {
        let mut blocks: Vec<_> = (0..=self.max_level)
            .flat_map(move |level| {
                self.free_at(level)
                    .map(move |offset| BlockDescriptor::free(offset, block_size(level)))
            })
            .collect();
        blocks.sort_unstable_by_key(|b| b.offset);
        blocks
    }

    fn check_invariants(&self) -> Result<(), InvariantError> {
        let arena_size = self.arena.size();

        for level in 0..=self.max_level {
            let size = block_size(level);
            for offset in self.free_at(level) {
                ensure!(
                    offset.checked_add(size).is_some_and(|end| end <= arena_size),
                    BlockOutOfArenaSnafu {
                        offset,
                        size,
                        arena_size,
                    }
                );
                ensure!(
                    level >= MIN_LEVEL && offset.is_multiple_of(size),
                    MisalignedBlockSnafu { offset, size }
                );
                let buddy = buddy_of(offset, size);
                ensure!(
                    level == self.max_level || !self.levels[level as usize].contains(&buddy),
                    UnmergedBuddiesSnafu {
                        offset,
                        buddy,
                        level,
                    }
                );
            }
        }
        for (&offset, alloc) in &self.live {
            let size = block_size(alloc.level);
            ensure!(offset.is_multiple_of(size), MisalignedBlockSnafu { offset, size });
        }

        let mut expected = 0;
        let mut prev: Option<BlockDescriptor> = None;
        for block in self.blocks() {
            if let Some(prev) = prev {
                ensure!(
                    block.offset >= prev.end(),
                    OverlapSnafu {
                        offset: prev.offset,
                        end: prev.end(),
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
        stats.free = self.free_blocks().iter().map(|b| b.size).sum();
        stats.in_use = stats.total - stats.free;
        stats.free_blocks = self.levels.iter().map(BTreeSet::len).sum();
        stats.live_allocations = self.live.len();
        stats
    }
}
