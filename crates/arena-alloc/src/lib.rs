//! Fixed-arena memory allocators.
//!
//! Every allocator in this crate owns a single [`Arena`](arena::Arena): one
//! buffer obtained at construction and never resized. Memory is handed out
//! from that buffer only, and running out of it is reported by returning
//! `None`, never by growing.
//!
//! # Available Allocators
//!
//! ## [`BoundaryTagAllocator`](boundary_tag::BoundaryTagAllocator)
//!
//! Partitions the arena into chunks, each starting with a one-word tag that
//! records its size and whether it is in use. Free neighbours are merged on
//! every free. Best suited for:
//!
//! - Variable-sized allocations
//! - Workloads where fragmentation has to stay low
//!
//! ## [`SortedListAllocator`](sorted_list::SortedListAllocator)
//!
//! Tracks only free blocks, in an address-ordered doubly linked list. Blocks
//! are neither split nor coalesced, so a request receives a whole free block
//! and the caller decides how much of it to give back.
//!
//! ## [`BuddyAllocator`](buddy::BuddyAllocator)
//!
//! Hands out power-of-two blocks and merges buddy pairs back together on free.
//! Allocation and deallocation are logarithmic; the price is internal
//! fragmentation of up to half of each block.
//!
//! # Selection Policies
//!
//! All allocators take a [`SelectionPolicy`] at construction that decides
//! which of several sufficient free blocks is used:
//!
//! | Allocator      | `first-fit`       | `best-fit`         | `worst-fit`        |
//! |----------------|-------------------|--------------------|--------------------|
//! | boundary tag   | lowest address    | smallest chunk     | largest chunk      |
//! | sorted list    | lowest address    | same as first-fit  | largest node       |
//! | buddy          | smallest level    | smallest level     | largest level      |
//!
//! # Usage Example
//!
//! ```rust
//! use arena_alloc::{AllocatorConfig, SelectionPolicy, Strategy};
//!
//! let config = AllocatorConfig {
//!     strategy: Strategy::BoundaryTag,
//!     policy: SelectionPolicy::BestFit,
//!     arena_size: 1024,
//! };
//! let mut allocator = config.build().unwrap();
//!
//! let a = allocator.allocate(100).unwrap();
//! let b = allocator.allocate(200).unwrap();
//! unsafe {
//!     allocator.deallocate(a, 100).unwrap();
//!     allocator.deallocate(b, 200).unwrap();
//! }
//! allocator.check_invariants().unwrap();
//! assert_eq!(allocator.free_blocks().len(), 1);
//! ```
//!
//! # Design Considerations
//!
//! ## Memory Safety
//!
//! Blocks are identified by their offset from the arena base, and all
//! bookkeeping used to validate a free lives outside the arena. A free that
//! does not describe a live allocation is rejected with a [`DeallocError`]
//! and leaves the allocator untouched. Callers still must not use a block
//! after freeing it or after the allocator has been dropped.
//!
//! ## Thread Safety
//!
//! The allocators are `Send` but not `Sync`. They can be moved between threads
//! but require external synchronization for concurrent access.

#![no_std]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

extern crate alloc;

use alloc::{boxed::Box, vec::Vec};
use core::{ptr::NonNull, str::FromStr};

pub use self::{
    block::{BlockDescriptor, BlockState},
    error::{ArenaError, DeallocError, InvariantError, ParsePolicyError, ParseStrategyError},
    policy::SelectionPolicy,
    stats::AllocStats,
};
use self::{
    arena::Arena, boundary_tag::BoundaryTagAllocator, buddy::BuddyAllocator,
    error::ParseStrategySnafu, sorted_list::SortedListAllocator,
};

pub mod arena;
pub mod block;
pub mod boundary_tag;
pub mod buddy;
pub mod error;
pub mod policy;
pub mod sorted_list;
pub mod stats;

/// Operations shared by every allocator in this crate.
pub trait ArenaAllocator {
    /// Human-readable name of the allocation strategy.
    fn name(&self) -> &'static str;

    /// The selection policy chosen at construction.
    fn policy(&self) -> SelectionPolicy;

    /// The arena memory is handed out from.
    fn arena(&self) -> &Arena;

    /// Allocates a block that can hold `size` bytes.
    ///
    /// Returns `None` if `size` is zero or no free block is large enough. A
    /// failed allocation leaves the allocator unchanged.
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>>;

    /// Returns a block to the allocator.
    ///
    /// The request is validated before any state changes; a rejected free
    /// leaves the allocator exactly as it was.
    ///
    /// # Safety
    ///
    /// No reference into the block may be used after this call returns `Ok`.
    /// For the sorted free list, `size` is trusted: the range
    /// `ptr..ptr + size` must have been handed out by this allocator and not
    /// freed since.
    ///
    /// # Errors
    ///
    /// Returns a [`DeallocError`] if `ptr` and `size` do not describe a block
    /// this allocator can take back.
    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), DeallocError>;

    /// Returns the free blocks in address order.
    fn free_blocks(&self) -> Vec<BlockDescriptor>;

    /// Verifies the internal bookkeeping.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant found.
    fn check_invariants(&self) -> Result<(), InvariantError>;

    /// Returns usage statistics.
    fn stats(&self) -> AllocStats;
}

/// The allocation strategy behind an [`ArenaAllocator`].
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    derive_more::Display,
    derive_more::IsVariant,
)]
pub enum Strategy {
    #[default]
    #[display("boundary-tag")]
    BoundaryTag,
    #[display("sorted-list")]
    SortedList,
    #[display("buddy")]
    Buddy,
}

impl Strategy {
    pub const ALL: [Self; 3] = [Self::BoundaryTag, Self::SortedList, Self::Buddy];
}

impl FromStr for Strategy {
    type Err = ParseStrategyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "boundary-tag" | "tag" => Ok(Self::BoundaryTag),
            "sorted-list" | "list" => Ok(Self::SortedList),
            "buddy" => Ok(Self::Buddy),
            _ => ParseStrategySnafu { input: s }.fail(),
        }
    }
}

/// Everything needed to construct an allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorConfig {
    pub strategy: Strategy,
    pub policy: SelectionPolicy,
    pub arena_size: usize,
}

impl AllocatorConfig {
    /// Creates the configured allocator.
    ///
    /// # Errors
    ///
    /// Returns an [`ArenaError`] if the arena cannot be created.
    pub fn build(&self) -> Result<Box<dyn ArenaAllocator + Send>, ArenaError> {
        let Self {
            strategy,
            policy,
            arena_size,
        } = *self;
        let allocator: Box<dyn ArenaAllocator + Send> = match strategy {
            Strategy::BoundaryTag => Box::new(BoundaryTagAllocator::new(arena_size, policy)?),
            Strategy::SortedList => Box::new(SortedListAllocator::new(arena_size, policy)?),
            Strategy::Buddy => Box::new(BuddyAllocator::new(arena_size, policy)?),
        };
        log::debug!(
            "created {} ({policy}) over {} bytes",
            allocator.name(),
            allocator.arena().size()
        );
        Ok(allocator)
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use alloc::string::ToString as _;

    use super::*;

    #[test]
    fn test_strategy_display_and_parse() {
        for strategy in Strategy::ALL {
            assert_eq!(strategy.to_string().parse::<Strategy>().unwrap(), strategy);
        }
        assert_eq!("list".parse::<Strategy>().unwrap(), Strategy::SortedList);
        let err = "slab".parse::<Strategy>().unwrap_err();
        assert_eq!(err.to_string(), "unknown allocation strategy `slab`");
    }

    #[test]
    fn test_build_every_combination() {
        for strategy in Strategy::ALL {
            for policy in SelectionPolicy::ALL {
                let config = AllocatorConfig {
                    strategy,
                    policy,
                    arena_size: 1024,
                };
                let mut allocator = config.build().unwrap();
                assert_eq!(allocator.policy(), policy);
                assert_eq!(allocator.arena().size(), 1024);
                assert_eq!(allocator.free_blocks().len(), 1);
                assert!(allocator.allocate(0).is_none());
                assert!(allocator.allocate(2048).is_none());
                allocator.check_invariants().unwrap();
            }
        }
    }

    #[test]
    fn test_build_rejects_empty_arena() {
        for strategy in Strategy::ALL {
            let config = AllocatorConfig {
                strategy,
                policy: SelectionPolicy::FirstFit,
                arena_size: 0,
            };
            assert!(matches!(config.build(), Err(ArenaError::ZeroSize { .. })));
        }
    }

    #[test]
    fn test_disjoint_allocations() {
        // The sorted list hands its single initial block to the first request.
        for strategy in [Strategy::BoundaryTag, Strategy::Buddy] {
            let config = AllocatorConfig {
                strategy,
                policy: SelectionPolicy::FirstFit,
                arena_size: 1024,
            };
            let mut allocator = config.build().unwrap();
            let mut ranges = Vec::new();
            for size in [100, 200, 50] {
                let ptr = allocator.allocate(size).unwrap();
                let offset = allocator.arena().offset_of(ptr).unwrap();
                assert!(offset + size <= 1024, "{strategy}");
                ranges.push(BlockDescriptor::used(offset, size, size).range());
            }
            for (i, a) in ranges.iter().enumerate() {
                for b in &ranges[i + 1..] {
                    assert!(a.end <= b.start || b.end <= a.start, "{strategy}");
                }
            }
            allocator.check_invariants().unwrap();
        }
    }
}
