//! Error types reported by the arena allocators.
//!
//! Running out of memory is not an error: `allocate` reports it by returning
//! `None`. The types here cover the remaining failure classes:
//!
//! - [`ArenaError`]: the arena could not be constructed.
//! - [`DeallocError`]: a free was rejected because it does not describe a
//!   live allocation of this allocator. The allocator state is left untouched.
//! - [`InvariantError`]: [`check_invariants`] found corrupted bookkeeping.
//!
//! [`check_invariants`]: crate::ArenaAllocator::check_invariants

use alloc::string::String;
use core::alloc::LayoutError;

use snafu::Snafu;
use snafu_utils::{ErrorLocation, Location};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ArenaError {
    #[snafu(display("arena size must be greater than zero"))]
    ZeroSize {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("arena of {size} bytes is smaller than the minimum of {minimum} bytes"))]
    TooSmall {
        size: usize,
        minimum: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("invalid arena layout: size={size}, align={align}"))]
    InvalidLayout {
        size: usize,
        align: usize,
        #[snafu(source)]
        source: LayoutError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to obtain {size} bytes of backing memory"))]
    OutOfMemory {
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

/// An invalid free.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DeallocError {
    #[snafu(display("pointer {addr:#x} does not belong to the arena"))]
    ForeignPointer {
        addr: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("no allocation starts at offset {offset:#x}"))]
    UnknownBlock {
        offset: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("block at offset {offset:#x} is already free"))]
    DoubleFree {
        offset: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "size mismatch for block at offset {offset:#x}: allocated with {expected}, freed with \
         {actual}"
    ))]
    SizeMismatch {
        offset: usize,
        expected: usize,
        actual: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "boundary tag at offset {offset:#x} is corrupt: expected {expected:#x}, found {found:#x}"
    ))]
    CorruptTag {
        offset: usize,
        expected: usize,
        found: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("zero-sized free at offset {offset:#x}"))]
    ZeroSizedFree {
        offset: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("range {offset:#x}+{size} exceeds the arena of {arena_size} bytes"))]
    RangeOutOfArena {
        offset: usize,
        size: usize,
        arena_size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("range {offset:#x}+{size} overlaps the free block {free_offset:#x}+{free_size}"))]
    OverlapsFreeBlock {
        offset: usize,
        size: usize,
        free_offset: usize,
        free_size: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum InvariantError {
    #[snafu(display("blocks out of address order: {offset:#x} is followed by {next:#x}"))]
    Unsorted {
        offset: usize,
        next: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("gap in arena partition: expected a block at {expected:#x}, found {found:#x}"))]
    Gap {
        expected: usize,
        found: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("block {offset:#x}..{end:#x} overlaps the block at {next:#x}"))]
    Overlap {
        offset: usize,
        end: usize,
        next: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("blocks cover {covered} of {arena_size} arena bytes"))]
    IncompleteCover {
        covered: usize,
        arena_size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("free blocks at {offset:#x} and {next:#x} are adjacent but not merged"))]
    AdjacentFree {
        offset: usize,
        next: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "boundary tag at offset {offset:#x} disagrees with the block table: expected \
         {expected:#x}, found {found:#x}"
    ))]
    TagMismatch {
        offset: usize,
        expected: usize,
        found: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("block {offset:#x}+{size} lies outside the arena of {arena_size} bytes"))]
    BlockOutOfArena {
        offset: usize,
        size: usize,
        arena_size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("block {offset:#x}+{size} is misaligned"))]
    MisalignedBlock {
        offset: usize,
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("buddies {offset:#x} and {buddy:#x} are both free at level {level}"))]
    UnmergedBuddies {
        offset: usize,
        buddy: usize,
        level: u32,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("free list links around node {node} are inconsistent"))]
    BrokenLink {
        node: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("free list holds {actual} nodes but records {expected}"))]
    LengthMismatch {
        expected: usize,
        actual: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), display("unknown selection policy `{input}`"))]
pub struct ParsePolicyError {
    input: String,
    #[snafu(implicit)]
    location: Location,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), display("unknown allocation strategy `{input}`"))]
pub struct ParseStrategyError {
    input: String,
    #[snafu(implicit)]
    location: Location,
}

impl ErrorLocation for ArenaError {
    fn location(&self) -> Option<Location> {
        match self {
            Self::ZeroSize { location }
            | Self::TooSmall { location, .. }
            | Self::InvalidLayout { location, .. }
            | Self::OutOfMemory { location, .. } => Some(*location),
        }
    }
}

impl ErrorLocation for DeallocError {
    fn location(&self) -> Option<Location> {
        match self {
            Self::ForeignPointer { location, .. }
            | Self::UnknownBlock { location, .. }
            | Self::DoubleFree { location, .. }
            | Self::SizeMismatch { location, .. }
            | Self::CorruptTag { location, .. }
            | Self::ZeroSizedFree { location, .. }
            | Self::RangeOutOfArena { location, .. }
            | Self::OverlapsFreeBlock { location, .. } => Some(*location),
        }
    }
}

impl ErrorLocation for InvariantError {
    fn location(&self) -> Option<Location> {
        match self {
            Self::Unsorted { location, .. }
            | Self::Gap { location, .. }
            | Self::Overlap { location, .. }
            | Self::IncompleteCover { location, .. }
            | Self::AdjacentFree { location, .. }
            | Self::TagMismatch { location, .. }
            | Self::BlockOutOfArena { location, .. }
            | Self::MisalignedBlock { location, .. }
            | Self::UnmergedBuddies { location, .. }
            | Self::BrokenLink { location, .. }
            | Self::LengthMismatch { location, .. } => Some(*location),
        }
    }
}

impl ErrorLocation for ParsePolicyError {
    fn location(&self) -> Option<Location> {
        Some(self.location)
    }
}

impl ErrorLocation for ParseStrategyError {
    fn location(&self) -> Option<Location> {
        Some(self.location)
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use core::ptr::NonNull;

    use snafu_utils::Report;

    use super::*;
    use crate::{ArenaAllocator as _, SelectionPolicy, buddy::BuddyAllocator};

    #[test]
    fn test_rejected_free_points_at_check() {
        let mut allocator = BuddyAllocator::new(1024, SelectionPolicy::FirstFit).unwrap();
        let ptr = allocator.allocate(100).unwrap();
        unsafe {
            allocator.deallocate(ptr, 100).unwrap();
        }

        let err = unsafe { allocator.deallocate(ptr, 100) }.unwrap_err();
        assert!(matches!(err, DeallocError::DoubleFree { .. }));
        let location = err.location().unwrap();
        assert!(location.file().ends_with("buddy.rs"), "{location}");
    }

    #[test]
    fn test_report_shows_location() {
        let mut local = 0_u8;
        let mut allocator = BuddyAllocator::new(64, SelectionPolicy::FirstFit).unwrap();
        let err = unsafe { allocator.deallocate(NonNull::from(&mut local), 1) }.unwrap_err();
        let location = err.location().unwrap();

        let rendered = alloc::format!("{}", Report::new(err).locate::<DeallocError>());
        assert!(rendered.starts_with("Error: pointer "));
        assert!(rendered.contains(&alloc::format!("\n  at {location}\n")));
    }
}
