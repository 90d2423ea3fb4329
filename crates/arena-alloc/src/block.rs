//! Read-only descriptions of the blocks an allocator manages.

use core::ops::Range;

/// Whether a block is available for allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::IsVariant)]
pub enum BlockState {
    Free,
    /// Handed out to a caller who asked for `requested` bytes.
    Used { requested: usize },
}

/// A chunk of the arena as seen by an allocator.
///
/// `offset` is relative to the arena base. What `size` counts depends on the
/// allocator:
///
/// - boundary tag: the whole chunk, boundary tag word included,
/// - sorted free list: the bytes handed out from `offset`,
/// - buddy: `2^level` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockDescriptor {
    pub offset: usize,
    pub size: usize,
    pub state: BlockState,
}

impl BlockDescriptor {
    #[must_use]
    pub const fn free(offset: usize, size: usize) -> Self {
        Self {
            offset,
            size,
            state: BlockState::Free,
        }
    }

    #[must_use]
    pub const fn used(offset: usize, size: usize, requested: usize) -> Self {
        Self {
            offset,
            size,
            state: BlockState::Used { requested },
        }
    }

    /// Offset one past the last byte of the block.
    #[must_use]
    pub const fn end(&self) -> usize {
        self.offset + self.size
    }

    #[must_use]
    pub const fn range(&self) -> Range<usize> {
        self.offset..self.end()
    }

    /// Returns `true` if `next` starts exactly where `self` ends.
    #[must_use]
    pub const fn is_adjacent_to(&self, next: &Self) -> bool {
        self.end() == next.offset
    }
}
