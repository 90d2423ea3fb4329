//! Fixed-size backing storage shared by every allocator in this crate.
//!
//! An [`Arena`] obtains a single buffer when it is created and never grows,
//! shrinks or moves it. Allocators hand out pointers into this buffer and
//! track blocks by their *offset* from [`Arena::base`], so all bookkeeping is
//! independent of where the buffer happens to live.
//!
//! ```text
//! base                                               base + size
//! ┌──────────┬──────────────────┬──────────┬──────────────┐
//! │ block 0  │ block 1          │ block 2  │ block 3      │
//! └──────────┴──────────────────┴──────────┴──────────────┘
//! 0          offset(1)          offset(2)  offset(3)    size
//! ```

use core::{alloc::Layout, fmt, ptr::NonNull};

use snafu::{OptionExt as _, ResultExt as _, ensure};

use crate::error::{ArenaError, InvalidLayoutSnafu, OutOfMemorySnafu, ZeroSizeSnafu};

/// Size of a machine word. Boundary tags occupy one word and payload sizes
/// are rounded up to a multiple of it.
pub const WORD_SIZE: usize = size_of::<usize>();

/// Alignment of the arena base address.
///
/// One page on most systems. Blocks whose size divides this value are aligned
/// to their size in absolute terms as well as relative to the base.
pub const ARENA_ALIGN: usize = 4096;

/// Rounds `value` up to the next multiple of [`WORD_SIZE`].
///
/// Returns `None` on overflow.
#[must_use]
pub const fn align_to_word(value: usize) -> Option<usize> {
    value.checked_next_multiple_of(WORD_SIZE)
}

/// A single contiguous buffer owned by one allocator.
///
/// Dropping the arena releases the buffer; pointers previously handed out by
/// an allocator built on top of it become dangling.
pub struct Arena {
    base: NonNull<u8>,
    layout: Layout,
}

// The arena exclusively owns its buffer.
unsafe impl Send for Arena {}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("base", &self.base)
            .field("size", &self.layout.size())
            .finish()
    }
}

impl Arena {
    /// Obtains a zero-filled buffer of exactly `size` bytes.
    ///
    /// The buffer is aligned to [`ARENA_ALIGN`].
    pub fn new(size: usize) -> Result<Self, ArenaError> {
        ensure!(size > 0, ZeroSizeSnafu);

        let layout = Layout::from_size_align(size, ARENA_ALIGN).context(InvalidLayoutSnafu {
            size,
            align: ARENA_ALIGN,
        })?;
        let base = unsafe { alloc::alloc::alloc_zeroed(layout) };
        let base = NonNull::new(base).context(OutOfMemorySnafu { size })?;

        log::debug!("arena of {size} bytes created at {base:p}");
        Ok(Self { base, layout })
    }

    /// Address of the first byte of the arena.
    #[must_use]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Number of bytes in the arena.
    #[must_use]
    pub fn size(&self) -> usize {
        self.layout.size()
    }

    /// Returns the offset of `ptr` from the arena base, or `None` if `ptr`
    /// does not point into the arena.
    #[must_use]
    pub fn offset_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        let offset = ptr.addr().get().checked_sub(self.base.addr().get())?;
        (offset < self.size()).then_some(offset)
    }

    /// Returns a pointer to the byte at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if `offset` lies outside the arena.
    #[must_use]
    pub fn ptr_at(&self, offset: usize) -> NonNull<u8> {
        assert!(offset < self.size(), "offset {offset:#x} outside arena");
        unsafe { self.base.add(offset) }
    }

    /// Reads the machine word stored at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is not word aligned or the word does not fit in the
    /// arena.
    #[must_use]
    pub fn read_word(&self, offset: usize) -> usize {
        let word = self.word_ptr(offset);
        unsafe { word.read() }
    }

    /// Writes `value` as a machine word at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is not word aligned or the word does not fit in the
    /// arena.
    pub fn write_word(&self, offset: usize, value: usize) {
        let word = self.word_ptr(offset);
        unsafe { word.write(value) }
    }

    fn word_ptr(&self, offset: usize) -> *mut usize {
        assert!(
            offset.is_multiple_of(WORD_SIZE),
            "word offset {offset:#x} must be aligned"
        );
        assert!(
            offset
                .checked_add(WORD_SIZE)
                .is_some_and(|end| end <= self.size()),
            "word at {offset:#x} must lie inside the arena"
        );
        #[expect(clippy::cast_ptr_alignment)]
        let word = unsafe { self.base.as_ptr().add(offset) }.cast::<usize>();
        debug_assert!(word.is_aligned());
        word
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        log::debug!("arena of {} bytes at {:p} released", self.size(), self.base);
        unsafe {
            alloc::alloc::dealloc(self.base.as_ptr(), self.layout);
        }
    }
}

/// Fills `len` bytes starting at `offset` with `byte`.
///
/// Used to scrub payloads in tests; never touches bookkeeping words.
#[cfg(test)]
pub(crate) fn fill(arena: &Arena, offset: usize, len: usize, byte: u8) {
    assert!(offset + len <= arena.size());
    unsafe {
        core::ptr::write_bytes(arena.base().as_ptr().add(offset), byte, len);
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_size_is_rejected() {
        assert!(matches!(Arena::new(0), Err(ArenaError::ZeroSize { .. })));
    }

    #[test]
    fn test_base_is_aligned() {
        let arena = Arena::new(100).unwrap();
        assert_eq!(arena.base().addr().get() % ARENA_ALIGN, 0);
        assert_eq!(arena.size(), 100);
    }

    #[test]
    fn test_offset_of() {
        let arena = Arena::new(64).unwrap();
        assert_eq!(arena.offset_of(arena.base()), Some(0));
        assert_eq!(arena.offset_of(arena.ptr_at(63)), Some(63));

        let past_end = unsafe { arena.base().add(64) };
        assert_eq!(arena.offset_of(past_end), None);

        let mut local = 0_u8;
        assert_eq!(arena.offset_of(NonNull::from(&mut local)), None);
    }

    #[test]
    fn test_word_round_trip() {
        let arena = Arena::new(64).unwrap();
        assert_eq!(arena.read_word(WORD_SIZE), 0);
        arena.write_word(WORD_SIZE, 0xdead_beef);
        assert_eq!(arena.read_word(WORD_SIZE), 0xdead_beef);
        assert_eq!(arena.read_word(0), 0);
    }

    #[test]
    fn test_fill_leaves_neighbours() {
        let arena = Arena::new(64).unwrap();
        fill(&arena, WORD_SIZE, WORD_SIZE, 0xff);
        assert_eq!(arena.read_word(0), 0);
        assert_eq!(arena.read_word(WORD_SIZE), usize::MAX);
        assert_eq!(arena.read_word(2 * WORD_SIZE), 0);
    }

    #[test]
    fn test_align_to_word() {
        let alignments = [
            (1..=WORD_SIZE, WORD_SIZE),
            (WORD_SIZE + 1..=2 * WORD_SIZE, 2 * WORD_SIZE),
        ];
        for (sizes, expected) in alignments {
            for size in sizes {
                assert_eq!(align_to_word(size), Some(expected));
            }
        }
        assert_eq!(align_to_word(0), Some(0));
        assert_eq!(align_to_word(usize::MAX), None);
    }
}
