//! Sorted free-list allocator implementation.
//!
//! Only *free* blocks are tracked, as nodes of a doubly linked list kept in
//! address order. Blocks in use are invisible to the allocator: the caller
//! must hand back the exact address and size it wants to return.
//!
//! # Algorithm
//!
//! - **Allocation**: `first-fit` and `best-fit` walk the list from the head
//!   and take the first node that is large enough. `worst-fit` scans the whole
//!   list and takes the largest node. The chosen node is unlinked and its
//!   *whole* block is handed out. Blocks are never split, so the caller may
//!   receive more memory than requested; the excess is only recovered if the
//!   caller frees it explicitly.
//! - **Deallocation**: a node is created for the returned range and linked
//!   in front of the first node with a greater address. Neighbouring free
//!   blocks are **not** coalesced, so the list may hold adjacent nodes.
//!
//! A block may be returned in pieces. The parts still held by the caller are
//! remembered outside the arena, so a free must lie inside one of them, and an
//! allocation stays live until its last piece comes back.
//!
//! # Node Storage
//!
//! Nodes live in a slab indexed by [`NodeId`]; links are ids rather than
//! pointers, and slots of unlinked nodes are reused by later insertions.
//!
//! ```text
//!  head                                         tail
//!   │                                             │
//!   ▼                                             ▼
//! ┌──────────┐ next ┌──────────┐ next ┌──────────┐
//! │ 0x000+64 │─────▶│ 0x040+64 │─────▶│ 0x200+96 │
//! │          │◀─────│          │◀─────│          │
//! └──────────┘ prev └──────────┘ prev └──────────┘
//! ```
//!
//! # Usage Example
//!
//! ```rust
//! use arena_alloc::{ArenaAllocator as _, SelectionPolicy, sorted_list::SortedListAllocator};
//!
//! let mut allocator = SortedListAllocator::new(1024, SelectionPolicy::FirstFit).unwrap();
//!
//! // The first request receives the whole arena.
//! let ptr = allocator.allocate(100).unwrap();
//! assert!(allocator.allocate(1).is_none());
//!
//! // Return it in two halves: they stay separate nodes.
//! unsafe {
//!     allocator.deallocate(ptr, 512).unwrap();
//!     allocator.deallocate(ptr.add(512), 512).unwrap();
//! }
//! assert_eq!(allocator.free_blocks().len(), 2);
//! ```

use alloc::{
    collections::{BTreeMap, BTreeSet},
    vec::Vec,
};
use core::ptr::NonNull;

use log::{trace, warn};
use snafu::{OptionExt as _, ensure};

use crate::{
    ArenaAllocator,
    arena::Arena,
    block::BlockDescriptor,
    error::{
        ArenaError, BlockOutOfArenaSnafu, BrokenLinkSnafu, DeallocError, DoubleFreeSnafu,
        ForeignPointerSnafu, IncompleteCoverSnafu, InvariantError, LengthMismatchSnafu,
        OverlapSnafu, OverlapsFreeBlockSnafu, RangeOutOfArenaSnafu, UnknownBlockSnafu,
        UnsortedSnafu, ZeroSizedFreeSnafu,
    },
    policy::SelectionPolicy,
    stats::AllocStats,
};

/// Handle of a node in the free-list slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct NodeId(usize);

#[derive(Debug, Clone, Copy)]
struct Node {
    offset: usize,
    size: usize,
    prev: Option<NodeId>,
    next: Option<NodeId>,
}

impl Node {
    fn end(&self) -> usize {
        self.offset + self.size
    }
}

/// Address-ordered doubly linked list of free blocks.
#[derive(Debug, Default)]
struct FreeList {
    slots: Vec<Option<Node>>,
    vacant: Vec<NodeId>,
    head: Option<NodeId>,
    tail: Option<NodeId>,
    len: usize,
}

impl FreeList {
    fn node(&self, id: NodeId) -> &Node {
        self.slots[id.0].as_ref().expect("node id must refer to a linked node")
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.slots[id.0].as_mut().expect("node id must refer to a linked node")
    }

    fn iter(&self) -> Iter<'_> {
        Iter {
            list: self,
            current: self.head,
        }
    }

    /// Links a new node in front of `next`, or at the tail if `next` is
    /// `None`.
    fn insert_before(&mut self, next: Option<NodeId>, offset: usize, size: usize) -> NodeId {
        let prev = match next {
            Some(next) => self.node(next).prev,
            None => self.tail,
        };
        let node = Node {
            offset,
            size,
            prev,
            next,
        };

        let id = if let Some(id) = self.vacant.pop() {
            self.slots[id.0] = Some(node);
            id
        } else {
            self.slots.push(Some(node));
            NodeId(self.slots.len() - 1)
        };

        match prev {
            Some(prev) => self.node_mut(prev).next = Some(id),
            None => self.head = Some(id),
        }
        match next {
            Some(next) => self.node_mut(next).prev = Some(id),
            None => self.tail = Some(id),
        }
        self.len += 1;
        id
    }

    /// Unlinks `id` and releases its slot.
    fn remove(&mut self, id: NodeId) -> Node {
        let node = self.slots[id.0]
            .take()
            .expect("node id must refer to a linked node");

        match node.prev {
            Some(prev) => self.node_mut(prev).next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => self.node_mut(next).prev = node.prev,
            None => self.tail = node.prev,
        }
        self.vacant.push(id);
        self.len -= 1;
        node
    }
}

struct Iter<'a> {
    list: &'a FreeList,
    current: Option<NodeId>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (NodeId, &'a Node);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.current?;
        let node = self.list.node(id);
        self.current = node.next;
        Some((id, node))
    }
}

/// Part of a handed-out block that has not been returned yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeldRange {
    end: usize,
    /// Allocation the range was handed out by.
    allocation: usize,
}

/// An allocator that keeps only its free blocks, in a sorted doubly linked
/// list.
///
/// # Thread Safety
///
/// This allocator is `Send` but not `Sync`. It can be moved between threads but
/// requires external synchronization for concurrent access.
pub struct SortedListAllocator {
    arena: Arena,
    policy: SelectionPolicy,
    free_list: FreeList,
    /// Ranges held by callers, keyed by start offset.
    held: BTreeMap<usize, HeldRange>,
    next_allocation: usize,
}

impl SortedListAllocator {
    /// Creates an allocator managing an arena of `total_size` bytes, all of it
    /// in a single free block.
    pub fn new(total_size: usize, policy: SelectionPolicy) -> Result<Self, ArenaError> {
        let arena = Arena::new(total_size)?;
        let mut free_list = FreeList::default();
        free_list.insert_before(None, 0, arena.size());
        Ok(Self {
            arena,
            policy,
            free_list,
            held: BTreeMap::new(),
            next_allocation: 0,
        })
    }

    /// Chooses the node to hand out for a request of `size` bytes.
    fn find_node(&self, size: usize) -> Option<NodeId> {
        // Best fit shares the head-first traversal of first fit.
        let traversal = match self.policy {
            SelectionPolicy::FirstFit | SelectionPolicy::BestFit => SelectionPolicy::FirstFit,
            SelectionPolicy::WorstFit => SelectionPolicy::WorstFit,
        };
        let candidates = self
            .free_list
            .iter()
            .filter(|(_, node)| node.size >= size)
            .map(|(id, node)| (id, node.size));
        traversal.select(candidates)
    }

    /// Finds the node a block at `offset..offset + size` has to be linked in
    /// front of, rejecting ranges that overlap a free block.
    fn find_insert_position(
        &self,
        offset: usize,
        size: usize,
    ) -> Result<Option<NodeId>, DeallocError> {
        let next = self
            .free_list
            .iter()
            .find(|(_, node)| node.offset > offset)
            .map(|(id, _)| id);
        let prev = match next {
            Some(next) => self.free_list.node(next).prev,
            None => self.free_list.tail,
        };
        let end = offset + size;

        if let Some(prev) = prev.map(|id| self.free_list.node(id)) {
            ensure!(
                prev.end() < end || prev.end() <= offset,
                DoubleFreeSnafu { offset }
            );
            ensure!(
                prev.end() <= offset,
                OverlapsFreeBlockSnafu {
                    offset,
                    size,
                    free_offset: prev.offset,
                    free_size: prev.size,
                }
            );
        }
        if let Some(next) = next.map(|id| self.free_list.node(id)) {
            ensure!(
                end <= next.offset,
                OverlapsFreeBlockSnafu {
                    offset,
                    size,
                    free_offset: next.offset,
                    free_size: next.size,
                }
            );
        }
        Ok(next)
    }

    /// Returns the start of the held range containing `offset..end`.
    fn find_held(&self, offset: usize, end: usize) -> Result<usize, DeallocError> {
        self.held
            .range(..=offset)
            .next_back()
            .filter(|(_, held)| end <= held.end)
            .map(|(&start, _)| start)
            .context(UnknownBlockSnafu { offset })
    }

    fn validate_free(
        &self,
        ptr: NonNull<u8>,
        size: usize,
    ) -> Result<(usize, Option<NodeId>, usize), DeallocError> {
        let offset = self.arena.offset_of(ptr).context(ForeignPointerSnafu {
            addr: ptr.addr().get(),
        })?;
        ensure!(size > 0, ZeroSizedFreeSnafu { offset });
        let arena_size = self.arena.size();
        ensure!(
            offset.checked_add(size).is_some_and(|end| end <= arena_size),
            RangeOutOfArenaSnafu {
                offset,
                size,
                arena_size,
            }
        );
        let next = self.find_insert_position(offset, size)?;
        let held = self.find_held(offset, offset + size)?;
        Ok((offset, next, held))
    }

    /// Removes `offset..end` from the held range starting at `start`.
    fn release_held(&mut self, start: usize, offset: usize, end: usize) {
        let Some(held) = self.held.remove(&start) else {
            return;
        };
        if start < offset {
            self.held.insert(start, HeldRange { end: offset, ..held });
        }
        if end < held.end {
            self.held.insert(end, held);
        }
    }
}

impl ArenaAllocator for SortedListAllocator {
    fn name(&self) -> &'static str {
        "Sorted Free List Allocator"
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
        let Some(id) = self.find_node(size) else {
            trace!("allocate({size}): no free block large enough");
            return None;
        };

        let node = self.free_list.remove(id);
        self.held.insert(
            node.offset,
            HeldRange {
                end: node.end(),
                allocation: self.next_allocation,
            },
        );
        self.next_allocation += 1;

        let ptr = self.arena.ptr_at(node.offset);
        trace!("allocate({size}) = {ptr:p} (block {:#x}+{})", node.offset, node.size);
        Some(ptr)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), DeallocError> {
        let (offset, next, held) = self
            .validate_free(ptr, size)
            .inspect_err(|err| warn!("rejected free of {ptr:p}: {err}"))?;

        self.free_list.insert_before(next, offset, size);
        self.release_held(held, offset, offset + size);
        trace!("deallocate({ptr:p}, {size}) (block {offset:#x}+{size})");
        Ok(())
    }

    fn free_blocks(&self) -> Vec<BlockDescriptor> {
        self.free_list
            .iter()
            .map(|(_, node)| BlockDescriptor::free(node.offset, node.size))
            .collect()
    }

    fn check_invariants(&self) -> Result<(), InvariantError> {
        let list = &self.free_list;
        let arena_size = self.arena.size();

        let mut count = 0;
        let mut prev: Option<(NodeId, &Node)> = None;
        for (id, node) in list.iter() {
            count += 1;
            ensure!(
                count <= list.slots.len(),
                LengthMismatchSnafu {
                    expected: list.len,
                    actual: count,
                }
            );
            ensure!(
                node.prev == prev.map(|(id, _)| id),
                BrokenLinkSnafu { node: id.0 }
            );
            ensure!(
                node.size > 0 && node.end() <= arena_size,
                BlockOutOfArenaSnafu {
                    offset: node.offset,
                    size: node.size,
                    arena_size,
                }
            );
            if let Some((_, prev)) = prev {
                ensure!(
                    prev.offset < node.offset,
                    UnsortedSnafu {
                        offset: prev.offset,
                        next: node.offset,
                    }
                );
                ensure!(
                    prev.end() <= node.offset,
                    OverlapSnafu {
                        offset: prev.offset,
                        end: prev.end(),
                        next: node.offset,
                    }
                );
            }
            prev = Some((id, node));
        }

        ensure!(
            list.tail == prev.map(|(id, _)| id),
            BrokenLinkSnafu {
                node: list.tail.map_or(usize::MAX, |id| id.0),
            }
        );
        let free: usize = list.iter().map(|(_, node)| node.size).sum();
        let held: usize = self.held.iter().map(|(start, held)| held.end - start).sum();
        ensure!(
            free + held == arena_size,
            IncompleteCoverSnafu {
                covered: free + held,
                arena_size,
            }
        );

        let occupied = list.slots.iter().filter(|slot| slot.is_some()).count();
        ensure!(
            count == list.len && occupied == list.len,
            LengthMismatchSnafu {
                expected: list.len,
                actual: count,
            }
        );
        Ok(())
    }

    fn stats(&self) -> AllocStats {
        let mut stats = AllocStats::with_name(self.name());
        stats.total = self.arena.size();
        stats.free = self.free_list.iter().map(|(_, node)| node.size).sum();
        stats.in_use = self.held.iter().map(|(start, held)| held.end - start).sum();
        stats.free_blocks = self.free_list.len;
        stats.live_allocations = self
            .held
            .values()
            .map(|held| held.allocation)
            .collect::<BTreeSet<_>>()
            .len();
        stats
    }
}
