//! First-fit heap allocator for tile memory.
//!
//! The heap is an implicit doubly linked list of blocks laid out back to
//! back: `header | payload | header | payload | ...`. Each 8-byte header
//! records the offset of the previous header and the payload size, so the
//! next header is at `header + 8 + size`. Freed blocks are merged with free
//! neighbours on both sides, so two free blocks are never adjacent.
//!
//! Offsets are absolute within the store's address space. The allocator has
//! no internal locking: one writer at a time, by convention.

pub mod store;

use std::fmt;

use thiserror::Error;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::device::layout::align_up;

pub use store::{BlockStore, DirectStore, RemoteStore};

/// Size of a [`BlockHeader`].
pub const HEADER_SIZE: u32 = 8;
/// Every block starts and ends on this alignment.
pub const ALLOC_ALIGN: u32 = 4;
/// Smallest payload worth splitting a block for.
pub const MIN_ALLOC_SIZE: u32 = 8;

const SIZE_BITS: u32 = 29;
const SIZE_MASK: u32 = (1 << SIZE_BITS) - 1;
const IN_USE: u32 = 1 << 29;
const IS_LAST: u32 = 1 << 30;
const HOST_ALLOCATED: u32 = 1 << 31;
const NO_PREV: u32 = u32::MAX;

/// Largest payload a header can describe.
pub const MAX_BLOCK_SIZE: u32 = SIZE_MASK;

/// On-memory block header.
///
/// Word 0 is the previous header's offset (`u32::MAX` for the first block).
/// Word 1 packs `size:29 | in_use:1 | is_last:1 | host_allocated:1`.
#[derive(Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct BlockHeader {
    prev: u32,
    bits: u32,
}

const _: () = assert!(std::mem::size_of::<BlockHeader>() == HEADER_SIZE as usize);

impl BlockHeader {
    /// Header for a free block of `size` payload bytes.
    pub fn free(size: u32, prev: Option<u32>, is_last: bool) -> Self {
        let mut header = Self {
            prev: NO_PREV,
            bits: 0,
        };
        header.set_size(size);
        header.set_prev(prev);
        header.set_last(is_last);
        header
    }

    #[inline]
    pub(crate) fn from_words(prev: u32, bits: u32) -> Self {
        Self { prev, bits }
    }

    #[inline]
    pub(crate) fn to_words(self) -> (u32, u32) {
        (self.prev, self.bits)
    }

    #[inline]
    pub fn size(&self) -> u32 {
        self.bits & SIZE_MASK
    }

    #[inline]
    pub fn set_size(&mut self, size: u32) {
        debug_assert!(size <= SIZE_MASK, "block size {size} exceeds 29 bits");
        self.bits = (self.bits & !SIZE_MASK) | (size & SIZE_MASK);
    }

    #[inline]
    pub fn prev(&self) -> Option<u32> {
        (self.prev != NO_PREV).then_some(self.prev)
    }

    #[inline]
    pub fn set_prev(&mut self, prev: Option<u32>) {
        self.prev = prev.unwrap_or(NO_PREV);
    }

    #[inline]
    pub fn in_use(&self) -> bool {
        self.bits & IN_USE != 0
    }

    #[inline]
    pub fn set_in_use(&mut self, in_use: bool) {
        self.set_flag(IN_USE, in_use);
    }

    #[inline]
    pub fn is_last(&self) -> bool {
        self.bits & IS_LAST != 0
    }

    #[inline]
    pub fn set_last(&mut self, is_last: bool) {
        self.set_flag(IS_LAST, is_last);
    }

    #[inline]
    pub fn host_allocated(&self) -> bool {
        self.bits & HOST_ALLOCATED != 0
    }

    #[inline]
    pub fn set_host_allocated(&mut self, host: bool) {
        self.set_flag(HOST_ALLOCATED, host);
    }

    /// Room for `new_size` plus a header and a minimal block after it.
    #[inline]
    pub fn is_splitable(&self, new_size: u32) -> bool {
        self.size() >= new_size + HEADER_SIZE + MIN_ALLOC_SIZE
    }

    fn set_flag(&mut self, flag: u32, on: bool) {
        if on {
            self.bits |= flag;
        } else {
            self.bits &= !flag;
        }
    }
}

impl fmt::Debug for BlockHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockHeader")
            .field("prev", &self.prev())
            .field("size", &self.size())
            .field("in_use", &self.in_use())
            .field("is_last", &self.is_last())
            .field("host_allocated", &self.host_allocated())
            .finish()
    }
}

/// Heap region validation failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HeapError {
    #[error("heap start 0x{0:04X} is not {ALLOC_ALIGN}-byte aligned")]
    Misaligned(u32),
    #[error("heap of {0} bytes is too small for a header and a minimal block")]
    TooSmall(u32),
    #[error("heap of {0} bytes exceeds the largest describable block")]
    TooLarge(u32),
}

/// Snapshot of one block, for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Offset of the header.
    pub header: u32,
    /// Offset of the payload (what `malloc` returned).
    pub payload: u32,
    pub size: u32,
    pub in_use: bool,
    pub is_last: bool,
    pub host_allocated: bool,
}

/// A heap over a region `[start, start + size)` of some store.
pub struct Heap<S> {
    store: S,
    start: u32,
    size: u32,
}

impl<S: BlockStore> Heap<S> {
    /// Format the region as one free block covering everything.
    pub fn init(store: S, start: u32, size: u32) -> Result<Self, HeapError> {
        Self::validate(start, size)?;
        let mut first = BlockHeader::free(size - HEADER_SIZE, None, true);
        first.set_host_allocated(store.host_side());
        store.store_header(start, first);
        log::debug!("heap initialised at 0x{start:04X}, {size} bytes");
        Ok(Self { store, start, size })
    }

    /// Use a region previously formatted by [`Heap::init`].
    pub fn attach(store: S, start: u32, size: u32) -> Result<Self, HeapError> {
        Self::validate(start, size)?;
        Ok(Self { store, start, size })
    }

    fn validate(start: u32, size: u32) -> Result<(), HeapError> {
        if start % ALLOC_ALIGN != 0 {
            return Err(HeapError::Misaligned(start));
        }
        if size < HEADER_SIZE + MIN_ALLOC_SIZE {
            return Err(HeapError::TooSmall(size));
        }
        if size - HEADER_SIZE > MAX_BLOCK_SIZE {
            return Err(HeapError::TooLarge(size));
        }
        Ok(())
    }

    #[inline]
    pub fn start(&self) -> u32 {
        self.start
    }

    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    #[inline]
    fn next_of(at: u32, header: &BlockHeader) -> u32 {
        at + HEADER_SIZE + header.size()
    }

    fn round(size: u32) -> Option<u32> {
        let size = size.max(MIN_ALLOC_SIZE);
        if size > MAX_BLOCK_SIZE {
            return None;
        }
        align_up(size, ALLOC_ALIGN)
    }

    /// Shrink the block at `at` to `new_size` and turn the rest into a free
    /// block that inherits `is_last`.
    fn split(&self, at: u32, header: &mut BlockHeader, new_size: u32) {
        debug_assert!(header.size() >= new_size + HEADER_SIZE);
        let rest_at = at + HEADER_SIZE + new_size;
        let rest = BlockHeader::free(
            header.size() - new_size - HEADER_SIZE,
            Some(at),
            header.is_last(),
        );
        self.store.store_header(rest_at, rest);

        if !rest.is_last() {
            let after_at = Self::next_of(rest_at, &rest);
            let mut after = self.store.load_header(after_at);
            after.set_prev(Some(rest_at));
            self.store.store_header(after_at, after);
        }

        header.set_size(new_size);
        header.set_last(false);
    }

    /// Absorb the following block if it is free. Returns whether it did.
    fn merge_next(&self, at: u32, header: &mut BlockHeader) -> bool {
        if header.is_last() {
            return false;
        }
        let next_at = Self::next_of(at, header);
        let next = self.store.load_header(next_at);
        if next.in_use() {
            return false;
        }

        header.set_size(header.size() + HEADER_SIZE + next.size());
        header.set_last(next.is_last());
        if !header.is_last() {
            let after_at = Self::next_of(at, header);
            let mut after = self.store.load_header(after_at);
            after.set_prev(Some(at));
            self.store.store_header(after_at, after);
        }
        true
    }

    /// First-fit allocation. Returns the payload offset, or `None` when no
    /// free block is large enough.
    pub fn try_malloc(&self, size: u32) -> Option<u32> {
        let size = Self::round(size)?;
        let mut at = self.start;
        loop {
            let mut header = self.store.load_header(at);
            if !header.in_use() && header.size() >= size {
                if header.is_splitable(size) {
                    self.split(at, &mut header, size);
                }
                header.set_in_use(true);
                header.set_host_allocated(self.store.host_side());
                self.store.store_header(at, header);
                log::trace!("malloc({size}) = 0x{:04X}", at + HEADER_SIZE);
                return Some(at + HEADER_SIZE);
            }
            if header.is_last() {
                log::debug!("malloc({size}) failed, {} bytes free", self.free_bytes());
                return None;
            }
            at = Self::next_of(at, &header);
        }
    }

    /// Allocate or panic.
    pub fn malloc(&self, size: u32) -> u32 {
        match self.try_malloc(size) {
            Some(ptr) => ptr,
            None => panic!("unhandled dynamic allocation failure ({size} bytes)"),
        }
    }

    fn header_of(&self, ptr: u32) -> u32 {
        assert!(
            ptr >= self.start + HEADER_SIZE && ptr < self.start + self.size,
            "pointer 0x{ptr:04X} is not inside the heap"
        );
        ptr - HEADER_SIZE
    }

    /// Release the block at `ptr`.
    ///
    /// # Panics
    /// On a pointer outside the heap or a block that is not in use.
    pub fn free(&self, ptr: u32) {
        let at = self.header_of(ptr);
        let mut header = self.store.load_header(at);
        assert!(header.in_use(), "double free of 0x{ptr:04X}");

        header.set_in_use(false);
        header.set_host_allocated(false);
        self.merge_next(at, &mut header);
        self.store.store_header(at, header);

        if let Some(prev_at) = header.prev() {
            let mut prev = self.store.load_header(prev_at);
            if !prev.in_use() && self.merge_next(prev_at, &mut prev) {
                self.store.store_header(prev_at, prev);
            }
        }
        log::trace!("free(0x{ptr:04X})");
    }

    /// Resize the block at `ptr`, in place when possible.
    ///
    /// Returns the new payload offset, or `None` (leaving the original block
    /// untouched) when no block is large enough.
    pub fn try_realloc(&self, ptr: u32, new_size: u32) -> Option<u32> {
        let new_size = Self::round(new_size)?;
        let at = self.header_of(ptr);
        let mut header = self.store.load_header(at);
        assert!(header.in_use(), "realloc of free block 0x{ptr:04X}");

        if header.size() < new_size && !header.is_last() {
            let next = self.store.load_header(Self::next_of(at, &header));
            if !next.in_use() && header.size() + HEADER_SIZE + next.size() >= new_size {
                self.merge_next(at, &mut header);
            }
        }

        if header.size() >= new_size {
            if header.is_splitable(new_size) {
                self.split(at, &mut header, new_size);
                // The split-off tail may now sit next to a free block.
                let rest_at = Self::next_of(at, &header);
                let mut rest = self.store.load_header(rest_at);
                if self.merge_next(rest_at, &mut rest) {
                    self.store.store_header(rest_at, rest);
                }
            }
            self.store.store_header(at, header);
            return Some(ptr);
        }

        let old_size = header.size();
        let new_ptr = self.try_malloc(new_size)?;
        self.store.copy(ptr, new_ptr, old_size);
        self.free(ptr);
        Some(new_ptr)
    }

    /// Resize or panic.
    pub fn realloc(&self, ptr: u32, new_size: u32) -> u32 {
        match self.try_realloc(ptr, new_size) {
            Some(ptr) => ptr,
            None => panic!("unhandled dynamic allocation failure ({new_size} bytes)"),
        }
    }

    /// Walk the block list from the start.
    pub fn blocks(&self) -> Blocks<'_, S> {
        Blocks {
            heap: self,
            next: Some(self.start),
        }
    }

    /// Payload bytes in free blocks.
    pub fn free_bytes(&self) -> u32 {
        self.blocks()
            .filter(|b| !b.in_use)
            .map(|b| b.size)
            .sum()
    }

    /// Largest single allocation that would currently succeed.
    pub fn largest_free(&self) -> u32 {
        self.blocks()
            .filter(|b| !b.in_use)
            .map(|b| b.size)
            .max()
            .unwrap_or(0)
    }

    /// Blocks still in use that the host did not allocate.
    pub fn leaks(&self) -> Vec<BlockInfo> {
        self.blocks()
            .filter(|b| b.in_use && !b.host_allocated)
            .collect()
    }

    /// Panic if any tile-side allocation is still live.
    pub fn assert_no_leak(&self) {
        let leaks = self.leaks();
        if !leaks.is_empty() {
            self.dump();
            panic!(
                "{} leaked block(s), first at 0x{:04X}",
                leaks.len(),
                leaks[0].payload
            );
        }
    }

    /// Log the block list at debug level.
    pub fn dump(&self) {
        log::debug!("heap 0x{:04X}+{}:", self.start, self.size);
        for block in self.blocks() {
            log::debug!(
                "  0x{:04X} size={} {}{}{}",
                block.payload,
                block.size,
                if block.in_use { "used" } else { "free" },
                if block.host_allocated { " host" } else { "" },
                if block.is_last { " last" } else { "" },
            );
        }
    }
}

/// Iterator over a heap's blocks.
pub struct Blocks<'a, S> {
    heap: &'a Heap<S>,
    next: Option<u32>,
}

impl<S: BlockStore> Iterator for Blocks<'_, S> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        let at = self.next?;
        let header = self.heap.store.load_header(at);
        self.next = (!header.is_last()).then(|| Heap::<S>::next_of(at, &header));
        Some(BlockInfo {
            header: at,
            payload: at + HEADER_SIZE,
            size: header.size(),
            in_use: header.in_use(),
            is_last: header.is_last(),
            host_allocated: header.host_allocated(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::memory::{HostHandle, MemoryAccess, TileMemory};
    use crate::device::TileCoord;
    use proptest::prelude::*;
    use std::sync::Arc;

    const START: u32 = 0x100;
    const SIZE: u32 = 0x400;

    fn direct(memory: &TileMemory) -> Heap<DirectStore<'_>> {
        Heap::init(DirectStore::new(memory), START, SIZE).unwrap()
    }

    /// Structural invariants that must hold after every operation.
    fn check_invariants<S: BlockStore>(heap: &Heap<S>) {
        let blocks: Vec<_> = heap.blocks().collect();
        let mut expected_prev = None;
        let mut at = heap.start();
        for (i, block) in blocks.iter().enumerate() {
            assert_eq!(block.header, at);
            assert_eq!(heap.store().load_header(at).prev(), expected_prev);
            assert_eq!(block.is_last, i == blocks.len() - 1);
            if i > 0 {
                assert!(
                    blocks[i - 1].in_use || block.in_use,
                    "adjacent free blocks at 0x{:04X}",
                    block.header
                );
            }
            expected_prev = Some(at);
            at += HEADER_SIZE + block.size;
        }
        assert_eq!(at, heap.start() + heap.size());
    }

    #[test]
    fn test_header_packing() {
        let mut h = BlockHeader::free(100, Some(0x40), true);
        assert_eq!(h.size(), 100);
        assert_eq!(h.prev(), Some(0x40));
        assert!(h.is_last());
        assert!(!h.in_use());
        h.set_in_use(true);
        h.set_host_allocated(true);
        assert_eq!(h.size(), 100);
        assert_eq!(h.to_words().1 >> 29, 0b111);
        h.set_last(false);
        assert!(!h.is_last());
        assert_eq!(BlockHeader::free(8, None, false).prev(), None);
    }

    #[test]
    fn test_init_single_free_block() {
        let memory = TileMemory::new(0x800);
        let heap = direct(&memory);
        let blocks: Vec<_> = heap.blocks().collect();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].size, SIZE - HEADER_SIZE);
        assert!(blocks[0].is_last);
    }

    #[test]
    fn test_malloc_splits_and_aligns() {
        let memory = TileMemory::new(0x800);
        let heap = direct(&memory);
        let a = heap.malloc(5);
        let b = heap.malloc(12);
        assert_eq!(a, START + HEADER_SIZE);
        assert_eq!(b, a + 8 + HEADER_SIZE);
        assert_eq!(a % ALLOC_ALIGN, 0);
        assert_eq!(b % ALLOC_ALIGN, 0);
        check_invariants(&heap);
    }

    #[test]
    fn test_zero_size_gets_distinct_blocks() {
        let memory = TileMemory::new(0x800);
        let heap = direct(&memory);
        let a = heap.malloc(0);
        let b = heap.malloc(0);
        assert_ne!(a, b);
        check_invariants(&heap);
    }

    #[test]
    fn test_no_split_when_remainder_too_small() {
        let memory = TileMemory::new(0x800);
        let heap = direct(&memory);
        // Leave exactly 12 bytes: not enough for header + 8
        let whole = SIZE - HEADER_SIZE;
        let ptr = heap.malloc(whole - 12);
        let blocks: Vec<_> = heap.blocks().collect();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].payload, ptr);
        assert_eq!(blocks[0].size, whole);
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let memory = TileMemory::new(0x800);
        let heap = direct(&memory);
        assert_eq!(heap.try_malloc(SIZE), None);
        let whole = heap.malloc(SIZE - HEADER_SIZE);
        assert_eq!(heap.try_malloc(4), None);
        heap.free(whole);
        assert!(heap.try_malloc(4).is_some());
    }

    #[test]
    #[should_panic(expected = "unhandled dynamic allocation failure")]
    fn test_malloc_panics_on_exhaustion() {
        let memory = TileMemory::new(0x800);
        let heap = direct(&memory);
        heap.malloc(SIZE * 2);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_panics() {
        let memory = TileMemory::new(0x800);
        let heap = direct(&memory);
        let a = heap.malloc(16);
        let _b = heap.malloc(16);
        heap.free(a);
        heap.free(a);
    }

    #[test]
    fn test_adjacent_frees_coalesce_either_order() {
        for order in [[0usize, 1], [1, 0]] {
            let memory = TileMemory::new(0x800);
            let heap = direct(&memory);
            let ptrs = [heap.malloc(32), heap.malloc(48)];
            let guard = heap.malloc(16);
            heap.free(ptrs[order[0]]);
            heap.free(ptrs[order[1]]);
            check_invariants(&heap);
            let combined = heap.malloc(32 + HEADER_SIZE + 48);
            assert_eq!(combined, ptrs[0]);
            heap.free(combined);
            heap.free(guard);
            assert_eq!(heap.blocks().count(), 1);
        }
    }

    #[test]
    fn test_free_everything_restores_single_block() {
        let memory = TileMemory::new(0x800);
        let heap = direct(&memory);
        let ptrs: Vec<_> = (1..=10).map(|i| heap.malloc(i * 4)).collect();
        for &p in ptrs.iter().step_by(2) {
            heap.free(p);
        }
        for &p in ptrs.iter().skip(1).step_by(2) {
            heap.free(p);
        }
        let blocks: Vec<_> = heap.blocks().collect();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].size, SIZE - HEADER_SIZE);
    }

    #[test]
    fn test_realloc_grows_in_place_into_free_next() {
        let memory = TileMemory::new(0x800);
        let heap = direct(&memory);
        let a = heap.malloc(16);
        let b = heap.malloc(64);
        let _c = heap.malloc(16);
        heap.free(b);
        memory.write_u32(a, 0xCAFE);
        let grown = heap.realloc(a, 48);
        assert_eq!(grown, a);
        assert_eq!(memory.read_u32(a), 0xCAFE);
        check_invariants(&heap);
    }

    #[test]
    fn test_realloc_shrinks_in_place() {
        let memory = TileMemory::new(0x800);
        let heap = direct(&memory);
        let a = heap.malloc(128);
        let shrunk = heap.realloc(a, 16);
        assert_eq!(shrunk, a);
        assert_eq!(heap.blocks().next().unwrap().size, 16);
        check_invariants(&heap);
    }

    #[test]
    fn test_realloc_moves_and_copies() {
        let memory = TileMemory::new(0x800);
        let heap = direct(&memory);
        let a = heap.malloc(8);
        let _pin = heap.malloc(8);
        memory.write_u32(a, 11);
        memory.write_u32(a + 4, 22);
        let moved = heap.realloc(a, 64);
        assert_ne!(moved, a);
        assert_eq!(memory.read_u32(moved), 11);
        assert_eq!(memory.read_u32(moved + 4), 22);
        assert!(!heap.blocks().next().unwrap().in_use);
        check_invariants(&heap);
    }

    #[test]
    fn test_remote_and_direct_share_layout() {
        let memory = Arc::new(TileMemory::new(0x800));
        let handle = HostHandle::new(TileCoord::new(0, 0), memory.clone());
        let remote = Heap::init(RemoteStore::new(&handle), START, SIZE).unwrap();
        let host_block = remote.malloc(24);

        let device = Heap::attach(DirectStore::new(&memory), START, SIZE).unwrap();
        let tile_block = device.malloc(24);
        assert_eq!(tile_block, host_block + 24 + HEADER_SIZE);

        // Only the tile allocation counts as a leak
        let leaks = device.leaks();
        assert_eq!(leaks.len(), 1);
        assert_eq!(leaks[0].payload, tile_block);

        device.free(tile_block);
        device.assert_no_leak();
        remote.free(host_block);
        assert_eq!(remote.blocks().count(), 1);
        assert!(handle.transactions().0 > 0);
    }

    #[test]
    #[should_panic(expected = "leaked block")]
    fn test_assert_no_leak_panics() {
        let memory = TileMemory::new(0x800);
        let heap = direct(&memory);
        heap.malloc(8);
        heap.assert_no_leak();
    }

    #[test]
    fn test_invalid_regions() {
        let memory = TileMemory::new(0x800);
        assert_eq!(
            Heap::init(DirectStore::new(&memory), 2, 64).err(),
            Some(HeapError::Misaligned(2))
        );
        assert_eq!(
            Heap::init(DirectStore::new(&memory), 0, 8).err(),
            Some(HeapError::TooSmall(8))
        );
    }

    #[derive(Debug, Clone)]
    enum Op {
        Alloc(u32),
        Free(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u32..200).prop_map(Op::Alloc),
            any::<usize>().prop_map(Op::Free),
        ]
    }

    proptest! {
        #[test]
        fn test_random_sequence_then_free_all(ops in proptest::collection::vec(op(), 1..80)) {
            let memory = TileMemory::new(0x800);
            let heap = direct(&memory);
            let mut live: Vec<u32> = Vec::new();
            for op in ops {
                match op {
                    Op::Alloc(size) => {
                        if let Some(ptr) = heap.try_malloc(size) {
                            prop_assert_eq!(ptr % ALLOC_ALIGN, 0);
                            prop_assert!(!live.contains(&ptr));
                            live.push(ptr);
                        }
                    }
                    Op::Free(i) if !live.is_empty() => {
                        let ptr = live.swap_remove(i % live.len());
                        heap.free(ptr);
                    }
                    Op::Free(_) => {}
                }
                check_invariants(&heap);
            }
            for ptr in live {
                heap.free(ptr);
            }
            let blocks: Vec<_> = heap.blocks().collect();
            prop_assert_eq!(blocks.len(), 1);
            prop_assert_eq!(blocks[0].size, SIZE - HEADER_SIZE);
        }
    }
}
