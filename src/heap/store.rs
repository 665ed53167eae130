//! Where block headers live.
//!
//! The allocator algorithm in [`super::Heap`] only ever touches memory
//! through a [`BlockStore`], so the same code runs on the tile (direct
//! access to its own memory) and on the host (one control-channel
//! transaction per header access).

use std::sync::atomic::Ordering;

use crate::device::memory::{MemoryAccess, MemoryAccessExt, TileMemory};

use super::BlockHeader;

/// Header and payload access for the allocator.
pub trait BlockStore {
    fn load_header(&self, at: u32) -> BlockHeader;

    fn store_header(&self, at: u32, header: BlockHeader);

    /// Copy `len` payload bytes from `from` to `to`. Ranges never overlap.
    fn copy(&self, from: u32, to: u32, len: u32);

    /// Whether blocks allocated through this store are host allocations.
    fn host_side(&self) -> bool {
        false
    }
}

/// The tile's own view of its memory.
#[derive(Clone, Copy)]
pub struct DirectStore<'a> {
    memory: &'a TileMemory,
}

impl<'a> DirectStore<'a> {
    pub fn new(memory: &'a TileMemory) -> Self {
        Self { memory }
    }
}

impl BlockStore for DirectStore<'_> {
    #[inline]
    fn load_header(&self, at: u32) -> BlockHeader {
        BlockHeader::from_words(
            self.memory.word(at).load(Ordering::Relaxed),
            self.memory.word(at + 4).load(Ordering::Relaxed),
        )
    }

    #[inline]
    fn store_header(&self, at: u32, header: BlockHeader) {
        let (prev, bits) = header.to_words();
        self.memory.word(at).store(prev, Ordering::Relaxed);
        self.memory.word(at + 4).store(bits, Ordering::Relaxed);
    }

    fn copy(&self, from: u32, to: u32, len: u32) {
        let mut buf = vec![0u8; len as usize];
        self.memory.read_bytes(from, &mut buf);
        self.memory.write_bytes(to, &buf);
    }
}

/// A host controller's view through a memory handle.
pub struct RemoteStore<H> {
    handle: H,
}

impl<H: MemoryAccess> RemoteStore<H> {
    pub fn new(handle: H) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }
}

impl<H: MemoryAccess> BlockStore for RemoteStore<H> {
    fn load_header(&self, at: u32) -> BlockHeader {
        self.handle.load(at)
    }

    fn store_header(&self, at: u32, header: BlockHeader) {
        self.handle.store(at, &header)
    }

    fn copy(&self, from: u32, to: u32, len: u32) {
        let mut buf = vec![0u8; len as usize];
        self.handle.read_bytes(from, &mut buf);
        self.handle.write_bytes(to, &buf);
    }

    fn host_side(&self) -> bool {
        true
    }
}
