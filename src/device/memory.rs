//! Tile-local memory.
//!
//! Tile memory is shared between the tile program (running on a pool
//! worker) and the host controller (the polling thread), so it is stored as
//! atomic little-endian words. Word accesses use acquire/release ordering;
//! byte accesses read-modify-write the containing word.
//!
//! Accesses outside the memory panic, like slice indexing. Callers taking
//! offsets from untrusted places (DMA commands, service requests) check
//! them first with [`MemoryAccess::contains`].

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes};

use super::TileCoord;

/// Read/write access to one tile's memory at byte offsets.
///
/// This is the boundary to whatever actually holds the memory: the tile
/// itself, or a host controller reaching it over a control channel.
pub trait MemoryAccess: Send + Sync {
    /// Size in bytes.
    fn size(&self) -> u32;

    /// Read an aligned word.
    fn read_u32(&self, offset: u32) -> u32;

    /// Write an aligned word.
    fn write_u32(&self, offset: u32, value: u32);

    fn read_bytes(&self, offset: u32, buf: &mut [u8]);

    fn write_bytes(&self, offset: u32, data: &[u8]);

    /// True if `[offset, offset + len)` lies inside the memory.
    fn contains(&self, offset: u32, len: u32) -> bool {
        offset
            .checked_add(len)
            .is_some_and(|end| end <= self.size())
    }
}

/// Typed access to fixed-layout records.
pub trait MemoryAccessExt: MemoryAccess {
    /// Read a `#[repr(C)]` record stored at `offset`.
    fn load<T: FromBytes + IntoBytes>(&self, offset: u32) -> T {
        let mut value = T::new_zeroed();
        self.read_bytes(offset, value.as_mut_bytes());
        value
    }

    /// Write a `#[repr(C)]` record at `offset`.
    fn store<T: IntoBytes + Immutable>(&self, offset: u32, value: &T) {
        self.write_bytes(offset, value.as_bytes());
    }
}

impl<M: MemoryAccess + ?Sized> MemoryAccessExt for M {}

impl<M: MemoryAccess + ?Sized> MemoryAccess for Arc<M> {
    fn size(&self) -> u32 {
        (**self).size()
    }

    fn read_u32(&self, offset: u32) -> u32 {
        (**self).read_u32(offset)
    }

    fn write_u32(&self, offset: u32, value: u32) {
        (**self).write_u32(offset, value)
    }

    fn read_bytes(&self, offset: u32, buf: &mut [u8]) {
        (**self).read_bytes(offset, buf)
    }

    fn write_bytes(&self, offset: u32, data: &[u8]) {
        (**self).write_bytes(offset, data)
    }
}

impl<M: MemoryAccess + ?Sized> MemoryAccess for &M {
    fn size(&self) -> u32 {
        (**self).size()
    }

    fn read_u32(&self, offset: u32) -> u32 {
        (**self).read_u32(offset)
    }

    fn write_u32(&self, offset: u32, value: u32) {
        (**self).write_u32(offset, value)
    }

    fn read_bytes(&self, offset: u32, buf: &mut [u8]) {
        (**self).read_bytes(offset, buf)
    }

    fn write_bytes(&self, offset: u32, data: &[u8]) {
        (**self).write_bytes(offset, data)
    }
}

/// One tile's memory.
pub struct TileMemory {
    words: Box<[AtomicU32]>,
}

impl TileMemory {
    /// Zero-filled memory of `size` bytes, rounded up to whole words.
    pub fn new(size: u32) -> Self {
        let words = size.div_ceil(4) as usize;
        Self {
            words: (0..words).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    /// The atomic word at a 4-byte aligned offset.
    #[inline]
    pub fn word(&self, offset: u32) -> &AtomicU32 {
        assert!(
            offset % 4 == 0,
            "misaligned word access at offset 0x{offset:04X}"
        );
        &self.words[(offset / 4) as usize]
    }

    /// Read `count` consecutive words.
    pub fn read_words(&self, offset: u32, count: usize) -> Vec<u32> {
        (0..count as u32)
            .map(|i| self.read_u32(offset + i * 4))
            .collect()
    }

    /// Write consecutive words starting at `offset`.
    pub fn write_words(&self, offset: u32, values: &[u32]) {
        for (i, &value) in values.iter().enumerate() {
            self.write_u32(offset + i as u32 * 4, value);
        }
    }

    /// Zero the whole memory.
    pub fn clear(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Relaxed);
        }
    }

    fn check_range(&self, offset: u32, len: usize) {
        assert!(
            self.contains(offset, len as u32),
            "tile memory access [0x{offset:04X}, +{len}) outside {} bytes",
            self.size()
        );
    }
}

impl MemoryAccess for TileMemory {
    #[inline]
    fn size(&self) -> u32 {
        (self.words.len() * 4) as u32
    }

    #[inline]
    fn read_u32(&self, offset: u32) -> u32 {
        self.word(offset).load(Ordering::Acquire)
    }

    #[inline]
    fn write_u32(&self, offset: u32, value: u32) {
        self.word(offset).store(value, Ordering::Release)
    }

    fn read_bytes(&self, offset: u32, buf: &mut [u8]) {
        self.check_range(offset, buf.len());
        let mut pos = offset as usize;
        let mut out = 0;
        while out < buf.len() {
            let base = pos & !3;
            let skip = pos - base;
            let take = (4 - skip).min(buf.len() - out);
            let mut bytes = [0u8; 4];
            LittleEndian::write_u32(&mut bytes, self.read_u32(base as u32));
            buf[out..out + take].copy_from_slice(&bytes[skip..skip + take]);
            out += take;
            pos += take;
        }
    }

    fn write_bytes(&self, offset: u32, data: &[u8]) {
        self.check_range(offset, data.len());
        let mut pos = offset as usize;
        let mut done = 0;
        while done < data.len() {
            let base = pos & !3;
            let skip = pos - base;
            let take = (4 - skip).min(data.len() - done);
            let chunk = &data[done..done + take];
            let word = self.word(base as u32);
            if take == 4 {
                word.store(LittleEndian::read_u32(chunk), Ordering::Release);
            } else {
                let _ = word.fetch_update(Ordering::AcqRel, Ordering::Acquire, |old| {
                    let mut bytes = [0u8; 4];
                    LittleEndian::write_u32(&mut bytes, old);
                    bytes[skip..skip + take].copy_from_slice(chunk);
                    Some(LittleEndian::read_u32(&bytes))
                });
            }
            done += take;
            pos += take;
        }
    }
}

impl std::fmt::Debug for TileMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileMemory")
            .field("size", &self.size())
            .finish()
    }
}

/// Host-side handle on a tile's memory.
///
/// Stands in for a driver handle: every access is a separate transaction
/// over a slow control channel, traced and counted.
pub struct HostHandle {
    coord: TileCoord,
    memory: Arc<TileMemory>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl HostHandle {
    pub fn new(coord: TileCoord, memory: Arc<TileMemory>) -> Self {
        Self {
            coord,
            memory,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn coord(&self) -> TileCoord {
        self.coord
    }

    /// (reads, writes) issued through this handle so far.
    pub fn transactions(&self) -> (u64, u64) {
        (
            self.reads.load(Ordering::Relaxed),
            self.writes.load(Ordering::Relaxed),
        )
    }
}

impl MemoryAccess for HostHandle {
    fn size(&self) -> u32 {
        self.memory.size()
    }

    fn read_u32(&self, offset: u32) -> u32 {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let value = self.memory.read_u32(offset);
        log::trace!("{} host read  0x{offset:04X} -> 0x{value:08X}", self.coord);
        value
    }

    fn write_u32(&self, offset: u32, value: u32) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        log::trace!("{} host write 0x{offset:04X} <- 0x{value:08X}", self.coord);
        self.memory.write_u32(offset, value)
    }

    fn read_bytes(&self, offset: u32, buf: &mut [u8]) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        log::trace!("{} host read  0x{offset:04X} [{} bytes]", self.coord, buf.len());
        self.memory.read_bytes(offset, buf)
    }

    fn write_bytes(&self, offset: u32, data: &[u8]) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        log::trace!("{} host write 0x{offset:04X} [{} bytes]", self.coord, data.len());
        self.memory.write_bytes(offset, data)
    }
}
