//! Per-tile address-space layout.
//!
//! ```text
//!  0x0000 ┌──────────────────────────┐
//!         │ stack                    │
//!         │        ┌─────────────────┤ STACK_SIZE - SERVICE_SCRATCH_SIZE
//!         │        │ service scratch │  request data + log text
//!  0x1000 ├────────┴─────────────────┤
//!         │ offset table (12 B)      │
//!         │ service record (24 B)    │
//!         ├──────────────────────────┤ tile_memory_start
//!         │ tile-shared memory       │
//!         ├──────────────────────────┤ closure_start
//!         │ kernel closure image     │
//!         ├──────────────────────────┤ heap_start
//!         │ heap                     │
//!         ├──────────────────────────┤ global_variable_start
//!         │ global variables         │
//!  0x8000 └──────────────────────────┘
//! ```
//!
//! The offset table is written into tile memory at device construction so
//! code running on the tile can find the movable regions.

use thiserror::Error;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::heap::ALLOC_ALIGN;
use crate::service::record::{ServiceRecord, SERVICE_RECORD_SIZE};

use super::memory::{MemoryAccess, MemoryAccessExt};

/// Total addressable memory per tile (32 KiB data memory).
pub const TILE_SIZE: u32 = 0x8000;

/// Stack region at the bottom of tile memory.
pub const STACK_SIZE: u32 = 0x1000;

/// Bytes at the top of the stack used to stage service requests.
pub const SERVICE_SCRATCH_SIZE: u32 = 0x100;

/// Size of the [`OffsetTable`] in tile memory.
pub const OFFSET_TABLE_SIZE: u32 = 12;

/// Round `value` up to a multiple of `align` (a power of two). `None` if
/// the result does not fit in a `u32`.
#[inline]
pub const fn align_up(value: u32, align: u32) -> Option<u32> {
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Round `value` down to a multiple of `align` (a power of two).
#[inline]
pub const fn align_down(value: u32, align: u32) -> u32 {
    value & !(align - 1)
}

/// Region starts stored in tile memory right after the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct OffsetTable {
    pub global_variable_start: u32,
    pub closure_start: u32,
    pub heap_start: u32,
}

const _: () = assert!(std::mem::size_of::<OffsetTable>() == OFFSET_TABLE_SIZE as usize);

/// Layout construction failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LayoutError {
    #[error("reserved memory start 0x{reserved:04X} lies beyond the {tile_size}-byte tile")]
    ReservedBeyondTile { reserved: u32, tile_size: u32 },
    #[error("no room for a heap: heap would start at 0x{heap_start:04X} but globals start at 0x{globals:04X}")]
    NoHeap { heap_start: u32, globals: u32 },
    #[error("{region} of {size} bytes does not fit in the 32-bit address space")]
    Overflow { region: &'static str, size: u32 },
}

/// Requested region sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutParams {
    pub tile_size: u32,
    /// Bytes of tile-shared memory right after the service record.
    pub tile_memory_size: u32,
    /// Bytes reserved for the kernel closure image.
    pub closure_size: u32,
    /// Start of the global-variable area, which runs to the end of the tile.
    pub reserved_memory: u32,
}

impl Default for LayoutParams {
    fn default() -> Self {
        Self {
            tile_size: TILE_SIZE,
            tile_memory_size: 0x1000,
            closure_size: 0x100,
            reserved_memory: TILE_SIZE - 0x400,
        }
    }
}

/// Resolved per-tile address map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLayout {
    tile_size: u32,
    tile_memory_size: u32,
    table: OffsetTable,
}

impl MemoryLayout {
    pub fn new(params: LayoutParams) -> Result<Self, LayoutError> {
        if params.reserved_memory > params.tile_size {
            return Err(LayoutError::ReservedBeyondTile {
                reserved: params.reserved_memory,
                tile_size: params.tile_size,
            });
        }

        let closure_start = Self::tile_memory_start()
            .checked_add(params.tile_memory_size)
            .and_then(|end| align_up(end, ALLOC_ALIGN))
            .ok_or(LayoutError::Overflow {
                region: "tile memory",
                size: params.tile_memory_size,
            })?;
        let heap_start = closure_start
            .checked_add(params.closure_size)
            .and_then(|end| align_up(end, ALLOC_ALIGN))
            .ok_or(LayoutError::Overflow {
                region: "closure",
                size: params.closure_size,
            })?;
        let global_variable_start = align_down(params.reserved_memory, ALLOC_ALIGN);

        // A heap needs room for at least one header and a minimal block.
        if heap_start.checked_add(16).map_or(true, |end| end > global_variable_start) {
            return Err(LayoutError::NoHeap {
                heap_start,
                globals: global_variable_start,
            });
        }

        Ok(Self {
            tile_size: params.tile_size,
            tile_memory_size: params.tile_memory_size,
            table: OffsetTable {
                global_variable_start,
                closure_start,
                heap_start,
            },
        })
    }

    #[inline]
    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    #[inline]
    pub const fn offset_table_offset() -> u32 {
        STACK_SIZE
    }

    #[inline]
    pub const fn service_record_offset() -> u32 {
        STACK_SIZE + OFFSET_TABLE_SIZE
    }

    #[inline]
    pub const fn service_scratch_offset() -> u32 {
        STACK_SIZE - SERVICE_SCRATCH_SIZE
    }

    #[inline]
    pub const fn tile_memory_start() -> u32 {
        Self::service_record_offset() + SERVICE_RECORD_SIZE
    }

    #[inline]
    pub fn tile_memory_size(&self) -> u32 {
        self.tile_memory_size
    }

    #[inline]
    pub fn closure_start(&self) -> u32 {
        self.table.closure_start
    }

    #[inline]
    pub fn heap_start(&self) -> u32 {
        self.table.heap_start
    }

    #[inline]
    pub fn heap_size(&self) -> u32 {
        self.table.global_variable_start - self.table.heap_start
    }

    #[inline]
    pub fn global_variable_start(&self) -> u32 {
        self.table.global_variable_start
    }

    #[inline]
    pub fn offset_table(&self) -> OffsetTable {
        self.table
    }

    /// Write the offset table and a zeroed service record into `memory`.
    pub fn install<M: MemoryAccess + ?Sized>(&self, memory: &M) {
        memory.store(Self::offset_table_offset(), &self.table);
        memory.store(Self::service_record_offset(), &ServiceRecord::default());
    }

    /// Read the offset table back from tile memory.
    pub fn read_table<M: MemoryAccess + ?Sized>(memory: &M) -> OffsetTable {
        memory.load(Self::offset_table_offset())
    }
}
