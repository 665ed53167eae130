//! The request record shared by a tile and the host.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::device::layout::{MemoryLayout, SERVICE_SCRATCH_SIZE};

/// Size of a [`ServiceRecord`] in tile memory.
pub const SERVICE_RECORD_SIZE: u32 = 24;

/// Request descriptor at [`MemoryLayout::service_record_offset`].
///
/// `counters` is the barrier the two sides meet on; the rest is written by
/// the tile before it arrives and read by the host after.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ServiceRecord {
    /// Device counter, host counter.
    pub counters: [u32; 2],
    /// Index in the service table. 0 means the tile has finished.
    pub index: u32,
    /// Offset of the request data.
    pub data: u32,
    /// Offset of the 4-byte response slot, or 0 for none.
    pub response: u32,
    /// Non-zero when another request from the same tile follows at once.
    pub chained: u32,
}

const _: () = assert!(std::mem::size_of::<ServiceRecord>() == SERVICE_RECORD_SIZE as usize);

pub(crate) const INDEX_FIELD: u32 = 8;
pub(crate) const DATA_FIELD: u32 = 12;
pub(crate) const RESPONSE_FIELD: u32 = 16;
pub(crate) const CHAINED_FIELD: u32 = 20;

/// Largest request data record.
pub const DATA_SLOT_SIZE: u32 = 64;

/// Where the tile stages request data.
pub const fn data_slot() -> u32 {
    MemoryLayout::service_scratch_offset()
}

/// Where the host writes the response.
pub const fn response_slot() -> u32 {
    data_slot() + DATA_SLOT_SIZE
}

/// Where the tile stages log text.
pub const fn text_slot() -> u32 {
    response_slot() + 4
}

/// Bytes of log text sent per request.
pub const TEXT_SLOT_SIZE: u32 = SERVICE_SCRATCH_SIZE - DATA_SLOT_SIZE - 4;
