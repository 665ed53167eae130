//! Host services a tile program can call.
//!
//! A tile describes a request in its service record and meets the host on
//! the record's barrier. The host polls every tile, decodes the request
//! data with the type registered at the requested index, runs the handler
//! and meets the tile again so it can read the response.
//!
//! ```text
//!   tile                                host
//!   ────                                ────
//!   stage data, fill record
//!   barrier ─────────────────────────▶ try_arrive / wait
//!                                      decode, act_on_data, write response
//!   barrier ◀───────────────────────── wait
//!   read response
//! ```
//!
//! Index 0 is reserved: the tile has finished and reports its exit code in
//! a [`DoneData`]. The poller handles it inline and never looks it up in
//! the table, so registered services start at index 1. A request with `chained` set tells the host the next request
//! from the same tile follows immediately, so multi-part log lines stay
//! contiguous.

pub mod builtin;
pub mod client;
pub mod poller;
pub mod record;

use std::any::TypeId;
use std::collections::HashMap;
use std::marker::PhantomData;

use thiserror::Error;
use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::device::{MemoryAccess, TileCoord};

pub use builtin::{
    BreakpointData, BreakpointService, DoneData, LogCapture, LogData, LogService,
};
pub use client::ServiceClient;
pub use poller::{PollStats, ServicePoller};
pub use record::{ServiceRecord, SERVICE_RECORD_SIZE};

/// Tile finished normally.
pub const EXIT_SUCCESS: i32 = 0;
/// Tile program returned an error.
pub const EXIT_FAILURE: i32 = 1;
/// Tile called `abort`.
pub const EXIT_ABORT: i32 = i32::MAX - 1;
/// Tile program panicked.
pub const EXIT_ASSERT: i32 = i32::MAX;

/// Index reserved for the done request.
pub const DONE_INDEX: u32 = 0;

/// Short name for an exit code.
pub fn exit_reason(code: &i32) -> &'static str {
    match *code {
        EXIT_SUCCESS => "success",
        EXIT_FAILURE => "failure",
        EXIT_ABORT => "abort",
        EXIT_ASSERT => "assertion",
        _ => "exit",
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("tile {coord} requested unknown service {index}")]
    UnknownService { coord: TileCoord, index: u32 },

    #[error("service {0} is not registered")]
    NotRegistered(&'static str),

    #[error("service {0} is already registered")]
    Duplicate(&'static str),

    #[error("{service} request has {found} bytes, expected {expected}")]
    BadRequest {
        service: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("request data of {size} bytes does not fit the {max}-byte slot")]
    DataTooLarge { size: usize, max: u32 },

    #[error("tile {coord}: 0x{offset:04X}+{len} is outside tile memory")]
    OutOfBounds { coord: TileCoord, offset: u32, len: u32 },

    #[error("tile {coord} terminated with {} (code {code})", exit_reason(.code))]
    TileFailed { coord: TileCoord, code: i32 },

    #[error("service handler failed: {0}")]
    Handler(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// What a handler sees of the requesting tile.
pub struct ServiceContext<'a> {
    coord: TileCoord,
    memory: &'a dyn MemoryAccess,
}

impl<'a> ServiceContext<'a> {
    pub fn new(coord: TileCoord, memory: &'a dyn MemoryAccess) -> Self {
        Self { coord, memory }
    }

    pub fn coord(&self) -> TileCoord {
        self.coord
    }

    /// The tile's memory as the host reaches it.
    pub fn memory(&self) -> &'a dyn MemoryAccess {
        self.memory
    }

    fn check(&self, offset: u32, len: u32) -> Result<(), ServiceError> {
        if self.memory.contains(offset, len) {
            Ok(())
        } else {
            Err(ServiceError::OutOfBounds {
                coord: self.coord,
                offset,
                len,
            })
        }
    }

    /// Copy `len` bytes out of tile memory.
    pub fn read_bytes(&self, offset: u32, len: u32) -> Result<Vec<u8>, ServiceError> {
        self.check(offset, len)?;
        let mut buf = vec![0u8; len as usize];
        self.memory.read_bytes(offset, &mut buf);
        Ok(buf)
    }

    /// Copy `count` words out of tile memory.
    pub fn read_words(&self, offset: u32, count: u32) -> Result<Vec<u32>, ServiceError> {
        let len = count.checked_mul(4).ok_or(ServiceError::OutOfBounds {
            coord: self.coord,
            offset,
            len: u32::MAX,
        })?;
        self.check(offset, len)?;
        Ok((0..count).map(|i| self.memory.read_u32(offset + 4 * i)).collect())
    }
}

/// A host-side handler for one kind of request.
pub trait Service: Send + Sync + 'static {
    /// Request data, laid out identically on both sides.
    type Data: FromBytes + IntoBytes + Immutable + Send + 'static;

    const NAME: &'static str;

    /// Handle one request. `Some(value)` is written to the tile's response
    /// slot.
    fn act_on_data(
        &self,
        ctx: &ServiceContext<'_>,
        data: Self::Data,
    ) -> Result<Option<u32>, ServiceError>;
}

trait ErasedService: Send + Sync {
    fn name(&self) -> &'static str;
    fn data_size(&self) -> usize;
    fn dispatch(&self, ctx: &ServiceContext<'_>, bytes: &[u8])
        -> Result<Option<u32>, ServiceError>;
}

impl<S: Service> ErasedService for S {
    fn name(&self) -> &'static str {
        S::NAME
    }

    fn data_size(&self) -> usize {
        std::mem::size_of::<S::Data>()
    }

    fn dispatch(
        &self,
        ctx: &ServiceContext<'_>,
        bytes: &[u8],
    ) -> Result<Option<u32>, ServiceError> {
        let data = S::Data::read_from_bytes(bytes).map_err(|_| ServiceError::BadRequest {
            service: S::NAME,
            expected: self.data_size(),
            found: bytes.len(),
        })?;
        self.act_on_data(ctx, data)
    }
}

type Handler<D> = dyn Fn(&ServiceContext<'_>, D) -> Result<Option<u32>, ServiceError> + Send + Sync;

/// A closure registered as a service. One per data type.
pub struct FnService<D> {
    handler: Box<Handler<D>>,
    _data: PhantomData<fn(D)>,
}

impl<D> FnService<D> {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&ServiceContext<'_>, D) -> Result<Option<u32>, ServiceError> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            _data: PhantomData,
        }
    }
}

impl<D> Service for FnService<D>
where
    D: FromBytes + IntoBytes + Immutable + Send + 'static,
{
    type Data = D;
    const NAME: &'static str = "fn";

    fn act_on_data(&self, ctx: &ServiceContext<'_>, data: D) -> Result<Option<u32>, ServiceError> {
        (self.handler)(ctx, data)
    }
}

/// Registered services, indexed by the number a tile puts in its record.
///
/// Index [`DONE_INDEX`] never maps to an entry. Built once before the device
/// and shared read-only afterwards.
pub struct ServiceTable {
    entries: Vec<Box<dyn ErasedService>>,
    by_type: HashMap<TypeId, u32>,
}

impl ServiceTable {
    /// A table with no services; only the done request is understood.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            by_type: HashMap::new(),
        }
    }

    /// Log to stdout and breakpoint.
    pub fn with_builtins() -> Self {
        Self::with_log(LogService::stdout())
    }

    /// The given log service and breakpoint.
    pub fn with_log(log: LogService) -> Self {
        let mut table = Self::new();
        table.insert(log);
        table.insert(BreakpointService::default());
        table
    }

    fn insert<S: Service>(&mut self, service: S) -> u32 {
        let index = self.entries.len() as u32 + 1;
        self.by_type.insert(TypeId::of::<S>(), index);
        self.entries.push(Box::new(service));
        index
    }

    /// Add a service and return its index.
    pub fn register<S: Service>(&mut self, service: S) -> Result<u32, ServiceError> {
        if self.by_type.contains_key(&TypeId::of::<S>()) {
            return Err(ServiceError::Duplicate(S::NAME));
        }
        let index = self.insert(service);
        log::debug!("registered service {} at index {index}", S::NAME);
        Ok(index)
    }

    /// Add a closure handling requests carrying `D`.
    pub fn register_fn<D, F>(&mut self, handler: F) -> Result<u32, ServiceError>
    where
        D: FromBytes + IntoBytes + Immutable + Send + 'static,
        F: Fn(&ServiceContext<'_>, D) -> Result<Option<u32>, ServiceError> + Send + Sync + 'static,
    {
        self.register(FnService::new(handler))
    }

    fn entry(&self, index: u32) -> Option<&dyn ErasedService> {
        let slot = index.checked_sub(1)?;
        self.entries.get(slot as usize).map(|s| s.as_ref())
    }

    pub fn index_of<S: Service>(&self) -> Option<u32> {
        self.by_type.get(&TypeId::of::<S>()).copied()
    }

    pub fn name_of(&self, index: u32) -> Option<&'static str> {
        if index == DONE_INDEX {
            return Some("done");
        }
        self.entry(index).map(|s| s.name())
    }

    /// Request data size of the service at `index`.
    pub fn data_size(&self, index: u32) -> Option<usize> {
        self.entry(index).map(|s| s.data_size())
    }

    /// Number of registered services.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Decode `bytes` and run the service at `index`.
    pub fn dispatch(
        &self,
        index: u32,
        ctx: &ServiceContext<'_>,
        bytes: &[u8],
    ) -> Result<Option<u32>, ServiceError> {
        let service = self.entry(index).ok_or(ServiceError::UnknownService {
                coord: ctx.coord(),
                index,
            })?;
        service.dispatch(ctx, bytes)
    }
}

impl Default for ServiceTable {
    fn default() -> Self {
        Self::with_builtins()
    }
}
