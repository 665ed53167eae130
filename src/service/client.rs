//! Tile side of the service protocol.

use std::any::type_name;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use zerocopy::{Immutable, IntoBytes};

use super::builtin::{BreakpointData, BreakpointService, DoneData, LogData, LogService};
use super::record::{
    data_slot, response_slot, text_slot, CHAINED_FIELD, DATA_FIELD, DATA_SLOT_SIZE, INDEX_FIELD,
    RESPONSE_FIELD, TEXT_SLOT_SIZE,
};
use super::{Service, ServiceError, ServiceTable, DONE_INDEX, EXIT_ABORT};
use crate::device::{MemoryAccess, MemoryLayout, TileCoord, TileMemory};
use crate::sync::{DeviceBarrier, TileLock};

/// Issues requests from one tile to the host.
///
/// Requests from one tile are serialized; a chained sequence holds the
/// client for its whole length.
pub struct ServiceClient {
    coord: TileCoord,
    memory: Arc<TileMemory>,
    table: Arc<ServiceTable>,
    barrier: DeviceBarrier,
    exclusive: TileLock,
    exited: AtomicBool,
}

impl ServiceClient {
    pub fn new(coord: TileCoord, memory: Arc<TileMemory>, table: Arc<ServiceTable>) -> Self {
        let barrier = DeviceBarrier::new(memory.clone(), MemoryLayout::service_record_offset());
        Self {
            coord,
            memory,
            table,
            barrier,
            exclusive: TileLock::new(),
            exited: AtomicBool::new(false),
        }
    }

    pub fn coord(&self) -> TileCoord {
        self.coord
    }

    pub fn table(&self) -> &ServiceTable {
        &self.table
    }

    /// True once the tile has sent its exit code.
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    fn index_of<S: Service>(&self) -> Result<u32, ServiceError> {
        self.table
            .index_of::<S>()
            .ok_or(ServiceError::NotRegistered(type_name::<S>()))
    }

    async fn request(&self, index: u32, data: &[u8], chained: bool) -> Result<u32, ServiceError> {
        if data.len() > DATA_SLOT_SIZE as usize {
            return Err(ServiceError::DataTooLarge {
                size: data.len(),
                max: DATA_SLOT_SIZE,
            });
        }
        let record = MemoryLayout::service_record_offset();
        self.memory.write_bytes(data_slot(), data);
        self.memory.write_u32(response_slot(), 0);
        self.memory.write_u32(record + INDEX_FIELD, index);
        self.memory.write_u32(record + DATA_FIELD, data_slot());
        self.memory.write_u32(record + RESPONSE_FIELD, response_slot());
        self.memory.write_u32(record + CHAINED_FIELD, chained as u32);
        log::trace!("tile {} request {index} chained={chained}", self.coord);

        // Request available.
        self.barrier.wait().await;
        // Host done.
        self.barrier.wait().await;
        Ok(self.memory.read_u32(response_slot()))
    }

    /// Send one request to the service registered as `S` and return what it
    /// wrote to the response slot (0 if nothing).
    pub async fn perform<S: Service>(&self, data: S::Data) -> Result<u32, ServiceError> {
        let index = self.index_of::<S>()?;
        self.exclusive.acquire().await;
        let result = self.request(index, data.as_bytes(), false).await;
        self.exclusive.release();
        result
    }

    /// Send `data` to the closure registered for `D`.
    pub async fn call<D>(&self, data: D) -> Result<u32, ServiceError>
    where
        D: zerocopy::FromBytes + IntoBytes + Immutable + Send + 'static,
    {
        self.perform::<super::FnService<D>>(data).await
    }

    async fn send_text(&self, index: u32, parts: &[&str]) -> Result<(), ServiceError> {
        let chunks: Vec<&[u8]> = parts
            .iter()
            .flat_map(|part| part.as_bytes().chunks(TEXT_SLOT_SIZE as usize))
            .collect();
        for (i, chunk) in chunks.iter().enumerate() {
            self.memory.write_bytes(text_slot(), chunk);
            let data = LogData {
                ptr: text_slot(),
                len: chunk.len() as u32,
            };
            self.request(index, data.as_bytes(), i + 1 < chunks.len())
                .await?;
        }
        Ok(())
    }

    /// Print the parts as one contiguous piece of output.
    pub async fn log_parts(&self, parts: &[&str]) -> Result<(), ServiceError> {
        let index = self.index_of::<LogService>()?;
        self.exclusive.acquire().await;
        let result = self.send_text(index, parts).await;
        self.exclusive.release();
        result
    }

    /// Print a line prefixed with the tile's coordinates.
    pub async fn log(&self, message: &str) -> Result<(), ServiceError> {
        let prefix = format!("{:2}, {} : ", self.coord.x, self.coord.y);
        if message.ends_with('\n') {
            self.log_parts(&[&prefix, message]).await
        } else {
            self.log_parts(&[&prefix, message, "\n"]).await
        }
    }

    /// Report the exit code. The tile must not issue requests afterwards.
    pub async fn exit(&self, code: i32) -> Result<(), ServiceError> {
        self.exclusive.acquire().await;
        let result = self.request(DONE_INDEX, DoneData { code }.as_bytes(), false).await;
        self.exclusive.release();
        result?;
        self.exited.store(true, Ordering::Release);
        Ok(())
    }

    pub async fn abort(&self) -> Result<(), ServiceError> {
        self.exit(EXIT_ABORT).await
    }

    /// Show `count` words at `offset` to the host.
    pub async fn breakpoint(&self, offset: u32, count: u32) -> Result<(), ServiceError> {
        self.perform::<BreakpointService>(BreakpointData { offset, count })
            .await
            .map(|_| ())
    }
}
