//! Host side of the service protocol.

use crate::device::{HostHandle, MemoryAccess, MemoryAccessExt, MemoryLayout, TileCoord};
use crate::sync::HostBarrier;

use super::builtin::DoneData;
use super::{
    exit_reason, ServiceContext, ServiceError, ServiceRecord, ServiceTable, DONE_INDEX,
    EXIT_FAILURE, EXIT_SUCCESS,
};

/// Counts from one polling run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    /// Requests served, done requests included.
    pub requests: u64,
    /// Tiles that reported an exit code.
    pub finished: usize,
    /// Sweeps over the tile list.
    pub sweeps: u64,
}

struct PolledTile<'a> {
    handle: &'a HostHandle,
    barrier: HostBarrier<&'a HostHandle>,
    finished: bool,
}

/// Serves requests from a set of launched tiles until each has finished.
pub struct ServicePoller<'a> {
    table: &'a ServiceTable,
    tiles: Vec<PolledTile<'a>>,
}

impl<'a> ServicePoller<'a> {
    pub fn new(table: &'a ServiceTable, tiles: impl IntoIterator<Item = &'a HostHandle>) -> Self {
        let tiles = tiles
            .into_iter()
            .map(|handle| PolledTile {
                handle,
                barrier: HostBarrier::new(handle, MemoryLayout::service_record_offset()),
                finished: false,
            })
            .collect();
        Self { table, tiles }
    }

    /// Sweep the tiles until every one has sent a done request.
    ///
    /// A tile gets a non-blocking look per sweep. When its request is
    /// chained the poller stays on that tile and blocks for the next one, so
    /// chained output from different tiles never interleaves.
    ///
    /// Returns [`ServiceError::TileFailed`] as soon as a tile reports a
    /// non-zero exit code. The tile is released first.
    pub fn run(&mut self) -> Result<PollStats, ServiceError> {
        let mut stats = PollStats::default();
        let expected = self.tiles.iter().filter(|t| !t.finished).count();
        let table = self.table;

        while stats.finished < expected {
            stats.sweeps += 1;
            let mut progressed = false;
            for tile in self.tiles.iter_mut().filter(|t| !t.finished) {
                if !tile.barrier.try_arrive() {
                    continue;
                }
                progressed = true;
                loop {
                    stats.requests += 1;
                    let chained = Self::serve(table, tile)?;
                    if tile.finished {
                        stats.finished += 1;
                        break;
                    }
                    if !chained {
                        break;
                    }
                    tile.barrier.wait();
                }
            }
            if !progressed {
                std::thread::yield_now();
            }
        }

        log::debug!(
            "service polling finished: {} request(s) over {} sweep(s)",
            stats.requests,
            stats.sweeps
        );
        Ok(stats)
    }

    /// Serve the request the tile just arrived with and release it.
    /// Returns the request's chained flag.
    fn serve(table: &ServiceTable, tile: &mut PolledTile<'_>) -> Result<bool, ServiceError> {
        let handle = tile.handle;
        let coord = handle.coord();
        let record: ServiceRecord = handle.load(MemoryLayout::service_record_offset());
        let outcome = Self::dispatch(table, coord, handle, &record);
        // Let the tile read the response and move on, even on failure.
        tile.barrier.wait();

        if record.index == DONE_INDEX {
            tile.finished = true;
        }
        match outcome? {
            Some(code) if code != EXIT_SUCCESS => {
                log::error!("tile {coord} terminated with exit code {code}");
                Err(ServiceError::TileFailed { coord, code })
            }
            _ => Ok(record.chained != 0),
        }
    }

    /// Run the handler. `Some(code)` is the exit code of a done request.
    fn dispatch(
        table: &ServiceTable,
        coord: TileCoord,
        handle: &HostHandle,
        record: &ServiceRecord,
    ) -> Result<Option<i32>, ServiceError> {
        if record.index == DONE_INDEX {
            return Ok(Some(Self::exit_code(coord, handle, record)));
        }

        let size = table
            .data_size(record.index)
            .ok_or(ServiceError::UnknownService {
                coord,
                index: record.index,
            })?;
        let ctx = ServiceContext::new(coord, handle);
        let bytes = ctx.read_bytes(record.data, size as u32)?;
        log::trace!(
            "tile {coord}: {} request, chained={}",
            table.name_of(record.index).unwrap_or("?"),
            record.chained
        );

        let response = table.dispatch(record.index, &ctx, &bytes)?;
        if let Some(value) = response {
            if record.response != 0 && handle.contains(record.response, 4) {
                handle.write_u32(record.response, value);
            }
        }
        Ok(None)
    }

    /// Exit code of a done request. An unreadable code counts as a failure.
    fn exit_code(coord: TileCoord, handle: &HostHandle, record: &ServiceRecord) -> i32 {
        let size = std::mem::size_of::<DoneData>() as u32;
        let code = if handle.contains(record.data, size) {
            handle.load::<DoneData>(record.data).code
        } else {
            log::warn!(
                "tile {coord}: done request points outside tile memory at 0x{:08X}",
                record.data
            );
            EXIT_FAILURE
        };
        log::debug!("tile {coord} done: {} ({code})", exit_reason(&code));
        code
    }
}
