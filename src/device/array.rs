//! The tile array and the host-side coordinator.
//!
//! The device owns every tile, the task pool their programs and movers run
//! on, and the service table. Tiles are stored in a flat Vec, indexed by
//! `col * rows + row`.
//!
//! # Lifecycle
//!
//! 1. [`Device::new`] builds the tiles, binds each router's DMA and core
//!    outputs, links neighbouring routers and lock units, writes each
//!    tile's offset table and formats its heap from the host.
//! 2. [`Device::route`] and [`Device::connect`] set up data paths.
//! 3. [`Device::launch`] starts a program on a tile; [`Device::wait_all`]
//!    serves service requests until every launched tile has finished.
//! 4. [`Device::shutdown`] (also run on drop) drains DMA engines, stops
//!    routers and joins the pool.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use futures::FutureExt;
use parking_lot::Mutex;
use thiserror::Error;

use crate::config::{check_dma_depth, check_router_depth, Config, ConfigError};
use crate::heap::{Heap, HeapError, RemoteStore};
use crate::pool::{PoolConfig, PoolError, TaskPool};
use crate::service::{
    exit_reason, PollStats, ServiceClient, ServiceError, ServicePoller, ServiceTable,
    EXIT_ASSERT, EXIT_FAILURE, EXIT_SUCCESS,
};
use crate::sync::LockUnit;

use super::connection::{Connection, ConnectionEnd, ConnectionError};
use super::dma::{DmaError, ReceivingDma, SendingDma, DEFAULT_COMMAND_DEPTH};
use super::layout::{LayoutError, LayoutParams, MemoryLayout};
use super::memory::{HostHandle, MemoryAccess, TileMemory};
use super::router::{
    ReceiverPort, Router, RouterError, RouterPort, CORE_PORTS, DEFAULT_QUEUE_DEPTH, DMA_PORTS,
};
use super::tile::{Tile, TileContext, TileError, TileParts};
use super::{Direction, TileCoord};

/// Device construction parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
    pub columns: u8,
    pub rows: u8,
    pub pool: PoolConfig,
    /// FIFO depth of router ports, DMA input FIFOs and connections.
    pub router_depth: usize,
    /// Command queue depth of DMA engines.
    pub dma_depth: usize,
    pub layout: LayoutParams,
}

impl DeviceConfig {
    /// A `columns` x `rows` array with default everything else.
    pub fn with_size(columns: u8, rows: u8) -> Self {
        Self {
            columns,
            rows,
            pool: PoolConfig::default(),
            router_depth: DEFAULT_QUEUE_DEPTH,
            dma_depth: DEFAULT_COMMAND_DEPTH,
            layout: LayoutParams::default(),
        }
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            columns: config.columns(),
            rows: config.rows(),
            pool: config.pool_config(),
            router_depth: config.router_queue_depth(),
            dma_depth: config.dma_queue_depth(),
            layout: config.layout_params(),
        }
    }

    fn index(&self, coord: TileCoord) -> Option<usize> {
        (coord.x < self.columns && coord.y < self.rows)
            .then(|| coord.x as usize * self.rows as usize + coord.y as usize)
    }

    fn coords(&self) -> impl Iterator<Item = TileCoord> + '_ {
        (0..self.columns).flat_map(move |x| (0..self.rows).map(move |y| TileCoord::new(x, y)))
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::from_config(Config::get())
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("a device needs at least one tile, got {columns}x{rows}")]
    Empty { columns: u8, rows: u8 },

    #[error("no tile at {0}")]
    NoTile(TileCoord),

    #[error("tile {coord} terminated with {} (code {code})", exit_reason(.code))]
    TileFailed { coord: TileCoord, code: i32 },

    #[error("tile {coord}: 0x{offset:04X}+{len} is outside tile memory")]
    OutOfBounds { coord: TileCoord, offset: u32, len: u32 },

    #[error("device was terminated after a tile failure")]
    Terminated,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error(transparent)]
    Heap(#[from] HeapError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error(transparent)]
    Dma(#[from] DmaError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Tile(#[from] TileError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// The tile array plus everything needed to run programs on it.
pub struct Device {
    config: DeviceConfig,
    layout: MemoryLayout,
    pool: Arc<TaskPool>,
    services: Arc<ServiceTable>,
    tiles: Vec<Arc<Tile>>,
    launched: Mutex<Vec<TileCoord>>,
    terminated: AtomicBool,
    shut_down: AtomicBool,
}

impl Device {
    /// Build a device with the built-in services.
    pub fn new(config: DeviceConfig) -> Result<Self, DeviceError> {
        Self::with_services(config, ServiceTable::with_builtins())
    }

    /// Build a device serving requests with `services`.
    pub fn with_services(config: DeviceConfig, services: ServiceTable) -> Result<Self, DeviceError> {
        if config.columns == 0 || config.rows == 0 {
            return Err(DeviceError::Empty {
                columns: config.columns,
                rows: config.rows,
            });
        }
        check_router_depth(config.router_depth)?;
        check_dma_depth(config.dma_depth)?;
        let layout = MemoryLayout::new(config.layout)?;
        let pool = Arc::new(TaskPool::new(config.pool)?);
        let services = Arc::new(services);

        let units: Vec<Arc<LockUnit>> = config.coords().map(|c| Arc::new(LockUnit::new(c))).collect();

        let mut tiles = Vec::with_capacity(units.len());
        for coord in config.coords() {
            let memory = Arc::new(TileMemory::new(layout.tile_size()));
            let router = Router::new(coord, config.router_depth);

            let mut rx_dma = Vec::with_capacity(DMA_PORTS);
            let mut tx_dma = Vec::with_capacity(DMA_PORTS);
            for i in 0..DMA_PORTS as u8 {
                let rx = ReceivingDma::new(
                    format!("{coord}/rx{i}"),
                    memory.clone(),
                    &pool,
                    config.dma_depth,
                    config.router_depth,
                )?;
                router.bind_output(RouterPort::Dma(i), rx.port())?;
                rx_dma.push(rx);

                let tx = SendingDma::new(
                    format!("{coord}/tx{i}"),
                    memory.clone(),
                    &pool,
                    config.dma_depth,
                    router.input(RouterPort::Dma(i))?,
                )?;
                tx_dma.push(tx);
            }

            let mut core_in = Vec::with_capacity(CORE_PORTS);
            for i in 0..CORE_PORTS as u8 {
                let port = Arc::new(ReceiverPort::new(config.router_depth));
                router.bind_output(RouterPort::Core(i), port.clone())?;
                core_in.push(port);
            }

            let mut locks: [Option<Arc<LockUnit>>; 5] = Default::default();
            for direction in Direction::CARDINAL.into_iter().chain([Direction::Local]) {
                locks[direction.index()] = coord
                    .step(direction)
                    .and_then(|n| config.index(n))
                    .map(|i| units[i].clone());
            }

            let client = ServiceClient::new(coord, memory.clone(), services.clone());
            let tile = Arc::new(Tile::new(TileParts {
                coord,
                memory,
                layout,
                router,
                rx_dma,
                tx_dma,
                core_in,
                locks,
                services: client,
                pool: pool.clone(),
            }));

            layout.install(tile.host());
            Heap::init(
                RemoteStore::new(tile.host()),
                layout.heap_start(),
                layout.heap_size(),
            )?;
            tiles.push(tile);
        }

        for tile in &tiles {
            for direction in Direction::CARDINAL {
                let Some(n) = tile.coord().step(direction).and_then(|n| config.index(n)) else {
                    continue;
                };
                let far_end = tiles[n].router().input(RouterPort::Link(direction.opposite()))?;
                tile.router().bind_output(RouterPort::Link(direction), far_end)?;
            }
        }

        log::info!(
            "device {}x{} ready: {} scheduling, {} worker(s), heap 0x{:04X}+{}",
            config.columns,
            config.rows,
            pool.policy(),
            pool.threads(),
            layout.heap_start(),
            layout.heap_size()
        );

        Ok(Self {
            config,
            layout,
            pool,
            services,
            tiles,
            launched: Mutex::new(Vec::new()),
            terminated: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn columns(&self) -> u8 {
        self.config.columns
    }

    pub fn rows(&self) -> u8 {
        self.config.rows
    }

    pub fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    pub fn pool(&self) -> &TaskPool {
        &self.pool
    }

    pub fn services(&self) -> &ServiceTable {
        &self.services
    }

    pub fn tile(&self, coord: TileCoord) -> Option<&Arc<Tile>> {
        self.config.index(coord).map(|i| &self.tiles[i])
    }

    pub fn tiles(&self) -> &[Arc<Tile>] {
        &self.tiles
    }

    fn get(&self, coord: TileCoord) -> Result<&Arc<Tile>, DeviceError> {
        self.tile(coord).ok_or(DeviceError::NoTile(coord))
    }

    /// Forward everything arriving on `from` of tile `coord` to its `to`.
    pub fn route(&self, coord: TileCoord, from: RouterPort, to: RouterPort) -> Result<(), DeviceError> {
        self.get(coord)?.router().route(&self.pool, from, to)?;
        Ok(())
    }

    /// Create a pipe carrying `T` from output slot `src_port` of `src` to
    /// input slot `dst_port` of `dst`.
    pub fn connect<T: 'static>(
        &self,
        src: TileCoord,
        src_port: usize,
        dst: TileCoord,
        dst_port: usize,
    ) -> Result<(), DeviceError> {
        let source = self.get(src)?;
        let dest = self.get(dst)?;
        let connection = Connection::new::<T>(self.config.router_depth);
        source.attach(ConnectionEnd::Output, src_port, connection.clone())?;
        if let Err(e) = dest.attach(ConnectionEnd::Input, dst_port, connection) {
            source.detach(ConnectionEnd::Output, src_port);
            return Err(e.into());
        }
        log::debug!("connected {src}[{src_port}] -> {dst}[{dst_port}]");
        Ok(())
    }

    /// Start `program` on tile `coord`.
    ///
    /// The program runs inside a kernel wrapper that checks the tile heap
    /// for leaks afterwards and reports the exit code to the host, unless
    /// the program already did: 0 on success, [`EXIT_FAILURE`] if it
    /// returned an error and [`EXIT_ASSERT`] if it panicked or leaked.
    pub fn launch<F, Fut>(&self, coord: TileCoord, program: F) -> Result<(), DeviceError>
    where
        F: FnOnce(TileContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.terminated.load(Ordering::Acquire) {
            return Err(DeviceError::Terminated);
        }
        let tile = self.get(coord)?;
        tile.single_task(move |ctx| kernel(ctx, program))?;
        self.launched.lock().push(coord);
        Ok(())
    }

    /// Serve service requests until every launched tile has finished, then
    /// collect each tile's result.
    ///
    /// A non-zero exit code terminates the whole device.
    pub fn wait_all(&self) -> Result<PollStats, DeviceError> {
        let launched = std::mem::take(&mut *self.launched.lock());
        let tiles: Vec<&Arc<Tile>> = launched.iter().filter_map(|&c| self.tile(c)).collect();

        let polled = ServicePoller::new(&self.services, tiles.iter().map(|t| t.host())).run();
        let stats = match polled {
            Ok(stats) => stats,
            Err(ServiceError::TileFailed { coord, code }) => {
                self.terminate();
                return Err(DeviceError::TileFailed { coord, code });
            }
            Err(e) => {
                log::error!("service polling failed: {e}");
                self.terminate();
                return Err(e.into());
            }
        };

        let mut first_error = None;
        for tile in tiles {
            if let Err(e) = tile.wait() {
                log::error!("{e}");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => {
                log::info!(
                    "{} tile(s) finished, {} service request(s)",
                    stats.finished,
                    stats.requests
                );
                Ok(stats)
            }
        }
    }

    /// Launch `program` on every tile and wait for all of them.
    pub fn run<F, Fut>(&self, program: F) -> Result<PollStats, DeviceError>
    where
        F: FnOnce(TileContext) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        for tile in &self.tiles {
            self.launch(tile.coord(), program.clone())?;
        }
        self.wait_all()
    }

    /// Stop everything without draining. Used after a tile failure.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        log::warn!("terminating device");
        self.pool.terminate();
        for tile in &self.tiles {
            for dma in tile.tx_dmas() {
                dma.close();
            }
            for dma in tile.rx_dmas() {
                dma.close();
            }
            tile.close_connections();
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Close and join every DMA engine, stop the routers and join the pool.
    ///
    /// Streams must be drained: a receive command still waiting for data
    /// keeps its engine from finishing. Idempotent.
    pub fn shutdown(&self) -> Result<(), DeviceError> {
        if self.shut_down.swap(true, Ordering::AcqRel) || self.is_terminated() {
            return Ok(());
        }
        let result = futures::executor::block_on(async {
            for tile in &self.tiles {
                for dma in tile.tx_dmas() {
                    dma.shutdown().await?;
                }
            }
            for tile in &self.tiles {
                for dma in tile.rx_dmas() {
                    dma.shutdown().await?;
                }
            }
            for tile in &self.tiles {
                tile.router().shutdown().await?;
                tile.close_connections();
            }
            Ok::<_, DeviceError>(())
        });
        match &result {
            Ok(()) => {
                self.pool.join();
                log::debug!("device shut down");
            }
            Err(e) => {
                log::error!("device shutdown failed: {e}");
                self.terminate();
            }
        }
        result
    }

    /// The host's view of a tile's heap.
    pub fn host_heap(&self, coord: TileCoord) -> Result<Heap<RemoteStore<&HostHandle>>, DeviceError> {
        let tile = self.get(coord)?;
        Ok(Heap::attach(
            RemoteStore::new(tile.host()),
            self.layout.heap_start(),
            self.layout.heap_size(),
        )?)
    }

    /// Allocate on a tile's heap from the host. `None` when full.
    pub fn host_malloc(&self, coord: TileCoord, size: u32) -> Result<Option<u32>, DeviceError> {
        Ok(self.host_heap(coord)?.try_malloc(size))
    }

    pub fn host_free(&self, coord: TileCoord, ptr: u32) -> Result<(), DeviceError> {
        self.host_heap(coord)?.free(ptr);
        Ok(())
    }

    fn check_span(tile: &Tile, offset: u32, count: usize) -> Result<(), DeviceError> {
        let len = u32::try_from(count * 4).unwrap_or(u32::MAX);
        if offset % 4 == 0 && tile.host().contains(offset, len) {
            Ok(())
        } else {
            Err(DeviceError::OutOfBounds {
                coord: tile.coord(),
                offset,
                len,
            })
        }
    }

    /// Read `count` words of a tile's memory through its host handle.
    pub fn read_words(&self, coord: TileCoord, offset: u32, count: usize) -> Result<Vec<u32>, DeviceError> {
        let tile = self.get(coord)?;
        Self::check_span(tile, offset, count)?;
        Ok((0..count as u32)
            .map(|i| tile.host().read_u32(offset + 4 * i))
            .collect())
    }

    /// Write words into a tile's memory through its host handle.
    pub fn write_words(&self, coord: TileCoord, offset: u32, values: &[u32]) -> Result<(), DeviceError> {
        let tile = self.get(coord)?;
        Self::check_span(tile, offset, values.len())?;
        for (i, &value) in values.iter().enumerate() {
            tile.host().write_u32(offset + 4 * i as u32, value);
        }
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("{e}");
        }
    }
}

/// Run a tile program and report how it ended.
async fn kernel<F, Fut>(ctx: TileContext, program: F) -> anyhow::Result<()>
where
    F: FnOnce(TileContext) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let coord = ctx.coord();
    let body = {
        let ctx = ctx.clone();
        async move { program(ctx).await }
    };
    let outcome = AssertUnwindSafe(body).catch_unwind().await;

    let (mut code, mut result, panicked) = match outcome {
        Ok(Ok(())) => (EXIT_SUCCESS, Ok(()), None),
        Ok(Err(e)) => {
            log::error!("tile {coord}: {e:#}");
            (EXIT_FAILURE, Err(e), None)
        }
        Err(payload) => (EXIT_ASSERT, Ok(()), Some(payload)),
    };

    if code == EXIT_SUCCESS {
        match ctx.heap() {
            Ok(heap) => {
                let leaks = heap.leaks();
                if let Some(first) = leaks.first() {
                    heap.dump();
                    result = Err(anyhow!(
                        "{} heap block(s) leaked, first at 0x{:04X}",
                        leaks.len(),
                        first.payload
                    ));
                    code = EXIT_ASSERT;
                }
            }
            Err(e) => {
                result = Err(e.into());
                code = EXIT_ASSERT;
            }
        }
    }

    if !ctx.services().has_exited() {
        ctx.exit(code).await?;
    }
    if let Some(payload) = panicked {
        panic::resume_unwind(payload);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::dma::{DmaCommand, MemorySpan};
    use crate::device::router::Packet;
    use crate::pool::SchedulerPolicy;
    use crate::service::{LogService, EXIT_ABORT};
    use anyhow::ensure;

    fn config(columns: u8, rows: u8, policy: SchedulerPolicy) -> DeviceConfig {
        DeviceConfig::with_size(columns, rows).with_pool(PoolConfig::new(policy, 2))
    }

    #[test]
    fn test_empty_device_rejected() {
        let err = Device::new(config(0, 1, SchedulerPolicy::RoundRobin)).err().unwrap();
        assert!(matches!(err, DeviceError::Empty { columns: 0, rows: 1 }));
    }

    #[test]
    fn test_bad_queue_depths_rejected() {
        let mut bad = config(1, 1, SchedulerPolicy::RoundRobin);
        bad.router_depth = 0;
        let err = Device::new(bad).err().unwrap();
        assert!(matches!(
            err,
            DeviceError::Config(ConfigError::OutOfRange { name: "router_queue_depth", value: 0, .. })
        ));

        let mut bad = config(1, 1, SchedulerPolicy::RoundRobin);
        bad.dma_depth = 0;
        let err = Device::new(bad).err().unwrap();
        assert!(matches!(
            err,
            DeviceError::Config(ConfigError::OutOfRange { name: "dma_queue_depth", .. })
        ));
    }

    #[test]
    fn test_neighbour_links_and_locks() {
        let device = Device::new(config(2, 2, SchedulerPolicy::SharedWork)).unwrap();
        let origin = device.tile(TileCoord::new(0, 0)).unwrap();
        assert!(origin.router().output(RouterPort::Link(Direction::East)).is_ok());
        assert!(origin.router().output(RouterPort::Link(Direction::North)).is_ok());
        assert!(matches!(
            origin.router().output(RouterPort::Link(Direction::West)),
            Err(RouterError::Unbound { .. })
        ));

        let east = device.tile(TileCoord::new(1, 0)).unwrap();
        let shared = origin.lock_unit(Direction::East).unwrap();
        assert!(Arc::ptr_eq(shared, east.lock_unit(Direction::Local).unwrap()));
        assert_eq!(shared.owner(), TileCoord::new(1, 0));
        assert!(origin.lock_unit(Direction::South).is_none());
        assert!(device.tile(TileCoord::new(2, 0)).is_none());
    }

    #[test]
    fn test_offset_table_installed() {
        let device = Device::new(config(1, 1, SchedulerPolicy::RoundRobin)).unwrap();
        let tile = device.tile(TileCoord::new(0, 0)).unwrap();
        let table = MemoryLayout::read_table(tile.memory().as_ref());
        assert_eq!(table, device.layout().offset_table());
    }

    #[test]
    fn test_stream_between_tiles() {
        for policy in [
            SchedulerPolicy::RoundRobin,
            SchedulerPolicy::SharedWork,
            SchedulerPolicy::WorkStealing,
        ] {
            let device = Device::new(config(2, 1, policy)).unwrap();
            let west = TileCoord::new(0, 0);
            let east = TileCoord::new(1, 0);
            device
                .route(west, RouterPort::Dma(0), RouterPort::Link(Direction::East))
                .unwrap();
            device
                .route(east, RouterPort::Link(Direction::West), RouterPort::Dma(0))
                .unwrap();

            device
                .launch(west, |ctx| async move {
                    let ptr = {
                        let heap = ctx.heap()?;
                        heap.malloc(64)
                    };
                    let values: Vec<u32> = (0..16).collect();
                    ctx.memory().write_words(ptr, &values);
                    let tx = ctx.tx_dma(0)?;
                    tx.push(DmaCommand::send(MemorySpan::new(ptr, 16))).await?;
                    tx.wait().await?;
                    ctx.heap()?.free(ptr);
                    Ok(())
                })
                .unwrap();
            device
                .launch(east, |ctx| async move {
                    let ptr = ctx.heap()?.malloc(64);
                    let rx = ctx.rx_dma(0)?;
                    rx.push(DmaCommand::receive(MemorySpan::new(ptr, 16))).await?;
                    rx.wait().await?;
                    let received = ctx.memory().read_words(ptr, 16);
                    ctx.heap()?.free(ptr);
                    ensure!(received == (0..16).collect::<Vec<u32>>(), "got {received:?}");
                    Ok(())
                })
                .unwrap();

            let stats = device.wait_all().unwrap();
            assert_eq!(stats.finished, 2);
            device.shutdown().unwrap();
        }
    }

    #[test]
    fn test_log_from_every_tile() {
        let (log, capture) = LogService::capture();
        let device = Device::with_services(
            config(2, 2, SchedulerPolicy::WorkStealing),
            ServiceTable::with_log(log),
        )
        .unwrap();
        device
            .run(|ctx| async move {
                ctx.log("hello").await?;
                Ok(())
            })
            .unwrap();

        let mut lines = capture.lines();
        lines.sort();
        assert_eq!(
            lines,
            vec![" 0, 0 : hello", " 0, 1 : hello", " 1, 0 : hello", " 1, 1 : hello"]
        );
    }

    #[test]
    fn test_program_error_fails_run() {
        let device = Device::new(config(1, 1, SchedulerPolicy::SharedWork)).unwrap();
        device
            .launch(TileCoord::new(0, 0), |_ctx| async move { Err(anyhow!("boom")) })
            .unwrap();
        let err = device.wait_all().unwrap_err();
        assert!(matches!(err, DeviceError::TileFailed { code: EXIT_FAILURE, .. }));
        assert!(device.is_terminated());
        assert!(matches!(
            device.launch(TileCoord::new(0, 0), |_ctx| async move { Ok(()) }),
            Err(DeviceError::Terminated)
        ));
    }

    #[test]
    fn test_panic_reports_assert() {
        let device = Device::new(config(1, 1, SchedulerPolicy::RoundRobin)).unwrap();
        device
            .launch(TileCoord::new(0, 0), |_ctx| async move {
                panic!("device-side assertion");
            })
            .unwrap();
        let err = device.wait_all().unwrap_err();
        assert!(matches!(err, DeviceError::TileFailed { code: EXIT_ASSERT, .. }));
    }

    #[test]
    fn test_abort_reports_abort() {
        let device = Device::new(config(2, 1, SchedulerPolicy::WorkStealing)).unwrap();
        device
            .launch(TileCoord::new(1, 0), |ctx| async move {
                ctx.abort().await?;
                Ok(())
            })
            .unwrap();
        let err = device.wait_all().unwrap_err();
        assert!(matches!(
            err,
            DeviceError::TileFailed { code: EXIT_ABORT, coord } if coord == TileCoord::new(1, 0)
        ));
    }

    #[test]
    fn test_leak_is_an_assertion() {
        let device = Device::new(config(1, 1, SchedulerPolicy::SharedWork)).unwrap();
        device
            .launch(TileCoord::new(0, 0), |ctx| async move {
                ctx.heap()?.malloc(32);
                Ok(())
            })
            .unwrap();
        let err = device.wait_all().unwrap_err();
        assert!(matches!(err, DeviceError::TileFailed { code: EXIT_ASSERT, .. }));
    }

    #[test]
    fn test_host_allocations_are_not_leaks() {
        let device = Device::new(config(1, 1, SchedulerPolicy::RoundRobin)).unwrap();
        let coord = TileCoord::new(0, 0);
        let ptr = device.host_malloc(coord, 16).unwrap().unwrap();
        device.write_words(coord, ptr, &[7, 8, 9, 10]).unwrap();
        device
            .launch(coord, move |ctx| async move {
                let heap = ctx.heap()?;
                let block = heap.blocks().find(|b| b.payload == ptr);
                ensure!(block.is_some_and(|b| b.in_use && b.host_allocated));
                ensure!(ctx.memory().read_words(ptr, 4) == vec![7, 8, 9, 10]);
                Ok(())
            })
            .unwrap();
        device.wait_all().unwrap();
        device.host_free(coord, ptr).unwrap();
        assert!(device.host_heap(coord).unwrap().leaks().is_empty());
        assert_eq!(device.host_heap(coord).unwrap().blocks().count(), 1);
    }

    #[test]
    fn test_single_task_busy() {
        let device = Device::new(config(1, 1, SchedulerPolicy::SharedWork)).unwrap();
        let coord = TileCoord::new(0, 0);
        device
            .launch(coord, |ctx| async move {
                ctx.lock(Direction::Local, 0)?.acquire_with_value(true).await;
                Ok(())
            })
            .unwrap();
        let err = device
            .launch(coord, |_ctx| async move { Ok(()) })
            .unwrap_err();
        assert!(matches!(err, DeviceError::Tile(TileError::Busy(c)) if c == coord));

        let tile = device.tile(coord).unwrap();
        tile.lock_unit(Direction::Local)
            .unwrap()
            .get(0)
            .unwrap()
            .release_with_value(true);
        device.wait_all().unwrap();
        assert!(!tile.is_running());
    }

    #[test]
    fn test_connection_between_tiles() {
        let device = Device::new(config(2, 1, SchedulerPolicy::WorkStealing)).unwrap();
        let src = TileCoord::new(0, 0);
        let dst = TileCoord::new(1, 0);
        device.connect::<u32>(src, 1, dst, 2).unwrap();
        assert!(matches!(
            device.connect::<u32>(src, 1, dst, 3),
            Err(DeviceError::Connection(ConnectionError::AlreadyConnected { .. }))
        ));
        assert!(matches!(
            device.connect::<u32>(src, 3, dst, 2),
            Err(DeviceError::Connection(ConnectionError::AlreadyConnected { .. }))
        ));

        device
            .launch(src, |ctx| async move {
                let out = ctx.output::<u32>(1)?;
                for i in 1..=10 {
                    out.write(Packet::new(i)).await?;
                }
                Ok(())
            })
            .unwrap();
        device
            .launch(dst, |ctx| async move {
                ensure!(ctx.input::<f32>(2).is_err());
                let input = ctx.input::<u32>(2)?;
                let mut sum = 0;
                for _ in 0..10 {
                    sum += input.read().await?.value;
                }
                ensure!(sum == 55, "sum was {sum}");
                Ok(())
            })
            .unwrap();
        device.wait_all().unwrap();
    }

    #[test]
    fn test_core_ports_through_routers() {
        let device = Device::new(config(1, 2, SchedulerPolicy::RoundRobin)).unwrap();
        let south = TileCoord::new(0, 0);
        let north = TileCoord::new(0, 1);
        device
            .route(south, RouterPort::Core(0), RouterPort::Link(Direction::North))
            .unwrap();
        device
            .route(north, RouterPort::Link(Direction::South), RouterPort::Core(1))
            .unwrap();
        device
            .launch(south, |ctx| async move {
                let out = ctx.core_out(0)?;
                out.write(Packet::new(1)).await?;
                out.write(Packet::with_last(2)).await?;
                Ok(())
            })
            .unwrap();
        device
            .launch(north, |ctx| async move {
                let input = ctx.core_in(1)?;
                let first = input.read().await?;
                let second = input.read().await?;
                ensure!(first.value == 1 && !first.last);
                ensure!(second.value == 2 && second.last);
                Ok(())
            })
            .unwrap();
        device.wait_all().unwrap();
        device.shutdown().unwrap();
    }

    #[test]
    fn test_host_word_access_bounds() {
        let device = Device::new(config(1, 1, SchedulerPolicy::RoundRobin)).unwrap();
        let coord = TileCoord::new(0, 0);
        let end = device.layout().tile_size();
        assert!(device.write_words(coord, end - 4, &[1]).is_ok());
        assert!(matches!(
            device.read_words(coord, end - 4, 2),
            Err(DeviceError::OutOfBounds { .. })
        ));
        assert!(matches!(
            device.read_words(TileCoord::new(3, 3), 0, 1),
            Err(DeviceError::NoTile(_))
        ));
    }
}
