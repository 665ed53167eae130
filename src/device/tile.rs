//! One tile: its memory, router, DMA engines, lock units and the program
//! slot, plus the context handed to the program.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::heap::{DirectStore, Heap, HeapError};
use crate::pool::{PoolError, TaskError, TaskHandle, TaskPool};
use crate::service::{ServiceClient, ServiceError};
use crate::sync::{LockId, LockUnit, TileLock};

use super::connection::{Connection, ConnectionEnd, ConnectionError, CONNECTION_PORTS};
use super::dma::{ReceivingDma, SendingDma};
use super::layout::MemoryLayout;
use super::memory::{HostHandle, TileMemory};
use super::router::{Port, ReceiverPort, Router, RouterPort};
use super::{Direction, TileCoord};

#[derive(Debug, Error)]
pub enum TileError {
    #[error("tile {0} is still running its previous task")]
    Busy(TileCoord),

    #[error("tile {coord} panicked: {message}")]
    Panicked { coord: TileCoord, message: String },

    #[error("tile {0} task was dropped before it finished")]
    Cancelled(TileCoord),

    #[error("tile {coord} program failed: {source:#}")]
    Program {
        coord: TileCoord,
        source: anyhow::Error,
    },

    #[error("tile {coord} has no neighbour to the {direction}")]
    NoNeighbour { coord: TileCoord, direction: Direction },

    #[error("lock {0} does not exist")]
    NoSuchLock(LockId),

    #[error("tile {coord} has no {kind} {index}")]
    NoSuchPort {
        coord: TileCoord,
        kind: &'static str,
        index: usize,
    },

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Heap(#[from] HeapError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

type ConnectionSlots = Mutex<[Option<Connection>; CONNECTION_PORTS]>;

/// A tile of the array.
pub struct Tile {
    coord: TileCoord,
    memory: Arc<TileMemory>,
    host: HostHandle,
    layout: MemoryLayout,
    router: Router,
    rx_dma: Vec<ReceivingDma>,
    tx_dma: Vec<SendingDma>,
    core_in: Vec<Arc<ReceiverPort>>,
    /// Indexed by [`Direction::index`]; `None` past the array edge.
    locks: [Option<Arc<LockUnit>>; 5],
    inputs: ConnectionSlots,
    outputs: ConnectionSlots,
    services: ServiceClient,
    pool: Arc<TaskPool>,
    task: Mutex<Option<TaskHandle<anyhow::Result<()>>>>,
}

/// Everything [`Tile::new`] needs that the device builds first.
pub(crate) struct TileParts {
    pub coord: TileCoord,
    pub memory: Arc<TileMemory>,
    pub layout: MemoryLayout,
    pub router: Router,
    pub rx_dma: Vec<ReceivingDma>,
    pub tx_dma: Vec<SendingDma>,
    pub core_in: Vec<Arc<ReceiverPort>>,
    pub locks: [Option<Arc<LockUnit>>; 5],
    pub services: ServiceClient,
    pub pool: Arc<TaskPool>,
}

impl Tile {
    pub(crate) fn new(parts: TileParts) -> Self {
        Self {
            coord: parts.coord,
            host: HostHandle::new(parts.coord, parts.memory.clone()),
            memory: parts.memory,
            layout: parts.layout,
            router: parts.router,
            rx_dma: parts.rx_dma,
            tx_dma: parts.tx_dma,
            core_in: parts.core_in,
            locks: parts.locks,
            inputs: Mutex::new(Default::default()),
            outputs: Mutex::new(Default::default()),
            services: parts.services,
            pool: parts.pool,
            task: Mutex::new(None),
        }
    }

    #[inline]
    pub fn coord(&self) -> TileCoord {
        self.coord
    }

    pub fn memory(&self) -> &Arc<TileMemory> {
        &self.memory
    }

    /// The host's handle on this tile's memory.
    pub fn host(&self) -> &HostHandle {
        &self.host
    }

    pub fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn rx_dmas(&self) -> &[ReceivingDma] {
        &self.rx_dma
    }

    pub fn tx_dmas(&self) -> &[SendingDma] {
        &self.tx_dma
    }

    pub fn services(&self) -> &ServiceClient {
        &self.services
    }

    /// Lock unit reachable in `direction`, if there is a tile there.
    pub fn lock_unit(&self, direction: Direction) -> Option<&Arc<LockUnit>> {
        self.locks[direction.index()].as_ref()
    }

    pub(crate) fn attach(
        &self,
        end: ConnectionEnd,
        port: usize,
        connection: Connection,
    ) -> Result<(), ConnectionError> {
        let slots = match end {
            ConnectionEnd::Input => &self.inputs,
            ConnectionEnd::Output => &self.outputs,
        };
        let mut slots = slots.lock();
        let slot = slots
            .get_mut(port)
            .ok_or(ConnectionError::InvalidPort { port })?;
        if slot.is_some() {
            return Err(ConnectionError::AlreadyConnected {
                coord: self.coord,
                port,
                end,
            });
        }
        *slot = Some(connection);
        Ok(())
    }

    pub(crate) fn detach(&self, end: ConnectionEnd, port: usize) -> Option<Connection> {
        let slots = match end {
            ConnectionEnd::Input => &self.inputs,
            ConnectionEnd::Output => &self.outputs,
        };
        slots.lock().get_mut(port).and_then(Option::take)
    }

    fn connection(&self, end: ConnectionEnd, port: usize) -> Result<Connection, ConnectionError> {
        let slots = match end {
            ConnectionEnd::Input => &self.inputs,
            ConnectionEnd::Output => &self.outputs,
        };
        slots
            .lock()
            .get(port)
            .ok_or(ConnectionError::InvalidPort { port })?
            .clone()
            .ok_or(ConnectionError::NotConnected {
                coord: self.coord,
                port,
                end,
            })
    }

    /// Close every connection this tile is an end of.
    pub(crate) fn close_connections(&self) {
        for slots in [&self.inputs, &self.outputs] {
            for connection in slots.lock().iter_mut().filter_map(Option::take) {
                connection.close();
            }
        }
    }

    /// Start `program` on this tile.
    ///
    /// A tile runs one program at a time: fails with [`TileError::Busy`] if
    /// the previous one has not completed.
    pub fn single_task<F, Fut>(self: &Arc<Self>, program: F) -> Result<(), TileError>
    where
        F: FnOnce(TileContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut slot = self.task.lock();
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return Err(TileError::Busy(self.coord));
        }
        let ctx = TileContext {
            tile: self.clone(),
        };
        *slot = Some(self.pool.submit(move || program(ctx))?);
        log::debug!("tile {}: task started", self.coord);
        Ok(())
    }

    /// True while a submitted program has not completed.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Block until the current program completes and report how it ended.
    /// Returns at once if nothing was started. Must not be called from a
    /// pool worker.
    pub fn wait(&self) -> Result<(), TileError> {
        let Some(task) = self.task.lock().take() else {
            return Ok(());
        };
        let coord = self.coord;
        match task.wait() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(TileError::Program { coord, source }),
            Err(TaskError::Panicked(message)) => Err(TileError::Panicked { coord, message }),
            Err(TaskError::Cancelled) => Err(TileError::Cancelled(coord)),
        }
    }
}

impl fmt::Debug for Tile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tile")
            .field("coord", &self.coord)
            .field("router", &self.router)
            .field("running", &self.is_running())
            .finish()
    }
}

/// What a tile program sees of its tile.
#[derive(Clone)]
pub struct TileContext {
    tile: Arc<Tile>,
}

impl TileContext {
    #[inline]
    pub fn coord(&self) -> TileCoord {
        self.tile.coord
    }

    pub fn tile(&self) -> &Tile {
        &self.tile
    }

    pub fn memory(&self) -> &TileMemory {
        &self.tile.memory
    }

    pub fn layout(&self) -> &MemoryLayout {
        &self.tile.layout
    }

    /// The tile's heap, formatted by the host when the device was built.
    pub fn heap(&self) -> Result<Heap<DirectStore<'_>>, HeapError> {
        Heap::attach(
            DirectStore::new(&self.tile.memory),
            self.tile.layout.heap_start(),
            self.tile.layout.heap_size(),
        )
    }

    /// Receiving DMA engine `index` (network to memory).
    pub fn rx_dma(&self, index: usize) -> Result<&ReceivingDma, TileError> {
        self.tile.rx_dma.get(index).ok_or(TileError::NoSuchPort {
            coord: self.coord(),
            kind: "receiving DMA",
            index,
        })
    }

    /// Sending DMA engine `index` (memory to network).
    pub fn tx_dma(&self, index: usize) -> Result<&SendingDma, TileError> {
        self.tile.tx_dma.get(index).ok_or(TileError::NoSuchPort {
            coord: self.coord(),
            kind: "sending DMA",
            index,
        })
    }

    /// Lock `id` of this tile's unit or a neighbour's.
    pub fn lock(&self, direction: Direction, id: u8) -> Result<&TileLock, TileError> {
        let unit = self.tile.locks[direction.index()]
            .as_ref()
            .ok_or(TileError::NoNeighbour {
                coord: self.coord(),
                direction,
            })?;
        unit.get(id).ok_or(TileError::NoSuchLock(LockId {
            tile: self.coord(),
            direction,
            id,
        }))
    }

    /// Where the router delivers packets routed to output `Core(index)`.
    pub fn core_in(&self, index: usize) -> Result<Arc<dyn Port>, TileError> {
        self.tile
            .core_in
            .get(index)
            .map(|port| port.clone() as Arc<dyn Port>)
            .ok_or(TileError::NoSuchPort {
                coord: self.coord(),
                kind: "core input",
                index,
            })
    }

    /// Router input `Core(index)`, for the program to write into.
    pub fn core_out(&self, index: usize) -> Result<Arc<dyn Port>, TileError> {
        let port = u8::try_from(index)
            .ok()
            .and_then(|i| self.tile.router.input(RouterPort::Core(i)).ok())
            .ok_or(TileError::NoSuchPort {
                coord: self.coord(),
                kind: "core output",
                index,
            })?;
        Ok(port as Arc<dyn Port>)
    }

    /// Read end of the connection on input slot `port`, carrying `T`.
    pub fn input<T: 'static>(&self, port: usize) -> Result<Arc<dyn Port>, TileError> {
        Ok(self.tile.connection(ConnectionEnd::Input, port)?.port::<T>()?)
    }

    /// Write end of the connection on output slot `port`, carrying `T`.
    pub fn output<T: 'static>(&self, port: usize) -> Result<Arc<dyn Port>, TileError> {
        Ok(self.tile.connection(ConnectionEnd::Output, port)?.port::<T>()?)
    }

    pub fn services(&self) -> &ServiceClient {
        &self.tile.services
    }

    /// Print a line on the host, prefixed with the tile coordinates.
    pub async fn log(&self, message: &str) -> Result<(), ServiceError> {
        self.tile.services.log(message).await
    }

    /// Print several pieces as one contiguous piece of output.
    pub async fn log_parts(&self, parts: &[&str]) -> Result<(), ServiceError> {
        self.tile.services.log_parts(parts).await
    }

    /// Report `code` to the host and finish.
    pub async fn exit(&self, code: i32) -> Result<(), ServiceError> {
        self.tile.services.exit(code).await
    }

    pub async fn abort(&self) -> Result<(), ServiceError> {
        self.tile.services.abort().await
    }

    pub async fn breakpoint(&self, offset: u32, count: u32) -> Result<(), ServiceError> {
        self.tile.services.breakpoint(offset, count).await
    }
}

impl fmt::Debug for TileContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileContext")
            .field("coord", &self.coord())
            .finish()
    }
}
