//! Per-tile packet router.
//!
//! The router handles data movement between tiles. It provides:
//!
//! - Bounded FIFO buffering at every port (backpressure by blocking)
//! - Circuit-switched routing: each input forwards to one fixed output
//! - Links to the four neighbour routers
//!
//! # Architecture
//!
//! ```text
//!            inputs (slave side)                 outputs (master side)
//!   core out ──► Core(i) ─┐                ┌─► Core(i) ──► program input
//!   tx DMA   ──► Dma(i)  ─┼── route() ─────┼─► Dma(i)  ──► rx DMA
//!   neighbour──► Link(d) ─┘  (one mover    └─► Link(d) ──► neighbour's
//!                             task each)                   Link(opposite)
//! ```
//!
//! Every input is a [`RoutingPort`]: a queue plus a mover task that pops
//! packets and writes them to the output chosen when the route was set up.
//! The mover exits when it pops a shutdown packet.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use thiserror::Error;

use crate::pool::{PoolError, TaskError, TaskHandle, TaskPool};
use crate::sync::{Channel, TryPopError, TryPushError};

use super::{Direction, TileCoord};

/// Program-facing ports per router.
pub const CORE_PORTS: usize = 2;
/// DMA-facing ports per router, which is also the DMA engine count per
/// direction.
pub const DMA_PORTS: usize = 2;
/// Total inputs (and outputs) per router.
pub const ROUTER_PORTS: usize = CORE_PORTS + DMA_PORTS + 4;

/// Default FIFO depth of a port.
pub const DEFAULT_QUEUE_DEPTH: usize = 4;
/// Accepted range of port FIFO depths.
pub const MIN_QUEUE_DEPTH: usize = 4;
pub const MAX_QUEUE_DEPTH: usize = 16;

/// One word on the interconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    pub value: u32,
    /// Last word of a stream.
    pub last: bool,
    /// Tells a routing port's mover to exit. Never forwarded.
    pub shutdown: bool,
}

impl Packet {
    pub const fn new(value: u32) -> Self {
        Self {
            value,
            last: false,
            shutdown: false,
        }
    }

    pub const fn with_last(value: u32) -> Self {
        Self {
            value,
            last: true,
            shutdown: false,
        }
    }

    pub const fn shutdown() -> Self {
        Self {
            value: 0,
            last: true,
            shutdown: true,
        }
    }
}

/// Port operation on a port that has been torn down.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("port is closed")]
    Closed,
}

/// Abstract packet endpoint.
pub trait Port: Send + Sync {
    /// Enqueue, waiting while the port is full.
    fn write(&self, packet: Packet) -> BoxFuture<'_, Result<(), PortError>>;

    /// Enqueue if there is room. `Ok(false)` when full.
    fn try_write(&self, packet: Packet) -> Result<bool, PortError>;

    /// Dequeue, waiting while the port is empty.
    fn read(&self) -> BoxFuture<'_, Result<Packet, PortError>>;

    /// Dequeue if a packet is waiting.
    fn try_read(&self) -> Result<Option<Packet>, PortError>;
}

fn try_write_to(queue: &Channel<Packet>, packet: Packet) -> Result<bool, PortError> {
    match queue.try_push(packet) {
        Ok(()) => Ok(true),
        Err(TryPushError::Full(_)) => Ok(false),
        Err(TryPushError::Closed(_)) => Err(PortError::Closed),
    }
}

fn try_read_from(queue: &Channel<Packet>) -> Result<Option<Packet>, PortError> {
    match queue.try_pop() {
        Ok(packet) => Ok(Some(packet)),
        Err(TryPopError::Empty) => Ok(None),
        Err(TryPopError::Closed) => Err(PortError::Closed),
    }
}

/// Port that feeds a consumer directly: a tile program input or a
/// receiving DMA.
pub struct ReceiverPort {
    queue: Channel<Packet>,
}

impl ReceiverPort {
    pub fn new(depth: usize) -> Self {
        Self {
            queue: Channel::new(depth),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Reject further writes. Pending packets can still be read.
    pub fn close(&self) {
        self.queue.close();
    }
}

impl Port for ReceiverPort {
    fn write(&self, packet: Packet) -> BoxFuture<'_, Result<(), PortError>> {
        async move { self.queue.push(packet).await.map_err(|_| PortError::Closed) }.boxed()
    }

    fn try_write(&self, packet: Packet) -> Result<bool, PortError> {
        try_write_to(&self.queue, packet)
    }

    fn read(&self) -> BoxFuture<'_, Result<Packet, PortError>> {
        async move { self.queue.pop().await.ok_or(PortError::Closed) }.boxed()
    }

    fn try_read(&self) -> Result<Option<Packet>, PortError> {
        try_read_from(&self.queue)
    }
}

/// Router input: a queue drained by a mover task into one downstream port.
pub struct RoutingPort {
    name: String,
    queue: Arc<Channel<Packet>>,
    downstream: Mutex<Option<Arc<dyn Port>>>,
    mover: Mutex<Option<TaskHandle<Result<u64, PortError>>>>,
}

impl RoutingPort {
    pub fn new(name: impl Into<String>, depth: usize) -> Self {
        Self {
            name: name.into(),
            queue: Arc::new(Channel::new(depth)),
            downstream: Mutex::new(None),
            mover: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True once a downstream port has been fixed.
    pub fn is_routed(&self) -> bool {
        self.downstream.lock().is_some()
    }

    /// Fix the downstream port and start the mover. Only once per port.
    pub fn start(&self, pool: &TaskPool, downstream: Arc<dyn Port>) -> Result<(), RouterError> {
        let mut slot = self.downstream.lock();
        if slot.is_some() {
            return Err(RouterError::AlreadyRouted(self.name.clone()));
        }
        *slot = Some(downstream.clone());
        drop(slot);

        let queue = self.queue.clone();
        let name = self.name.clone();
        let handle = pool.submit(move || async move {
            let mut forwarded = 0u64;
            while let Some(packet) = queue.pop().await {
                if packet.shutdown {
                    break;
                }
                log::trace!("{name}: forward 0x{:08X}{}", packet.value, if packet.last { " (last)" } else { "" });
                downstream.write(packet).await?;
                forwarded += 1;
            }
            log::trace!("{name}: mover exiting after {forwarded} packet(s)");
            Ok(forwarded)
        })?;
        *self.mover.lock() = Some(handle);
        Ok(())
    }

    /// Send the shutdown sentinel, wait for the mover to exit and release
    /// the downstream port. Returns the number of packets forwarded.
    pub async fn shutdown(&self) -> Result<u64, RouterError> {
        let mover = self.mover.lock().take();
        let forwarded = match mover {
            Some(mover) => {
                self.queue
                    .push(Packet::shutdown())
                    .await
                    .map_err(|_| RouterError::Port(PortError::Closed))?;
                mover.await??
            }
            None => 0,
        };
        self.queue.close();
        self.downstream.lock().take();
        Ok(forwarded)
    }
}

impl Port for RoutingPort {
    fn write(&self, packet: Packet) -> BoxFuture<'_, Result<(), PortError>> {
        async move { self.queue.push(packet).await.map_err(|_| PortError::Closed) }.boxed()
    }

    fn try_write(&self, packet: Packet) -> Result<bool, PortError> {
        try_write_to(&self.queue, packet)
    }

    /// Reads compete with the mover, so this is only useful on an input
    /// that was never routed.
    fn read(&self) -> BoxFuture<'_, Result<Packet, PortError>> {
        async move { self.queue.pop().await.ok_or(PortError::Closed) }.boxed()
    }

    fn try_read(&self) -> Result<Option<Packet>, PortError> {
        try_read_from(&self.queue)
    }
}

impl fmt::Debug for RoutingPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingPort")
            .field("name", &self.name)
            .field("queued", &self.queue.len())
            .field("routed", &self.is_routed())
            .finish()
    }
}

/// Logical router port, used for both inputs and outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouterPort {
    /// Tile program side.
    Core(u8),
    /// DMA engine side.
    Dma(u8),
    /// Neighbour link. `Link(Direction::Local)` is not a port.
    Link(Direction),
}

impl RouterPort {
    /// Position in the router's port tables.
    pub fn index(self) -> Option<usize> {
        match self {
            RouterPort::Core(i) if (i as usize) < CORE_PORTS => Some(i as usize),
            RouterPort::Dma(i) if (i as usize) < DMA_PORTS => Some(CORE_PORTS + i as usize),
            RouterPort::Link(Direction::Local) => None,
            RouterPort::Link(d) => Some(CORE_PORTS + DMA_PORTS + d.index()),
            _ => None,
        }
    }

    /// Every valid port, in index order.
    pub fn all() -> impl Iterator<Item = RouterPort> {
        (0..CORE_PORTS as u8)
            .map(RouterPort::Core)
            .chain((0..DMA_PORTS as u8).map(RouterPort::Dma))
            .chain(Direction::CARDINAL.into_iter().map(RouterPort::Link))
    }
}

impl fmt::Display for RouterPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouterPort::Core(i) => write!(f, "core{i}"),
            RouterPort::Dma(i) => write!(f, "dma{i}"),
            RouterPort::Link(d) => write!(f, "{d}"),
        }
    }
}

/// Routing and port failures.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("{0} is not a router port")]
    InvalidPort(RouterPort),
    #[error("output {port} of tile {coord} is not connected to anything")]
    Unbound { coord: TileCoord, port: RouterPort },
    #[error("output {port} of tile {coord} is already bound")]
    AlreadyBound { coord: TileCoord, port: RouterPort },
    #[error("input {0} is already routed")]
    AlreadyRouted(String),
    #[error(transparent)]
    Port(#[from] PortError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("routing mover failed: {0}")]
    Mover(#[from] TaskError),
}

/// One tile's router.
pub struct Router {
    coord: TileCoord,
    inputs: Vec<Arc<RoutingPort>>,
    outputs: Vec<Mutex<Option<Arc<dyn Port>>>>,
}

impl Router {
    pub fn new(coord: TileCoord, depth: usize) -> Self {
        let inputs = RouterPort::all()
            .map(|p| Arc::new(RoutingPort::new(format!("{coord}/{p}"), depth)))
            .collect();
        let outputs = (0..ROUTER_PORTS).map(|_| Mutex::new(None)).collect();
        Self {
            coord,
            inputs,
            outputs,
        }
    }

    #[inline]
    pub fn coord(&self) -> TileCoord {
        self.coord
    }

    fn index(port: RouterPort) -> Result<usize, RouterError> {
        port.index().ok_or(RouterError::InvalidPort(port))
    }

    /// The input (slave side) routing port.
    pub fn input(&self, port: RouterPort) -> Result<Arc<RoutingPort>, RouterError> {
        Ok(self.inputs[Self::index(port)?].clone())
    }

    /// The port an output (master side) delivers into.
    pub fn output(&self, port: RouterPort) -> Result<Arc<dyn Port>, RouterError> {
        self.outputs[Self::index(port)?]
            .lock()
            .clone()
            .ok_or(RouterError::Unbound {
                coord: self.coord,
                port,
            })
    }

    /// Attach the consumer of an output.
    pub fn bind_output(&self, port: RouterPort, target: Arc<dyn Port>) -> Result<(), RouterError> {
        let mut slot = self.outputs[Self::index(port)?].lock();
        if slot.is_some() {
            return Err(RouterError::AlreadyBound {
                coord: self.coord,
                port,
            });
        }
        *slot = Some(target);
        Ok(())
    }

    /// Forward everything arriving on `from` to `to`.
    pub fn route(&self, pool: &TaskPool, from: RouterPort, to: RouterPort) -> Result<(), RouterError> {
        let downstream = self.output(to)?;
        self.input(from)?.start(pool, downstream)?;
        log::debug!("router {}: {from} -> {to}", self.coord);
        Ok(())
    }

    /// Stop every mover and drop all output bindings.
    pub async fn shutdown(&self) -> Result<(), RouterError> {
        for input in &self.inputs {
            let forwarded = input.shutdown().await?;
            if forwarded > 0 {
                log::debug!("{}: forwarded {forwarded} packet(s)", input.name());
            }
        }
        for output in &self.outputs {
            output.lock().take();
        }
        Ok(())
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("coord", &self.coord)
            .field("inputs", &self.inputs)
            .finish()
    }
}
