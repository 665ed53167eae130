//! DMA engines.
//!
//! Each tile has [`DMA_PORTS`](super::router::DMA_PORTS) receiving engines
//! (network to memory) and as many sending engines (memory to network).
//! An engine owns a bounded command queue and one long-lived mover task
//! that executes commands in order, one word per packet.
//!
//! # Usage
//!
//! ```ignore
//! let dma = ctx.tx_dma(0)?;
//! dma.push(DmaCommand::send(MemorySpan::new(buffer, 16))).await?;
//! dma.wait().await?;
//! ```

mod engine;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::pool::{PoolError, TaskError, TaskHandle};
use crate::sync::{Channel, WaitRoom};

use super::memory::{MemoryAccess, TileMemory};
use super::router::PortError;

pub use engine::{ReceivingDma, SendingDma};

/// Default number of commands an engine can queue.
pub const DEFAULT_COMMAND_DEPTH: usize = 8;

/// Which way data moves, from the tile memory's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    /// Network to memory.
    In,
    /// Memory to network.
    Out,
}

impl fmt::Display for DmaDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DmaDirection::In => write!(f, "in"),
            DmaDirection::Out => write!(f, "out"),
        }
    }
}

/// Word range in tile memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySpan {
    /// Byte offset of the first word.
    pub offset: u32,
    /// Number of 32-bit words.
    pub words: u32,
}

impl MemorySpan {
    pub const fn new(offset: u32, words: u32) -> Self {
        Self { offset, words }
    }

    /// Byte offset of word `i`.
    #[inline]
    pub fn word_offset(&self, i: u32) -> u32 {
        self.offset + i * 4
    }

    pub fn byte_len(&self) -> Option<u32> {
        self.words.checked_mul(4)
    }
}

/// One transfer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaCommand {
    pub span: MemorySpan,
    pub direction: DmaDirection,
}

impl DmaCommand {
    /// Fill `span` from the network.
    pub const fn receive(span: MemorySpan) -> Self {
        Self {
            span,
            direction: DmaDirection::In,
        }
    }

    /// Stream `span` out to the network.
    pub const fn send(span: MemorySpan) -> Self {
        Self {
            span,
            direction: DmaDirection::Out,
        }
    }
}

#[derive(Debug, Error)]
pub enum DmaError {
    #[error("{engine} moves data {expected}, command asks for {found}")]
    DirectionMismatch {
        engine: String,
        expected: DmaDirection,
        found: DmaDirection,
    },
    #[error("span at 0x{offset:04X} ({words} words) is outside tile memory")]
    OutOfBounds { offset: u32, words: u32 },
    #[error("span offset 0x{0:04X} is not word aligned")]
    Misaligned(u32),
    #[error("{0} no longer accepts commands")]
    Closed(String),
    #[error("{0} stopped after a failed transfer")]
    Failed(String),
    #[error(transparent)]
    Port(#[from] PortError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("DMA mover failed: {0}")]
    Mover(#[from] TaskError),
}

/// Totals reported by a mover when it exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DmaStats {
    pub commands: u64,
    pub words: u64,
}

/// State shared by an engine handle and its mover.
pub(crate) struct DmaCore {
    name: String,
    direction: DmaDirection,
    memory: Arc<TileMemory>,
    commands: Channel<DmaCommand>,
    outstanding: AtomicUsize,
    failed: AtomicBool,
    idle: WaitRoom,
    mover: Mutex<Option<TaskHandle<Result<DmaStats, DmaError>>>>,
}

impl DmaCore {
    pub(crate) fn new(
        name: String,
        direction: DmaDirection,
        memory: Arc<TileMemory>,
        depth: usize,
    ) -> Self {
        Self {
            name,
            direction,
            memory,
            commands: Channel::new(depth),
            outstanding: AtomicUsize::new(0),
            failed: AtomicBool::new(false),
            idle: WaitRoom::new(),
            mover: Mutex::new(None),
        }
    }

    fn validate(&self, command: &DmaCommand) -> Result<(), DmaError> {
        if command.direction != self.direction {
            return Err(DmaError::DirectionMismatch {
                engine: self.name.clone(),
                expected: self.direction,
                found: command.direction,
            });
        }
        let span = command.span;
        if span.offset % 4 != 0 {
            return Err(DmaError::Misaligned(span.offset));
        }
        match span.byte_len() {
            Some(len) if self.memory.contains(span.offset, len) => Ok(()),
            _ => Err(DmaError::OutOfBounds {
                offset: span.offset,
                words: span.words,
            }),
        }
    }

    pub(crate) async fn push(&self, command: DmaCommand) -> Result<(), DmaError> {
        self.validate(&command)?;
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        if self.commands.push(command).await.is_err() {
            self.complete_one();
            return Err(DmaError::Closed(self.name.clone()));
        }
        log::trace!("{}: queued {:?}", self.name, command.span);
        Ok(())
    }

    pub(crate) fn complete_one(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_all();
        }
    }

    pub(crate) fn fail(&self) {
        self.failed.store(true, Ordering::Release);
        self.commands.close();
        self.idle.notify_all();
    }

    pub(crate) async fn wait(&self) -> Result<(), DmaError> {
        self.idle
            .wait_until(|| {
                self.outstanding.load(Ordering::Acquire) == 0
                    || self.failed.load(Ordering::Acquire)
            })
            .await;
        if self.failed.load(Ordering::Acquire) {
            return Err(DmaError::Failed(self.name.clone()));
        }
        Ok(())
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub(crate) fn close(&self) {
        self.commands.close();
    }

    pub(crate) async fn join(&self) -> Result<DmaStats, DmaError> {
        self.close();
        let mover = self.mover.lock().take();
        match mover {
            Some(mover) => {
                let stats = mover.await??;
                log::debug!(
                    "{}: {} command(s), {} word(s)",
                    self.name,
                    stats.commands,
                    stats.words
                );
                Ok(stats)
            }
            None => Ok(DmaStats::default()),
        }
    }
}
