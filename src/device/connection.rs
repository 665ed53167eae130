//! Direct tile-to-tile pipes.
//!
//! A connection is a bounded FIFO shared by exactly two tiles: the source
//! writes through its `out` slot, the destination reads through its `in`
//! slot. It is tagged with the element type it was created for, and taking
//! a port with a different type is an error. Both tiles hold an `Arc`; the
//! medium goes away when both let go.

use std::any::{type_name, TypeId};
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use super::router::{Port, ReceiverPort};
use super::TileCoord;

/// Connection slots per tile, in each direction.
pub const CONNECTION_PORTS: usize = 4;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("connection carries {found}, not {expected}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
    #[error("{port} is not a valid port number between 0 and {}", CONNECTION_PORTS - 1)]
    InvalidPort { port: usize },
    #[error("tile {coord} has no {end} connection on port {port}")]
    NotConnected {
        coord: TileCoord,
        port: usize,
        end: ConnectionEnd,
    },
    #[error("tile {coord} already has an {end} connection on port {port}")]
    AlreadyConnected {
        coord: TileCoord,
        port: usize,
        end: ConnectionEnd,
    },
}

/// Which end of a connection a tile holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEnd {
    Input,
    Output,
}

impl fmt::Display for ConnectionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEnd::Input => write!(f, "input"),
            ConnectionEnd::Output => write!(f, "output"),
        }
    }
}

/// Type-tagged shared medium.
#[derive(Clone)]
pub struct Connection {
    medium: Arc<ReceiverPort>,
    element: TypeId,
    element_name: &'static str,
}

impl Connection {
    /// New connection carrying `T`, buffering up to `depth` words.
    pub fn new<T: 'static>(depth: usize) -> Self {
        Self {
            medium: Arc::new(ReceiverPort::new(depth)),
            element: TypeId::of::<T>(),
            element_name: type_name::<T>(),
        }
    }

    pub fn element_name(&self) -> &'static str {
        self.element_name
    }

    /// The medium as a port, if this connection carries `T`.
    pub fn port<T: 'static>(&self) -> Result<Arc<dyn Port>, ConnectionError> {
        if self.element != TypeId::of::<T>() {
            return Err(ConnectionError::TypeMismatch {
                expected: type_name::<T>(),
                found: self.element_name,
            });
        }
        Ok(self.medium.clone())
    }

    /// Reject further writes; what is buffered can still be read.
    pub fn close(&self) {
        self.medium.close();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("element", &self.element_name)
            .field("queued", &self.medium.len())
            .finish()
    }
}
