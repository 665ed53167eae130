//! The tile array: tiles, their memory, interconnect, DMA and the device
//! that coordinates them.
//!
//! This module provides:
//! - Tile coordinates and neighbour directions
//! - Tile memory and the host handle used to reach it
//! - Per-tile address-space layout
//! - Routers, ports and tile-to-tile connections
//! - DMA engines
//! - Tiles and the device coordinator
//!
//! # Geometry
//!
//! `x` grows east, `y` grows north. Tile `(x, y)` is linked to at most four
//! neighbours:
//!
//! ```text
//!              (x, y+1)
//!                 │ North
//!   (x-1, y) ─── (x, y) ─── (x+1, y)
//!         West    │    East
//!              (x, y-1)
//!                   South
//! ```
//!
//! # Example
//!
//! ```no_run
//! use tilesim::device::{Device, DeviceConfig, TileCoord};
//!
//! let device = Device::new(DeviceConfig::with_size(2, 1)).unwrap();
//! device
//!     .run(|ctx| async move {
//!         ctx.log(&format!("hello from {}", ctx.coord())).await?;
//!         Ok(())
//!     })
//!     .unwrap();
//! assert_eq!(device.tile(TileCoord::new(1, 0)).unwrap().coord().x, 1);
//! ```

pub mod array;
pub mod connection;
pub mod dma;
pub mod layout;
pub mod memory;
pub mod router;
pub mod tile;

use std::fmt;

pub use array::{Device, DeviceConfig, DeviceError};
pub use connection::{Connection, ConnectionEnd, ConnectionError, CONNECTION_PORTS};
pub use dma::{DmaCommand, DmaDirection, DmaError, MemorySpan, ReceivingDma, SendingDma};
pub use layout::{LayoutParams, MemoryLayout, OffsetTable};
pub use memory::{HostHandle, MemoryAccess, MemoryAccessExt, TileMemory};
pub use router::{
    Packet, Port, PortError, ReceiverPort, Router, RouterError, RouterPort, RoutingPort,
};
pub use tile::{Tile, TileContext, TileError};

/// Neighbour direction, or the tile itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    North,
    South,
    East,
    West,
    /// The tile itself.
    Local,
}

impl Direction {
    /// The four neighbour directions.
    pub const CARDINAL: [Direction; 4] = [
        Direction::North,
        Direction::South,
        Direction::East,
        Direction::West,
    ];

    /// Direction seen from the other end of a link.
    pub fn opposite(self) -> Self {
        match self {
            Direction::North => Direction::South,
            Direction::South => Direction::North,
            Direction::East => Direction::West,
            Direction::West => Direction::East,
            Direction::Local => Direction::Local,
        }
    }

    /// Index into per-direction tables: cardinal directions 0..4, local 4.
    #[inline]
    pub fn index(self) -> usize {
        match self {
            Direction::North => 0,
            Direction::South => 1,
            Direction::East => 2,
            Direction::West => 3,
            Direction::Local => 4,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::North => write!(f, "north"),
            Direction::South => write!(f, "south"),
            Direction::East => write!(f, "east"),
            Direction::West => write!(f, "west"),
            Direction::Local => write!(f, "local"),
        }
    }
}

/// Tile position in the array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileCoord {
    pub x: u8,
    pub y: u8,
}

impl TileCoord {
    pub const fn new(x: u8, y: u8) -> Self {
        Self { x, y }
    }

    /// Coordinate one step in `direction`, if it does not underflow or
    /// overflow. Bounds of the actual array are checked by the caller.
    pub fn step(self, direction: Direction) -> Option<Self> {
        let (x, y) = (self.x, self.y);
        match direction {
            Direction::North => y.checked_add(1).map(|y| Self::new(x, y)),
            Direction::South => y.checked_sub(1).map(|y| Self::new(x, y)),
            Direction::East => x.checked_add(1).map(|x| Self::new(x, y)),
            Direction::West => x.checked_sub(1).map(|x| Self::new(x, y)),
            Direction::Local => Some(self),
        }
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opposite_is_involution() {
        for d in Direction::CARDINAL {
            assert_ne!(d.opposite(), d);
            assert_eq!(d.opposite().opposite(), d);
        }
        assert_eq!(Direction::Local.opposite(), Direction::Local);
    }

    #[test]
    fn test_step() {
        let c = TileCoord::new(1, 1);
        assert_eq!(c.step(Direction::North), Some(TileCoord::new(1, 2)));
        assert_eq!(c.step(Direction::South), Some(TileCoord::new(1, 0)));
        assert_eq!(c.step(Direction::East), Some(TileCoord::new(2, 1)));
        assert_eq!(c.step(Direction::West), Some(TileCoord::new(0, 1)));
        assert_eq!(TileCoord::new(0, 0).step(Direction::West), None);
        assert_eq!(TileCoord::new(0, 0).step(Direction::South), None);
    }

    #[test]
    fn test_step_then_opposite_returns() {
        let c = TileCoord::new(3, 4);
        for d in Direction::CARDINAL {
            assert_eq!(c.step(d).and_then(|n| n.step(d.opposite())), Some(c));
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(TileCoord::new(2, 5).to_string(), "(2, 5)");
        assert_eq!(Direction::East.to_string(), "east");
    }
}
