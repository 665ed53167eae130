//! Cooperative synchronization primitives.
//!
//! Everything here suspends the calling task rather than its worker thread,
//! except the host side of the barrier, which runs on a real OS thread.

pub mod barrier;
pub mod channel;
pub mod lock;
pub mod wait_room;

pub use barrier::{DeviceBarrier, HostBarrier};
pub use channel::{Channel, SendError, TryPopError, TryPushError};
pub use lock::{LockId, LockUnit, TileLock, LOCKS_PER_TILE};
pub use wait_room::WaitRoom;
