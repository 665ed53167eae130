//! tilesim library
//!
//! Host-side runtime for a 2-D array of accelerator tiles: per-tile memory
//! and heap, routers and DMA engines moving words between tiles, locks,
//! the host/tile service protocol, and the task pool tile programs run on.

pub mod config;
pub mod device;
pub mod heap;
pub mod pool;
pub mod service;
pub mod sync;
