//! Two-party barrier between a tile and the host.
//!
//! The barrier is a pair of counters in tile memory: the device bumps the
//! first, the host bumps the second, and neither ever writes the other's.
//! Both sides spin; the device side yields to the scheduler between checks,
//! the host side yields its OS thread.
//!
//! Only two parties are supported. With more, the counters no longer tell
//! who is waiting for whom.

use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;
use std::thread;

use crate::device::memory::{MemoryAccess, TileMemory};
use crate::pool::yield_now;

/// Offset of the device counter within the barrier.
pub const DEVICE_COUNTER: u32 = 0;
/// Offset of the host counter within the barrier.
pub const HOST_COUNTER: u32 = 4;
/// Bytes occupied by a barrier.
pub const BARRIER_SIZE: u32 = 8;

/// Tile-side end of a barrier.
#[derive(Debug, Clone)]
pub struct DeviceBarrier {
    memory: Arc<TileMemory>,
    offset: u32,
}

impl DeviceBarrier {
    pub fn new(memory: Arc<TileMemory>, offset: u32) -> Self {
        Self { memory, offset }
    }

    /// Arrive, then wait until the host has arrived as many times.
    pub async fn wait(&self) {
        fence(Ordering::SeqCst);
        let device = self.memory.word(self.offset + DEVICE_COUNTER);
        let host = self.memory.word(self.offset + HOST_COUNTER);
        let arrived = device.load(Ordering::Relaxed).wrapping_add(1);
        device.store(arrived, Ordering::Release);
        while host.load(Ordering::Acquire) != arrived {
            yield_now().await;
        }
        fence(Ordering::SeqCst);
    }

    /// (device, host) counter values.
    pub fn counters(&self) -> (u32, u32) {
        (
            self.memory.read_u32(self.offset + DEVICE_COUNTER),
            self.memory.read_u32(self.offset + HOST_COUNTER),
        )
    }
}

/// Host-side end of a barrier, reached through a memory handle.
#[derive(Debug)]
pub struct HostBarrier<H> {
    handle: H,
    offset: u32,
}

impl<H: MemoryAccess> HostBarrier<H> {
    pub fn new(handle: H, offset: u32) -> Self {
        Self { handle, offset }
    }

    /// Arrive if the device is already waiting. Never blocks.
    pub fn try_arrive(&self) -> bool {
        let host = self.handle.read_u32(self.offset + HOST_COUNTER);
        if self.handle.read_u32(self.offset + DEVICE_COUNTER) == host {
            return false;
        }
        fence(Ordering::SeqCst);
        self.handle
            .write_u32(self.offset + HOST_COUNTER, host.wrapping_add(1));
        true
    }

    /// Wait for the device to arrive, then arrive.
    pub fn wait(&self) {
        let host = self.handle.read_u32(self.offset + HOST_COUNTER);
        while self.handle.read_u32(self.offset + DEVICE_COUNTER) == host {
            thread::yield_now();
        }
        fence(Ordering::SeqCst);
        self.handle
            .write_u32(self.offset + HOST_COUNTER, host.wrapping_add(1));
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{PoolConfig, SchedulerPolicy, TaskPool};

    #[test]
    fn test_try_arrive_needs_device() {
        let memory = Arc::new(TileMemory::new(64));
        let host = HostBarrier::new(memory.clone(), 8);
        assert!(!host.try_arrive());
        assert!(!host.try_arrive());
    }

    #[test]
    fn test_rounds_in_lockstep() {
        for policy in [SchedulerPolicy::RoundRobin, SchedulerPolicy::WorkStealing] {
            let pool = TaskPool::new(PoolConfig::new(policy, 2)).unwrap();
            let memory = Arc::new(TileMemory::new(64));
            let device = DeviceBarrier::new(memory.clone(), 16);
            let host = HostBarrier::new(memory.clone(), 16);

            let task = {
                let device = device.clone();
                pool.submit(move || async move {
                    for round in 1..=50u32 {
                        device.wait().await;
                        let (dev, host) = device.counters();
                        assert_eq!(dev, round);
                        assert!(host <= dev, "host {host} ahead of device {dev}");
                    }
                })
                .unwrap()
            };

            for _ in 0..50 {
                host.wait();
            }
            task.wait().unwrap();
            assert_eq!(device.counters(), (50, 50));
            assert!(!host.try_arrive());
        }
    }

    #[test]
    fn test_try_arrive_releases_waiting_device() {
        let pool = TaskPool::new(PoolConfig::new(SchedulerPolicy::SharedWork, 1)).unwrap();
        let memory = Arc::new(TileMemory::new(64));
        let device = DeviceBarrier::new(memory.clone(), 0);
        let host = HostBarrier::new(memory.clone(), 0);

        let task = {
            let device = device.clone();
            pool.submit(move || async move { device.wait().await }).unwrap()
        };
        while !host.try_arrive() {
            thread::yield_now();
        }
        task.wait().unwrap();
        assert!(!host.try_arrive());
    }
}
