//! Hardware-style locks.
//!
//! Every tile has a unit of [`LOCKS_PER_TILE`] locks. A tile program can use
//! the locks of its own unit and those of its four neighbours, which is how
//! neighbouring tiles hand shared buffers back and forth.
//!
//! Each lock offers two independent protocols:
//! - `acquire`/`release`: plain mutual exclusion.
//! - `acquire_with_value`/`release_with_value`: a boolean handshake. The
//!   acquirer waits until the value matches; the releaser sets it and wakes
//!   one waiter. Only one outstanding waiter per lock is supported.
//!
//! Waiting futures can be dropped; a wake-up already handed to a dropped
//! waiter moves on to the next one.

use std::fmt;
use std::task::Poll;

use futures::future::poll_fn;
use parking_lot::Mutex;

use super::wait_room::{Parking, WakerList};
use crate::device::{Direction, TileCoord};

/// Locks per tile.
pub const LOCKS_PER_TILE: usize = 16;

/// Fully qualified lock name as seen from a tile program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockId {
    /// Tile whose program names the lock.
    pub tile: TileCoord,
    /// Which unit: the tile's own or a neighbour's.
    pub direction: Direction,
    pub id: u8,
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}#{}", self.tile, self.direction, self.id)
    }
}

#[derive(Default)]
struct LockState {
    held: bool,
    value: bool,
    acquirers: WakerList,
    value_waiters: WakerList,
}

fn acquirers(state: &mut LockState) -> &mut WakerList {
    &mut state.acquirers
}

fn value_waiters(state: &mut LockState) -> &mut WakerList {
    &mut state.value_waiters
}

/// One lock.
#[derive(Default)]
pub struct TileLock {
    state: Mutex<LockState>,
}

impl TileLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until the lock is free and take it.
    pub async fn acquire(&self) {
        let mut parking = Parking::new(&self.state, acquirers);
        poll_fn(|cx| {
            let mut state = self.state.lock();
            if !state.held {
                state.held = true;
                parking.done();
                Poll::Ready(())
            } else {
                parking.park(&mut state, cx.waker());
                Poll::Pending
            }
        })
        .await
    }

    /// Take the lock if it is free.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        if state.held {
            false
        } else {
            state.held = true;
            true
        }
    }

    /// Release the lock and wake one task waiting in `acquire`.
    pub fn release(&self) {
        let waker = {
            let mut state = self.state.lock();
            if !state.held {
                log::warn!("release of a lock that is not held");
            }
            state.held = false;
            (!state.acquirers.is_empty()).then(|| state.acquirers.remove(0))
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Wait until the lock's value equals `value`.
    pub async fn acquire_with_value(&self, value: bool) {
        let mut parking = Parking::new(&self.state, value_waiters);
        poll_fn(|cx| {
            let mut state = self.state.lock();
            if state.value == value {
                parking.done();
                Poll::Ready(())
            } else {
                parking.park(&mut state, cx.waker());
                Poll::Pending
            }
        })
        .await
    }

    /// Set the lock's value and wake one task waiting on it.
    pub fn release_with_value(&self, value: bool) {
        let waker = {
            let mut state = self.state.lock();
            state.value = value;
            (!state.value_waiters.is_empty()).then(|| state.value_waiters.remove(0))
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    pub fn is_held(&self) -> bool {
        self.state.lock().held
    }

    pub fn value(&self) -> bool {
        self.state.lock().value
    }
}

/// The locks of one tile.
pub struct LockUnit {
    owner: TileCoord,
    locks: [TileLock; LOCKS_PER_TILE],
}

impl LockUnit {
    pub fn new(owner: TileCoord) -> Self {
        Self {
            owner,
            locks: std::array::from_fn(|_| TileLock::new()),
        }
    }

    /// Tile this unit belongs to.
    #[inline]
    pub fn owner(&self) -> TileCoord {
        self.owner
    }

    #[inline]
    pub fn get(&self, id: u8) -> Option<&TileLock> {
        self.locks.get(id as usize)
    }
}

impl fmt::Debug for LockUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let held: Vec<usize> = (0..LOCKS_PER_TILE)
            .filter(|&i| self.locks[i].is_held())
            .collect();
        f.debug_struct("LockUnit")
            .field("owner", &self.owner)
            .field("held", &held)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{yield_now, PoolConfig, SchedulerPolicy, TaskPool};
    use futures::executor::block_on;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_try_acquire_and_release() {
        let lock = TileLock::new();
        assert!(lock.try_acquire());
        assert!(!lock.try_acquire());
        lock.release();
        assert!(lock.try_acquire());
    }

    #[test]
    fn test_mutual_exclusion() {
        let pool = TaskPool::new(PoolConfig::new(SchedulerPolicy::WorkStealing, 4)).unwrap();
        let lock = Arc::new(TileLock::new());
        let inside = Arc::new(AtomicU32::new(0));
        let total = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (lock, inside, total) = (lock.clone(), inside.clone(), total.clone());
                pool.submit(move || async move {
                    for _ in 0..20 {
                        lock.acquire().await;
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        yield_now().await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                        total.fetch_add(1, Ordering::SeqCst);
                        lock.release();
                    }
                })
                .unwrap()
            })
            .collect();
        for handle in handles {
            handle.wait().unwrap();
        }
        assert_eq!(total.load(Ordering::SeqCst), 160);
    }

    #[test]
    fn test_value_handshake() {
        let pool = TaskPool::new(PoolConfig::new(SchedulerPolicy::RoundRobin, 1)).unwrap();
        let lock = Arc::new(TileLock::new());
        let data = Arc::new(AtomicU32::new(0));

        let consumer = {
            let (lock, data) = (lock.clone(), data.clone());
            pool.submit(move || async move {
                let mut seen = Vec::new();
                for _ in 0..5 {
                    lock.acquire_with_value(true).await;
                    seen.push(data.load(Ordering::SeqCst));
                    lock.release_with_value(false);
                }
                seen
            })
            .unwrap()
        };
        let producer = {
            let (lock, data) = (lock.clone(), data.clone());
            pool.submit(move || async move {
                for v in 1..=5 {
                    lock.acquire_with_value(false).await;
                    data.store(v, Ordering::SeqCst);
                    lock.release_with_value(true);
                }
            })
            .unwrap()
        };

        producer.wait().unwrap();
        assert_eq!(consumer.wait().unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_value_ready_immediately() {
        let lock = TileLock::new();
        block_on(lock.acquire_with_value(false));
        lock.release_with_value(true);
        assert!(lock.value());
        block_on(lock.acquire_with_value(true));
    }

    fn counting_waker() -> (std::task::Waker, Arc<AtomicU32>) {
        struct Counter(Arc<AtomicU32>);
        impl futures::task::ArcWake for Counter {
            fn wake_by_ref(arc_self: &Arc<Self>) {
                arc_self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let count = Arc::new(AtomicU32::new(0));
        (futures::task::waker(Arc::new(Counter(count.clone()))), count)
    }

    #[test]
    fn test_dropped_acquire_hands_wake_on() {
        use std::future::Future;
        use std::task::Context;

        let lock = TileLock::new();
        assert!(lock.try_acquire());
        let mut first = Box::pin(lock.acquire());
        let mut second = Box::pin(lock.acquire());
        let (first_waker, first_count) = counting_waker();
        let (second_waker, second_count) = counting_waker();
        assert!(first.as_mut().poll(&mut Context::from_waker(&first_waker)).is_pending());
        assert!(second.as_mut().poll(&mut Context::from_waker(&second_waker)).is_pending());

        lock.release();
        assert_eq!(first_count.load(Ordering::SeqCst), 1);
        assert_eq!(second_count.load(Ordering::SeqCst), 0);

        // The chosen waiter is cancelled before it runs.
        drop(first);
        assert_eq!(second_count.load(Ordering::SeqCst), 1);
        assert!(second.as_mut().poll(&mut Context::from_waker(&second_waker)).is_ready());
        assert!(lock.is_held());
    }

    #[test]
    fn test_dropped_value_waiter_hands_wake_on() {
        use std::future::Future;
        use std::task::Context;

        let lock = TileLock::new();
        let mut first = Box::pin(lock.acquire_with_value(true));
        let mut second = Box::pin(lock.acquire_with_value(true));
        let (first_waker, _) = counting_waker();
        let (second_waker, second_count) = counting_waker();
        assert!(first.as_mut().poll(&mut Context::from_waker(&first_waker)).is_pending());
        assert!(second.as_mut().poll(&mut Context::from_waker(&second_waker)).is_pending());

        lock.release_with_value(true);
        drop(first);
        assert_eq!(second_count.load(Ordering::SeqCst), 1);
        assert!(second.as_mut().poll(&mut Context::from_waker(&second_waker)).is_ready());
    }

    #[test]
    fn test_dropped_parked_acquire_is_forgotten() {
        use std::future::Future;
        use std::task::Context;

        let lock = TileLock::new();
        assert!(lock.try_acquire());
        let mut waiter = Box::pin(lock.acquire());
        let (waker, count) = counting_waker();
        assert!(waiter.as_mut().poll(&mut Context::from_waker(&waker)).is_pending());
        drop(waiter);
        lock.release();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(lock.try_acquire());
    }

    #[test]
    fn test_unit_has_sixteen_locks() {
        let unit = LockUnit::new(TileCoord::new(2, 3));
        assert!(unit.get(15).is_some());
        assert!(unit.get(16).is_none());
        assert_eq!(unit.owner(), TileCoord::new(2, 3));
    }
}
