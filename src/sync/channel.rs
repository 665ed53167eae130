//! Bounded multi-producer multi-consumer async queue.
//!
//! This is the buffering behind every port and DMA command queue. Producers
//! park when the queue is full, consumers park when it is empty. Closing the
//! queue rejects further pushes; consumers drain what is left and then see
//! `None`.

use std::collections::VecDeque;
use std::task::Poll;

use futures::future::poll_fn;
use parking_lot::Mutex;
use thiserror::Error;

use super::wait_room::{park, wake_all, WakerList};

/// Push attempted on a closed channel. Carries the rejected item back.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("channel closed")]
pub struct SendError<T>(pub T);

/// Non-blocking push failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TryPushError<T> {
    #[error("channel full")]
    Full(T),
    #[error("channel closed")]
    Closed(T),
}

/// Non-blocking pop failure.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum TryPopError {
    #[error("channel empty")]
    Empty,
    #[error("channel closed")]
    Closed,
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
    producers: WakerList,
    consumers: WakerList,
}

/// Bounded async FIFO.
pub struct Channel<T> {
    capacity: usize,
    state: Mutex<State<T>>,
}

impl<T> Channel<T> {
    /// Create a channel holding at most `capacity` items (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                closed: false,
                producers: WakerList::new(),
                consumers: WakerList::new(),
            }),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.state.lock().items.len() >= self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Enqueue `item`, waiting for room if the channel is full.
    pub async fn push(&self, item: T) -> Result<(), SendError<T>> {
        let mut item = Some(item);
        poll_fn(|cx| {
            let Some(value) = item.take() else {
                return Poll::Ready(Ok(()));
            };
            let mut state = self.state.lock();
            if state.closed {
                return Poll::Ready(Err(SendError(value)));
            }
            if state.items.len() < self.capacity {
                state.items.push_back(value);
                let consumers = std::mem::take(&mut state.consumers);
                drop(state);
                wake_all(consumers);
                return Poll::Ready(Ok(()));
            }
            park(&mut state.producers, cx.waker());
            item = Some(value);
            Poll::Pending
        })
        .await
    }

    /// Enqueue `item` only if there is room right now.
    pub fn try_push(&self, item: T) -> Result<(), TryPushError<T>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TryPushError::Closed(item));
        }
        if state.items.len() >= self.capacity {
            return Err(TryPushError::Full(item));
        }
        state.items.push_back(item);
        let consumers = std::mem::take(&mut state.consumers);
        drop(state);
        wake_all(consumers);
        Ok(())
    }

    /// Dequeue the oldest item, waiting while the channel is empty.
    ///
    /// Returns `None` once the channel is closed and drained.
    pub async fn pop(&self) -> Option<T> {
        poll_fn(|cx| {
            let mut state = self.state.lock();
            if let Some(item) = state.items.pop_front() {
                let producers = std::mem::take(&mut state.producers);
                drop(state);
                wake_all(producers);
                return Poll::Ready(Some(item));
            }
            if state.closed {
                return Poll::Ready(None);
            }
            park(&mut state.consumers, cx.waker());
            Poll::Pending
        })
        .await
    }

    /// Dequeue the oldest item if one is available.
    pub fn try_pop(&self) -> Result<T, TryPopError> {
        let mut state = self.state.lock();
        match state.items.pop_front() {
            Some(item) => {
                let producers = std::mem::take(&mut state.producers);
                drop(state);
                wake_all(producers);
                Ok(item)
            }
            None if state.closed => Err(TryPopError::Closed),
            None => Err(TryPopError::Empty),
        }
    }

    /// Reject further pushes and wake everyone parked on the channel.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        let producers = std::mem::take(&mut state.producers);
        let consumers = std::mem::take(&mut state.consumers);
        drop(state);
        wake_all(producers);
        wake_all(consumers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use std::sync::Arc;

    #[test]
    fn test_fifo_order() {
        let chan = Channel::new(4);
        block_on(async {
            for v in 0..4 {
                chan.push(v).await.unwrap();
            }
            for v in 0..4 {
                assert_eq!(chan.pop().await, Some(v));
            }
        });
    }

    #[test]
    fn test_try_push_full() {
        let chan = Channel::new(2);
        assert!(chan.try_push(1).is_ok());
        assert!(chan.try_push(2).is_ok());
        assert_eq!(chan.try_push(3), Err(TryPushError::Full(3)));
        assert!(chan.is_full());
        assert_eq!(chan.try_pop(), Ok(1));
        assert!(chan.try_push(3).is_ok());
    }

    #[test]
    fn test_try_pop_empty() {
        let chan: Channel<u32> = Channel::new(1);
        assert_eq!(chan.try_pop(), Err(TryPopError::Empty));
    }

    #[test]
    fn test_close_drains_then_none() {
        let chan = Channel::new(4);
        chan.try_push(7).unwrap();
        chan.close();
        assert_eq!(chan.try_push(8), Err(TryPushError::Closed(8)));
        block_on(async {
            assert_eq!(chan.pop().await, Some(7));
            assert_eq!(chan.pop().await, None);
        });
        assert_eq!(chan.try_pop(), Err(TryPopError::Closed));
    }

    #[test]
    fn test_blocked_producer_resumes() {
        let chan = Arc::new(Channel::new(1));
        chan.try_push(0u32).unwrap();

        let producer = {
            let chan = chan.clone();
            std::thread::spawn(move || block_on(chan.push(1)))
        };

        block_on(async {
            assert_eq!(chan.pop().await, Some(0));
            assert_eq!(chan.pop().await, Some(1));
        });
        assert!(producer.join().unwrap().is_ok());
    }

    #[test]
    fn test_close_releases_blocked_producer() {
        let chan = Arc::new(Channel::new(1));
        chan.try_push(0u32).unwrap();

        let producer = {
            let chan = chan.clone();
            std::thread::spawn(move || block_on(chan.push(1)))
        };
        while chan.state.lock().producers.is_empty() {
            std::thread::yield_now();
        }
        chan.close();
        assert_eq!(producer.join().unwrap(), Err(SendError(1)));
    }
}
