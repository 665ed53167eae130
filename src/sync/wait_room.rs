//! Waker parking for conditions that are not tied to a queue.
//!
//! A `WaitRoom` is the async counterpart of a condition variable: tasks park
//! their waker while a predicate is false and are woken by `notify_*`. The
//! predicate is re-checked after the waker is registered, so a notification
//! racing with the registration is never lost.
//!
//! Waiting futures may be dropped at any point. A dropped waiter removes its
//! waker, and if a wake-one notification already picked it, hands the wake
//! on to the next parked task.

use std::future::Future;
use std::task::{Context, Poll, Waker};

use futures::future::poll_fn;
use parking_lot::{Mutex, MutexGuard};
use smallvec::SmallVec;

/// Parked wakers. Most rooms see one or two waiters at a time.
pub(crate) type WakerList = SmallVec<[Waker; 4]>;

/// Register `waker` in `list` unless an equivalent waker is already parked.
pub(crate) fn park(list: &mut WakerList, waker: &Waker) {
    if !list.iter().any(|w| w.will_wake(waker)) {
        list.push(waker.clone());
    }
}

/// Place of one waiting future in a waker list behind `state`.
pub(crate) struct Parking<'a, T> {
    state: &'a Mutex<T>,
    list: fn(&mut T) -> &mut WakerList,
    waker: Option<Waker>,
}

impl<'a, T> Parking<'a, T> {
    pub(crate) fn new(state: &'a Mutex<T>, list: fn(&mut T) -> &mut WakerList) -> Self {
        Self {
            state,
            list,
            waker: None,
        }
    }

    /// Park `waker`. `state` is the held guard of the same mutex.
    pub(crate) fn park(&mut self, state: &mut MutexGuard<'_, T>, waker: &Waker) {
        park((self.list)(&mut **state), waker);
        self.waker = Some(waker.clone());
    }

    /// The future completed; nothing to give up on drop.
    pub(crate) fn done(&mut self) {
        self.waker = None;
    }
}

impl<T> Drop for Parking<'_, T> {
    fn drop(&mut self) {
        let Some(waker) = self.waker.take() else {
            return;
        };
        let next = {
            let mut state = self.state.lock();
            let list = (self.list)(&mut *state);
            match list.iter().position(|w| w.will_wake(&waker)) {
                Some(pos) => {
                    list.remove(pos);
                    None
                }
                None => (!list.is_empty()).then(|| list.remove(0)),
            }
        };
        if let Some(next) = next {
            next.wake();
        }
    }
}

/// Wake every waker in `list`. Call with no locks held.
pub(crate) fn wake_all(list: WakerList) {
    for waker in list {
        waker.wake();
    }
}

fn waiter_list(list: &mut WakerList) -> &mut WakerList {
    list
}

/// A set of parked tasks waiting for some shared state to change.
#[derive(Default)]
pub struct WaitRoom {
    waiters: Mutex<WakerList>,
}

impl WaitRoom {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve once `ready()` returns true.
    pub fn wait_until<'a, F>(&'a self, mut ready: F) -> impl Future<Output = ()> + 'a
    where
        F: FnMut() -> bool + 'a,
    {
        let mut parking = Parking::new(&self.waiters, waiter_list);
        poll_fn(move |cx: &mut Context<'_>| {
            if ready() {
                parking.done();
                return Poll::Ready(());
            }
            parking.park(&mut self.waiters.lock(), cx.waker());
            if ready() {
                parking.done();
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
    }

    /// Wake one parked task.
    pub fn notify_one(&self) {
        let waker = {
            let mut waiters = self.waiters.lock();
            if waiters.is_empty() {
                None
            } else {
                Some(waiters.remove(0))
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Wake every parked task.
    pub fn notify_all(&self) {
        let waiters = std::mem::take(&mut *self.waiters.lock());
        wake_all(waiters);
    }

    /// Number of parked wakers.
    pub fn waiting(&self) -> usize {
        self.waiters.lock().len()
    }
}
