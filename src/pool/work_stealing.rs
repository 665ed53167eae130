//! Per-worker deques with random-victim stealing.
//!
//! Each worker owns a FIFO deque installed in a thread-local on `enter`.
//! Tasks woken on a worker go to that worker's deque; tasks woken from any
//! other thread go to the shared injector. An idle worker first drains the
//! injector, then samples random peers to steal from.
//!
//! All workers meet at a barrier after installing their deque and again
//! before tearing it down, so no stealer ever observes a half-built or
//! half-destroyed pool.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use crossbeam::deque::{Injector, Steal, Stealer, Worker};
use parking_lot::{Condvar, Mutex};
use rand::Rng;

use super::ready_queue::IDLE_TIMEOUT;
use super::task::Task;
use super::Scheduler;

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(0);

struct LocalQueue {
    pool: usize,
    worker: Worker<Arc<Task>>,
}

thread_local! {
    static LOCAL: RefCell<Option<LocalQueue>> = const { RefCell::new(None) };
}

pub(crate) struct WorkStealing {
    id: usize,
    injector: Injector<Arc<Task>>,
    stealers: Vec<Stealer<Arc<Task>>>,
    /// Deques waiting to be picked up by their worker thread.
    unclaimed: Mutex<Vec<Option<Worker<Arc<Task>>>>>,
    barrier: Barrier,
    stopped: AtomicBool,
    suspend_on_idle: bool,
    idle: Mutex<()>,
    available: Condvar,
}

impl WorkStealing {
    pub(crate) fn new(threads: usize, suspend_on_idle: bool) -> Self {
        let workers: Vec<_> = (0..threads).map(|_| Worker::new_fifo()).collect();
        let stealers = workers.iter().map(Worker::stealer).collect();
        Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            injector: Injector::new(),
            stealers,
            unclaimed: Mutex::new(workers.into_iter().map(Some).collect()),
            barrier: Barrier::new(threads),
            stopped: AtomicBool::new(false),
            suspend_on_idle,
            idle: Mutex::new(()),
            available: Condvar::new(),
        }
    }

    fn find_task(&self, index: usize) -> Option<Arc<Task>> {
        LOCAL.with(|slot| {
            let slot = slot.borrow();
            let local = slot.as_ref().filter(|q| q.pool == self.id)?;
            if let Some(task) = local.worker.pop() {
                return Some(task);
            }
            loop {
                match self.injector.steal_batch_and_pop(&local.worker) {
                    Steal::Success(task) => return Some(task),
                    Steal::Retry => continue,
                    Steal::Empty => break,
                }
            }
            self.steal_from_peer(index)
        })
    }

    /// Sample up to `threads` random victims other than `index`.
    fn steal_from_peer(&self, index: usize) -> Option<Arc<Task>> {
        let peers = self.stealers.len();
        if peers < 2 {
            return None;
        }
        let mut rng = rand::thread_rng();
        for _ in 0..peers {
            let mut victim = rng.gen_range(0..peers - 1);
            if victim >= index {
                victim += 1;
            }
            if let Steal::Success(task) = self.stealers[victim].steal() {
                log::trace!("worker {index} stole from worker {victim}");
                return Some(task);
            }
        }
        None
    }

    fn wait_for_work(&self) {
        if self.suspend_on_idle {
            let mut guard = self.idle.lock();
            if !self.stopped.load(Ordering::Acquire) && self.injector.is_empty() {
                self.available.wait_for(&mut guard, IDLE_TIMEOUT);
            }
        } else {
            thread::yield_now();
        }
    }
}

impl Scheduler for WorkStealing {
    fn threads(&self) -> usize {
        self.stealers.len()
    }

    fn schedule(&self, task: Arc<Task>) {
        let overflow = LOCAL.with(|slot| match slot.borrow().as_ref() {
            Some(local) if local.pool == self.id => {
                local.worker.push(task);
                None
            }
            _ => Some(task),
        });
        if let Some(task) = overflow {
            self.injector.push(task);
        }
        if self.suspend_on_idle {
            let _guard = self.idle.lock();
            self.available.notify_one();
        }
    }

    fn enter(&self, worker: usize) {
        let queue = self.unclaimed.lock()[worker].take();
        match queue {
            Some(queue) => LOCAL.with(|slot| {
                *slot.borrow_mut() = Some(LocalQueue {
                    pool: self.id,
                    worker: queue,
                })
            }),
            None => log::error!("worker {worker} has no deque to claim"),
        }
        self.barrier.wait();
    }

    fn next(&self, worker: usize) -> Option<Arc<Task>> {
        loop {
            if self.stopped.load(Ordering::Acquire) {
                return None;
            }
            if let Some(task) = self.find_task(worker) {
                return Some(task);
            }
            self.wait_for_work();
        }
    }

    fn leave(&self, _worker: usize) {
        self.barrier.wait();
        let local = LOCAL.with(|slot| slot.borrow_mut().take());
        drop(local);
    }

    fn stop(&self) {
        let _guard = self.idle.lock();
        self.stopped.store(true, Ordering::Release);
        self.available.notify_all();
    }

    fn clear(&self) {
        loop {
            match self.injector.steal() {
                Steal::Success(task) => drop(task),
                Steal::Retry => continue,
                Steal::Empty => break,
            }
        }
    }
}
