//! Cooperative task pool.
//!
//! Tile programs, DMA movers and routing movers are all `async` tasks. They
//! run on a bounded set of worker threads and give the thread back whenever
//! they would otherwise block (full queue, held lock, barrier spin). This is
//! what lets a grid of hundreds of tiles run on a handful of OS threads.
//!
//! # Policies
//!
//! | Policy         | Workers | Ready queue                               |
//! |----------------|---------|-------------------------------------------|
//! | `RoundRobin`   | 1       | FIFO, no migration                        |
//! | `SharedWork`   | N       | one global FIFO shared by all workers     |
//! | `WorkStealing` | N       | per-worker deques, idle workers steal     |
//!
//! With `suspend_on_idle` an idle worker sleeps on a condition variable
//! instead of spinning.
//!
//! ```text
//!   submit() ──► Task ──► Scheduler::schedule ──► worker ──► poll
//!                  ▲                                          │
//!                  └──────────── waker (Pending) ◄────────────┘
//! ```

mod ready_queue;
mod round_robin;
mod shared_work;
mod task;
mod work_stealing;

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread;

use futures::channel::oneshot;
use futures::FutureExt;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use round_robin::RoundRobin;
use shared_work::SharedWork;
pub use task::TaskHandle;
use task::Task;
use work_stealing::WorkStealing;

/// Scheduling policy for the worker threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulerPolicy {
    /// One worker, tasks run in submission/wake order.
    RoundRobin,
    /// N workers pulling from one global queue.
    SharedWork,
    /// N workers with private deques and random-victim stealing.
    #[default]
    WorkStealing,
}

impl fmt::Display for SchedulerPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerPolicy::RoundRobin => write!(f, "round-robin"),
            SchedulerPolicy::SharedWork => write!(f, "shared-work"),
            SchedulerPolicy::WorkStealing => write!(f, "work-stealing"),
        }
    }
}

impl FromStr for SchedulerPolicy {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "round-robin" | "rr" => Ok(SchedulerPolicy::RoundRobin),
            "shared-work" | "shared" => Ok(SchedulerPolicy::SharedWork),
            "work-stealing" | "stealing" => Ok(SchedulerPolicy::WorkStealing),
            _ => Err(PoolError::UnknownPolicy(s.to_string())),
        }
    }
}

/// Task pool construction parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub policy: SchedulerPolicy,
    /// Worker count. Ignored by `RoundRobin`, which always uses one.
    pub threads: usize,
    /// Sleep on a condition variable when there is nothing to run.
    pub suspend_on_idle: bool,
}

impl PoolConfig {
    pub fn new(policy: SchedulerPolicy, threads: usize) -> Self {
        Self {
            policy,
            threads,
            suspend_on_idle: true,
        }
    }

    pub fn with_suspend(mut self, suspend_on_idle: bool) -> Self {
        self.suspend_on_idle = suspend_on_idle;
        self
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        let threads = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self::new(SchedulerPolicy::default(), threads)
    }
}

/// Pool-level failures.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("task pool is closed to new work")]
    Closed,
    #[error("task pool needs at least one worker thread")]
    NoWorkers,
    #[error("unknown scheduler policy '{0}' (expected round-robin, shared-work or work-stealing)")]
    UnknownPolicy(String),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// How a submitted task ended, when it did not produce a value.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("task panicked: {0}")]
    Panicked(String),
    #[error("task was dropped before completing")]
    Cancelled,
}

/// Policy-specific ready-queue management.
pub(crate) trait Scheduler: Send + Sync {
    /// Number of worker threads this scheduler drives.
    fn threads(&self) -> usize;

    /// Make `task` runnable.
    fn schedule(&self, task: Arc<Task>);

    /// Called on the worker thread before its first `next`.
    fn enter(&self, _worker: usize) {}

    /// Next task for `worker`, idling as needed. `None` means stop.
    fn next(&self, worker: usize) -> Option<Arc<Task>>;

    /// Called on the worker thread after `next` returned `None`.
    fn leave(&self, _worker: usize) {}

    /// Make every `next` return `None` and wake idle workers.
    fn stop(&self);

    /// Drop any task still queued.
    fn clear(&self);
}

struct Tally {
    pending: usize,
    closed: bool,
    terminated: bool,
}

/// State shared between the pool handle and its tasks.
pub(crate) struct PoolShared {
    scheduler: Arc<dyn Scheduler>,
    tally: Mutex<Tally>,
    drained: Condvar,
}

impl PoolShared {
    fn task_done(&self) {
        let mut tally = self.tally.lock();
        tally.pending -= 1;
        if tally.pending == 0 {
            self.drained.notify_all();
        }
    }
}

/// A bounded set of worker threads running cooperative tasks.
pub struct TaskPool {
    config: PoolConfig,
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl TaskPool {
    /// Start the worker threads.
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        if config.threads == 0 {
            return Err(PoolError::NoWorkers);
        }

        let scheduler: Arc<dyn Scheduler> = match config.policy {
            SchedulerPolicy::RoundRobin => {
                if config.threads > 1 {
                    log::debug!(
                        "round-robin scheduling uses one worker, ignoring {} requested",
                        config.threads
                    );
                }
                Arc::new(RoundRobin::new(config.suspend_on_idle))
            }
            SchedulerPolicy::SharedWork => {
                Arc::new(SharedWork::new(config.threads, config.suspend_on_idle))
            }
            SchedulerPolicy::WorkStealing => {
                Arc::new(WorkStealing::new(config.threads, config.suspend_on_idle))
            }
        };

        let shared = Arc::new(PoolShared {
            scheduler: scheduler.clone(),
            tally: Mutex::new(Tally {
                pending: 0,
                closed: false,
                terminated: false,
            }),
            drained: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(scheduler.threads());
        for index in 0..scheduler.threads() {
            let scheduler = scheduler.clone();
            let handle = thread::Builder::new()
                .name(format!("tilesim-worker-{index}"))
                .spawn(move || worker_loop(scheduler, index))?;
            workers.push(handle);
        }

        log::debug!(
            "task pool started: {} with {} worker(s), suspend_on_idle={}",
            config.policy,
            workers.len(),
            config.suspend_on_idle
        );

        Ok(Self {
            config,
            shared,
            workers: Mutex::new(workers),
        })
    }

    #[inline]
    pub fn policy(&self) -> SchedulerPolicy {
        self.config.policy
    }

    /// Number of worker threads actually running.
    #[inline]
    pub fn threads(&self) -> usize {
        self.shared.scheduler.threads()
    }

    /// Tasks submitted and not yet finished.
    pub fn pending(&self) -> usize {
        self.shared.tally.lock().pending
    }

    /// Submit a callable producing the task's future.
    ///
    /// The returned handle resolves with the future's output, or with
    /// `TaskError::Panicked` if the task panicked.
    pub fn submit<F, Fut, T>(&self, work: F) -> Result<TaskHandle<T>, PoolError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        {
            let mut tally = self.shared.tally.lock();
            if tally.closed {
                return Err(PoolError::Closed);
            }
            tally.pending += 1;
        }

        let (sender, receiver) = oneshot::channel();
        let finished = Arc::new(AtomicBool::new(false));
        let done = finished.clone();

        let body = async move {
            let outcome = AssertUnwindSafe(async move { work().await })
                .catch_unwind()
                .await
                .map_err(|payload| TaskError::Panicked(panic_message(payload.as_ref())));
            if let Err(TaskError::Panicked(msg)) = &outcome {
                log::error!("task panicked: {msg}");
            }
            done.store(true, Ordering::Release);
            let _ = sender.send(outcome);
        };

        let task = Task::new(body.boxed(), Arc::downgrade(&self.shared));
        self.shared.scheduler.schedule(task);

        Ok(TaskHandle::new(receiver, finished))
    }

    /// Stop accepting new work. Already submitted tasks keep running.
    pub fn close(&self) {
        self.shared.tally.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.shared.tally.lock().closed
    }

    /// Close, wait for every submitted task to finish, then stop and join
    /// the workers. Must not be called from a worker thread.
    pub fn join(&self) {
        self.close();
        {
            let mut tally = self.shared.tally.lock();
            while tally.pending > 0 && !tally.terminated {
                self.shared.drained.wait(&mut tally);
            }
        }
        self.stop_workers();
    }

    /// Stop the workers without waiting for outstanding tasks. Tasks that
    /// never finished are dropped.
    pub fn terminate(&self) {
        let pending = {
            let mut tally = self.shared.tally.lock();
            tally.closed = true;
            tally.terminated = true;
            tally.pending
        };
        self.shared.drained.notify_all();
        if pending > 0 {
            log::warn!("terminating task pool with {pending} unfinished task(s)");
        }
        self.stop_workers();
        self.shared.scheduler.clear();
    }

    fn stop_workers(&self) {
        let workers = std::mem::take(&mut *self.workers.lock());
        if workers.is_empty() {
            return;
        }
        self.shared.scheduler.stop();
        for worker in workers {
            if worker.join().is_err() {
                log::error!("task pool worker exited by panic");
            }
        }
        log::debug!("task pool stopped");
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.join();
    }
}

impl fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskPool")
            .field("config", &self.config)
            .field("pending", &self.pending())
            .finish()
    }
}

fn worker_loop(scheduler: Arc<dyn Scheduler>, index: usize) {
    log::trace!("worker {index} started");
    scheduler.enter(index);
    while let Some(task) = scheduler.next(index) {
        task.run();
    }
    scheduler.leave(index);
    log::trace!("worker {index} stopped");
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Give the worker thread back to the scheduler once.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Future returned by [`yield_now`].
#[derive(Debug)]
#[must_use = "futures do nothing unless awaited"]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::Channel;
    use std::sync::atomic::AtomicUsize;

    const POLICIES: [SchedulerPolicy; 3] = [
        SchedulerPolicy::RoundRobin,
        SchedulerPolicy::SharedWork,
        SchedulerPolicy::WorkStealing,
    ];

    fn pools() -> Vec<TaskPool> {
        let mut pools = Vec::new();
        for policy in POLICIES {
            for suspend in [false, true] {
                let config = PoolConfig::new(policy, 3).with_suspend(suspend);
                pools.push(TaskPool::new(config).unwrap());
            }
        }
        pools
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("round-robin".parse::<SchedulerPolicy>().unwrap(), SchedulerPolicy::RoundRobin);
        assert_eq!("shared_work".parse::<SchedulerPolicy>().unwrap(), SchedulerPolicy::SharedWork);
        assert_eq!("Work-Stealing".parse::<SchedulerPolicy>().unwrap(), SchedulerPolicy::WorkStealing);
        assert!("fifo".parse::<SchedulerPolicy>().is_err());
        assert_eq!(SchedulerPolicy::SharedWork.to_string(), "shared-work");
    }

    #[test]
    fn test_zero_threads_rejected() {
        let err = TaskPool::new(PoolConfig::new(SchedulerPolicy::SharedWork, 0)).unwrap_err();
        assert!(matches!(err, PoolError::NoWorkers));
    }

    #[test]
    fn test_round_robin_single_worker() {
        let pool = TaskPool::new(PoolConfig::new(SchedulerPolicy::RoundRobin, 8)).unwrap();
        assert_eq!(pool.threads(), 1);
    }

    #[test]
    fn test_submit_returns_value() {
        for pool in pools() {
            let handle = pool.submit(|| async { 6 * 7 }).unwrap();
            assert_eq!(handle.wait(), Ok(42));
        }
    }

    #[test]
    fn test_every_task_runs_exactly_once() {
        for pool in pools() {
            let counter = Arc::new(AtomicUsize::new(0));
            let handles: Vec<_> = (0..200)
                .map(|_| {
                    let counter = counter.clone();
                    pool.submit(move || async move {
                        yield_now().await;
                        counter.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap()
                })
                .collect();
            for handle in handles {
                handle.wait().unwrap();
            }
            assert_eq!(counter.load(Ordering::SeqCst), 200);
        }
    }

    #[test]
    fn test_join_drains_pending_tasks() {
        for pool in pools() {
            let counter = Arc::new(AtomicUsize::new(0));
            for _ in 0..50 {
                let counter = counter.clone();
                pool.submit(move || async move {
                    for _ in 0..3 {
                        yield_now().await;
                    }
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            }
            pool.join();
            assert_eq!(counter.load(Ordering::SeqCst), 50);
            assert_eq!(pool.pending(), 0);
        }
    }

    #[test]
    fn test_submit_after_close_fails() {
        let pool = TaskPool::new(PoolConfig::new(SchedulerPolicy::SharedWork, 2)).unwrap();
        pool.close();
        assert!(matches!(pool.submit(|| async {}), Err(PoolError::Closed)));
    }

    #[test]
    fn test_panic_is_reported_on_handle() {
        for pool in pools() {
            let handle = pool
                .submit(|| async {
                    panic!("tile exploded");
                })
                .unwrap();
            let err: Result<(), _> = handle.wait();
            assert_eq!(err, Err(TaskError::Panicked("tile exploded".to_string())));
        }
    }

    #[test]
    fn test_producer_consumer_single_worker() {
        // A blocked consumer must not starve the producer on one thread.
        let pool = TaskPool::new(PoolConfig::new(SchedulerPolicy::RoundRobin, 1)).unwrap();
        let chan = Arc::new(Channel::new(2));

        let consumer = {
            let chan = chan.clone();
            pool.submit(move || async move {
                let mut sum = 0u32;
                for _ in 0..100 {
                    sum += chan.pop().await.unwrap();
                }
                sum
            })
            .unwrap()
        };
        let producer = {
            let chan = chan.clone();
            pool.submit(move || async move {
                for v in 0..100u32 {
                    chan.push(v).await.unwrap();
                }
            })
            .unwrap()
        };

        producer.wait().unwrap();
        assert_eq!(consumer.wait(), Ok((0..100).sum()));
    }

    #[test]
    fn test_tasks_submit_tasks() {
        for pool in pools() {
            let pool = Arc::new(pool);
            let inner_pool = pool.clone();
            let outer = pool
                .submit(move || async move {
                    let inner = inner_pool.submit(|| async { 5 }).unwrap();
                    inner.await.unwrap() + 1
                })
                .unwrap();
            assert_eq!(outer.wait(), Ok(6));
            pool.join();
        }
    }

    #[test]
    fn test_is_finished() {
        let pool = TaskPool::new(PoolConfig::new(SchedulerPolicy::SharedWork, 1)).unwrap();
        let gate = Arc::new(Channel::new(1));
        let handle = {
            let gate = gate.clone();
            pool.submit(move || async move { gate.pop().await }).unwrap()
        };
        assert!(!handle.is_finished());
        gate.try_push(1u8).unwrap();
        while !handle.is_finished() {
            thread::yield_now();
        }
        assert_eq!(handle.wait(), Ok(Some(1)));
    }
}
