//! Lock-protected FIFO of runnable tasks with optional idle suspension.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::task::Task;

/// Upper bound on one idle sleep, so a missed notification only costs latency.
pub(crate) const IDLE_TIMEOUT: Duration = Duration::from_millis(5);

pub(crate) struct ReadyQueue {
    tasks: Mutex<VecDeque<Arc<Task>>>,
    available: Condvar,
    stopped: AtomicBool,
    suspend_on_idle: bool,
}

impl ReadyQueue {
    pub(crate) fn new(suspend_on_idle: bool) -> Self {
        Self {
            tasks: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            stopped: AtomicBool::new(false),
            suspend_on_idle,
        }
    }

    pub(crate) fn push(&self, task: Arc<Task>) {
        self.tasks.lock().push_back(task);
        if self.suspend_on_idle {
            self.available.notify_one();
        }
    }

    /// Pop the oldest task, idling while the queue is empty.
    pub(crate) fn pop(&self) -> Option<Arc<Task>> {
        loop {
            if self.stopped.load(Ordering::Acquire) {
                return None;
            }
            let mut tasks = self.tasks.lock();
            if let Some(task) = tasks.pop_front() {
                return Some(task);
            }
            if self.suspend_on_idle {
                if !self.stopped.load(Ordering::Acquire) {
                    self.available.wait_for(&mut tasks, IDLE_TIMEOUT);
                }
            } else {
                drop(tasks);
                thread::yield_now();
            }
        }
    }

    pub(crate) fn stop(&self) {
        let _tasks = self.tasks.lock();
        self.stopped.store(true, Ordering::Release);
        self.available.notify_all();
    }

    pub(crate) fn clear(&self) {
        let drained: Vec<_> = self.tasks.lock().drain(..).collect();
        drop(drained);
    }
}
