//! N workers pulling from one global queue.

use std::sync::Arc;

use super::ready_queue::ReadyQueue;
use super::task::Task;
use super::Scheduler;

pub(crate) struct SharedWork {
    threads: usize,
    queue: ReadyQueue,
}

impl SharedWork {
    pub(crate) fn new(threads: usize, suspend_on_idle: bool) -> Self {
        Self {
            threads,
            queue: ReadyQueue::new(suspend_on_idle),
        }
    }
}

impl Scheduler for SharedWork {
    fn threads(&self) -> usize {
        self.threads
    }

    fn schedule(&self, task: Arc<Task>) {
        self.queue.push(task);
    }

    fn next(&self, _worker: usize) -> Option<Arc<Task>> {
        self.queue.pop()
    }

    fn stop(&self) {
        self.queue.stop();
    }

    fn clear(&self) {
        self.queue.clear();
    }
}
