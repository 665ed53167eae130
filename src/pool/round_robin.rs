//! Single worker, strict FIFO.

use std::sync::Arc;

use super::ready_queue::ReadyQueue;
use super::task::Task;
use super::Scheduler;

/// Runs every task on one worker in the order they became ready.
pub(crate) struct RoundRobin {
    queue: ReadyQueue,
}

impl RoundRobin {
    pub(crate) fn new(suspend_on_idle: bool) -> Self {
        Self {
            queue: ReadyQueue::new(suspend_on_idle),
        }
    }
}

impl Scheduler for RoundRobin {
    fn threads(&self) -> usize {
        1
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
