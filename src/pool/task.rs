//! Scheduled unit of work and the handle returned to the submitter.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures::channel::oneshot;
use futures::future::BoxFuture;
use futures::task::{waker_ref, ArcWake};
use parking_lot::Mutex;

use super::{PoolShared, TaskError};

/// A spawned future plus its scheduling state.
pub(crate) struct Task {
    future: Mutex<Option<BoxFuture<'static, ()>>>,
    /// Set while the task sits in a ready queue.
    queued: AtomicBool,
    pool: Weak<PoolShared>,
}

impl Task {
    pub(crate) fn new(future: BoxFuture<'static, ()>, pool: Weak<PoolShared>) -> Arc<Self> {
        Arc::new(Self {
            future: Mutex::new(Some(future)),
            queued: AtomicBool::new(true),
            pool,
        })
    }

    /// Poll the task once on the current worker.
    pub(crate) fn run(self: &Arc<Self>) {
        self.queued.store(false, Ordering::Release);

        let mut slot = self.future.lock();
        let Some(future) = slot.as_mut() else {
            return;
        };

        let waker = waker_ref(self);
        let mut cx = Context::from_waker(&waker);
        if future.as_mut().poll(&mut cx).is_ready() {
            *slot = None;
            drop(slot);
            if let Some(pool) = self.pool.upgrade() {
                pool.task_done();
            }
        }
    }
}

impl ArcWake for Task {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        if arc_self.queued.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(pool) = arc_self.pool.upgrade() {
            pool.scheduler.schedule(arc_self.clone());
        }
    }
}

/// Completion handle for a submitted task.
///
/// Awaiting it yields the task's output. OS threads outside the pool use
/// [`TaskHandle::wait`].
#[must_use = "dropping a TaskHandle detaches the task"]
pub struct TaskHandle<T> {
    receiver: oneshot::Receiver<Result<T, TaskError>>,
    finished: Arc<AtomicBool>,
}

impl<T> TaskHandle<T> {
    pub(crate) fn new(
        receiver: oneshot::Receiver<Result<T, TaskError>>,
        finished: Arc<AtomicBool>,
    ) -> Self {
        Self { receiver, finished }
    }

    /// True once the task body has returned or panicked.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Block the calling thread until the task resolves.
    pub fn wait(self) -> Result<T, TaskError> {
        futures::executor::block_on(self)
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.get_mut().receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(TaskError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("finished", &self.is_finished())
            .finish()
    }
}
