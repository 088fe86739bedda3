use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{SchedulerResult, TaskError};
use crate::scheduler::{Param, Value};

use super::engine::Engine;
use super::task::Task;

/// One caller's reference to a scheduled task.
///
/// Every future retained from the same live task observes the same
/// completion. Dropping a future does not give up its reference; call
/// [`SharedFuture::cancel`] when the result is no longer wanted.
pub struct SharedFuture<P: Param, V: Value> {
    engine: Arc<Engine<P, V>>,
    task: Arc<Task<P, V>>,
    released: AtomicBool,
}

impl<P: Param, V: Value> SharedFuture<P, V> {
    pub(crate) fn new(engine: Arc<Engine<P, V>>, task: Arc<Task<P, V>>) -> Self {
        Self {
            engine,
            task,
            released: AtomicBool::new(false),
        }
    }

    pub(crate) fn task(&self) -> &Arc<Task<P, V>> {
        &self.task
    }

    pub fn param(&self) -> &P {
        &self.task.param
    }

    /// Wait for the result. On a worker thread this executes other queued
    /// work while waiting. Called from inside a work function, it waits as a
    /// dependency of the task being executed, like [`WorkCallback::join`].
    ///
    /// [`WorkCallback::join`]: crate::WorkCallback::join
    pub fn join(&self) -> SchedulerResult<V> {
        self.engine.join(&self.task, None)
    }

    pub fn try_get(&self) -> Option<Result<V, TaskError>> {
        self.task.promise.try_get()
    }

    pub fn is_done(&self) -> bool {
        self.task.promise.is_done()
    }

    pub fn is_cancelled(&self) -> bool {
        self.task.promise.is_cancelled()
    }

    /// Give up this future's reference. The task is cancelled once nobody
    /// references it and it has not started; running tasks are never
    /// interrupted. Returns whether a reference was released.
    pub fn cancel(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.engine.release(&self.task)
    }

    /// Whether both futures refer to the same task generation.
    pub fn same_task(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.task, &other.task)
    }
}

impl<P: Param, V: Value> fmt::Debug for SharedFuture<P, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedFuture")
            .field("param", &self.task.param)
            .field("done", &self.is_done())
            .field("released", &self.released.load(Ordering::Relaxed))
            .finish()
    }
}
