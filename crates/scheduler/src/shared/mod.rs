//! Deduplicating scheduler handing out shared futures.
//!
//! [`SharedFutureScheduler`] keeps at most one pending task per parameter.
//! Callers scheduling an equal parameter share that task's future, tasks
//! whose every retainer cancelled are never run, and a parameter scheduled
//! again while its task is executing is run once more after it finishes.
//!
//! Work functions may recursively schedule and wait on other parameters
//! through their [`WorkCallback`]. A worker thread that waits executes other
//! queued work instead of blocking, so deep recursion cannot exhaust a
//! bounded worker group.

mod callback;
mod engine;
mod future;
mod policy;
mod task;


use std::sync::Arc;

use tracing::warn;

use crate::error::SchedulerResult;
use crate::metrics::SchedulerMetrics;
use crate::scheduler::{Param, Scheduler, Value, WorkFunction};
use crate::worker::WorkerGroupBuilder;

pub use callback::WorkCallback;
pub use future::SharedFuture;

pub(crate) use policy::{ParamComparator, Prioritized};

use engine::Engine;
use policy::{SchedulingPolicy, Unordered};

pub struct SharedFutureScheduler<P: Param, V: Value> {
    engine: Arc<Engine<P, V>>,
}

impl<P: Param, V: Value> SharedFutureScheduler<P, V> {
    /// Start a scheduler running `work` on a freshly built worker group.
    pub fn new(work: impl WorkFunction<P, V> + 'static, builder: WorkerGroupBuilder) -> SchedulerResult<Self> {
        Self::with_policy(Box::new(Unordered::<P, V>::new()), Box::new(work), builder)
    }

    pub(crate) fn with_policy(
        policy: Box<dyn SchedulingPolicy<P, V>>,
        work: Box<dyn WorkFunction<P, V>>,
        builder: WorkerGroupBuilder,
    ) -> SchedulerResult<Self> {
        Ok(Self {
            engine: Engine::start(policy, work, builder)?,
        })
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        self.engine.metrics()
    }

    pub fn is_running(&self) -> bool {
        self.engine.is_running()
    }
}

impl<P: Param, V: Value> Scheduler<P, V> for SharedFutureScheduler<P, V> {
    fn schedule(&self, param: P) -> SharedFuture<P, V> {
        SharedFuture::new(Arc::clone(&self.engine), self.engine.retain(param))
    }

    fn scatter_gather(&self, params: Vec<P>) -> SchedulerResult<Vec<V>> {
        self.engine.scatter_gather(params, None)
    }

    fn close(&self) -> SchedulerResult<()> {
        self.engine.shutdown()
    }
}

impl<P: Param, V: Value> Drop for SharedFutureScheduler<P, V> {
    fn drop(&mut self) {
        if self.engine.is_running() {
            if let Err(err) = self.engine.shutdown() {
                warn!(error = %err, "scheduler dropped without a clean shutdown");
            }
        }
    }
}
