//! Shared-future scheduler with approximate priority ordering.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::SchedulerResult;
use crate::metrics::SchedulerMetrics;
use crate::scheduler::{Param, Scheduler, Value, WorkFunction};
use crate::shared::{ParamComparator, Prioritized, SharedFuture, SharedFutureScheduler};
use crate::worker::WorkerGroupBuilder;

/// A [`SharedFutureScheduler`] whose queue is ordered by a comparator that
/// partitions the parameter space into buckets.
///
/// The comparator does not need to be a total order. Workers always take
/// from the least bucket; tasks tied within a bucket leave in insertion
/// order. A task for `a` may only wait on parameters `b` with
/// `comparator(a, b) == Greater`, and only parameters of one bucket may be
/// acquired into a single invocation. Breaking either rule fails fast with
/// [`crate::SchedulerError::IllegalState`].
pub struct ApproximatelyPrioritizedSharedFutureScheduler<P: Param, V: Value> {
    inner: SharedFutureScheduler<P, V>,
}

impl<P: Param, V: Value> ApproximatelyPrioritizedSharedFutureScheduler<P, V> {
    pub fn new(
        work: impl WorkFunction<P, V> + 'static,
        builder: WorkerGroupBuilder,
        comparator: impl Fn(&P, &P) -> Ordering + Send + Sync + 'static,
    ) -> SchedulerResult<Self> {
        let comparator: ParamComparator<P> = Arc::new(comparator);
        let inner = SharedFutureScheduler::with_policy(Box::new(Prioritized::<P, V>::new(comparator)), Box::new(work), builder)?;
        Ok(Self { inner })
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        self.inner.metrics()
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }
}

impl<P: Param, V: Value> Scheduler<P, V> for ApproximatelyPrioritizedSharedFutureScheduler<P, V> {
    fn schedule(&self, param: P) -> SharedFuture<P, V> {
        self.inner.schedule(param)
    }

    fn scatter_gather(&self, params: Vec<P>) -> SchedulerResult<Vec<V>> {
        self.inner.scatter_gather(params)
    }

    fn close(&self) -> SchedulerResult<()> {
        self.inner.close()
    }
}
