//! The scheduler contract and the work-function protocol.

use std::fmt::Debug;
use std::hash::Hash;

use crate::error::SchedulerResult;
use crate::shared::{SharedFuture, WorkCallback};

/// Requirements on a task parameter: a value-equal, hashable key.
pub trait Param: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> Param for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

/// Requirements on a task result. Values are cloned out to every joiner.
pub trait Value: Clone + Send + Sync + 'static {}

impl<T> Value for T where T: Clone + Send + Sync + 'static {}

/// Executes parameterized work with automatic deduplication.
///
/// At most one not-yet-completed task exists for equal parameters at any
/// time; every caller scheduling an equal parameter while that task is
/// pending shares its result.
pub trait Scheduler<P: Param, V: Value>: Send + Sync {
    /// Get a future for `param`, retaining the pending task for an equal
    /// parameter if there is one and creating a new task otherwise.
    ///
    /// The returned future holds a reference until [`SharedFuture::cancel`];
    /// dropping it leaves the task to run.
    #[must_use = "call `cancel` on the future to give up its reference"]
    fn schedule(&self, param: P) -> SharedFuture<P, V>;

    /// Schedule every parameter and wait for all of them, returning the
    /// results in input order.
    ///
    /// On the first failure the remaining tasks are released (not killed)
    /// before the error is returned.
    fn scatter_gather(&self, params: Vec<P>) -> SchedulerResult<Vec<V>>;

    /// Stop handing out work and block until every worker thread has exited.
    /// Executions already in flight run to completion.
    fn close(&self) -> SchedulerResult<()>;
}

/// How [`WorkCallback::acquire`] may obtain tasks for extra parameters.
///
/// This is a hint: the scheduler currently treats every strategy like
/// [`AcquisitionStrategy::TryStealExistingOrCreate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionStrategy {
    /// Only take over tasks that are queued but have not started.
    TryStealExisting,
    /// Also create tasks for parameters that have none.
    TryStealExistingOrCreate,
}

/// Caller-supplied computation run once per generation of a task.
///
/// Before returning `Ok`, the implementation must call
/// [`WorkCallback::complete`] for every parameter it owns: initially just
/// `param`, plus anything it took over through [`WorkCallback::acquire`].
pub trait WorkFunction<P: Param, V: Value>: Send + Sync {
    fn work(&self, param: &P, callback: &mut WorkCallback<'_, P, V>) -> SchedulerResult<()>;
}

/// Work function backed by a closure, see [`work_fn::from_fn`].
pub struct FnWork<F>(F);

impl<P, V, F> WorkFunction<P, V> for FnWork<F>
where
    P: Param,
    V: Value,
    F: Fn(&P, &mut WorkCallback<'_, P, V>) -> SchedulerResult<()> + Send + Sync,
{
    fn work(&self, param: &P, callback: &mut WorkCallback<'_, P, V>) -> SchedulerResult<()> {
        (self.0)(param, callback)
    }
}

/// Work function computing one value per parameter, see [`work_fn::single`].
pub struct SingleWork<F>(F);

impl<P, V, F> WorkFunction<P, V> for SingleWork<F>
where
    P: Param,
    V: Value,
    F: Fn(&P) -> anyhow::Result<V> + Send + Sync,
{
    fn work(&self, param: &P, callback: &mut WorkCallback<'_, P, V>) -> SchedulerResult<()> {
        let value = (self.0)(param)?;
        callback.complete(param, value)
    }
}

pub mod work_fn {
    use super::*;

    /// Wrap a closure that drives the callback protocol itself.
    pub fn from_fn<P, V, F>(f: F) -> FnWork<F>
    where
        P: Param,
        V: Value,
        F: Fn(&P, &mut WorkCallback<'_, P, V>) -> SchedulerResult<()> + Send + Sync,
    {
        FnWork(f)
    }

    /// Wrap a plain function of the parameter; its result completes the task.
    pub fn single<P, V, F>(f: F) -> SingleWork<F>
    where
        P: Param,
        V: Value,
        F: Fn(&P) -> anyhow::Result<V> + Send + Sync,
    {
        SingleWork(f)
    }
}
