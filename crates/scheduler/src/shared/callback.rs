use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{SchedulerError, SchedulerResult};
use crate::scheduler::{AcquisitionStrategy, Param, Value};

use super::engine::Engine;
use super::future::SharedFuture;
use super::task::Task;

/// A task owned by one work-function invocation, with its result once known.
pub(crate) struct Owned<P, V> {
    pub task: Arc<Task<P, V>>,
    pub value: Option<V>,
}

/// Handle given to a work function for the duration of one invocation.
///
/// It carries the task being executed, so anything scheduled or awaited
/// through it counts as recursion from that task.
pub struct WorkCallback<'a, P: Param, V: Value> {
    engine: &'a Arc<Engine<P, V>>,
    task: &'a Arc<Task<P, V>>,
    owned: Vec<Owned<P, V>>,
}

impl<'a, P: Param, V: Value> WorkCallback<'a, P, V> {
    pub(crate) fn new(engine: &'a Arc<Engine<P, V>>, task: &'a Arc<Task<P, V>>) -> Self {
        Self {
            engine,
            task,
            owned: vec![Owned { task: Arc::clone(task), value: None }],
        }
    }

    /// Parameter of the task this invocation was started for.
    pub fn param(&self) -> &P {
        &self.task.param
    }

    /// Every parameter this invocation must complete, in acquisition order.
    pub fn owned(&self) -> impl Iterator<Item = &P> + '_ {
        self.owned.iter().map(|o| &o.task.param)
    }

    pub fn is_completed(&self, param: &P) -> bool {
        self.owned
            .iter()
            .any(|o| o.task.param == *param && o.value.is_some())
    }

    /// Record the result for an owned parameter.
    pub fn complete(&mut self, param: &P, value: V) -> SchedulerResult<()> {
        let Some(owned) = self.owned.iter_mut().find(|o| o.task.param == *param) else {
            return Err(SchedulerError::illegal_state(format!(
                "cannot complete {:?}: not owned by the invocation for {:?}",
                param, self.task.param
            )));
        };
        if owned.value.is_some() {
            return Err(SchedulerError::illegal_state(format!("{:?} was already completed", param)));
        }
        owned.value = Some(value);
        Ok(())
    }

    /// Try to take over the tasks for `params` so this invocation computes
    /// them too. Returns the parameters actually acquired; each of them must
    /// be completed like the invocation's own parameter.
    ///
    /// Every strategy currently behaves like
    /// [`AcquisitionStrategy::TryStealExistingOrCreate`].
    pub fn acquire(&mut self, params: Vec<P>, _strategy: AcquisitionStrategy) -> SchedulerResult<Vec<P>> {
        let mut seen: HashSet<&P> = self.owned.iter().map(|o| &o.task.param).collect();
        for param in &params {
            if !seen.insert(param) {
                return Err(SchedulerError::illegal_state(format!(
                    "{:?} is already owned by the invocation for {:?}",
                    param, self.task.param
                )));
            }
        }

        let batch: Vec<&P> = self.owned().chain(params.iter()).collect();
        if !self.engine.can_execute_in_batch(&batch) {
            return Err(SchedulerError::illegal_state(format!(
                "{:?} cannot be executed in one batch",
                batch
            )));
        }

        let mut acquired = Vec::with_capacity(params.len());
        for param in params {
            if let Some(task) = self.engine.try_acquire(&param) {
                self.owned.push(Owned { task, value: None });
                acquired.push(param);
            }
        }
        Ok(acquired)
    }

    /// Schedule and wait for `params` as dependencies of the current task.
    pub fn scatter_gather(&self, params: Vec<P>) -> SchedulerResult<Vec<V>> {
        self.engine.scatter_gather(params, Some(self.task))
    }

    #[must_use = "call `cancel` on the future to give up its reference"]
    pub fn schedule(&self, param: P) -> SharedFuture<P, V> {
        SharedFuture::new(Arc::clone(self.engine), self.engine.retain(param))
    }

    /// Wait for `future` as a dependency of the current task.
    pub fn join(&self, future: &SharedFuture<P, V>) -> SchedulerResult<V> {
        self.engine.join(future.task(), Some(self.task))
    }

    /// False once the scheduler is closing; long computations may stop early.
    pub fn is_running(&self) -> bool {
        self.engine.is_running()
    }

    pub(crate) fn into_owned(self) -> Vec<Owned<P, V>> {
        self.owned
    }
}
