//! The shared-future task engine.
//!
//! Every lifecycle change of a task is one atomic `compute` over its entry in
//! the task map. The compute closure may run more than once, so it only
//! builds the replacement slot; queueing, cancellation and dependency
//! releases happen after the map operation has been applied.

use std::hash::BuildHasherDefault;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use ahash::AHasher;
use papaya::{Compute, Operation};
use tracing::{debug, error, trace};

use crate::error::{panic_message, SchedulerError, SchedulerResult, TaskError};
use crate::metrics::{Counters, SchedulerMetrics};
use crate::scheduler::{Param, Value, WorkFunction};
use crate::worker::{LoopSettings, WorkerGroup, WorkerGroupBuilder};

use super::callback::{Owned, WorkCallback};
use super::policy::SchedulingPolicy;
use super::task::{Refs, Slot, Task};

type TaskMap<P, V> = papaya::HashMap<P, Slot<P, V>, BuildHasherDefault<AHasher>>;
type ExecutingMap<P, V> = papaya::HashMap<ThreadId, Arc<Task<P, V>>, BuildHasherDefault<AHasher>>;

pub(crate) struct Engine<P: Param, V: Value> {
    tasks: TaskMap<P, V>,
    /// Innermost task each thread is running the work function for.
    executing: ExecutingMap<P, V>,
    policy: Box<dyn SchedulingPolicy<P, V>>,
    work: Box<dyn WorkFunction<P, V>>,
    group: WorkerGroup,
    settings: LoopSettings,
    running: AtomicBool,
    pub(crate) counters: Counters,
}

impl<P: Param, V: Value> Engine<P, V> {
    /// Build the worker group and start one worker loop per thread.
    pub fn start(
        policy: Box<dyn SchedulingPolicy<P, V>>,
        work: Box<dyn WorkFunction<P, V>>,
        builder: WorkerGroupBuilder,
    ) -> SchedulerResult<Arc<Self>> {
        let engine = Self::build(policy, work, builder)?;
        let worker = Arc::clone(&engine);
        engine.group.launch(Arc::new(move || worker.run_worker()));
        Ok(engine)
    }

    /// Build without starting any worker loop.
    pub(crate) fn build(
        policy: Box<dyn SchedulingPolicy<P, V>>,
        work: Box<dyn WorkFunction<P, V>>,
        builder: WorkerGroupBuilder,
    ) -> SchedulerResult<Arc<Self>> {
        let group = builder.build()?;
        Ok(Arc::new(Self {
            tasks: TaskMap::with_hasher(BuildHasherDefault::default()),
            executing: ExecutingMap::with_hasher(BuildHasherDefault::default()),
            policy,
            work,
            settings: group.settings,
            group,
            running: AtomicBool::new(true),
            counters: Counters::default(),
        }))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        self.counters.snapshot(self.policy.queue_len())
    }

    fn note(&self, param: &P, transition: &'static str) {
        if self.settings.trace_transitions {
            trace!(param = ?param, transition, "task transition");
        }
    }

    pub(crate) fn report(&self, err: &SchedulerError) {
        Counters::bump(&self.counters.reported);
        self.group.handle(err);
    }

    // ── Transitions ──────────────────────────────────────────────────

    /// Take a reference to the live task for `param`, creating one if needed.
    pub fn retain(&self, param: P) -> Arc<Task<P, V>> {
        let map = self.tasks.pin();
        let result = map.compute(param.clone(), |entry| {
            let slot = match entry {
                None => Slot::queued(Task::new(param.clone())),
                Some((_, slot)) => match slot.refs {
                    Refs::Retained(n) => slot.with_refs(Refs::Retained(n + 1)),
                    // may not run alongside the executing generation
                    Refs::Executing => Slot {
                        task: Task::new(param.clone()),
                        refs: Refs::Retained(1),
                        previous: Some(Arc::clone(&slot.task)),
                    },
                },
            };
            Operation::<_, ()>::Insert(slot)
        });

        let task = match result {
            Compute::Inserted(_, slot) => {
                self.note(&param, "created");
                Counters::bump(&self.counters.created);
                let task = Arc::clone(&slot.task);
                self.policy.enqueue(Arc::clone(&task));
                task
            }
            Compute::Updated { old: (_, old), new: (_, new) } => {
                if new.holds(&old.task) {
                    self.note(&param, "retained");
                    Counters::bump(&self.counters.retained);
                } else {
                    self.note(&param, "resubmitted");
                    Counters::bump(&self.counters.created);
                    Counters::bump(&self.counters.resubmitted);
                }
                Arc::clone(&new.task)
            }
            Compute::Removed(..) | Compute::Aborted(()) => unreachable!("retain always inserts"),
        };
        drop(map);

        if !self.is_running() {
            self.force_cancel(&param);
        }
        task
    }

    /// Drop one reference to `expected`. Returns false if the map has moved
    /// on to another task for the parameter.
    pub fn release(&self, expected: &Arc<Task<P, V>>) -> bool {
        let map = self.tasks.pin();
        let result = map.compute(expected.param.clone(), |entry| match entry {
            Some((_, slot)) if slot.holds(expected) => match slot.refs {
                Refs::Retained(n) if n > 1 => Operation::Insert(slot.with_refs(Refs::Retained(n - 1))),
                Refs::Retained(_) => match &slot.previous {
                    Some(previous) => Operation::Insert(Slot::executing(Arc::clone(previous))),
                    None => Operation::Remove,
                },
                // too late to cancel
                Refs::Executing => Operation::Abort(true),
            },
            _ => Operation::Abort(false),
        });

        let discarded = match result {
            Compute::Removed(_, old) => Some(Arc::clone(&old.task)),
            Compute::Updated { old: (_, old), new: (_, new) } if !new.holds(&old.task) => Some(Arc::clone(&old.task)),
            Compute::Updated { .. } => {
                self.note(&expected.param, "partially released");
                None
            }
            Compute::Inserted(..) => None,
            Compute::Aborted(matched) => {
                if !matched {
                    self.note(&expected.param, "release of stale task ignored");
                }
                return matched;
            }
        };
        drop(map);

        if let Some(task) = discarded {
            self.note(&task.param, "released");
            self.discard(&task);
        }
        true
    }

    /// Claim `expected` for execution. Fails if it is not the live task for
    /// its parameter, is already executing, or must wait for a predecessor.
    pub fn begin(&self, expected: &Arc<Task<P, V>>) -> bool {
        let map = self.tasks.pin();
        let result = map.compute(expected.param.clone(), |entry| match entry {
            Some((_, slot)) if slot.holds(expected) && slot.previous.is_none() => match slot.refs {
                Refs::Retained(_) => Operation::Insert(slot.with_refs(Refs::Executing)),
                Refs::Executing => Operation::Abort(()),
            },
            _ => Operation::Abort(()),
        });
        let began = matches!(result, Compute::Updated { .. });
        drop(map);

        if began {
            self.note(&expected.param, "began");
            self.policy.unqueue(expected);
        } else {
            self.note(&expected.param, "begin lost");
        }
        began
    }

    /// Retire a finished task, handing the parameter over to its successor
    /// if one was submitted while it ran.
    pub fn delete(&self, expected: &Arc<Task<P, V>>) {
        let map = self.tasks.pin();
        let result = map.compute(expected.param.clone(), |entry| match entry {
            Some((_, slot)) if slot.holds(expected) => Operation::Remove,
            Some((_, slot)) if slot.follows(expected) => Operation::Insert(Slot {
                task: Arc::clone(&slot.task),
                refs: slot.refs,
                previous: None,
            }),
            _ => Operation::Abort(()),
        });

        let successor = match result {
            Compute::Removed(..) => {
                self.note(&expected.param, "deleted");
                None
            }
            Compute::Updated { new: (_, new), .. } => Some(Arc::clone(&new.task)),
            Compute::Inserted(..) => None,
            Compute::Aborted(()) => {
                error!(param = ?expected.param, "finished task is neither live nor superseded");
                None
            }
        };
        drop(map);

        if let Some(successor) = successor {
            self.note(&expected.param, "successor enqueued");
            self.policy.enqueue(successor);
            if !self.is_running() {
                self.force_cancel(&expected.param);
            }
        }
    }

    /// Take over the task for `param` on behalf of a running invocation:
    /// steal it if queued and not yet begun, create it if absent.
    pub fn try_acquire(&self, param: &P) -> Option<Arc<Task<P, V>>> {
        let map = self.tasks.pin();
        let result = map.compute(param.clone(), |entry| match entry {
            None => Operation::Insert(Slot::executing(Task::new(param.clone()))),
            Some((_, slot)) if slot.previous.is_none() && slot.refs != Refs::Executing => {
                Operation::Insert(slot.with_refs(Refs::Executing))
            }
            Some(_) => Operation::Abort(()),
        });

        let (task, stolen) = match result {
            Compute::Inserted(_, slot) => (Arc::clone(&slot.task), false),
            Compute::Updated { new: (_, new), .. } => (Arc::clone(&new.task), true),
            Compute::Removed(..) | Compute::Aborted(()) => return None,
        };
        drop(map);

        if stolen {
            self.note(param, "stolen");
            self.policy.unqueue(&task);
        } else {
            self.note(param, "created for batch");
            Counters::bump(&self.counters.created);
        }
        Counters::bump(&self.counters.acquired);
        Some(task)
    }

    /// Unconditionally drop a queued task for `param`, as on shutdown.
    fn force_cancel(&self, param: &P) {
        let map = self.tasks.pin();
        let result = map.compute(param.clone(), |entry| match entry {
            Some((_, slot)) if slot.refs != Refs::Executing => match &slot.previous {
                Some(previous) => Operation::Insert(Slot::executing(Arc::clone(previous))),
                None => Operation::Remove,
            },
            _ => Operation::Abort(()),
        });

        let discarded = match result {
            Compute::Removed(_, old) | Compute::Updated { old: (_, old), .. } => Some(Arc::clone(&old.task)),
            Compute::Inserted(..) | Compute::Aborted(()) => None,
        };
        drop(map);

        if let Some(task) = discarded {
            self.note(param, "cancelled by shutdown");
            self.discard(&task);
        }
    }

    /// Cancel a task that lost its last reference, cascading to the tasks it
    /// was gathering.
    fn discard(&self, task: &Arc<Task<P, V>>) {
        self.policy.unqueue(task);
        if task.promise.cancel() {
            Counters::bump(&self.counters.cancelled);
        }
        if let Some(dependencies) = task.take_dependencies() {
            for dependency in dependencies.iter() {
                self.release(dependency);
            }
        }
    }

    // ── Execution ────────────────────────────────────────────────────

    /// Run the work function for a task this thread has begun.
    ///
    /// Only returns an error for [`SchedulerError::Closed`]; every other
    /// failure is stored in the owned tasks' futures.
    pub fn execute_task(self: &Arc<Self>, task: &Arc<Task<P, V>>, parent: Option<&Arc<Task<P, V>>>) -> SchedulerResult<()> {
        if let Some(parent) = parent {
            if let Err(err) = self.check_recursion(parent, &task.param) {
                self.report(&err);
                self.fail(task, TaskError::from_scheduler_error(err));
                self.delete(task);
                return Ok(());
            }
        }
        if !self.is_running() {
            task.promise.cancel();
            self.delete(task);
            return Err(SchedulerError::Closed);
        }

        Counters::bump(&self.counters.executions);
        let mut callback = WorkCallback::new(self, task);
        let result = {
            let _scope = self.enter(task);
            panic::catch_unwind(AssertUnwindSafe(|| self.work.work(&task.param, &mut callback)))
                .unwrap_or_else(|payload| Err(SchedulerError::Panicked(panic_message(payload.as_ref()))))
        };
        let owned = callback.into_owned();
        let tasks: Vec<Arc<Task<P, V>>> = owned.iter().map(|o| Arc::clone(&o.task)).collect();

        let outcome = match result {
            Ok(()) => {
                self.complete_owned(owned);
                Ok(())
            }
            Err(SchedulerError::Closed) => {
                for owned in &tasks {
                    owned.promise.cancel();
                }
                Err(SchedulerError::Closed)
            }
            Err(err @ SchedulerError::DependencyCancelled { .. }) => {
                let already_cancelled = tasks.iter().any(|t| t.promise.is_cancelled());
                if already_cancelled || !self.is_running() {
                    for owned in &tasks {
                        owned.promise.cancel();
                    }
                } else {
                    // nothing cancelled us, so the dependency should not have been cancelled either
                    self.report(&err);
                    self.fail_all(&tasks, TaskError::from_scheduler_error(err));
                }
                Ok(())
            }
            Err(err) => {
                if self.is_running() {
                    self.report(&err);
                }
                self.fail_all(&tasks, TaskError::from_scheduler_error(err));
                Ok(())
            }
        };

        for owned in &tasks {
            self.delete(owned);
        }
        outcome
    }

    fn complete_owned(&self, owned: Vec<Owned<P, V>>) {
        for Owned { task, value } in owned {
            match value {
                Some(value) => {
                    if task.promise.succeed(value) {
                        Counters::bump(&self.counters.completed);
                    }
                }
                None => {
                    let err = SchedulerError::illegal_state(format!(
                        "work function returned without completing {:?}",
                        task.param
                    ));
                    self.report(&err);
                    self.fail(&task, TaskError::from_scheduler_error(err));
                }
            }
        }
    }

    fn fail(&self, task: &Arc<Task<P, V>>, err: TaskError) {
        if task.promise.fail(err) {
            Counters::bump(&self.counters.failed);
        }
    }

    fn fail_all(&self, tasks: &[Arc<Task<P, V>>], err: TaskError) {
        for task in tasks {
            self.fail(task, err.clone());
        }
    }

    /// Poll one task and execute it if this thread wins the race to begin it.
    fn poll_and_execute(self: &Arc<Self>, parent: Option<&Arc<Task<P, V>>>, timeout: Duration) -> SchedulerResult<()> {
        if !self.is_running() {
            return Err(SchedulerError::Closed);
        }
        match self.policy.poll(parent, timeout) {
            Some(task) if self.begin(&task) => self.execute_task(&task, parent),
            _ => Ok(()),
        }
    }

    fn run_worker(self: &Arc<Self>) {
        debug!("worker loop started");
        while self.poll_and_execute(None, self.settings.poll_timeout).is_ok() {}
        debug!("worker loop exited");
    }

    // ── Joining ──────────────────────────────────────────────────────

    /// Mark `task` as the one the calling thread executes until the scope is dropped.
    fn enter(&self, task: &Arc<Task<P, V>>) -> ExecutionScope<'_, P, V> {
        let outer = self
            .executing
            .pin()
            .insert(thread::current().id(), Arc::clone(task))
            .cloned();
        ExecutionScope { engine: self, outer }
    }

    /// The task whose work function is running on the calling thread, if any.
    fn current_task(&self) -> Option<Arc<Task<P, V>>> {
        self.executing.pin().get(&thread::current().id()).cloned()
    }

    pub(crate) fn check_recursion(&self, parent: &Arc<Task<P, V>>, to: &P) -> SchedulerResult<()> {
        if parent.param == *to {
            return Err(SchedulerError::illegal_state(format!(
                "task for {:?} cannot wait on its own parameter",
                to
            )));
        }
        if !self.policy.can_recurse(&parent.param, to) {
            return Err(SchedulerError::illegal_state(format!(
                "recursion from {:?} to {:?} is not permitted!",
                parent.param, to
            )));
        }
        Ok(())
    }

    /// Wait for `task`, surfacing its outcome. Without an explicit parent the
    /// task executing on the calling thread is used. With a parent, failures
    /// are wrapped as dependency errors naming both tasks.
    pub fn join(self: &Arc<Self>, task: &Arc<Task<P, V>>, parent: Option<&Arc<Task<P, V>>>) -> SchedulerResult<V> {
        let current = match parent {
            Some(_) => None,
            None => self.current_task(),
        };
        let parent = parent.or(current.as_ref());
        if let Some(parent) = parent {
            self.check_recursion(parent, &task.param)?;
        }
        if self.group.is_worker_thread() {
            self.await_join(task, parent)?;
        }
        let outcome = task.promise.wait();

        match (outcome, parent) {
            (Ok(value), _) => Ok(value),
            (Err(err), None) => Err(err.into()),
            (Err(TaskError::Cancelled), Some(parent)) => Err(SchedulerError::DependencyCancelled {
                child: format!("{:?}", task.param),
                parent: format!("{:?}", parent.param),
            }),
            (Err(TaskError::Failed(cause)), Some(parent)) => Err(SchedulerError::DependencyFailed {
                child: format!("{:?}", task.param),
                parent: format!("{:?}", parent.param),
                cause,
            }),
        }
    }

    /// Keep a worker thread busy until `task` is done instead of blocking it.
    fn await_join(self: &Arc<Self>, task: &Arc<Task<P, V>>, parent: Option<&Arc<Task<P, V>>>) -> SchedulerResult<()> {
        if self.policy.races_to_begin() && self.begin(task) {
            return self.execute_task(task, parent);
        }
        while !task.promise.is_done() {
            self.poll_and_execute(parent, self.settings.join_poll_interval)?;
        }
        Ok(())
    }

    /// Retain every parameter, wait for all of them, then release them.
    pub fn scatter_gather(self: &Arc<Self>, params: Vec<P>, parent: Option<&Arc<Task<P, V>>>) -> SchedulerResult<Vec<V>> {
        if let Some(parent) = parent {
            for param in &params {
                self.check_recursion(parent, param)?;
            }
        }
        let tasks: Vec<Arc<Task<P, V>>> = params.into_iter().map(|param| self.retain(param)).collect();

        let Some(parent) = parent else {
            let result = self.gather(&tasks, None);
            for task in &tasks {
                self.release(task);
            }
            return result;
        };

        let dependencies = Arc::new(tasks);
        if !parent.try_set_dependencies(&dependencies) {
            for task in dependencies.iter() {
                self.release(task);
            }
            return Err(SchedulerError::illegal_state(format!(
                "task for {:?} has already started recursion!",
                parent.param
            )));
        }

        let result = self.gather(&dependencies, Some(parent));
        // a concurrent cancellation of the parent may already have released them
        if parent.clear_dependencies_if(&dependencies) {
            for task in dependencies.iter() {
                self.release(task);
            }
        }
        result
    }

    fn gather(self: &Arc<Self>, tasks: &[Arc<Task<P, V>>], parent: Option<&Arc<Task<P, V>>>) -> SchedulerResult<Vec<V>> {
        if self.policy.races_to_begin() {
            for task in tasks {
                if self.begin(task) {
                    self.execute_task(task, parent)?;
                }
            }
        }
        tasks.iter().map(|task| self.join(task, parent)).collect()
    }

    pub fn can_execute_in_batch(&self, params: &[&P]) -> bool {
        self.policy.can_execute_in_batch(params)
    }

    // ── Shutdown ─────────────────────────────────────────────────────

    /// Stop the worker loops, wait for them to exit, then cancel whatever is
    /// still queued so no joiner waits forever.
    pub fn shutdown(&self) -> SchedulerResult<()> {
        self.running.store(false, Ordering::Release);
        self.group.close()?;
        self.cancel_pending();
        Ok(())
    }

    fn cancel_pending(&self) {
        let pending: Vec<P> = {
            let map = self.tasks.pin();
            map.iter()
                .filter(|(_, slot)| slot.refs != Refs::Executing)
                .map(|(param, _)| param.clone())
                .collect()
        };
        if !pending.is_empty() {
            debug!(count = pending.len(), "cancelling tasks left in queue");
        }
        for param in &pending {
            self.force_cancel(param);
        }
    }
}

/// Restores the thread's outer executing task, or clears it, when dropped.
struct ExecutionScope<'a, P: Param, V: Value> {
    engine: &'a Engine<P, V>,
    outer: Option<Arc<Task<P, V>>>,
}

impl<P: Param, V: Value> Drop for ExecutionScope<'_, P, V> {
    fn drop(&mut self) {
        let id = thread::current().id();
        let executing = self.engine.executing.pin();
        match self.outer.take() {
            Some(outer) => {
                executing.insert(id, outer);
            }
            None => {
                executing.remove(&id);
            }
        }
    }
}
