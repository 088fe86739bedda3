//! Fire-and-forget deduplicating executor.
//!
//! [`NoFutureScheduler`] only remembers whether a parameter is waiting to be
//! run or currently running. It hands out no futures and supports no
//! recursion, since it never knows when a parameter is "done" for good.

use std::hash::BuildHasherDefault;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ahash::AHasher;
use papaya::{Compute, Operation};
use tracing::{debug, error, trace};

use crate::error::{panic_message, SchedulerError, SchedulerResult};
use crate::metrics::{Counters, SchedulerMetrics};
use crate::queue::{FifoQueue, TaskQueue};
use crate::scheduler::Param;
use crate::worker::{LoopSettings, WorkerGroup, WorkerGroupBuilder};

type Consumer<P> = Box<dyn Fn(&P) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Queued, waiting for a worker.
    Added,
    /// A worker is running the consumer for it.
    Running,
}

struct Inner<P: Param> {
    states: papaya::HashMap<P, State, BuildHasherDefault<AHasher>>,
    queue: FifoQueue<P>,
    consumer: Consumer<P>,
    group: WorkerGroup,
    settings: LoopSettings,
    running: AtomicBool,
    counters: Counters,
}

/// Runs a consumer once per scheduled parameter, never twice at the same
/// time for equal parameters.
///
/// Scheduling a parameter that is already waiting does nothing. Scheduling
/// one that is running marks it to run exactly once more after the current
/// run finishes.
pub struct NoFutureScheduler<P: Param> {
    inner: Arc<Inner<P>>,
}

impl<P: Param> NoFutureScheduler<P> {
    pub fn new(
        consumer: impl Fn(&P) -> anyhow::Result<()> + Send + Sync + 'static,
        builder: WorkerGroupBuilder,
    ) -> SchedulerResult<Self> {
        let group = builder.build()?;
        let inner = Arc::new(Inner {
            states: papaya::HashMap::with_hasher(BuildHasherDefault::default()),
            queue: FifoQueue::new(),
            consumer: Box::new(consumer),
            settings: group.settings,
            group,
            running: AtomicBool::new(true),
            counters: Counters::default(),
        });

        let worker = Arc::clone(&inner);
        inner.group.launch(Arc::new(move || worker.run_worker()));
        Ok(Self { inner })
    }

    /// Make sure `param` is run at least once more. Ignored once closed.
    pub fn schedule(&self, param: P) {
        let inner = &self.inner;
        if !inner.is_running() {
            debug!(param = ?param, "ignoring schedule on closed scheduler");
            return;
        }

        let states = inner.states.pin();
        let result = states.compute(param.clone(), |entry| match entry {
            None | Some((_, State::Running)) => Operation::Insert(State::Added),
            Some((_, State::Added)) => Operation::Abort(()),
        });
        match result {
            Compute::Inserted(..) => {
                Counters::bump(&inner.counters.created);
                inner.queue.add(param);
            }
            // re-queued by the worker once the current run finishes
            Compute::Updated { .. } => inner.note(&param, "marked for re-run"),
            Compute::Removed(..) | Compute::Aborted(()) => Counters::bump(&inner.counters.retained),
        }
    }

    /// Stop the workers and wait for them to exit. Runs in progress finish.
    pub fn close(&self) -> SchedulerResult<()> {
        self.inner.running.store(false, Ordering::Release);
        self.inner.group.close()?;
        self.inner.states.pin().clear();
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        self.inner.counters.snapshot(self.inner.queue.len())
    }
}

impl<P: Param> Drop for NoFutureScheduler<P> {
    fn drop(&mut self) {
        if self.inner.is_running() {
            if let Err(err) = self.close() {
                error!(error = %err, "scheduler dropped without a clean shutdown");
            }
        }
    }
}

impl<P: Param> Inner<P> {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn note(&self, param: &P, transition: &'static str) {
        if self.settings.trace_transitions {
            trace!(param = ?param, transition, "task transition");
        }
    }

    fn run_worker(&self) {
        debug!("worker loop started");
        while self.is_running() {
            if let Some(param) = self.queue.poll(self.settings.poll_timeout) {
                self.run_one(param);
            }
        }
        debug!("worker loop exited");
    }

    fn run_one(&self, param: P) {
        let began = {
            let states = self.states.pin();
            let result = states.compute(param.clone(), |entry| match entry {
                Some((_, State::Added)) => Operation::Insert(State::Running),
                _ => Operation::Abort(()),
            });
            matches!(result, Compute::Updated { .. })
        };
        if !began {
            error!(param = ?param, "dequeued parameter was not waiting to run");
            return;
        }
        self.note(&param, "began");
        Counters::bump(&self.counters.executions);

        let result = match panic::catch_unwind(AssertUnwindSafe(|| (self.consumer)(&param))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(SchedulerError::Work(err)),
            Err(payload) => Err(SchedulerError::Panicked(panic_message(payload.as_ref()))),
        };
        match result {
            Ok(()) => Counters::bump(&self.counters.completed),
            Err(err) => {
                Counters::bump(&self.counters.failed);
                if self.is_running() {
                    Counters::bump(&self.counters.reported);
                    self.group.handle(&err);
                }
            }
        }

        let rerun = {
            let states = self.states.pin();
            let result = states.compute(param.clone(), |entry| match entry {
                Some((_, State::Running)) => Operation::Remove,
                Some((_, State::Added)) => Operation::Abort(true),
                None => Operation::Abort(false),
            });
            matches!(result, Compute::Aborted(true))
        };
        if rerun {
            self.note(&param, "re-queued");
            Counters::bump(&self.counters.resubmitted);
            self.queue.add(param);
        } else {
            self.note(&param, "finished");
        }
    }
}
