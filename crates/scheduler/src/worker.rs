//! Worker thread group backing every scheduler.
//!
//! A [`WorkerGroup`] owns a dedicated rayon thread pool running one copy of
//! the scheduler's poll/execute loop per thread. It also answers whether the
//! calling thread is one of its workers (used to decide between work-stealing
//! and blocking joins) and forwards errors to an [`ErrorSink`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tessera_core::SchedulerConfig;
use tracing::{error, info, warn};

use crate::error::SchedulerError;

// ── Error sink ───────────────────────────────────────────────────────

/// Receives errors raised by work functions that nobody else will observe.
pub trait ErrorSink: Send + Sync {
    fn handle(&self, error: &SchedulerError);
}

/// Default sink: log at error level.
#[derive(Debug, Default)]
pub struct LoggingErrorSink;

impl ErrorSink for LoggingErrorSink {
    fn handle(&self, error: &SchedulerError) {
        error!(error = %error, "scheduler task failed");
    }
}

/// Sink that keeps the rendered messages of every reported error.
#[derive(Debug, Default)]
pub struct CollectingErrorSink {
    errors: Mutex<Vec<String>>,
}

impl CollectingErrorSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.errors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ErrorSink for CollectingErrorSink {
    fn handle(&self, error: &SchedulerError) {
        warn!(error = %error, "scheduler task failed");
        self.errors.lock().push(error.to_string());
    }
}

// ── WorkerGroupBuilder ───────────────────────────────────────────────

/// Fluent builder for the worker group a scheduler runs on.
///
/// # Example
/// ```ignore
/// let builder = WorkerGroupBuilder::from_config(&config)
///     .threads(4)
///     .error_sink(CollectingErrorSink::new());
/// let scheduler = SharedFutureScheduler::new(work, builder)?;
/// ```
#[derive(Clone)]
pub struct WorkerGroupBuilder {
    threads: usize,
    thread_name: String,
    poll_timeout: Duration,
    join_poll_interval: Duration,
    close_warn_after: Duration,
    trace_transitions: bool,
    error_sink: Arc<dyn ErrorSink>,
}

impl Default for WorkerGroupBuilder {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

impl WorkerGroupBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            threads: config.resolved_worker_threads(),
            thread_name: config.thread_name.clone(),
            poll_timeout: config.poll_timeout(),
            join_poll_interval: config.join_poll_interval(),
            close_warn_after: config.close_warn_after(),
            trace_transitions: config.trace_transitions,
            error_sink: Arc::new(LoggingErrorSink),
        }
    }

    /// Set the number of worker threads (at least one).
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Bounded wait of the idle worker loop (default: 1s).
    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Bounded wait between checks of an awaited task inside a join (default: 10ms).
    pub fn join_poll_interval(mut self, interval: Duration) -> Self {
        self.join_poll_interval = interval;
        self
    }

    pub fn trace_transitions(mut self, enabled: bool) -> Self {
        self.trace_transitions = enabled;
        self
    }

    pub fn error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.error_sink = sink;
        self
    }

    pub(crate) fn build(self) -> Result<WorkerGroup, SchedulerError> {
        let prefix = self.thread_name.clone();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .thread_name(move |i| format!("{}-{}", prefix, i))
            .panic_handler(|_| error!("scheduler worker loop panicked"))
            .build()
            .map_err(|e| SchedulerError::Pool(e.to_string()))?;

        Ok(WorkerGroup {
            name: self.thread_name,
            threads: self.threads,
            pool,
            live: Arc::new(Liveness::default()),
            sink: self.error_sink,
            settings: LoopSettings {
                poll_timeout: self.poll_timeout,
                join_poll_interval: self.join_poll_interval,
                close_warn_after: self.close_warn_after,
                trace_transitions: self.trace_transitions,
            },
        })
    }
}

// ── WorkerGroup ──────────────────────────────────────────────────────

/// Timing knobs for the loops run on the group.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LoopSettings {
    pub poll_timeout: Duration,
    pub join_poll_interval: Duration,
    pub close_warn_after: Duration,
    pub trace_transitions: bool,
}

#[derive(Default)]
struct Liveness {
    running: Mutex<usize>,
    exited: Condvar,
}

/// Decrements the live loop count when a loop exits, including by panic.
struct ExitGuard(Arc<Liveness>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let mut running = self.0.running.lock();
        *running -= 1;
        if *running == 0 {
            self.0.exited.notify_all();
        }
    }
}

pub struct WorkerGroup {
    name: String,
    threads: usize,
    pool: rayon::ThreadPool,
    live: Arc<Liveness>,
    sink: Arc<dyn ErrorSink>,
    pub(crate) settings: LoopSettings,
}

impl WorkerGroup {
    /// Start one copy of `body` on every thread of the group.
    pub(crate) fn launch(&self, body: Arc<dyn Fn() + Send + Sync>) {
        *self.live.running.lock() += self.threads;
        for _ in 0..self.threads {
            let guard = ExitGuard(Arc::clone(&self.live));
            let body = Arc::clone(&body);
            self.pool.spawn(move || {
                // the exit is signalled only after the body has been dropped
                let _guard = guard;
                let body = body;
                body();
            });
        }
        info!(group = %self.name, threads = self.threads, "worker group started");
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Whether the calling thread belongs to this group.
    pub fn is_worker_thread(&self) -> bool {
        self.pool.current_thread_index().is_some()
    }

    /// Report an error to the group's sink.
    pub fn handle(&self, error: &SchedulerError) {
        self.sink.handle(error);
    }

    /// Block until every worker loop has exited.
    ///
    /// The loops must already have been told to stop. Fails when called from
    /// one of the group's own threads, since that loop could never exit.
    pub fn close(&self) -> Result<(), SchedulerError> {
        if self.is_worker_thread() {
            return Err(SchedulerError::illegal_state(format!(
                "worker group {} cannot be closed from one of its own threads",
                self.name
            )));
        }

        let started = Instant::now();
        let mut running = self.live.running.lock();
        while *running > 0 {
            let result = self
                .live
                .exited
                .wait_for(&mut running, self.settings.close_warn_after);
            if result.timed_out() && *running > 0 {
                warn!(
                    group = %self.name,
                    remaining = *running,
                    waited = ?started.elapsed(),
                    "still waiting for workers to exit"
                );
            }
        }
        info!(group = %self.name, "worker group stopped");
        Ok(())
    }
}
