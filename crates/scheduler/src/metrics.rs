use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Scheduler operational metrics, as reported by `metrics()`.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerMetrics {
    /// Tasks created for parameters with no live task.
    pub tasks_created: u64,
    /// `schedule` calls that retained an already queued task.
    pub tasks_retained: u64,
    /// Tasks created while a previous generation was still executing.
    pub tasks_resubmitted: u64,
    /// Tasks whose last reference was released before they began.
    pub tasks_cancelled: u64,
    /// Work function invocations.
    pub executions: u64,
    /// Tasks completed successfully.
    pub tasks_completed: u64,
    /// Tasks completed exceptionally.
    pub tasks_failed: u64,
    /// Tasks taken over by another invocation through `acquire`.
    pub tasks_acquired: u64,
    /// Errors forwarded to the error sink.
    pub errors_reported: u64,
    /// Approximate number of queued tasks.
    pub queue_len: usize,
    /// When the scheduler was started.
    pub started_at: DateTime<Utc>,
}

/// Live counters behind [`SchedulerMetrics`].
#[derive(Debug)]
pub(crate) struct Counters {
    pub created: AtomicU64,
    pub retained: AtomicU64,
    pub resubmitted: AtomicU64,
    pub cancelled: AtomicU64,
    pub executions: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub acquired: AtomicU64,
    pub reported: AtomicU64,
    started_at: DateTime<Utc>,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            created: AtomicU64::new(0),
            retained: AtomicU64::new(0),
            resubmitted: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            executions: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            acquired: AtomicU64::new(0),
            reported: AtomicU64::new(0),
            started_at: Utc::now(),
        }
    }
}

impl Counters {
    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, queue_len: usize) -> SchedulerMetrics {
        SchedulerMetrics {
            tasks_created: self.created.load(Ordering::Relaxed),
            tasks_retained: self.retained.load(Ordering::Relaxed),
            tasks_resubmitted: self.resubmitted.load(Ordering::Relaxed),
            tasks_cancelled: self.cancelled.load(Ordering::Relaxed),
            executions: self.executions.load(Ordering::Relaxed),
            tasks_completed: self.completed.load(Ordering::Relaxed),
            tasks_failed: self.failed.load(Ordering::Relaxed),
            tasks_acquired: self.acquired.load(Ordering::Relaxed),
            errors_reported: self.reported.load(Ordering::Relaxed),
            queue_len,
            started_at: self.started_at,
        }
    }
}
