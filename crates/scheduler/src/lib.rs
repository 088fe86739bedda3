//! In-process task scheduling with deduplication.
//!
//! - [`SharedFutureScheduler`]: deduplicating scheduler handing out shared
//!   futures, with recursive scatter/gather and work-stealing joins.
//! - [`ApproximatelyPrioritizedSharedFutureScheduler`]: the same engine with
//!   a comparator-ordered queue and recursion restricted to lesser buckets.
//! - [`NoFutureScheduler`]: fire-and-forget deduplicating executor.
//!
//! All of them run on a [`WorkerGroup`] configured through a
//! [`WorkerGroupBuilder`].

pub mod error;
pub mod metrics;
pub mod no_future;
pub mod prioritized;
pub mod queue;
pub mod scheduler;
pub mod shared;
pub mod worker;

mod promise;

pub use error::{SchedulerError, SchedulerResult, TaskError};
pub use metrics::SchedulerMetrics;
pub use no_future::NoFutureScheduler;
pub use prioritized::ApproximatelyPrioritizedSharedFutureScheduler;
pub use scheduler::{work_fn, AcquisitionStrategy, Param, Scheduler, Value, WorkFunction};
pub use shared::{SharedFuture, SharedFutureScheduler, WorkCallback};
pub use worker::{CollectingErrorSink, ErrorSink, LoggingErrorSink, WorkerGroup, WorkerGroupBuilder};
