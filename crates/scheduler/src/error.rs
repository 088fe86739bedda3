use std::any::Any;
use std::sync::Arc;

use thiserror::Error;

/// Error type returned by every scheduler operation and by work functions.
///
/// `Closed` and `DependencyCancelled` are control-flow signals: they unwind
/// the frame that observed them and are handled by the engine rather than
/// reported as failures.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler has been closed")]
    Closed,

    #[error("task was cancelled")]
    Cancelled,

    #[error("task failed: {0}")]
    Failed(Arc<anyhow::Error>),

    #[error("task {child} (dependency of {parent}) was cancelled")]
    DependencyCancelled { child: String, parent: String },

    #[error("task {child} (dependency of {parent}) failed: {cause}")]
    DependencyFailed {
        child: String,
        parent: String,
        cause: Arc<anyhow::Error>,
    },

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("work function panicked: {0}")]
    Panicked(String),

    #[error("failed to build worker pool: {0}")]
    Pool(String),

    #[error(transparent)]
    Work(#[from] anyhow::Error),
}

impl SchedulerError {
    pub fn illegal_state(msg: impl Into<String>) -> Self {
        Self::IllegalState(msg.into())
    }

    /// Whether this is one of the unwinding signals rather than a failure.
    pub fn is_signal(&self) -> bool {
        matches!(self, Self::Closed | Self::DependencyCancelled { .. })
    }
}

/// The failure half of a completed task, shared by every joiner of that task.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    #[error("task was cancelled")]
    Cancelled,

    #[error("task failed: {0}")]
    Failed(Arc<anyhow::Error>),
}

impl TaskError {
    pub(crate) fn from_scheduler_error(err: SchedulerError) -> Self {
        match err {
            SchedulerError::Cancelled => Self::Cancelled,
            SchedulerError::Failed(cause) => Self::Failed(cause),
            SchedulerError::Work(cause) => Self::Failed(Arc::new(cause)),
            other => Self::Failed(Arc::new(anyhow::Error::new(other))),
        }
    }
}

impl From<TaskError> for SchedulerError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::Cancelled => Self::Cancelled,
            TaskError::Failed(cause) => Self::Failed(cause),
        }
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Render a caught panic payload for [`SchedulerError::Panicked`].
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
