use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::promise::Promise;
use crate::scheduler::{Param, Value};

/// Tasks retained by one scatter/gather, recorded on the parent task.
pub(crate) type Dependencies<P, V> = Arc<Vec<Arc<Task<P, V>>>>;

/// The scheduling record for one generation of one parameter.
///
/// Identity matters: two tasks for equal parameters are different tasks, so
/// equality is pointer equality.
pub(crate) struct Task<P, V> {
    pub param: P,
    pub promise: Promise<V>,
    /// Set only while this task is the parent of an active scatter/gather.
    dependencies: Mutex<Option<Dependencies<P, V>>>,
}

impl<P: Param, V: Value> Task<P, V> {
    pub fn new(param: P) -> Arc<Self> {
        Arc::new(Self {
            param,
            promise: Promise::new(),
            dependencies: Mutex::new(None),
        })
    }

    /// Record `deps` if no other scatter/gather is outstanding.
    pub fn try_set_dependencies(&self, deps: &Dependencies<P, V>) -> bool {
        let mut slot = self.dependencies.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(Arc::clone(deps));
        true
    }

    /// Clear the dependencies only if they are still exactly `expected`.
    pub fn clear_dependencies_if(&self, expected: &Dependencies<P, V>) -> bool {
        let mut slot = self.dependencies.lock();
        match slot.as_ref() {
            Some(current) if Arc::ptr_eq(current, expected) => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    pub fn take_dependencies(&self) -> Option<Dependencies<P, V>> {
        self.dependencies.lock().take()
    }
}

impl<P, V> PartialEq for Task<P, V> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

impl<P: fmt::Debug, V> fmt::Debug for Task<P, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task@{:p}(param={:?})", self, self.param)
    }
}

/// Reference state of the task currently mapped for a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Refs {
    /// Queued and not executing; the number of live retainers (never zero).
    Retained(usize),
    /// Currently executing; can no longer be cancelled.
    Executing,
}

/// Immutable task map entry. Every transition replaces the whole slot.
pub(crate) struct Slot<P, V> {
    pub task: Arc<Task<P, V>>,
    pub refs: Refs,
    /// Generation still executing that this one must wait for.
    pub previous: Option<Arc<Task<P, V>>>,
}

impl<P, V> Slot<P, V> {
    pub fn queued(task: Arc<Task<P, V>>) -> Self {
        Self { task, refs: Refs::Retained(1), previous: None }
    }

    pub fn executing(task: Arc<Task<P, V>>) -> Self {
        Self { task, refs: Refs::Executing, previous: None }
    }

    pub fn with_refs(&self, refs: Refs) -> Self {
        Self {
            task: Arc::clone(&self.task),
            refs,
            previous: self.previous.clone(),
        }
    }

    pub fn holds(&self, task: &Arc<Task<P, V>>) -> bool {
        Arc::ptr_eq(&self.task, task)
    }

    pub fn follows(&self, task: &Arc<Task<P, V>>) -> bool {
        self.previous.as_ref().is_some_and(|previous| Arc::ptr_eq(previous, task))
    }
}
