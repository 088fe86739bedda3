//! Single-assignment completion cell shared by every retainer of a task.

use parking_lot::{Condvar, Mutex};

use crate::error::TaskError;

pub(crate) type Outcome<V> = Result<V, TaskError>;

pub(crate) struct Promise<V> {
    state: Mutex<Option<Outcome<V>>>,
    done: Condvar,
}

impl<V: Clone> Promise<V> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    /// Complete the promise. Only the first completion wins; returns whether
    /// this call was it.
    pub fn complete(&self, outcome: Outcome<V>) -> bool {
        let mut state = self.state.lock();
        if state.is_some() {
            return false;
        }
        *state = Some(outcome);
        drop(state);
        self.done.notify_all();
        true
    }

    pub fn succeed(&self, value: V) -> bool {
        self.complete(Ok(value))
    }

    pub fn fail(&self, error: TaskError) -> bool {
        self.complete(Err(error))
    }

    /// Cancel without interrupting anyone.
    pub fn cancel(&self) -> bool {
        self.complete(Err(TaskError::Cancelled))
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(*self.state.lock(), Some(Err(TaskError::Cancelled)))
    }

    pub fn try_get(&self) -> Option<Outcome<V>> {
        self.state.lock().clone()
    }

    /// Block the calling thread until the promise is completed.
    pub fn wait(&self) -> Outcome<V> {
        let mut state = self.state.lock();
        loop {
            if let Some(outcome) = state.as_ref() {
                return outcome.clone();
            }
            self.done.wait(&mut state);
        }
    }
}
