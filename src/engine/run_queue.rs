use super::looper::panic_message;
use std::{
    collections::VecDeque,
    fmt,
    panic::{self, AssertUnwindSafe},
};

pub type StartedTask<T> = Box<dyn FnOnce(&T) + Send + 'static>;

/// Work submitted before the engine was up, replayed in submission order once it is.
pub struct RunQueue<T> {
    tasks: VecDeque<StartedTask<T>>,
}

impl<T> RunQueue<T> {
    pub const fn new() -> Self {
        Self {
            tasks: VecDeque::new(),
        }
    }

    pub fn push(&mut self, task: StartedTask<T>) {
        self.tasks.push_back(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Hand the queued tasks over, leaving the queue empty.
    pub fn take(&mut self) -> Self {
        Self {
            tasks: std::mem::take(&mut self.tasks),
        }
    }

    /// Run every task against `engine`. A panicking task is logged and does not stop the rest.
    pub fn drain_with(self, engine: &T) -> usize {
        let count = self.tasks.len();
        for task in self.tasks {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| task(engine))) {
                log::error!(
                    "Deferred engine task panicked: {}",
                    panic_message(payload.as_ref())
                );
            }
        }
        count
    }
}

impl<T> Default for RunQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for RunQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunQueue")
            .field("pending", &self.tasks.len())
            .finish()
    }
}
