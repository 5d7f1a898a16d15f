use crate::core::error::StartupError;
use std::thread::{self, ThreadId};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A thread the engine can be bound to: something that knows which thread it is
/// and accepts work to run there later.
///
/// `post` must queue the task and return; running it inline would re-enter the gate
/// while its lock is held.
#[cfg_attr(test, mockall::automock)]
pub trait AffinityExecutor: Send + Sync {
    fn thread_id(&self) -> ThreadId;

    fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id()
    }

    fn post(&self, task: Task) -> Result<(), StartupError>;
}
