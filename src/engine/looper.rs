use super::affinity::{AffinityExecutor, Task};
use crate::core::error::{LooperError, StartupError};
use std::{
    any::Any,
    cell::{Cell, RefCell},
    marker::PhantomData,
    panic::{self, AssertUnwindSafe},
    sync::{
        mpsc::{self, Receiver, Sender},
        OnceLock,
    },
    thread::{self, JoinHandle, ThreadId},
};

enum Message {
    Run(Task),
    Quit,
}

thread_local! {
    static CURRENT: RefCell<Option<LooperHandle>> = const { RefCell::new(None) };
}

static MAIN: OnceLock<LooperHandle> = OnceLock::new();

/// The receiving end of a thread's task queue. Lives and dies on the thread that
/// prepared it.
pub struct Looper {
    receiver: Receiver<Message>,
    handle: LooperHandle,
    quitting: Cell<bool>,
    _not_send: PhantomData<*const ()>,
}

/// Cheap, cloneable way to reach a looper from any thread.
#[derive(Clone, Debug)]
pub struct LooperHandle {
    thread_id: ThreadId,
    sender: Sender<Message>,
}

pub struct SpawnedLooper {
    pub handle: LooperHandle,
    pub thread: JoinHandle<()>,
}

impl Looper {
    /// Give the calling thread a task queue.
    pub fn prepare() -> Result<Self, LooperError> {
        CURRENT.with(|current| {
            let mut current = current.borrow_mut();
            if current.is_some() {
                return Err(LooperError::AlreadyPrepared);
            }

            let (sender, receiver) = mpsc::channel();
            let handle = LooperHandle {
                thread_id: thread::current().id(),
                sender,
            };
            *current = Some(handle.clone());

            Ok(Self {
                receiver,
                handle,
                quitting: Cell::new(false),
                _not_send: PhantomData,
            })
        })
    }

    /// Like [`Looper::prepare`], and designate the calling thread as the process main thread.
    /// There is only ever one main looper per process.
    pub fn prepare_main() -> Result<Self, LooperError> {
        let looper = Self::prepare()?;
        if MAIN.set(looper.handle.clone()).is_err() {
            return Err(LooperError::MainAlreadyPrepared);
        }
        log::debug!("Main looper prepared on {:?}", thread::current().id());
        Ok(looper)
    }

    pub fn spawn(name: &str) -> Result<SpawnedLooper, LooperError> {
        Self::spawn_with(name, false)
    }

    pub fn spawn_main(name: &str) -> Result<SpawnedLooper, LooperError> {
        Self::spawn_with(name, true)
    }

    fn spawn_with(name: &str, main: bool) -> Result<SpawnedLooper, LooperError> {
        let (ready_sender, ready_receiver) = mpsc::sync_channel(1);

        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let prepared = if main {
                    Looper::prepare_main()
                } else {
                    Looper::prepare()
                };
                match prepared {
                    Ok(looper) => {
                        let _ = ready_sender.send(Ok(looper.handle()));
                        looper.run();
                    }
                    Err(err) => {
                        let _ = ready_sender.send(Err(err));
                    }
                }
            })?;

        match ready_receiver.recv() {
            Ok(Ok(handle)) => Ok(SpawnedLooper { handle, thread }),
            Ok(Err(err)) => {
                let _ = thread.join();
                Err(err)
            }
            Err(_) => Err(LooperError::Disconnected),
        }
    }

    pub fn handle(&self) -> LooperHandle {
        self.handle.clone()
    }

    /// Process tasks until [`LooperHandle::quit`] is called.
    pub fn run(self) {
        if self.quitting.get() {
            return;
        }
        while let Ok(message) = self.receiver.recv() {
            match message {
                Message::Run(task) => dispatch(task),
                Message::Quit => break,
            }
        }
        log::debug!("Looper on {:?} quit", self.handle.thread_id);
    }

    /// Process whatever is queued right now without blocking. Returns the number of tasks run.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while !self.quitting.get() {
            match self.receiver.try_recv() {
                Ok(Message::Run(task)) => {
                    dispatch(task);
                    ran += 1;
                }
                Ok(Message::Quit) => self.quitting.set(true),
                Err(_) => break,
            }
        }
        ran
    }
}

impl Drop for Looper {
    fn drop(&mut self) {
        // The thread local may already be torn down when the thread is exiting
        let _ = CURRENT.try_with(|current| current.borrow_mut().take());
    }
}

fn dispatch(task: Task) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
        log::error!("Looper task panicked: {}", panic_message(payload.as_ref()));
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl LooperHandle {
    /// The looper prepared on the calling thread, if any.
    pub fn current() -> Option<Self> {
        CURRENT.with(|current| current.borrow().clone())
    }

    pub fn main() -> Option<Self> {
        MAIN.get().cloned()
    }

    pub fn is_main(&self) -> bool {
        MAIN.get()
            .is_some_and(|main| main.thread_id == self.thread_id)
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub fn post(&self, task: impl FnOnce() + Send + 'static) -> Result<(), LooperError> {
        self.sender
            .send(Message::Run(Box::new(task)))
            .map_err(|_| LooperError::Disconnected)
    }

    pub fn quit(&self) {
        let _ = self.sender.send(Message::Quit);
    }
}

impl AffinityExecutor for LooperHandle {
    fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    fn post(&self, task: Task) -> Result<(), StartupError> {
        self.sender
            .send(Message::Run(task))
            .map_err(|_| StartupError::AffinityThreadGone)
    }
}

impl SpawnedLooper {
    pub fn quit_and_join(self) {
        self.handle.quit();
        if self.thread.join().is_err() {
            log::error!("Looper thread panicked while quitting");
        }
    }
}
