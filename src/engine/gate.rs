//! One-time, thread-affine engine startup.
//!
//! The engine must be started exactly once, on one designated thread (the affinity
//! thread), but any thread may be the first to need it. Callers on the affinity thread
//! run the startup routine inline; everyone else posts the routine to the affinity
//! thread and blocks until it has finished.

use super::{
    affinity::{AffinityExecutor, Task},
    looper::{panic_message, LooperHandle},
    run_queue::{RunQueue, StartedTask},
};
use crate::core::error::{BoxError, StartupError};
use std::{
    fmt, mem,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
    },
    thread,
    time::Instant,
};

type Routine<T> = Box<dyn FnOnce() -> Result<T, BoxError> + Send + 'static>;

enum Phase<T> {
    /// Holds the routine until the one thread allowed to run it takes it out
    NotStarted(Routine<T>),
    Starting,
    Started(Arc<T>),
    Failed(StartupError),
}

impl<T> Phase<T> {
    /// The terminal result, if there is one yet.
    fn outcome(&self) -> Option<Result<Arc<T>, StartupError>> {
        match self {
            Self::Started(engine) => Some(Ok(Arc::clone(engine))),
            Self::Failed(err) => Some(Err(err.clone())),
            Self::NotStarted(_) | Self::Starting => None,
        }
    }

    fn take_routine(&mut self) -> Option<Routine<T>> {
        match mem::replace(self, Self::Starting) {
            Self::NotStarted(routine) => Some(routine),
            other => {
                *self = other;
                None
            }
        }
    }

    const fn status(&self) -> GateStatus {
        match self {
            Self::NotStarted(_) => GateStatus::NotStarted,
            Self::Starting => GateStatus::Starting,
            Self::Started(_) => GateStatus::Started,
            Self::Failed(_) => GateStatus::Failed,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateStatus {
    NotStarted,
    Starting,
    Started,
    Failed,
}

struct GateState<T> {
    phase: Phase<T>,
    affinity: Option<Arc<dyn AffinityExecutor>>,
    posted: bool,
    run_queue: RunQueue<T>,
}

struct Inner<T> {
    state: Mutex<GateState<T>>,
    /// Broadcast whenever `phase` reaches `Started` or `Failed`
    settled: Condvar,
    started: AtomicBool,
}

/// Runs an engine's startup routine exactly once, on the thread the engine is bound to.
///
/// Cloning the gate shares it.
pub struct StartupGate<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for StartupGate<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> StartupGate<T> {
    pub fn new<F, E>(routine: F) -> Self
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        E: Into<BoxError>,
    {
        let routine: Routine<T> = Box::new(move || routine().map_err(Into::into));
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(GateState {
                    phase: Phase::NotStarted(routine),
                    affinity: None,
                    posted: false,
                    run_queue: RunQueue::new(),
                }),
                settled: Condvar::new(),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Bind the engine to `executor` ahead of the first [`StartupGate::ensure_started`].
    ///
    /// Binding again to the same thread is a no-op; binding to another thread fails.
    pub fn bind_affinity(&self, executor: Arc<dyn AffinityExecutor>) -> Result<(), StartupError> {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        match &state.affinity {
            Some(bound) if bound.thread_id() == executor.thread_id() => Ok(()),
            Some(_) => Err(StartupError::AffinityConflict),
            None => {
                state.affinity = Some(executor);
                Ok(())
            }
        }
    }

    /// Block until the engine has started, starting it if nobody has yet.
    ///
    /// `require_main` binds the engine to the process main looper; otherwise the first
    /// caller's own looper becomes the affinity thread. Once bound, the binding never
    /// changes.
    ///
    /// There is no timeout. A caller off the affinity thread waits for as long as the
    /// affinity thread takes to get around to the posted startup task, so a stalled
    /// affinity thread stalls every such caller.
    pub fn ensure_started(&self, require_main: bool) -> Result<Arc<T>, StartupError> {
        let mut guard = self.inner.lock();

        // Early-out for the common case
        if let Some(outcome) = guard.phase.outcome() {
            return outcome;
        }

        let affinity = bind_locked(&mut *guard, require_main)?;

        if affinity.is_current() {
            return self.inner.start_locked(guard);
        }

        // Cover callers that reach the engine through a thread-safe accessor before
        // anything ever ran on the affinity thread. Once the routine is running there
        // is nothing to post, and a failed post must not settle the gate under it.
        if !guard.posted && matches!(guard.phase, Phase::NotStarted(_)) {
            guard.posted = true;
            let inner = Arc::clone(&self.inner);
            let task: Task = Box::new(move || inner.start_if_pending());
            if let Err(err) = affinity.post(task) {
                return Err(self.inner.fail_locked(&mut *guard, err));
            }
        }

        // Waiting releases the lock so the affinity thread can take it
        loop {
            if let Some(outcome) = guard.phase.outcome() {
                return outcome;
            }
            guard = self
                .inner
                .settled
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Lock-free and possibly stale. Never true before the routine has returned.
    pub fn has_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    pub fn status(&self) -> GateStatus {
        self.inner.lock().phase.status()
    }

    /// The started engine, without blocking or starting it.
    pub fn get(&self) -> Option<Arc<T>> {
        match &self.inner.lock().phase {
            Phase::Started(engine) => Some(Arc::clone(engine)),
            _ => None,
        }
    }

    pub fn run_with_guaranteed_start<R>(
        &self,
        require_main: bool,
        accessor: impl FnOnce(&T) -> R,
    ) -> Result<R, StartupError> {
        let engine = self.ensure_started(require_main)?;
        Ok(accessor(&engine))
    }

    /// Run `task` on the affinity thread once the engine is up.
    ///
    /// Before start the task is queued and replayed right after the routine returns.
    /// After start it runs inline on the affinity thread or is posted there.
    pub fn run_after_start(
        &self,
        task: impl FnOnce(&T) + Send + 'static,
    ) -> Result<(), StartupError> {
        let mut guard = self.inner.lock();
        let state = &mut *guard;

        let engine = match &state.phase {
            Phase::Failed(err) => return Err(err.clone()),
            Phase::Started(engine) => Arc::clone(engine),
            Phase::NotStarted(_) | Phase::Starting => {
                let task: StartedTask<T> = Box::new(task);
                state.run_queue.push(task);
                return Ok(());
            }
        };
        let affinity = state.affinity.clone();
        drop(guard);

        match affinity {
            Some(affinity) if !affinity.is_current() => {
                affinity.post(Box::new(move || task(&engine)))
            }
            _ => {
                task(&engine);
                Ok(())
            }
        }
    }
}

fn bind_locked<T>(
    state: &mut GateState<T>,
    require_main: bool,
) -> Result<Arc<dyn AffinityExecutor>, StartupError> {
    if let Some(bound) = &state.affinity {
        // A caller with a looper of its own asks for that looper; one without any just
        // wants the engine, wherever it lives
        let wanted = if require_main {
            LooperHandle::main()
        } else {
            LooperHandle::current()
        };
        if wanted.is_some_and(|looper| looper.thread_id() != bound.thread_id()) {
            return Err(StartupError::AffinityConflict);
        }
        return Ok(Arc::clone(bound));
    }

    let looper = if require_main {
        LooperHandle::main().ok_or(StartupError::NoMainLooper)?
    } else {
        LooperHandle::current().ok_or(StartupError::NoLooper)?
    };
    log::info!(
        "Binding engine to {} looper on {:?}",
        if looper.is_main() { "main" } else { "background" },
        looper.thread_id()
    );

    let executor: Arc<dyn AffinityExecutor> = Arc::new(looper);
    state.affinity = Some(Arc::clone(&executor));
    Ok(executor)
}

impl<T: Send + Sync + 'static> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, GateState<T>> {
        // Nothing runs user code under this lock, so a poisoned guard still holds a
        // consistent state
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The task posted to the affinity thread. Someone may have started the engine
    /// inline since it was posted, in which case there is nothing left to do.
    fn start_if_pending(&self) {
        let guard = self.lock();
        if matches!(guard.phase, Phase::NotStarted(_)) {
            let _ = self.start_locked(guard);
        }
    }

    /// Must be called on the affinity thread.
    fn start_locked(
        &self,
        mut guard: MutexGuard<'_, GateState<T>>,
    ) -> Result<Arc<T>, StartupError> {
        let Some(routine) = guard.phase.take_routine() else {
            // Only `Starting` has no outcome: the routine is calling back into the gate
            return guard
                .phase
                .outcome()
                .unwrap_or(Err(StartupError::Reentrant));
        };
        // `Starting` keeps every other caller out while the lock is released
        drop(guard);

        log::info!(
            "Starting engine on thread {}",
            thread::current().name().unwrap_or("<unnamed>")
        );
        let started_at = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(routine));

        let mut guard = self.lock();
        debug_assert!(matches!(guard.phase, Phase::Starting));
        match outcome {
            Ok(Ok(engine)) => {
                let engine = Arc::new(engine);
                guard.phase = Phase::Started(Arc::clone(&engine));
                self.started.store(true, Ordering::Release);
                let queued = guard.run_queue.take();
                drop(guard);

                log::info!("Engine started in {:?}", started_at.elapsed());
                // Deferred tasks may call back into the gate, so they run unlocked, but
                // blocked waiters stay asleep until the queue is empty
                let drained = queued.drain_with(&engine);
                if drained > 0 {
                    log::debug!("Ran {} deferred engine tasks", drained);
                }
                self.settled.notify_all();
                Ok(engine)
            }
            Ok(Err(err)) => Err(self.fail_locked(
                &mut guard,
                StartupError::InitializationFailed(Arc::from(err)),
            )),
            Err(payload) => Err(self.fail_locked(
                &mut guard,
                StartupError::InitializationPanicked(panic_message(payload.as_ref())),
            )),
        }
    }

    /// Settle the gate in its terminal failed state and wake every waiter.
    fn fail_locked(&self, state: &mut GateState<T>, err: StartupError) -> StartupError {
        log::error!("Engine startup failed: {}", err);
        state.phase = Phase::Failed(err.clone());
        let dropped = state.run_queue.take();
        if !dropped.is_empty() {
            log::warn!("Dropping {} deferred engine tasks", dropped.len());
        }
        self.settled.notify_all();
        err
    }
}

impl<T> fmt::Debug for StartupGate<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("StartupGate")
            .field("status", &state.phase.status())
            .field("bound", &state.affinity.as_ref().map(|a| a.thread_id()))
            .field("run_queue", &state.run_queue)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{affinity::MockAffinityExecutor, looper::Looper};
    use std::{
        io,
        sync::{atomic::AtomicUsize, mpsc, OnceLock},
        thread::{JoinHandle, ThreadId},
        time::Duration,
    };

    fn other_thread_id() -> ThreadId {
        thread::spawn(|| thread::current().id()).join().unwrap()
    }

    /// An executor that claims the calling thread, so the routine always runs inline.
    fn inline_executor() -> Arc<dyn AffinityExecutor> {
        let mut executor = MockAffinityExecutor::new();
        executor
            .expect_thread_id()
            .return_const(thread::current().id());
        executor.expect_is_current().return_const(true);
        executor.expect_post().never();
        Arc::new(executor)
    }

    fn counting_gate(runs: &Arc<AtomicUsize>) -> StartupGate<u32> {
        let runs = Arc::clone(runs);
        StartupGate::new(move || {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok::<_, io::Error>(42)
        })
    }

    #[test]
    fn should_run_routine_inline_on_affinity_thread() {
        let runs = Arc::new(AtomicUsize::new(0));
        let gate = counting_gate(&runs);
        gate.bind_affinity(inline_executor()).unwrap();

        assert!(!gate.has_started());
        assert_eq!(gate.status(), GateStatus::NotStarted);
        assert!(gate.get().is_none());

        let engine = gate.ensure_started(false).unwrap();
        assert_eq!(*engine, 42);
        assert!(gate.has_started());
        assert_eq!(gate.status(), GateStatus::Started);

        let again = gate.ensure_started(false).unwrap();
        assert!(Arc::ptr_eq(&engine, &again));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn should_reject_reentrant_start_from_routine() {
        let slot: Arc<OnceLock<StartupGate<u32>>> = Arc::new(OnceLock::new());
        let (sender, receiver) = mpsc::channel();

        let routine_slot = Arc::clone(&slot);
        let gate = StartupGate::new(move || {
            if let Some(gate) = routine_slot.get() {
                sender
                    .send((gate.ensure_started(false), gate.status()))
                    .unwrap();
            }
            Ok::<_, io::Error>(1)
        });
        gate.bind_affinity(inline_executor()).unwrap();
        slot.set(gate.clone()).unwrap();

        assert_eq!(*gate.ensure_started(false).unwrap(), 1);
        let (reentered, status_inside) = receiver.recv().unwrap();
        assert!(matches!(reentered, Err(StartupError::Reentrant)));
        assert_eq!(status_inside, GateStatus::Starting);
        assert_eq!(gate.status(), GateStatus::Started);
    }

    #[test]
    fn should_share_routine_error_with_every_caller() {
        let gate: StartupGate<u32> = StartupGate::new(|| {
            Err(io::Error::new(io::ErrorKind::NotFound, "engine library missing"))
        });
        gate.bind_affinity(inline_executor()).unwrap();

        let first = gate.ensure_started(false).unwrap_err();
        let later = gate.ensure_started(true).unwrap_err();
        match (&first, &later) {
            (
                StartupError::InitializationFailed(first),
                StartupError::InitializationFailed(later),
            ) => {
                assert!(Arc::ptr_eq(first, later));
                assert!(first.to_string().contains("engine library missing"));
            }
            other => panic!("unexpected errors {other:?}"),
        }
        assert!(first.is_terminal());
        assert!(!gate.has_started());
        assert_eq!(gate.status(), GateStatus::Failed);
    }

    #[test]
    fn should_turn_routine_panic_into_terminal_error() {
        let gate: StartupGate<u32> = StartupGate::new(|| -> Result<u32, io::Error> {
            panic!("native init crashed")
        });
        gate.bind_affinity(inline_executor()).unwrap();

        let err = gate.ensure_started(false).unwrap_err();
        assert!(matches!(
            &err,
            StartupError::InitializationPanicked(message) if message == "native init crashed"
        ));
        assert!(matches!(
            gate.run_after_start(|_| {}),
            Err(StartupError::InitializationPanicked(_))
        ));
    }

    #[test]
    fn should_fail_every_caller_when_affinity_thread_is_gone() {
        let runs = Arc::new(AtomicUsize::new(0));
        let gate = counting_gate(&runs);

        let mut executor = MockAffinityExecutor::new();
        executor.expect_thread_id().return_const(other_thread_id());
        executor.expect_is_current().return_const(false);
        executor
            .expect_post()
            .times(1)
            .returning(|_| Err(StartupError::AffinityThreadGone));
        gate.bind_affinity(Arc::new(executor)).unwrap();

        assert!(matches!(
            gate.ensure_started(false),
            Err(StartupError::AffinityThreadGone)
        ));
        assert!(matches!(
            gate.ensure_started(false),
            Err(StartupError::AffinityThreadGone)
        ));
        assert_eq!(gate.status(), GateStatus::Failed);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn should_post_routine_once_and_wait_for_it() {
        let runs = Arc::new(AtomicUsize::new(0));
        let gate = counting_gate(&runs);
        let posted: Arc<Mutex<Vec<Task>>> = Arc::new(Mutex::new(Vec::new()));

        let mut executor = MockAffinityExecutor::new();
        executor.expect_thread_id().return_const(other_thread_id());
        executor.expect_is_current().return_const(false);
        let stash = Arc::clone(&posted);
        executor.expect_post().times(1).returning(move |task| {
            stash.lock().unwrap().push(task);
            Ok(())
        });
        gate.bind_affinity(Arc::new(executor)).unwrap();

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let gate = gate.clone();
                thread::spawn(move || gate.ensure_started(false).map(|engine| *engine))
            })
            .collect();

        // Stand in for the affinity thread once the startup task shows up
        let task = loop {
            if let Some(task) = posted.lock().unwrap().pop() {
                break task;
            }
            thread::yield_now();
        };
        task();

        for waiter in waiters {
            assert_eq!(waiter.join().unwrap().unwrap(), 42);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn should_replay_deferred_tasks_after_start() {
        let gate: StartupGate<u32> = StartupGate::new(|| Ok::<_, io::Error>(5));
        gate.bind_affinity(inline_executor()).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for offset in 0..2 {
            let seen = Arc::clone(&seen);
            gate.run_after_start(move |engine| seen.lock().unwrap().push(engine + offset))
                .unwrap();
        }
        assert!(seen.lock().unwrap().is_empty());

        gate.ensure_started(false).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![5, 6]);

        let after = Arc::clone(&seen);
        gate.run_after_start(move |engine| after.lock().unwrap().push(engine * 10))
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![5, 6, 50]);
    }

    #[test]
    fn should_reject_binding_to_another_thread() {
        let gate: StartupGate<u32> = StartupGate::new(|| Ok::<_, io::Error>(0));
        gate.bind_affinity(inline_executor()).unwrap();
        gate.bind_affinity(inline_executor()).unwrap();

        let mut elsewhere = MockAffinityExecutor::new();
        elsewhere.expect_thread_id().return_const(other_thread_id());
        assert!(matches!(
            gate.bind_affinity(Arc::new(elsewhere)),
            Err(StartupError::AffinityConflict)
        ));
    }

    #[test]
    fn should_require_a_looper_to_bind_to() {
        thread::spawn(|| {
            let gate: StartupGate<u32> = StartupGate::new(|| Ok::<_, io::Error>(0));
            assert!(matches!(
                gate.ensure_started(false),
                Err(StartupError::NoLooper)
            ));
            // Binding problems are the caller's, not the engine's
            assert_eq!(gate.status(), GateStatus::NotStarted);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn should_finish_running_start_when_posting_fails_meanwhile() {
        let slot: Arc<OnceLock<StartupGate<u32>>> = Arc::new(OnceLock::new());
        let waiter: Arc<Mutex<Option<JoinHandle<Result<u32, StartupError>>>>> =
            Arc::new(Mutex::new(None));

        let routine_slot = Arc::clone(&slot);
        let routine_waiter = Arc::clone(&waiter);
        let gate = StartupGate::new(move || {
            if let Some(gate) = routine_slot.get() {
                // Another thread shows up while the engine is half way through starting
                let gate = gate.clone();
                let handle =
                    thread::spawn(move || gate.ensure_started(false).map(|engine| *engine));
                thread::sleep(Duration::from_millis(30));
                *routine_waiter.lock().unwrap() = Some(handle);
            }
            Ok::<_, io::Error>(7)
        });

        let affinity = thread::current().id();
        let mut executor = MockAffinityExecutor::new();
        executor.expect_thread_id().return_const(affinity);
        executor
            .expect_is_current()
            .returning(move || thread::current().id() == affinity);
        executor
            .expect_post()
            .returning(|_| Err(StartupError::AffinityThreadGone));
        gate.bind_affinity(Arc::new(executor)).unwrap();
        slot.set(gate.clone()).unwrap();

        let (sender, receiver) = mpsc::channel();
        gate.run_after_start(move |engine| sender.send(*engine).unwrap())
            .unwrap();

        assert_eq!(*gate.ensure_started(false).unwrap(), 7);
        let handle = waiter.lock().unwrap().take().unwrap();
        assert_eq!(handle.join().unwrap().unwrap(), 7);
        assert_eq!(gate.status(), GateStatus::Started);
        assert_eq!(*gate.ensure_started(false).unwrap(), 7);
        assert_eq!(receiver.try_recv().unwrap(), 7);
    }

    #[test]
    fn should_drain_deferred_tasks_before_waking_waiters() {
        let gate: StartupGate<u32> = StartupGate::new(|| Ok::<_, io::Error>(9));
        let posted: Arc<Mutex<Vec<Task>>> = Arc::new(Mutex::new(Vec::new()));

        let mut executor = MockAffinityExecutor::new();
        executor.expect_thread_id().return_const(other_thread_id());
        executor.expect_is_current().return_const(false);
        let stash = Arc::clone(&posted);
        executor.expect_post().times(1).returning(move |task| {
            stash.lock().unwrap().push(task);
            Ok(())
        });
        gate.bind_affinity(Arc::new(executor)).unwrap();

        let drained = Arc::new(AtomicBool::new(false));
        let deferred = Arc::clone(&drained);
        gate.run_after_start(move |_| {
            thread::sleep(Duration::from_millis(20));
            deferred.store(true, Ordering::SeqCst);
        })
        .unwrap();

        let waiter = {
            let gate = gate.clone();
            let drained = Arc::clone(&drained);
            thread::spawn(move || {
                gate.ensure_started(false).unwrap();
                drained.load(Ordering::SeqCst)
            })
        };

        let task = loop {
            if let Some(task) = posted.lock().unwrap().pop() {
                break task;
            }
            thread::yield_now();
        };
        task();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn should_reject_rebinding_to_another_background_looper() {
        let gate: StartupGate<u32> = StartupGate::new(|| Ok::<_, io::Error>(0));
        let first = Looper::spawn("first-engine-looper").unwrap();
        gate.bind_affinity(Arc::new(first.handle.clone())).unwrap();

        let contender = gate.clone();
        thread::spawn(move || {
            let _own = Looper::prepare().unwrap();
            assert!(matches!(
                contender.ensure_started(false),
                Err(StartupError::AffinityConflict)
            ));
            assert_eq!(contender.status(), GateStatus::NotStarted);
        })
        .join()
        .unwrap();

        // A thread without a looper goes to the engine's own looper
        let engine = thread::spawn(move || gate.ensure_started(false).map(|engine| *engine))
            .join()
            .unwrap();
        assert_eq!(engine.unwrap(), 0);
        first.quit_and_join();
    }
}
