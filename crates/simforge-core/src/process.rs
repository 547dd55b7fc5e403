//! Processes: sequential model logic that can block mid-body.
//!
//! Each process body runs on its own OS thread, but only ever while holding
//! the baton. The event loop hands the baton over by dispatching the
//! process's wake event, which sends [`Wake::Run`] to the process thread and
//! then blocks until the thread reports back with a [`Yield`]. A process
//! yields when it suspends (`suspend`, `wait_for`, `join`) or when its body
//! returns. Exactly one context, the loop or one process, is ever unblocked.
//!
//! Suspension is only possible through the [`ProcessContext`] handed to the
//! body. Holding a context is what allows a call to block.
//!
//! ```text
//!  loop thread                       process thread
//!  ───────────                       ──────────────
//!  dispatch(wake event)
//!    Wake::Run  ───────────────────▶  body continues
//!    recv()  (blocked)                ...
//!                                     wait_for(5.0)
//!                                       schedule wake at t+5
//!    ◀───────────────  Yield::Suspended
//!  next event                         recv()  (blocked)
//! ```
//!
//! When the run stops, every started process still suspended receives
//! [`Wake::Abort`]; its pending suspension call returns
//! [`SimError::Aborted`] and the body is expected to unwind with `?`.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam::channel::{self, Receiver, Sender};
use tracing::debug;

use crate::error::{ModelResult, SharedError, SimError};
use crate::event::{Event, EventHandle};
use crate::id::ProcessId;
use crate::simulation::{ErrorHandler, Kernel, Simulation, guarded, lock};
use crate::sim::{ErrorAction, ProcessState};
use crate::time::TimeUnit;

// ---------------------------------------------------------------------------
// Baton messages
// ---------------------------------------------------------------------------

/// Loop to process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wake {
    Run,
    Abort,
}

/// Process to loop.
#[derive(Debug)]
pub(crate) enum Yield {
    Suspended,
    /// The body finished; carries its failure, if any.
    Terminated(Option<SharedError>),
}

/// A process body failed. Carried from `dispatch` to the loop's error
/// routing so the process's own handler is consulted first.
pub(crate) struct ProcessFault {
    pub(crate) name: String,
    pub(crate) handler: Option<ErrorHandler>,
    pub(crate) source: SharedError,
}

impl std::fmt::Debug for ProcessFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessFault")
            .field("name", &self.name)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Display for ProcessFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "process '{}' failed: {}", self.name, self.source)
    }
}

impl std::error::Error for ProcessFault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

// ---------------------------------------------------------------------------
// ProcessCore
// ---------------------------------------------------------------------------

type ProcessBody = Box<dyn FnOnce(&ProcessContext) -> ModelResult + Send + 'static>;

pub(crate) struct ProcessInner {
    pub(crate) state: ProcessState,
    /// Processes blocked in `join` on this one.
    joiners: Vec<Arc<ProcessCore>>,
    pending_wake: Option<EventHandle>,
    failure: Option<SharedError>,
    local_handler: Option<ErrorHandler>,
    /// Taken when the thread is spawned.
    body: Option<ProcessBody>,
    wake_tx: Option<Sender<Wake>>,
    thread: Option<JoinHandle<()>>,
}

/// Type-erased process record shared by the process table, wake events and
/// every [`Process`] handle.
pub(crate) struct ProcessCore {
    pub(crate) id: ProcessId,
    pub(crate) name: String,
    thread_id: OnceLock<ThreadId>,
    inner: Mutex<ProcessInner>,
}

impl ProcessCore {
    fn new(id: ProcessId, name: String, body: ProcessBody) -> Self {
        Self {
            id,
            name,
            thread_id: OnceLock::new(),
            inner: Mutex::new(ProcessInner {
                state: ProcessState::Created,
                joiners: Vec::new(),
                pending_wake: None,
                failure: None,
                local_handler: None,
                body: Some(body),
                wake_tx: None,
                thread: None,
            }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ProcessInner> {
        lock(&self.inner)
    }

    pub(crate) fn state(&self) -> ProcessState {
        self.lock().state
    }
}

impl std::fmt::Debug for ProcessCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessCore")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn wake_event(core: &Arc<ProcessCore>, time: f64, priority: i32) -> Event {
    let target = Arc::clone(core);
    Event::new(time, move |sim: &Simulation| sim.dispatch(&target))
        .with_priority(priority)
        .described(format!("wake '{}'", core.name))
}

// ---------------------------------------------------------------------------
// Process handle
// ---------------------------------------------------------------------------

/// Handle to a process whose body produces a `T`.
pub struct Process<T> {
    core: Arc<ProcessCore>,
    sim: Simulation,
    slot: Arc<Mutex<Option<T>>>,
}

impl<T> Clone for Process<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            sim: self.sim.clone(),
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> std::fmt::Debug for Process<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.core.id)
            .field("name", &self.core.name)
            .field("state", &self.core.state())
            .finish()
    }
}

impl<T> Process<T> {
    pub fn id(&self) -> ProcessId {
        self.core.id
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn state(&self) -> ProcessState {
        self.core.state()
    }

    /// Whether the body has returned, failed or been aborted.
    pub fn is_terminated(&self) -> bool {
        self.state() == ProcessState::Terminated
    }

    /// Time of the pending wake event while `Scheduled`.
    pub fn next_wake_time(&self) -> Option<f64> {
        self.core.lock().pending_wake.map(|h| h.time())
    }

    /// Schedule the first activation at an absolute time.
    pub fn awake_at(&self, time: f64) -> Result<(), SimError> {
        self.sim.awake_core(&self.core, |_| time)
    }

    /// Schedule the first activation `delay` units from now.
    pub fn awake_in(&self, delay: f64) -> Result<(), SimError> {
        self.sim.awake_core(&self.core, |now| now + delay)
    }

    /// Make a passive process continue at the current time. Fails unless the
    /// process is `Passive`. Only for the baton holder; other threads use
    /// [`Simulation::submit`].
    pub fn resume(&self) -> Result<(), SimError> {
        self.sim.resume_core(&self.core)
    }

    /// Handler consulted before the global one when this body fails.
    pub fn set_local_error_handler<F>(&self, handler: F)
    where
        F: Fn(&(dyn std::error::Error + Send + Sync + 'static)) -> ErrorAction
            + Send
            + Sync
            + 'static,
    {
        self.core.lock().local_handler = Some(Arc::new(handler));
    }

    /// Block the calling process until this one terminates.
    pub fn join(&self, ctx: &ProcessContext) -> Result<(), SimError> {
        ctx.join(self)
    }

    /// The failure captured when the body returned an error or panicked.
    pub fn failure(&self) -> Option<SharedError> {
        self.core.lock().failure.clone()
    }

    /// The body's return value. Fails with `ResultNotReady` before
    /// termination and with `ProcessFailed` if the body failed.
    pub fn get(&self) -> Result<T, SimError>
    where
        T: Clone,
    {
        self.check_result()?;
        lock(&self.slot).clone().ok_or_else(|| self.missing_result())
    }

    /// Move the body's return value out. Later calls to `get` or `take`
    /// fail with `ResultTaken`.
    pub fn take(&self) -> Result<T, SimError> {
        self.check_result()?;
        let value = lock(&self.slot).take();
        value.ok_or_else(|| self.missing_result())
    }

    fn check_result(&self) -> Result<(), SimError> {
        let inner = self.core.lock();
        if inner.state != ProcessState::Terminated {
            return Err(SimError::ResultNotReady {
                name: self.core.name.clone(),
                state: inner.state,
            });
        }
        if let Some(source) = &inner.failure {
            return Err(SimError::ProcessFailed {
                name: self.core.name.clone(),
                source: Arc::clone(source),
            });
        }
        Ok(())
    }

    /// A terminated, successful process without a value handed it out already.
    fn missing_result(&self) -> SimError {
        SimError::ResultTaken {
            name: self.core.name.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// ProcessContext
// ---------------------------------------------------------------------------

/// Capability held by a running process body. Every call that may block
/// goes through it.
pub struct ProcessContext {
    sim: Simulation,
    core: Arc<ProcessCore>,
    wake_rx: Receiver<Wake>,
}

impl std::fmt::Debug for ProcessContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessContext")
            .field("process", &self.core.name)
            .finish_non_exhaustive()
    }
}

impl ProcessContext {
    /// The simulation this process belongs to.
    pub fn sim(&self) -> &Simulation {
        &self.sim
    }

    pub fn id(&self) -> ProcessId {
        self.core.id
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn sim_time(&self) -> f64 {
        self.sim.sim_time()
    }

    /// Suspend for `delay` time units.
    pub fn wait_for(&self, delay: f64) -> Result<(), SimError> {
        self.sleep_until(|now| now + delay)
    }

    /// Suspend until an absolute time.
    pub fn wait_until(&self, time: f64) -> Result<(), SimError> {
        self.sleep_until(|_| time)
    }

    /// Suspend for a wall-clock duration, converted through the time scale.
    pub fn wait_for_duration(&self, duration: Duration) -> Result<(), SimError> {
        self.wait_for(self.sim.to_sim_time_duration(duration))
    }

    /// Suspend for `count` calendar units.
    pub fn wait_for_units(&self, count: f64, unit: TimeUnit) -> Result<(), SimError> {
        self.wait_for(self.sim.to_sim_time_units(count, unit))
    }

    /// Suspend until the clock reaches a calendar instant.
    pub fn wait_until_instant(&self, instant: DateTime<Utc>) -> Result<(), SimError> {
        self.wait_until(self.sim.to_sim_time_instant(instant))
    }

    /// Schedule this process's wake event at `deadline(now)` and yield.
    fn sleep_until(&self, deadline: impl FnOnce(f64) -> f64) -> Result<(), SimError> {
        self.suspend_with(|kernel, core| {
            let time = deadline(kernel.clock);
            let prio = kernel.current_prio;
            let handle = kernel.schedule(wake_event(core, time, prio))?;
            core.lock().pending_wake = Some(handle);
            Ok(Some(ProcessState::Scheduled))
        })
        .map(drop)
    }

    /// Suspend until another context calls [`Process::resume`].
    pub fn suspend(&self) -> Result<(), SimError> {
        self.suspend_with(|_, _| Ok(Some(ProcessState::Passive)))
            .map(drop)
    }

    /// Block until `target` terminates. Returns at once if it already has.
    pub fn join<U>(&self, target: &Process<U>) -> Result<(), SimError> {
        if Arc::ptr_eq(&target.core, &self.core) {
            return Err(SimError::JoinSelf {
                name: self.core.name.clone(),
            });
        }
        loop {
            let suspended = self.suspend_with(|_, core| {
                let mut t = target.core.lock();
                if t.state == ProcessState::Terminated {
                    return Ok(None);
                }
                if !t.joiners.iter().any(|j| Arc::ptr_eq(j, core)) {
                    t.joiners.push(Arc::clone(core));
                }
                Ok(Some(ProcessState::Passive))
            })?;
            if !suspended {
                return Ok(());
            }
        }
    }

    pub(crate) fn core(&self) -> &Arc<ProcessCore> {
        &self.core
    }

    /// Yield the baton. `prepare` runs under the kernel lock and returns the
    /// state to suspend in, or `None` to continue without blocking. Returns
    /// whether the process actually suspended.
    fn suspend_with<F>(&self, prepare: F) -> Result<bool, SimError>
    where
        F: FnOnce(&mut Kernel, &Arc<ProcessCore>) -> Result<Option<ProcessState>, SimError>,
    {
        let shared = &self.sim.shared;
        let next = {
            let mut kernel = lock(&shared.kernel);
            if kernel.stopping {
                return Err(SimError::Aborted {
                    name: self.core.name.clone(),
                });
            }
            let own_thread = self.core.thread_id.get() == Some(&thread::current().id());
            if kernel.active != Some(self.core.id) || !own_thread {
                return Err(SimError::ForeignSuspend {
                    name: self.core.name.clone(),
                });
            }
            let Some(next) = prepare(&mut kernel, &self.core)? else {
                return Ok(false);
            };
            self.core.lock().state = next;
            next
        };
        debug!(process = %self.core.name, state = ?next, "suspended");

        let aborted = || SimError::Aborted {
            name: self.core.name.clone(),
        };
        shared
            .yield_tx
            .send(Yield::Suspended)
            .map_err(|_| aborted())?;
        match self.wake_rx.recv() {
            Ok(Wake::Run) => Ok(true),
            Ok(Wake::Abort) | Err(_) => Err(aborted()),
        }
    }
}

// ---------------------------------------------------------------------------
// Kernel side
// ---------------------------------------------------------------------------

impl Simulation {
    /// Create a process named `process-<n>` and schedule it at the current
    /// time.
    pub fn activate<T, F>(&self, body: F) -> Result<Process<T>, SimError>
    where
        T: Send + 'static,
        F: FnOnce(&ProcessContext) -> ModelResult<T> + Send + 'static,
    {
        let process = self.create_process(None, body);
        process.awake_in(0.0)?;
        Ok(process)
    }

    /// Create a named process and schedule it at the current time.
    pub fn activate_named<T, F>(&self, name: impl Into<String>, body: F) -> Result<Process<T>, SimError>
    where
        T: Send + 'static,
        F: FnOnce(&ProcessContext) -> ModelResult<T> + Send + 'static,
    {
        let process = self.create_process(Some(name.into()), body);
        process.awake_in(0.0)?;
        Ok(process)
    }

    /// Create a process in the `Created` state. It does not run until
    /// [`Process::awake_at`] or [`Process::awake_in`] is called.
    pub fn process<T, F>(&self, name: impl Into<String>, body: F) -> Process<T>
    where
        T: Send + 'static,
        F: FnOnce(&ProcessContext) -> ModelResult<T> + Send + 'static,
    {
        self.create_process(Some(name.into()), body)
    }

    fn create_process<T, F>(&self, name: Option<String>, body: F) -> Process<T>
    where
        T: Send + 'static,
        F: FnOnce(&ProcessContext) -> ModelResult<T> + Send + 'static,
    {
        let slot = Arc::new(Mutex::new(None));
        let out = Arc::clone(&slot);
        let erased: ProcessBody = Box::new(move |ctx| {
            let value = body(ctx)?;
            *lock(&out) = Some(value);
            Ok(())
        });

        let core = {
            let mut kernel = lock(&self.shared.kernel);
            kernel.processes_created += 1;
            let name = name.unwrap_or_else(|| format!("process-{}", kernel.processes_created));
            let key = kernel
                .processes
                .insert_with_key(|id| Arc::new(ProcessCore::new(id, name, erased)));
            Arc::clone(&kernel.processes[key])
        };
        debug!(process = %core.name, "process created");
        Process {
            core,
            sim: self.clone(),
            slot,
        }
    }

    /// Schedule the first activation of a `Created` process.
    fn awake_core(&self, core: &Arc<ProcessCore>, at: impl FnOnce(f64) -> f64) -> Result<(), SimError> {
        let mut kernel = lock(&self.shared.kernel);
        let state = core.state();
        if state != ProcessState::Created {
            return Err(SimError::InvalidActivation {
                name: core.name.clone(),
                state,
            });
        }
        let time = at(kernel.clock);
        let prio = kernel.current_prio;
        let handle = kernel.schedule(wake_event(core, time, prio))?;
        let mut inner = core.lock();
        inner.pending_wake = Some(handle);
        inner.state = ProcessState::Scheduled;
        Ok(())
    }

    pub(crate) fn resume_core(&self, core: &Arc<ProcessCore>) -> Result<(), SimError> {
        let mut kernel = lock(&self.shared.kernel);
        let state = core.state();
        if state != ProcessState::Passive {
            return Err(SimError::NotPassive {
                name: core.name.clone(),
                state,
            });
        }
        let time = kernel.clock;
        let prio = kernel.current_prio;
        let handle = kernel.schedule(wake_event(core, time, prio))?;
        let mut inner = core.lock();
        inner.pending_wake = Some(handle);
        inner.state = ProcessState::Scheduled;
        debug!(process = %core.name, time, "resumed");
        Ok(())
    }

    /// Action of a wake event: hand the baton to `core` and wait until it
    /// yields.
    pub(crate) fn dispatch(&self, core: &Arc<ProcessCore>) -> ModelResult {
        let (wake_tx, body) = {
            let mut kernel = lock(&self.shared.kernel);
            let mut inner = core.lock();
            if inner.state == ProcessState::Terminated {
                return Ok(());
            }
            inner.state = ProcessState::Running;
            inner.pending_wake = None;
            kernel.active = Some(core.id);
            (inner.wake_tx.clone(), inner.body.take())
        };

        let handed_over = match (wake_tx, body) {
            (Some(tx), _) => tx.send(Wake::Run).is_ok(),
            (None, Some(body)) => {
                self.spawn_process_thread(core, body)?;
                true
            }
            (None, None) => false,
        };
        if !handed_over {
            lock(&self.shared.kernel).active = None;
            return Ok(());
        }

        let outcome = self.shared.yield_rx.recv();
        lock(&self.shared.kernel).active = None;
        match outcome {
            Ok(Yield::Terminated(failure)) => {
                self.join_process_thread(core);
                match failure {
                    Some(source) => Err(Box::new(ProcessFault {
                        name: core.name.clone(),
                        handler: core.lock().local_handler.clone(),
                        source,
                    })),
                    None => Ok(()),
                }
            }
            Ok(Yield::Suspended) | Err(_) => Ok(()),
        }
    }

    fn spawn_process_thread(&self, core: &Arc<ProcessCore>, body: ProcessBody) -> Result<(), SimError> {
        let (wake_tx, wake_rx) = channel::unbounded();
        let sim = self.clone();
        let target = Arc::clone(core);
        let spawned = thread::Builder::new()
            .name(core.name.clone())
            .spawn(move || process_main(sim, target, body, wake_rx));
        let thread = match spawned {
            Ok(thread) => thread,
            Err(err) => {
                lock(&self.shared.kernel).active = None;
                return Err(SimError::Spawn(err));
            }
        };
        let mut inner = core.lock();
        inner.wake_tx = Some(wake_tx);
        inner.thread = Some(thread);
        Ok(())
    }

    fn join_process_thread(&self, core: &ProcessCore) {
        let thread = core.lock().thread.take();
        if let Some(thread) = thread {
            let _ = thread.join();
        }
    }

    /// Runs on the process thread once its body returned.
    fn finish_process(&self, core: &Arc<ProcessCore>, failure: Option<SharedError>) {
        let (joiners, stopping) = {
            let mut kernel = lock(&self.shared.kernel);
            let mut inner = core.lock();
            inner.state = ProcessState::Terminated;
            inner.failure = failure;
            inner.pending_wake = None;
            kernel.processes.remove(core.id);
            (std::mem::take(&mut inner.joiners), kernel.stopping)
        };
        debug!(process = %core.name, "process terminated");
        if stopping {
            return;
        }
        for joiner in joiners {
            // A joiner woken by someone else re-checks and joins again.
            let _ = self.resume_core(&joiner);
        }
    }

    /// Stop every process that has not terminated. Started processes get
    /// `Wake::Abort` and are waited for; unstarted ones are marked failed.
    pub(crate) fn shutdown_processes(&self) {
        let live: Vec<Arc<ProcessCore>> = {
            let mut kernel = lock(&self.shared.kernel);
            kernel.stopping = true;
            kernel.queue.clear();
            kernel.processes.values().cloned().collect()
        };

        for core in &live {
            let wake_tx = {
                let mut inner = core.lock();
                if inner.state == ProcessState::Terminated {
                    continue;
                }
                match inner.wake_tx.clone() {
                    Some(tx) => tx,
                    None => {
                        inner.state = ProcessState::Terminated;
                        inner.body = None;
                        inner.failure = Some(Arc::new(SimError::Aborted {
                            name: core.name.clone(),
                        }));
                        continue;
                    }
                }
            };
            debug!(process = %core.name, "aborting process");
            lock(&self.shared.kernel).active = Some(core.id);
            if wake_tx.send(Wake::Abort).is_ok() {
                while let Ok(message) = self.shared.yield_rx.recv() {
                    if matches!(message, Yield::Terminated(_)) {
                        break;
                    }
                }
            }
            lock(&self.shared.kernel).active = None;
            self.join_process_thread(core);
        }

        let mut kernel = lock(&self.shared.kernel);
        kernel.processes.clear();
        kernel.queue.clear();
    }
}

fn process_main(sim: Simulation, core: Arc<ProcessCore>, body: ProcessBody, wake_rx: Receiver<Wake>) {
    let _ = core.thread_id.set(thread::current().id());
    debug!(process = %core.name, time = sim.sim_time(), "process started");
    let ctx = ProcessContext {
        sim,
        core,
        wake_rx,
    };

    let failure = guarded(|| body(&ctx)).err().map(SharedError::from);
    ctx.sim.finish_process(&ctx.core, failure.clone());
    let _ = ctx.sim.shared.yield_tx.send(Yield::Terminated(failure));
}
