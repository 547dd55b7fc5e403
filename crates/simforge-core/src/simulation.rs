//! The run driver.
//!
//! [`Simulation`] owns the clock, the event queue, the process table, the
//! component tree and the result map. It is a cheap, cloneable handle so that
//! event handlers, process bodies and external threads can all refer to the
//! same run.
//!
//! # Run loop
//!
//! 1. `Initial -> Running`; component `init` and `sim_start` hooks run
//!    top-down.
//! 2. Until the continuation check fails: apply submitted commands, block
//!    while paused, pop the earliest event, advance the clock to its time and
//!    invoke its action.
//! 3. Pending events are discarded and suspended processes are woken with an
//!    abort signal so their threads exit.
//! 4. On success `sim_end` and `produce_results` run bottom-up and the state
//!    becomes `Finished`; on failure the state is `Error` and the model error
//!    is returned.
//!
//! The loop continues while no end was requested, the state is not `Error`,
//! the next event does not lie beyond the configured length and at least one
//! app event is pending.

use std::error::Error;
use std::fmt::Display;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam::channel::{self, Receiver, Sender};
use futures::channel::oneshot;
use slotmap::SlotMap;
use tracing::{debug, error, info, warn};

use crate::command::CommandInbox;
use crate::component::{Component, ComponentTree};
use crate::config::SimConfig;
use crate::error::{ModelError, ModelResult, Panicked, SharedError, SimError};
use crate::event::{Event, EventHandle, PRIO_LOWEST, PRIO_NORMAL};
use crate::id::{ComponentId, ProcessId};
use crate::process::{ProcessCore, ProcessFault, Yield};
use crate::queue::EventQueue;
use crate::realtime;
use crate::results::ResultMap;
use crate::sim::{ErrorAction, RunStats, SimExecState};
use crate::time::{TimeConverter, TimeUnit};

/// Decides how a model error is handled.
pub type ErrorHandler =
    Arc<dyn Fn(&(dyn Error + Send + Sync + 'static)) -> ErrorAction + Send + Sync + 'static>;

/// Receives every record passed to [`Simulation::trace`].
pub type TraceSink = Arc<dyn Fn(&TraceRecord) + Send + Sync + 'static>;

/// One trace line: the simulation time and the formatted fields.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceRecord {
    pub time: f64,
    pub fields: Vec<String>,
}

impl TraceRecord {
    /// Fields joined with tabs.
    pub fn message(&self) -> String {
        self.fields.join("\t")
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Lock a kernel mutex. A panic in model code never leaves kernel state
/// half-updated, so a poisoned lock is still usable.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run model code, turning a panic into a [`Panicked`] error.
pub(crate) fn guarded<T>(f: impl FnOnce() -> ModelResult<T>) -> ModelResult<T> {
    panic::catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|payload| Err(Box::new(Panicked::from_payload(payload))))
}

/// State touched only by the baton holder.
pub(crate) struct Kernel {
    pub(crate) clock: f64,
    pub(crate) current_prio: i32,
    pub(crate) queue: EventQueue,
    pub(crate) processes: SlotMap<ProcessId, Arc<ProcessCore>>,
    /// Process currently holding the baton.
    pub(crate) active: Option<ProcessId>,
    /// Set once the loop stopped; suspension calls fail with `Aborted`.
    pub(crate) stopping: bool,
    pub(crate) results: ResultMap,
    pub(crate) events_processed: u64,
    pub(crate) processes_created: u64,
}

impl Kernel {
    fn new(clock: f64) -> Self {
        Self {
            clock,
            current_prio: PRIO_NORMAL,
            queue: EventQueue::new(),
            processes: SlotMap::with_key(),
            active: None,
            stopping: false,
            results: ResultMap::new(),
            events_processed: 0,
            processes_created: 0,
        }
    }

    /// Insert an event after checking its time against the clock.
    pub(crate) fn schedule(&mut self, event: Event) -> Result<EventHandle, SimError> {
        if event.time.is_nan() {
            return Err(SimError::InvalidTime(event.time));
        }
        if event.time < self.clock {
            return Err(SimError::ScheduleInPast {
                time: event.time,
                now: self.clock,
            });
        }
        Ok(self.queue.insert(event))
    }
}

/// Run-state control. Written by external threads, read by the loop.
struct Control {
    state: SimExecState,
    pause_depth: u32,
    end_requested: bool,
    /// Wall-clock time the loop has spent blocked in `Paused`.
    paused_for: Duration,
}

pub(crate) struct Shared {
    config: SimConfig,
    converter: TimeConverter,
    pub(crate) kernel: Mutex<Kernel>,
    control: Mutex<Control>,
    /// Signalled on every control change.
    changed: Condvar,
    components: Mutex<ComponentTree>,
    inbox: Mutex<CommandInbox>,
    error_handler: Mutex<Option<ErrorHandler>>,
    trace_sink: Mutex<Option<TraceSink>>,
    frames_dropped: AtomicU64,
    /// Process threads report back to the loop on this channel.
    pub(crate) yield_tx: Sender<Yield>,
    pub(crate) yield_rx: Receiver<Yield>,
}

// ---------------------------------------------------------------------------
// Simulation
// ---------------------------------------------------------------------------

/// Handle to a single simulation run.
#[derive(Clone)]
pub struct Simulation {
    pub(crate) shared: Arc<Shared>,
}

impl std::fmt::Debug for Simulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulation")
            .field("name", &self.shared.config.name)
            .field("state", &self.state())
            .field("sim_time", &self.sim_time())
            .finish_non_exhaustive()
    }
}

impl Default for Simulation {
    fn default() -> Self {
        Self::build(SimConfig::default())
    }
}

impl Simulation {
    /// Create a simulation after validating its configuration.
    pub fn new(config: SimConfig) -> Result<Self, SimError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: SimConfig) -> Self {
        let (yield_tx, yield_rx) = channel::unbounded();
        let shared = Shared {
            converter: config.time_converter(),
            kernel: Mutex::new(Kernel::new(config.initial_time)),
            control: Mutex::new(Control {
                state: SimExecState::Initial,
                pause_depth: 0,
                end_requested: false,
                paused_for: Duration::ZERO,
            }),
            changed: Condvar::new(),
            components: Mutex::new(ComponentTree::new(config.name.clone())),
            inbox: Mutex::new(CommandInbox::new()),
            error_handler: Mutex::new(None),
            trace_sink: Mutex::new(None),
            frames_dropped: AtomicU64::new(0),
            yield_tx,
            yield_rx,
            config,
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    /// The validated configuration this run was built from.
    pub fn config(&self) -> &SimConfig {
        &self.shared.config
    }

    /// Name of the run, also the name of the root component.
    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    // -----------------------------------------------------------------------
    // Clock and scheduling
    // -----------------------------------------------------------------------

    /// Current value of the simulation clock.
    pub fn sim_time(&self) -> f64 {
        lock(&self.shared.kernel).clock
    }

    /// Priority of the event being dispatched.
    pub fn current_priority(&self) -> i32 {
        lock(&self.shared.kernel).current_prio
    }

    /// Add an event to the queue. Fails if its time is NaN or before the
    /// current clock.
    ///
    /// Scheduling calls are meant for the baton holder: event handlers,
    /// process bodies, component hooks and code running before the run
    /// starts. Other threads must go through [`submit`](Self::submit) while a
    /// run is in progress, or their events may land behind the clock.
    pub fn schedule(&self, event: Event) -> Result<EventHandle, SimError> {
        lock(&self.shared.kernel).schedule(event)
    }

    /// Schedule an app event at an absolute time with normal priority.
    pub fn schedule_at<F>(&self, time: f64, action: F) -> Result<EventHandle, SimError>
    where
        F: FnOnce(&Simulation) -> ModelResult + Send + 'static,
    {
        self.schedule(Event::new(time, action))
    }

    /// Schedule an app event `delay` time units from now.
    pub fn schedule_in<F>(&self, delay: f64, action: F) -> Result<EventHandle, SimError>
    where
        F: FnOnce(&Simulation) -> ModelResult + Send + 'static,
    {
        let mut kernel = lock(&self.shared.kernel);
        let time = kernel.clock + delay;
        kernel.schedule(Event::new(time, action))
    }

    /// Remove a pending event. Returns false if it already ran or was removed.
    /// Like [`schedule`](Self::schedule), only for the baton holder.
    pub fn unschedule(&self, handle: &EventHandle) -> bool {
        lock(&self.shared.kernel).queue.remove(handle).is_some()
    }

    /// Schedule a recurring utility event. The action runs at `first`, then
    /// every `interval` units for as long as it returns `true`. The returned
    /// handle refers to the first occurrence only.
    pub fn schedule_periodic<F>(
        &self,
        first: f64,
        interval: f64,
        priority: i32,
        action: F,
    ) -> Result<EventHandle, SimError>
    where
        F: FnMut(&Simulation) -> ModelResult<bool> + Send + 'static,
    {
        if !(interval.is_finite() && interval > 0.0) {
            return Err(SimError::InvalidTime(interval));
        }
        self.schedule(periodic_event(first, interval, priority, action))
    }

    // -----------------------------------------------------------------------
    // Run control
    // -----------------------------------------------------------------------

    /// Current execution state. Safe to poll from any thread.
    pub fn state(&self) -> SimExecState {
        lock(&self.shared.control).state
    }

    /// Request a pause. Nested requests need the same number of `unpause`
    /// calls. The loop blocks before the next dequeue.
    pub fn pause(&self) {
        let mut control = lock(&self.shared.control);
        control.pause_depth += 1;
        debug!(depth = control.pause_depth, "pause requested");
    }

    /// Withdraw one pause request. Extra calls are ignored.
    pub fn unpause(&self) {
        let mut control = lock(&self.shared.control);
        control.pause_depth = control.pause_depth.saturating_sub(1);
        debug!(depth = control.pause_depth, "unpause requested");
        if control.pause_depth == 0 {
            self.shared.changed.notify_all();
        }
    }

    /// Ask the loop to stop after the current handler. Wakes a paused loop.
    pub fn end(&self) -> Result<(), SimError> {
        let mut control = lock(&self.shared.control);
        if control.state.is_terminal() {
            return Err(SimError::NotRunning(control.state));
        }
        control.end_requested = true;
        debug!(state = ?control.state, "end requested");
        self.shared.changed.notify_all();
        Ok(())
    }

    /// Whether `end()` was called or the run length was reached.
    pub fn is_end_requested(&self) -> bool {
        lock(&self.shared.control).end_requested
    }

    /// Install the global error handler.
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(&(dyn Error + Send + Sync + 'static)) -> ErrorAction + Send + Sync + 'static,
    {
        *lock(&self.shared.error_handler) = Some(Arc::new(handler));
    }

    /// Remove the global error handler; unhandled model errors abort again.
    pub fn clear_error_handler(&self) {
        *lock(&self.shared.error_handler) = None;
    }

    /// Hand work to the loop from any thread. The command runs at the next
    /// safe point at the current simulation time.
    pub fn submit<F>(&self, label: impl Into<String>, command: F)
    where
        F: FnOnce(&Simulation) -> ModelResult + Send + 'static,
    {
        lock(&self.shared.inbox).push(label, Box::new(command));
    }

    /// Keep the labels of the last `max` applied commands.
    pub fn set_command_history(&self, max: usize) {
        lock(&self.shared.inbox).set_max_history(max);
    }

    /// Applied commands as `(time, label)`.
    pub fn command_history(&self) -> Vec<(f64, String)> {
        lock(&self.shared.inbox).history().to_vec()
    }

    /// Forget the recorded command history.
    pub fn clear_command_history(&self) {
        lock(&self.shared.inbox).clear_history();
    }

    /// Submitted commands still waiting for a safe point.
    pub fn pending_commands(&self) -> usize {
        lock(&self.shared.inbox).pending_count()
    }

    // -----------------------------------------------------------------------
    // Results, statistics and tracing
    // -----------------------------------------------------------------------

    /// Add or overwrite a result entry.
    pub fn add_result(&self, name: impl Into<String>, value: impl Into<serde_json::Value>) {
        lock(&self.shared.kernel).results.insert(name, value);
    }

    /// Snapshot of the result map.
    pub fn results(&self) -> ResultMap {
        lock(&self.shared.kernel).results.clone()
    }

    /// Number of events dispatched so far, utility events included.
    pub fn events_processed(&self) -> u64 {
        lock(&self.shared.kernel).events_processed
    }

    /// Snapshot of the clock and queue counters.
    pub fn stats(&self) -> RunStats {
        let kernel = lock(&self.shared.kernel);
        RunStats {
            sim_time: kernel.clock,
            events_processed: kernel.events_processed,
            pending_app_events: kernel.queue.app_event_count(),
            pending_utility_events: kernel.queue.utility_event_count(),
        }
    }

    /// Real-time frames that could not keep pace with the wall clock.
    pub fn frames_dropped(&self) -> u64 {
        self.shared.frames_dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn record_dropped_frame(&self) -> u64 {
        self.shared.frames_dropped.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Emit a trace record at the current simulation time.
    pub fn trace(&self, fields: &[&dyn Display]) {
        let record = TraceRecord {
            time: self.sim_time(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
        };
        tracing::trace!(target: "simforge::trace", time = record.time, "{}", record.message());
        let sink = lock(&self.shared.trace_sink).clone();
        if let Some(sink) = sink {
            sink(&record);
        }
    }

    /// Also deliver trace records to `sink`, replacing any previous sink.
    pub fn set_trace_sink<F>(&self, sink: F)
    where
        F: Fn(&TraceRecord) + Send + Sync + 'static,
    {
        *lock(&self.shared.trace_sink) = Some(Arc::new(sink));
    }

    // -----------------------------------------------------------------------
    // Time conversion
    // -----------------------------------------------------------------------

    /// The mapping between the clock and calendar time.
    pub fn time_converter(&self) -> &TimeConverter {
        &self.shared.converter
    }

    /// Absolute simulation time of a calendar instant.
    pub fn to_sim_time_instant(&self, instant: DateTime<Utc>) -> f64 {
        self.shared.converter.instant_to_sim(instant)
    }

    /// Relative simulation time of a wall-clock duration.
    pub fn to_sim_time_duration(&self, duration: Duration) -> f64 {
        self.shared.converter.duration_to_sim(duration)
    }

    /// Relative simulation time of `count` calendar units.
    pub fn to_sim_time_units(&self, count: f64, unit: TimeUnit) -> f64 {
        self.shared.converter.units_to_sim(count, unit)
    }

    /// Calendar instant of an absolute simulation time.
    pub fn sim_time_to_instant(&self, sim_time: f64) -> DateTime<Utc> {
        self.shared.converter.sim_to_instant(sim_time)
    }

    /// Calendar instant of the current clock.
    pub fn now_instant(&self) -> DateTime<Utc> {
        self.sim_time_to_instant(self.sim_time())
    }

    /// Schedule an app event a wall-clock duration from now.
    pub fn schedule_in_duration<F>(&self, delay: Duration, action: F) -> Result<EventHandle, SimError>
    where
        F: FnOnce(&Simulation) -> ModelResult + Send + 'static,
    {
        self.schedule_in(self.to_sim_time_duration(delay), action)
    }

    /// Schedule an app event `count` calendar units from now.
    pub fn schedule_in_units<F>(
        &self,
        count: f64,
        unit: TimeUnit,
        action: F,
    ) -> Result<EventHandle, SimError>
    where
        F: FnOnce(&Simulation) -> ModelResult + Send + 'static,
    {
        self.schedule_in(self.to_sim_time_units(count, unit), action)
    }

    /// Schedule an app event at a calendar instant. Fails with
    /// `ScheduleInPast` if the instant maps before the current clock.
    pub fn schedule_at_instant<F>(
        &self,
        instant: DateTime<Utc>,
        action: F,
    ) -> Result<EventHandle, SimError>
    where
        F: FnOnce(&Simulation) -> ModelResult + Send + 'static,
    {
        self.schedule_at(self.to_sim_time_instant(instant), action)
    }

    // -----------------------------------------------------------------------
    // Components
    // -----------------------------------------------------------------------

    /// The implicit root, named after the run.
    pub fn root_component(&self) -> ComponentId {
        lock(&self.shared.components).root()
    }

    /// Attach a component below the root.
    pub fn add_component<C: Component + 'static>(
        &self,
        name: impl Into<String>,
        component: C,
    ) -> Result<ComponentId, SimError> {
        let mut tree = lock(&self.shared.components);
        let root = tree.root();
        Ok(tree.add_child(root, name, component)?)
    }

    /// Attach a component below `parent`. Names must be unique among
    /// siblings.
    pub fn add_child<C: Component + 'static>(
        &self,
        parent: ComponentId,
        name: impl Into<String>,
        component: C,
    ) -> Result<ComponentId, SimError> {
        Ok(lock(&self.shared.components).add_child(parent, name, component)?)
    }

    /// Resolve a dotted path such as `sim.shop.saw`, starting at the root.
    pub fn component_by_hierarchical_name(&self, path: &str) -> Option<ComponentId> {
        lock(&self.shared.components).component_by_hierarchical_name(path)
    }

    /// Borrow the component tree. Must not be called re-entrantly.
    pub fn with_components<R>(&self, f: impl FnOnce(&mut ComponentTree) -> R) -> R {
        f(&mut lock(&self.shared.components))
    }

    /// Typed access to one component. `None` if the id is unknown, the type
    /// does not match, or the component is running one of its own hooks.
    pub fn with_component<T, R>(&self, id: ComponentId, f: impl FnOnce(&mut T) -> R) -> Option<R>
    where
        T: Component + 'static,
    {
        lock(&self.shared.components).get_mut::<T>(id).map(f)
    }

    // -----------------------------------------------------------------------
    // Running
    // -----------------------------------------------------------------------

    /// Run to completion on the calling thread.
    pub fn perform_run(&self) -> Result<ResultMap, SimError> {
        {
            let mut control = lock(&self.shared.control);
            if control.state != SimExecState::Initial {
                return Err(SimError::AlreadyRun(control.state));
            }
            control.state = SimExecState::Running;
        }
        info!(sim = %self.name(), start = self.sim_time(), "run started");

        let outcome = self.start().and_then(|()| self.event_loop());
        self.finish(outcome)
    }

    /// Run on a background thread. The returned handle resolves to the run's
    /// outcome.
    pub fn perform_run_async(&self) -> Result<RunHandle, SimError> {
        let (tx, rx) = oneshot::channel();
        let sim = self.clone();
        let thread = thread::Builder::new()
            .name(format!("{}-loop", self.name()))
            .spawn(move || {
                let _ = tx.send(sim.perform_run());
            })?;
        Ok(RunHandle {
            rx,
            thread: Some(thread),
        })
    }

    fn start(&self) -> Result<(), SimError> {
        let order = lock(&self.shared.components).top_down();
        self.run_component_hook(&order, "init", |c, sim| c.init(sim))?;
        self.run_component_hook(&order, "sim_start", |c, sim| c.sim_start(sim))?;

        if let Some(length) = self.shared.config.sim_length {
            let end = Event::new(length, |sim: &Simulation| {
                sim.request_end();
                Ok(())
            })
            .with_priority(PRIO_LOWEST)
            .utility()
            .described("end of run");
            self.schedule(end)?;
        }
        if let Some(rt) = &self.shared.config.real_time {
            realtime::install(self, rt)?;
        }
        Ok(())
    }

    fn event_loop(&self) -> Result<(), SimError> {
        loop {
            self.apply_commands()?;
            self.await_unpaused();
            self.apply_commands()?;

            let Some((handle, event)) = self.next_event() else {
                break;
            };
            let (description, action) = event.into_parts();
            if let Err(err) = guarded(|| action(self)) {
                let origin = description.unwrap_or_else(|| format!("event {}", handle.sequence()));
                self.handle_model_error(origin, err)?;
            }
        }
        Ok(())
    }

    /// Pop the next event if the run should continue, advancing the clock.
    fn next_event(&self) -> Option<(EventHandle, Event)> {
        {
            let control = lock(&self.shared.control);
            if control.end_requested || control.state == SimExecState::Error {
                return None;
            }
        }
        let mut kernel = lock(&self.shared.kernel);
        if kernel.queue.app_event_count() == 0 {
            return None;
        }
        let next = kernel.queue.peek_next()?.time();
        if self.shared.config.sim_length.is_some_and(|len| next > len) {
            return None;
        }
        let (handle, event) = kernel.queue.pop_next()?;
        kernel.clock = kernel.clock.max(handle.time());
        kernel.current_prio = handle.priority();
        kernel.events_processed += 1;
        Some((handle, event))
    }

    /// Block while a pause is pending. `end()` also wakes the loop.
    fn await_unpaused(&self) {
        let mut control = lock(&self.shared.control);
        if control.pause_depth == 0 || control.end_requested {
            return;
        }
        control.state = SimExecState::Paused;
        debug!(time = self.sim_time(), "paused");
        let paused_at = Instant::now();
        while control.pause_depth > 0 && !control.end_requested {
            control = self
                .shared
                .changed
                .wait(control)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if control.state == SimExecState::Paused {
            control.state = SimExecState::Running;
        }
        let paused = paused_at.elapsed();
        control.paused_for += paused;
        debug!(paused_ms = paused.as_millis() as u64, "resumed");
    }

    fn apply_commands(&self) -> Result<(), SimError> {
        let now = self.sim_time();
        let commands = lock(&self.shared.inbox).drain(now);
        for pending in commands {
            debug!(label = %pending.label, "applying command");
            let command = pending.command;
            if let Err(err) = guarded(|| command(self)) {
                self.handle_model_error(format!("command '{}'", pending.label), err)?;
            }
        }
        Ok(())
    }

    /// Sleep for up to `timeout` unless `end()` is called meanwhile.
    pub(crate) fn sleep_interruptible(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut control = lock(&self.shared.control);
        while !control.end_requested {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            control = self
                .shared
                .changed
                .wait_timeout(control, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    /// Total wall-clock time the loop has spent paused so far.
    pub(crate) fn paused_wall_time(&self) -> Duration {
        lock(&self.shared.control).paused_for
    }

    /// `end()` for kernel use: never fails.
    fn request_end(&self) {
        let mut control = lock(&self.shared.control);
        control.end_requested = true;
        self.shared.changed.notify_all();
    }

    fn set_state(&self, state: SimExecState) {
        let mut control = lock(&self.shared.control);
        control.state = state;
        self.shared.changed.notify_all();
    }

    // -----------------------------------------------------------------------
    // Error routing
    // -----------------------------------------------------------------------

    /// Offer a model error to the process-local handler (for process
    /// failures) or the global handler. Returns the fatal error on abort.
    pub(crate) fn handle_model_error(&self, origin: String, err: ModelError) -> Result<(), SimError> {
        let (origin, local, source): (String, _, SharedError) = match err.downcast::<ProcessFault>()
        {
            Ok(fault) => (format!("process '{}'", fault.name), fault.handler, fault.source),
            Err(err) => (origin, None, Arc::from(err)),
        };

        let fatal = source
            .downcast_ref::<SimError>()
            .is_some_and(SimError::is_fatal);
        let action = if fatal {
            ErrorAction::Abort
        } else {
            let handler = local.or_else(|| lock(&self.shared.error_handler).clone());
            handler.map_or(ErrorAction::Abort, |h| h(source.as_ref()))
        };

        let time = self.sim_time();
        match action {
            ErrorAction::Recover => {
                warn!(time, %origin, error = %source, "model error recovered");
                Ok(())
            }
            ErrorAction::Abort => {
                error!(time, %origin, error = %source, "model error aborts the run");
                self.set_state(SimExecState::Error);
                Err(SimError::Model {
                    time,
                    origin,
                    source,
                })
            }
        }
    }

    // -----------------------------------------------------------------------
    // Component lifecycle
    // -----------------------------------------------------------------------

    /// Run a hook on each component in `order`. The component is detached
    /// from the tree while its hook runs, so hooks may use the tree freely.
    fn run_component_hook<F>(&self, order: &[ComponentId], phase: &str, hook: F) -> Result<(), SimError>
    where
        F: Fn(&mut dyn Component, &Simulation) -> ModelResult,
    {
        for &id in order {
            let (name, taken) = {
                let mut tree = lock(&self.shared.components);
                (tree.hierarchical_name(id).unwrap_or_default(), tree.take(id))
            };
            let Some(mut component) = taken else {
                continue;
            };
            let outcome = guarded(|| hook(component.as_mut(), self));
            lock(&self.shared.components).restore(id, component);
            if let Err(err) = outcome {
                self.handle_model_error(format!("{phase} of component '{name}'"), err)?;
            }
        }
        Ok(())
    }

    fn finish(&self, outcome: Result<(), SimError>) -> Result<ResultMap, SimError> {
        self.shutdown_processes();

        let outcome = outcome.and_then(|()| {
            let order = lock(&self.shared.components).bottom_up();
            self.run_component_hook(&order, "sim_end", |c, sim| c.sim_end(sim))?;
            let mut produced = ResultMap::new();
            lock(&self.shared.components).produce_results(&mut produced);
            lock(&self.shared.kernel).results.merge(produced);
            Ok(())
        });

        let results = {
            let mut kernel = lock(&self.shared.kernel);
            let clock = kernel.clock;
            let events = kernel.events_processed;
            kernel.results.insert("simTime", clock);
            kernel.results.insert("eventsProcessed", events);
            kernel
                .results
                .insert("expAborted", u64::from(outcome.is_err()));
            if self.shared.config.real_time.is_some() {
                kernel
                    .results
                    .insert("realTime.framesDropped", self.frames_dropped());
            }
            kernel.results.clone()
        };

        match outcome {
            Ok(()) => {
                self.set_state(SimExecState::Finished);
                info!(
                    sim = %self.name(),
                    time = self.sim_time(),
                    events = self.events_processed(),
                    "run finished"
                );
                Ok(results)
            }
            Err(err) => {
                self.set_state(SimExecState::Error);
                error!(sim = %self.name(), time = self.sim_time(), error = %err, "run failed");
                Err(err)
            }
        }
    }
}

fn periodic_event<F>(time: f64, interval: f64, priority: i32, mut action: F) -> Event
where
    F: FnMut(&Simulation) -> ModelResult<bool> + Send + 'static,
{
    Event::new(time, move |sim: &Simulation| {
        if action(sim)? {
            sim.schedule(periodic_event(time + interval, interval, priority, action))?;
        }
        Ok(())
    })
    .with_priority(priority)
    .utility()
    .described("periodic")
}

// ---------------------------------------------------------------------------
// RunHandle
// ---------------------------------------------------------------------------

/// Outcome of [`Simulation::perform_run_async`]. Await it, or block with
/// [`wait`](Self::wait).
#[derive(Debug)]
pub struct RunHandle {
    rx: oneshot::Receiver<Result<ResultMap, SimError>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl RunHandle {
    /// Block until the run completes.
    pub fn wait(self) -> Result<ResultMap, SimError> {
        futures::executor::block_on(self)
    }

    /// Whether the run thread has exited.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(|t| t.is_finished())
    }
}

impl Future for RunHandle {
    type Output = Result<ResultMap, SimError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(outcome) => {
                if let Some(thread) = self.thread.take() {
                    let _ = thread.join();
                }
                Poll::Ready(outcome.unwrap_or(Err(SimError::Cancelled)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
