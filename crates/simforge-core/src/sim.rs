//! Run-state and process-state types.
//!
//! A [`Simulation`](crate::simulation::Simulation) moves through
//! [`SimExecState`] exactly once: `Initial -> Running <-> Paused -> Finished`
//! (or `Error`). Processes move through [`ProcessState`] on every
//! suspension and resumption.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Simulation state
// ---------------------------------------------------------------------------

/// Execution state of a simulation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SimExecState {
    /// Constructed, not yet run.
    Initial,
    /// The event loop is dispatching events.
    Running,
    /// The event loop is blocked between two events waiting for `unpause`.
    Paused,
    /// The run completed normally.
    Finished,
    /// The run stopped because of an unhandled or fatal error.
    Error,
}

impl SimExecState {
    /// Whether the run is over (finished or failed).
    pub fn is_terminal(self) -> bool {
        matches!(self, SimExecState::Finished | SimExecState::Error)
    }

    /// Whether the event loop is active (running or paused).
    pub fn is_active(self) -> bool {
        matches!(self, SimExecState::Running | SimExecState::Paused)
    }
}

// ---------------------------------------------------------------------------
// Process state
// ---------------------------------------------------------------------------

/// Lifecycle state of a process.
///
/// `Created -> Scheduled -> Running -> {Passive, Scheduled} -> Running -> ...
/// -> Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessState {
    /// Constructed; no activation event exists yet.
    Created,
    /// A wake-up event for this process is pending in the queue.
    Scheduled,
    /// The process body currently holds the baton.
    Running,
    /// Suspended indefinitely until another context calls `resume`.
    Passive,
    /// The body returned (or failed). Terminal.
    Terminated,
}

// ---------------------------------------------------------------------------
// Error handling decision
// ---------------------------------------------------------------------------

/// Decision returned by an error handler for a model error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorAction {
    /// The error is handled; the loop continues with the next event.
    Recover,
    /// The run stops in the `Error` state and the error is returned to the
    /// caller of the run.
    Abort,
}

// ---------------------------------------------------------------------------
// Run statistics
// ---------------------------------------------------------------------------

/// Snapshot of queue and dispatch counters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RunStats {
    /// Current simulation time.
    pub sim_time: f64,
    /// Events dispatched so far.
    pub events_processed: u64,
    /// Pending events that keep the run alive.
    pub pending_app_events: usize,
    /// Pending housekeeping events.
    pub pending_utility_events: usize,
}
