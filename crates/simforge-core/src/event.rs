//! Scheduled events.
//!
//! An [`Event`] couples a simulation time and priority with a one-shot
//! action. Scheduling assigns an [`EventSeq`] and returns an [`EventHandle`]
//! that doubles as the queue's ordering key, so the handle alone is enough to
//! unschedule a pending event.
//!
//! # Ordering
//!
//! Events are dispatched by `time` ascending, then `priority` ascending (a
//! lower value runs first), then by insertion sequence. Identical inputs
//! therefore replay identically.
//!
//! # App vs. utility events
//!
//! Only *app* events keep a run alive. *Utility* events (periodic
//! housekeeping, real-time pacing, the end-of-run marker) are dispatched
//! while app events remain, but never extend a run on their own.

use std::cmp::Ordering;

use crate::error::ModelResult;
use crate::id::EventSeq;
use crate::simulation::Simulation;

// ---------------------------------------------------------------------------
// Priorities
// ---------------------------------------------------------------------------

pub const PRIO_HIGHEST: i32 = -20_000;
pub const PRIO_VERY_HIGH: i32 = -10_000;
pub const PRIO_HIGH: i32 = -1_000;
pub const PRIO_NORMAL: i32 = 0;
pub const PRIO_LOW: i32 = 1_000;
pub const PRIO_VERY_LOW: i32 = 10_000;
pub const PRIO_LOWEST: i32 = 20_000;

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// The handler run when an event is dispatched.
pub type EventAction = Box<dyn FnOnce(&Simulation) -> ModelResult + Send + 'static>;

/// A unit of work scheduled at a simulation time.
pub struct Event {
    /// Simulation time at which the event fires.
    pub time: f64,
    /// Tie-break between events at the same time. Lower runs first.
    pub priority: i32,
    /// Whether this event keeps the run alive.
    pub app_event: bool,
    /// Optional label used in logs and error origins.
    pub description: Option<String>,
    action: EventAction,
}

impl Event {
    /// Create an app event with normal priority.
    pub fn new<F>(time: f64, action: F) -> Self
    where
        F: FnOnce(&Simulation) -> ModelResult + Send + 'static,
    {
        Self {
            time,
            priority: PRIO_NORMAL,
            app_event: true,
            description: None,
            action: Box::new(action),
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Mark as a utility event: dispatched normally, but its presence alone
    /// does not keep the run alive.
    pub fn utility(mut self) -> Self {
        self.app_event = false;
        self
    }

    /// Attach a diagnostic label.
    pub fn described(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub(crate) fn into_parts(self) -> (Option<String>, EventAction) {
        (self.description, self.action)
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("time", &self.time)
            .field("priority", &self.priority)
            .field("app_event", &self.app_event)
            .field("description", &self.description)
            .field("action", &"<fn>")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// EventHandle
// ---------------------------------------------------------------------------

/// Identifies a scheduled event. Also the queue's ordering key.
#[derive(Debug, Clone, Copy)]
pub struct EventHandle {
    time: f64,
    priority: i32,
    seq: EventSeq,
}

impl EventHandle {
    pub(crate) fn new(time: f64, priority: i32, seq: EventSeq) -> Self {
        Self {
            time,
            priority,
            seq,
        }
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Insertion order among events with equal time and priority.
    pub fn sequence(&self) -> EventSeq {
        self.seq
    }
}

impl Ord for EventHandle {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .total_cmp(&other.time)
            .then(self.priority.cmp(&other.priority))
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for EventHandle {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for EventHandle {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for EventHandle {}
