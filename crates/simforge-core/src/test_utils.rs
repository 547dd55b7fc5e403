//! Shared test helpers for integration tests and benchmarks.
//!
//! Gated behind `#[cfg(any(test, feature = "test-utils"))]` so these helpers
//! are available in unit tests, integration tests, and benchmarks (via the
//! `test-utils` feature).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::event::EventAction;
use crate::sim::SimExecState;
use crate::simulation::Simulation;

// ===========================================================================
// Errors
// ===========================================================================

/// A model error with a fixed message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct TestError(pub &'static str);

// ===========================================================================
// Counter
// ===========================================================================

/// Shared counter that event actions can bump.
#[derive(Debug, Clone, Default)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    /// An event action that increments this counter.
    pub fn incrementer(&self) -> EventAction {
        let counter = self.clone();
        Box::new(move |_: &Simulation| {
            counter.increment();
            Ok(())
        })
    }
}

// ===========================================================================
// Recorder
// ===========================================================================

/// Records `(sim_time, label)` pairs in dispatch order.
#[derive(Debug, Clone, Default)]
pub struct Recorder(Arc<Mutex<Vec<(f64, String)>>>);

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, time: f64, label: impl Into<String>) {
        self.0.lock().unwrap().push((time, label.into()));
    }

    /// An event action that records `label` at the dispatch time.
    pub fn recorder(&self, label: impl Into<String>) -> EventAction {
        let this = self.clone();
        let label = label.into();
        Box::new(move |sim: &Simulation| {
            this.record(sim.sim_time(), label);
            Ok(())
        })
    }

    pub fn entries(&self) -> Vec<(f64, String)> {
        self.0.lock().unwrap().clone()
    }

    pub fn labels(&self) -> Vec<String> {
        self.entries().into_iter().map(|(_, l)| l).collect()
    }

    pub fn times(&self) -> Vec<f64> {
        self.entries().into_iter().map(|(t, _)| t).collect()
    }
}

// ===========================================================================
// Polling
// ===========================================================================

/// Poll `sim.state()` until it equals `state` or `timeout` elapses.
pub fn wait_for_state(sim: &Simulation, state: SimExecState, timeout: Duration) -> bool {
    wait_until(timeout, || sim.state() == state)
}

/// Poll `condition` every millisecond until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}
