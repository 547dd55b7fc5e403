//! Counting resource with a FIFO wait queue.
//!
//! A process that finds no free unit joins the queue and suspends. Release
//! hands the unit straight to the head of the queue, so a unit freed at time
//! `t` cannot be taken by a process that asks later at the same time.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::SimError;
use crate::process::{ProcessContext, ProcessCore};
use crate::simulation::{Simulation, lock};

#[derive(Debug)]
struct ResourceState {
    capacity: usize,
    in_use: usize,
    waiters: VecDeque<Arc<ProcessCore>>,
}

/// A pool of identical units, e.g. the machines of a work station.
#[derive(Debug, Clone)]
pub struct Resource {
    name: Arc<str>,
    state: Arc<Mutex<ResourceState>>,
}

impl Resource {
    /// A resource with `capacity` units, all free.
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: Arc::from(name.into()),
            state: Arc::new(Mutex::new(ResourceState {
                capacity,
                in_use: 0,
                waiters: VecDeque::new(),
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        lock(&self.state).capacity
    }

    /// Units currently held.
    pub fn in_use(&self) -> usize {
        lock(&self.state).in_use
    }

    /// Processes waiting for a unit.
    pub fn queue_len(&self) -> usize {
        lock(&self.state).waiters.len()
    }

    /// Take one unit, suspending the calling process until one is handed
    /// over.
    pub fn seize(&self, ctx: &ProcessContext) -> Result<(), SimError> {
        let me = ctx.core();
        {
            let mut state = lock(&self.state);
            if state.in_use < state.capacity && state.waiters.is_empty() {
                state.in_use += 1;
                return Ok(());
            }
            state.waiters.push_back(Arc::clone(me));
        }
        debug!(resource = %self.name, process = %ctx.name(), "waiting for unit");

        loop {
            if let Err(err) = ctx.suspend() {
                lock(&self.state).waiters.retain(|w| !Arc::ptr_eq(w, me));
                return Err(err);
            }
            // Woken by someone else while still queued.
            let queued = lock(&self.state).waiters.iter().any(|w| Arc::ptr_eq(w, me));
            if !queued {
                return Ok(());
            }
        }
    }

    /// Return one unit. The longest waiter, if any, receives it and is
    /// resumed at the current time.
    pub fn release(&self, sim: &Simulation) -> Result<(), SimError> {
        let next = {
            let mut state = lock(&self.state);
            if state.in_use == 0 {
                return Err(SimError::ResourceNotHeld {
                    name: self.name.to_string(),
                });
            }
            match state.waiters.pop_front() {
                Some(next) => next,
                None => {
                    state.in_use -= 1;
                    return Ok(());
                }
            }
        };
        debug!(resource = %self.name, process = %next.name, "unit handed over");
        sim.resume_core(&next)
    }
}
