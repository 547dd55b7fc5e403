//! SimForge Core -- a process-oriented discrete-event simulation kernel.
//!
//! Model code is written as ordinary sequential logic (`wait_for`,
//! `suspend`, `join`, `seize`) while the kernel guarantees that, underneath,
//! only one event handler or process body runs at a time, in strict
//! `(time, priority, insertion)` order.
//!
//! # Run Pipeline
//!
//! A call to [`simulation::Simulation::perform_run`] goes through:
//!
//! 1. **Start** -- Component `init` and `sim_start` hooks run top-down; the
//!    end-of-run event and the real-time pacer are scheduled.
//! 2. **Loop** -- Submitted commands are applied, pauses are honored, and the
//!    earliest event is popped, the clock advanced to its time and its action
//!    invoked.
//! 3. **Shutdown** -- Pending events are discarded and suspended processes
//!    are aborted.
//! 4. **Finish** -- `sim_end` and `produce_results` run bottom-up and the
//!    standard results (`simTime`, `eventsProcessed`, `expAborted`) are added.
//!
//! # Processes
//!
//! ```rust,ignore
//! let sim = Simulation::default();
//! let worker = sim.activate_named("worker", |ctx: &ProcessContext| {
//!     ctx.wait_for(5.0)?;
//!     Ok(42)
//! })?;
//! sim.perform_run()?;
//! assert_eq!(worker.get()?, 42);
//! ```
//!
//! # Key Types
//!
//! - [`simulation::Simulation`] -- Run driver: clock, queue, run control,
//!   error routing and results.
//! - [`event::Event`] -- Time/priority ordered unit of work.
//! - [`process::Process`] -- Handle to a suspendable body;
//!   [`process::ProcessContext`] is the capability that lets a body block.
//! - [`component::ComponentTree`] -- Hierarchy of model parts with lifecycle
//!   hooks and scoped results.
//! - [`resource::Resource`] -- Counting resource with a FIFO wait queue.
//! - [`config::SimConfig`] -- Run configuration, loadable from TOML.

pub mod command;
pub mod component;
pub mod config;
pub mod error;
pub mod event;
pub mod id;
pub mod process;
pub mod queue;
mod realtime;
pub mod resource;
pub mod results;
pub mod sim;
pub mod simulation;
pub mod time;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
