//! Inbox for work submitted from outside the simulation.
//!
//! Threads that do not hold the baton (UI, a test driver, a network handler)
//! must not touch the queue or clock directly. They submit commands instead;
//! the event loop drains the inbox at its next safe point, before dequeuing
//! the next event, and runs each command as if it were an event handler at
//! the current simulation time.

use crate::error::ModelResult;
use crate::simulation::Simulation;

/// A unit of externally submitted work.
pub type Command = Box<dyn FnOnce(&Simulation) -> ModelResult + Send + 'static>;

/// A command waiting to be applied, with a label for logs and history.
pub struct PendingCommand {
    pub label: String,
    pub command: Command,
}

impl std::fmt::Debug for PendingCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCommand")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// CommandInbox
// ---------------------------------------------------------------------------

/// Commands waiting for the next safe point.
///
/// Supports optional history tracking of applied command labels.
#[derive(Debug, Default)]
pub struct CommandInbox {
    pending: Vec<PendingCommand>,
    /// Applied commands: (simulation time, label).
    history: Vec<(f64, String)>,
    /// Maximum history entries to retain. 0 = no history.
    max_history: usize,
}

impl CommandInbox {
    /// Create an empty inbox that keeps no history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a command for the next safe point.
    pub fn push(&mut self, label: impl Into<String>, command: Command) {
        self.pending.push(PendingCommand {
            label: label.into(),
            command,
        });
    }

    /// Take all pending commands in submission order and record them in the
    /// history at `time`.
    pub fn drain(&mut self, time: f64) -> Vec<PendingCommand> {
        let commands: Vec<PendingCommand> = self.pending.drain(..).collect();

        if self.max_history > 0 {
            for cmd in &commands {
                self.history.push((time, cmd.label.clone()));
            }
            let excess = self.history.len().saturating_sub(self.max_history);
            if excess > 0 {
                self.history.drain(..excess);
            }
        }

        commands
    }

    /// Number of commands not yet applied.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Applied commands, oldest first.
    pub fn history(&self) -> &[(f64, String)] {
        &self.history
    }

    /// Change the history limit, dropping the oldest entries beyond it.
    pub fn set_max_history(&mut self, max_history: usize) {
        self.max_history = max_history;
        let excess = self.history.len().saturating_sub(max_history);
        self.history.drain(..excess);
    }

    /// Forget all recorded history.
    pub fn clear_history(&mut self) {
        self.history.clear();
    }
}
