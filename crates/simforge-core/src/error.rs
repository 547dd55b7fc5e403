//! Kernel error taxonomy.
//!
//! Usage errors (scheduling into the past, process protocol violations,
//! run-state misuse) are returned immediately to the caller and never pass
//! through the error-handler chain. Model errors, i.e. anything returned by an
//! event handler or process body, are routed through the local and global
//! handlers and only surface as [`SimError::Model`] when fatal.

use std::any::Any;
use std::error::Error;
use std::sync::Arc;

use crate::component::ComponentError;
use crate::config::ConfigError;
use crate::sim::{ProcessState, SimExecState};

/// Error type returned by model code (event handlers, process bodies,
/// component hooks). Any `Error + Send + Sync` converts into it with `?`.
pub type ModelError = Box<dyn Error + Send + Sync + 'static>;

/// Result alias for model code.
pub type ModelResult<T = ()> = Result<T, ModelError>;

/// A captured failure that can be observed more than once (process results,
/// fatal run errors).
pub type SharedError = Arc<dyn Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("cannot schedule at t={time}: current time is t={now}")]
    ScheduleInPast { time: f64, now: f64 },

    #[error("invalid simulation time: {0}")]
    InvalidTime(f64),

    #[error("process '{name}' is {state:?}, expected Passive")]
    NotPassive { name: String, state: ProcessState },

    #[error("process '{name}' can only be suspended from its own context")]
    ForeignSuspend { name: String },

    #[error("process '{name}' has not terminated (state {state:?})")]
    ResultNotReady { name: String, state: ProcessState },

    #[error("result of process '{name}' was already taken")]
    ResultTaken { name: String },

    #[error("process '{name}' cannot be activated from state {state:?}")]
    InvalidActivation { name: String, state: ProcessState },

    #[error("process '{name}' cannot join itself")]
    JoinSelf { name: String },

    #[error("resource '{name}' released more often than seized")]
    ResourceNotHeld { name: String },

    #[error("process '{name}' failed: {source}")]
    ProcessFailed {
        name: String,
        #[source]
        source: SharedError,
    },

    #[error("process '{name}' aborted: the run is over")]
    Aborted { name: String },

    #[error("simulation cannot be run again (state {0:?})")]
    AlreadyRun(SimExecState),

    #[error("simulation is not running (state {0:?})")]
    NotRunning(SimExecState),

    #[error("model error at t={time} in {origin}: {source}")]
    Model {
        time: f64,
        origin: String,
        #[source]
        source: SharedError,
    },

    #[error("real-time pacing failed: {0}")]
    Pacing(String),

    #[error("failed to start process thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Component(#[from] ComponentError),

    #[error("run was dropped before producing a result")]
    Cancelled,
}

impl SimError {
    /// Errors that indicate a usage bug or a kernel failure. These are never
    /// offered to error handlers, even when a handler propagates them with `?`.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SimError::ScheduleInPast { .. }
                | SimError::InvalidTime(_)
                | SimError::NotPassive { .. }
                | SimError::ForeignSuspend { .. }
                | SimError::ResultNotReady { .. }
                | SimError::ResultTaken { .. }
                | SimError::InvalidActivation { .. }
                | SimError::JoinSelf { .. }
                | SimError::ResourceNotHeld { .. }
                | SimError::AlreadyRun(_)
                | SimError::NotRunning(_)
                | SimError::Pacing(_)
                | SimError::Spawn(_)
        )
    }

    /// The model error behind a `Model` or `ProcessFailed` error.
    pub fn model_source(&self) -> Option<&(dyn Error + Send + Sync + 'static)> {
        match self {
            SimError::Model { source, .. } | SimError::ProcessFailed { source, .. } => {
                Some(source.as_ref())
            }
            _ => None,
        }
    }
}

/// A panic caught inside an event handler or process body.
#[derive(Debug, Clone, thiserror::Error)]
#[error("panicked: {0}")]
pub struct Panicked(pub String);

impl Panicked {
    pub(crate) fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "<non-string panic payload>".to_string()
        };
        Panicked(message)
    }
}
