//! Run configuration.
//!
//! Supplied at construction and not part of any persisted format. Every field
//! has a default, so a TOML file only needs the values it changes:
//!
//! ```toml
//! name = "shop"
//! sim_length = 480.0
//! millis_per_time_unit = 60000.0
//!
//! [real_time]
//! factor = 60.0
//! interval = 5.0
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::time::{TimeConverter, TimeUnit};

/// Errors from loading or validating a [`SimConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Pacing of simulated time against the wall clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealTimeConfig {
    /// Speed relative to the wall clock: 1.0 runs in real time, 60.0 runs
    /// an hour of simulated time per wall-clock minute.
    pub factor: f64,
    /// Simulation time between two synchronization points.
    pub interval: f64,
}

impl Default for RealTimeConfig {
    fn default() -> Self {
        Self {
            factor: 1.0,
            interval: 1.0,
        }
    }
}

/// Configuration of a single simulation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Name of the root component and prefix of component result keys.
    pub name: String,
    /// Clock value at run start.
    pub initial_time: f64,
    /// Simulation time at which the run is ended. `None` runs until no app
    /// events remain.
    pub sim_length: Option<f64>,
    /// Wall-clock milliseconds represented by one simulation time unit.
    pub millis_per_time_unit: f64,
    /// Instant corresponding to simulation time 0.
    pub epoch: DateTime<Utc>,
    /// Optional real-time pacing.
    pub real_time: Option<RealTimeConfig>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            name: "sim".to_string(),
            initial_time: 0.0,
            sim_length: None,
            millis_per_time_unit: TimeUnit::Minutes.as_millis(),
            epoch: DateTime::<Utc>::UNIX_EPOCH,
            real_time: None,
        }
    }
}

impl SimConfig {
    /// Default settings under a different run name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_initial_time(mut self, time: f64) -> Self {
        self.initial_time = time;
        self
    }

    /// Stop the run once the next event lies beyond `length`.
    pub fn with_sim_length(mut self, length: f64) -> Self {
        self.sim_length = Some(length);
        self
    }

    /// Wall-clock milliseconds represented by one simulation time unit.
    pub fn with_time_scale(mut self, millis_per_time_unit: f64) -> Self {
        self.millis_per_time_unit = millis_per_time_unit;
        self
    }

    pub fn with_epoch(mut self, epoch: DateTime<Utc>) -> Self {
        self.epoch = epoch;
        self
    }

    /// Pace the run against the wall clock, syncing every `interval` units.
    pub fn with_real_time(mut self, factor: f64, interval: f64) -> Self {
        self.real_time = Some(RealTimeConfig { factor, interval });
        self
    }

    /// Parse a TOML document and validate it.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: SimConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field, reporting the first invalid one.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() || self.name.contains('.') {
            return Err(invalid("name", "must be non-empty and contain no '.'"));
        }
        if !self.initial_time.is_finite() {
            return Err(invalid("initial_time", "must be finite"));
        }
        if !(self.millis_per_time_unit.is_finite() && self.millis_per_time_unit > 0.0) {
            return Err(invalid("millis_per_time_unit", "must be positive and finite"));
        }
        if let Some(length) = self.sim_length {
            if length.is_nan() || length < self.initial_time {
                return Err(invalid(
                    "sim_length",
                    format!("{length} is before initial_time {}", self.initial_time),
                ));
            }
        }
        if let Some(rt) = &self.real_time {
            if !(rt.factor.is_finite() && rt.factor > 0.0) {
                return Err(invalid("real_time.factor", "must be positive and finite"));
            }
            if !(rt.interval.is_finite() && rt.interval > 0.0) {
                return Err(invalid("real_time.interval", "must be positive and finite"));
            }
        }
        Ok(())
    }

    pub fn time_converter(&self) -> TimeConverter {
        TimeConverter::new(self.epoch, self.millis_per_time_unit)
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}
