//! Mapping between the real-valued simulation clock and wall-clock time.
//!
//! Simulation time `t` corresponds to the instant
//! `epoch + t * millis_per_time_unit` milliseconds.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Calendar unit for count-based conversions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    Millis,
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    /// Length of one unit in milliseconds.
    pub fn as_millis(self) -> f64 {
        match self {
            TimeUnit::Millis => 1.0,
            TimeUnit::Seconds => 1_000.0,
            TimeUnit::Minutes => 60_000.0,
            TimeUnit::Hours => 3_600_000.0,
            TimeUnit::Days => 86_400_000.0,
        }
    }
}

/// Converts between simulation time and instants/durations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeConverter {
    epoch: DateTime<Utc>,
    millis_per_unit: f64,
}

impl TimeConverter {
    /// `millis_per_unit` must be positive and finite; callers validate it
    /// through [`SimConfig::validate`](crate::config::SimConfig::validate).
    pub fn new(epoch: DateTime<Utc>, millis_per_unit: f64) -> Self {
        Self {
            epoch,
            millis_per_unit,
        }
    }

    pub fn epoch(&self) -> DateTime<Utc> {
        self.epoch
    }

    pub fn millis_per_unit(&self) -> f64 {
        self.millis_per_unit
    }

    /// Relative simulation time covered by a wall-clock duration.
    pub fn duration_to_sim(&self, duration: Duration) -> f64 {
        duration.as_secs_f64() * 1_000.0 / self.millis_per_unit
    }

    /// Relative simulation time covered by `count` units.
    pub fn units_to_sim(&self, count: f64, unit: TimeUnit) -> f64 {
        count * unit.as_millis() / self.millis_per_unit
    }

    /// Absolute simulation time of an instant.
    pub fn instant_to_sim(&self, instant: DateTime<Utc>) -> f64 {
        let delta = instant.signed_duration_since(self.epoch);
        let millis = match delta.num_microseconds() {
            Some(us) => us as f64 / 1_000.0,
            None => delta.num_milliseconds() as f64,
        };
        millis / self.millis_per_unit
    }

    /// Instant corresponding to an absolute simulation time. Saturates at the
    /// representable calendar range.
    pub fn sim_to_instant(&self, sim_time: f64) -> DateTime<Utc> {
        let micros = (sim_time * self.millis_per_unit * 1_000.0).round();
        let saturated = if micros.is_sign_negative() {
            DateTime::<Utc>::MIN_UTC
        } else {
            DateTime::<Utc>::MAX_UTC
        };
        if !micros.is_finite() || micros.abs() >= i64::MAX as f64 {
            return saturated;
        }
        self.epoch
            .checked_add_signed(TimeDelta::microseconds(micros as i64))
            .unwrap_or(saturated)
    }
}

impl Default for TimeConverter {
    fn default() -> Self {
        Self::new(DateTime::<Utc>::UNIX_EPOCH, TimeUnit::Minutes.as_millis())
    }
}
