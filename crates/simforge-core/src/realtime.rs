//! Wall-clock pacing.
//!
//! A recurring utility event compares the wall-clock time since the run
//! started with the simulated time elapsed, converted through the time scale
//! and divided by the real-time factor. When the simulation is ahead it
//! sleeps for the difference; when it is behind a dropped frame is counted.
//! Wall time spent paused is left out of the comparison, so a run resumes
//! at its normal pace after `unpause`.
//! Pacing never changes which events run or when, only how long the run
//! takes.

use std::time::{Duration, Instant};

use tracing::{trace, warn};

use crate::config::RealTimeConfig;
use crate::error::{ModelResult, SimError};
use crate::event::PRIO_LOWEST;
use crate::simulation::Simulation;

/// Pacing state for one run.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Pacer {
    wall_start: Instant,
    sim_start: f64,
    /// Wall-clock milliseconds per simulation time unit at factor 1.
    millis_per_unit: f64,
    factor: f64,
}

impl Pacer {
    /// Wall-clock time that should have passed when the clock reads
    /// `sim_time`.
    fn target(&self, sim_time: f64) -> Result<Duration, SimError> {
        let millis = (sim_time - self.sim_start) * self.millis_per_unit / self.factor;
        Duration::try_from_secs_f64(millis / 1_000.0)
            .map_err(|e| SimError::Pacing(format!("target for t={sim_time}: {e}")))
    }

    fn sync(&self, sim: &Simulation) -> ModelResult {
        let target = self.target(sim.sim_time())?;
        let elapsed = self
            .wall_start
            .elapsed()
            .saturating_sub(sim.paused_wall_time());
        if target > elapsed {
            let ahead = target - elapsed;
            trace!(time = sim.sim_time(), ahead_ms = ahead.as_millis() as u64, "pacing");
            sim.sleep_interruptible(ahead);
        } else {
            let dropped = sim.record_dropped_frame();
            warn!(
                time = sim.sim_time(),
                behind_ms = (elapsed - target).as_millis() as u64,
                dropped,
                "real-time frame dropped"
            );
        }
        Ok(())
    }
}

/// Start pacing from the current clock.
pub(crate) fn install(sim: &Simulation, config: &RealTimeConfig) -> Result<(), SimError> {
    let pacer = Pacer {
        wall_start: Instant::now(),
        sim_start: sim.sim_time(),
        millis_per_unit: sim.time_converter().millis_per_unit(),
        factor: config.factor,
    };
    sim.schedule_periodic(
        pacer.sim_start + config.interval,
        config.interval,
        PRIO_LOWEST,
        move |sim| {
            pacer.sync(sim)?;
            Ok(true)
        },
    )?;
    Ok(())
}
