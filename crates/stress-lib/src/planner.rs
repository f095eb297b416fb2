//! Phase planning
//!
//! Turns a [`CycleConfig`] into effective phase durations and per-step
//! resource targets for the ramps. Everything here is pure so the schedule
//! can be checked without starting a single worker.

use crate::models::{secs, CycleConfig, ScheduleStep};
use std::time::Duration;

/// Shortest time a single ramp step is allowed to take
pub const MIN_STEP_SECS: f64 = 0.1;

/// Shortest time a whole phase is allowed to take
pub const MIN_PHASE_SECS: f64 = 1.0;

/// Effective timings and targets for one high phase
#[derive(Debug, Clone, PartialEq)]
pub struct PhasePlan {
    pub ramp_up: Duration,
    pub hold: Duration,
    pub ramp_down: Duration,
    pub step_interval_up: Duration,
    pub step_interval_down: Duration,
    /// Size of each memory block allocated during ramp-up
    pub memory_per_step_mb: f64,
    /// Fractional number of workers added per ramp-up step
    pub cores_per_step: f64,
    /// Workers kept through the low phase
    pub low_cores: usize,
    /// Memory the low phase nominally retains
    pub low_memory_mb: f64,
    /// True when the high phase was too short for the nominal ramps
    pub rescaled: bool,
    steps: usize,
    max_cores: usize,
}

/// Compute the phase plan for a configuration
pub fn plan(config: &CycleConfig) -> PhasePlan {
    let steps = config.steps.max(1);
    let fraction = config.low_phase_fraction.clamp(0.0, 1.0);
    let high = config.high_duration_secs.max(0.0);

    let low_cores = ((config.max_cores as f64 * fraction).floor() as usize)
        .max(1)
        .min(config.max_cores.max(1));
    let low_memory_mb = config.max_memory_mb * fraction;

    let min_phase = min_phase_duration(steps);
    let rescaled = high < 3.0 * min_phase;

    let (ramp_up, ramp_down) = if rescaled {
        let ramp = min_phase.max(high / 3.0);
        (ramp, ramp)
    } else {
        (
            config.ramp_up_duration_secs.max(0.0),
            config.ramp_down_duration_secs.max(0.0),
        )
    };
    let hold = (high - ramp_up - ramp_down).max(0.0);

    PhasePlan {
        ramp_up: secs(ramp_up),
        hold: secs(hold),
        ramp_down: secs(ramp_down),
        step_interval_up: secs(ramp_up / steps as f64),
        step_interval_down: secs(ramp_down / steps as f64),
        memory_per_step_mb: config.max_memory_mb.max(0.0) / steps as f64,
        cores_per_step: config.max_cores as f64 / steps as f64,
        low_cores,
        low_memory_mb,
        rescaled,
        steps,
        max_cores: config.max_cores,
    }
}

/// Minimum viable phase length for a given step count
pub fn min_phase_duration(steps: usize) -> f64 {
    MIN_PHASE_SECS.max(steps as f64 * MIN_STEP_SECS)
}

impl PhasePlan {
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Sum of ramp-up, hold and ramp-down, saturating at `Duration::MAX`
    pub fn high_phase_total(&self) -> Duration {
        self.ramp_up
            .saturating_add(self.hold)
            .saturating_add(self.ramp_down)
    }

    /// Whether memory is part of this plan at all
    pub fn allocates_memory(&self) -> bool {
        self.memory_per_step_mb > 0.0
    }

    /// Workers to hold after ramp-up step `step` (0-indexed)
    ///
    /// Equal to `floor((step + 1) * cores_per_step)`, computed in integers so
    /// the final step lands exactly on `max_cores`.
    pub fn ramp_up_core_target(&self, step: usize) -> usize {
        let step = step.min(self.steps - 1);
        (step + 1) * self.max_cores / self.steps
    }

    /// Workers to hold after ramp-down step `step` (0-indexed)
    ///
    /// Linear interpolation from `max_cores` to `low_cores`, floored and never
    /// below `low_cores`.
    pub fn ramp_down_core_target(&self, step: usize) -> usize {
        let step = step.min(self.steps - 1);
        let span = self.max_cores.saturating_sub(self.low_cores);
        let removed = ((step + 1) * span).div_ceil(self.steps);
        self.max_cores.saturating_sub(removed).max(self.low_cores)
    }

    /// Memory blocks retained through the low phase, given the blocks held
    /// when ramp-down starts
    pub fn low_memory_chunks(&self, live_blocks: usize, low_phase_fraction: f64) -> usize {
        let fraction = low_phase_fraction.clamp(0.0, 1.0);
        ((live_blocks as f64 * fraction).floor() as usize).max(1)
    }

    /// Checkpoints for ramp-up
    pub fn ramp_up_schedule(&self) -> Vec<ScheduleStep> {
        (0..self.steps)
            .map(|index| ScheduleStep {
                index,
                target_cores: self.ramp_up_core_target(index),
                target_memory_chunks: if self.allocates_memory() { index + 1 } else { 0 },
                interval: self.step_interval_up,
            })
            .collect()
    }

    /// Checkpoints for ramp-down, releasing at most one memory block per step
    /// until `low_chunks` remain
    pub fn ramp_down_schedule(&self, live_blocks: usize, low_chunks: usize) -> Vec<ScheduleStep> {
        (0..self.steps)
            .map(|index| ScheduleStep {
                index,
                target_cores: self.ramp_down_core_target(index),
                target_memory_chunks: live_blocks.saturating_sub(index + 1).max(low_chunks),
                interval: self.step_interval_down,
            })
            .collect()
    }
}
