//! Core data models for the stressor

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Tunables for one stressor instance, fixed at startup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleConfig {
    /// Length of the high-load phase (ramp-up + hold + ramp-down)
    pub high_duration_secs: f64,
    /// Length of the low-load phase
    pub low_duration_secs: f64,
    /// Ceiling on concurrently running workers
    pub max_cores: usize,
    /// Ceiling on total reserved memory
    pub max_memory_mb: f64,
    /// Checkpoints per ramp
    pub steps: usize,
    /// Fraction of the peak retained during the low phase
    pub low_phase_fraction: f64,
    /// Nominal ramp-up length
    pub ramp_up_duration_secs: f64,
    /// Nominal ramp-down length
    pub ramp_down_duration_secs: f64,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            high_duration_secs: 120.0,
            low_duration_secs: 300.0,
            max_cores: 1,
            max_memory_mb: 1024.0,
            steps: 10,
            low_phase_fraction: 0.1,
            ramp_up_duration_secs: 20.0,
            ramp_down_duration_secs: 20.0,
        }
    }
}

impl CycleConfig {
    pub fn low_duration(&self) -> Duration {
        secs(self.low_duration_secs)
    }
}

/// Phases of the stress cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    RampingUp,
    Holding,
    RampingDown,
    Low,
}

impl Phase {
    pub const ALL: [Phase; 4] = [
        Phase::RampingUp,
        Phase::Holding,
        Phase::RampingDown,
        Phase::Low,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::RampingUp => "ramping_up",
            Phase::Holding => "holding",
            Phase::RampingDown => "ramping_down",
            Phase::Low => "low",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One checkpoint of a ramp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleStep {
    /// 0-indexed position within the ramp
    pub index: usize,
    /// Workers to hold once the step is done
    pub target_cores: usize,
    /// Memory blocks to hold once the step is done
    pub target_memory_chunks: usize,
    /// Wall-clock budget for the step
    pub interval: Duration,
}

/// Resource counts held by the pool at a point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub workers: usize,
    pub memory_blocks: usize,
    pub memory_bytes: u64,
}

impl PoolSnapshot {
    pub fn is_empty(&self) -> bool {
        self.workers == 0 && self.memory_blocks == 0
    }

    pub fn memory_mb(&self) -> f64 {
        self.memory_bytes as f64 / BYTES_PER_MB as f64
    }
}

pub const BYTES_PER_MB: u64 = 1024 * 1024;

/// Convert fractional seconds into a `Duration`, treating negative or
/// non-finite values as zero and saturating at `Duration::MAX`
pub fn secs(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX)
    } else {
        Duration::ZERO
    }
}
