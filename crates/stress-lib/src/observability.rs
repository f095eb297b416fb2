//! Observability infrastructure for the stressor
//!
//! Provides:
//! - Prometheus metrics describing what the stressor currently holds
//! - Structured JSON logging of cycle events with tracing
//!
//! None of these measure the load the host actually experiences.

use crate::models::{CycleConfig, Phase, PoolSnapshot};
use crate::planner::PhasePlan;
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, register_int_gauge_vec,
    Histogram, IntCounter, IntGauge, IntGaugeVec,
};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};

/// Buckets for step overruns (in seconds)
const OVERRUN_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<StressMetricsInner> = OnceLock::new();

struct StressMetricsInner {
    workers_active: IntGauge,
    memory_bytes_held: IntGauge,
    memory_blocks_held: IntGauge,
    phase_info: IntGaugeVec,
    cycles_completed: IntCounter,
    worker_start_failures: IntCounter,
    allocation_failures: IntCounter,
    forced_kills: IntCounter,
    step_overrun_seconds: Histogram,
}

impl StressMetricsInner {
    fn new() -> Self {
        Self {
            workers_active: register_int_gauge!(
                "ramp_stressor_workers_active",
                "CPU workers currently held by the pool"
            )
            .expect("Failed to register workers_active"),

            memory_bytes_held: register_int_gauge!(
                "ramp_stressor_memory_bytes_held",
                "Bytes of memory currently reserved by the pool"
            )
            .expect("Failed to register memory_bytes_held"),

            memory_blocks_held: register_int_gauge!(
                "ramp_stressor_memory_blocks_held",
                "Memory blocks currently reserved by the pool"
            )
            .expect("Failed to register memory_blocks_held"),

            phase_info: register_int_gauge_vec!(
                "ramp_stressor_phase_info",
                "Current cycle phase (1 for the active phase)",
                &["phase"]
            )
            .expect("Failed to register phase_info"),

            cycles_completed: register_int_counter!(
                "ramp_stressor_cycles_completed_total",
                "Full stress cycles completed"
            )
            .expect("Failed to register cycles_completed"),

            worker_start_failures: register_int_counter!(
                "ramp_stressor_worker_start_failures_total",
                "Workers that failed to start"
            )
            .expect("Failed to register worker_start_failures"),

            allocation_failures: register_int_counter!(
                "ramp_stressor_allocation_failures_total",
                "Memory blocks that failed to allocate"
            )
            .expect("Failed to register allocation_failures"),

            forced_kills: register_int_counter!(
                "ramp_stressor_forced_kills_total",
                "Workers that had to be killed after ignoring a stop request"
            )
            .expect("Failed to register forced_kills"),

            step_overrun_seconds: register_histogram!(
                "ramp_stressor_step_overrun_seconds",
                "Time a ramp step's work ran past its interval",
                OVERRUN_BUCKETS.to_vec()
            )
            .expect("Failed to register step_overrun_seconds"),
        }
    }
}

/// Stressor metrics for Prometheus exposition
///
/// A lightweight handle to the global metrics instance; clones share the
/// same underlying metrics.
#[derive(Clone)]
pub struct StressMetrics {
    _private: (),
}

impl Default for StressMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl StressMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(StressMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &StressMetricsInner {
        GLOBAL_METRICS.get_or_init(StressMetricsInner::new)
    }

    /// Publish the pool's current holdings
    pub fn set_pool(&self, snapshot: &PoolSnapshot) {
        let inner = self.inner();
        inner.workers_active.set(snapshot.workers as i64);
        inner.memory_blocks_held.set(snapshot.memory_blocks as i64);
        inner.memory_bytes_held.set(snapshot.memory_bytes as i64);
    }

    /// Mark `phase` as the active phase
    pub fn set_phase(&self, phase: Phase) {
        for candidate in Phase::ALL {
            let value = i64::from(candidate == phase);
            self.inner()
                .phase_info
                .with_label_values(&[candidate.as_str()])
                .set(value);
        }
    }

    pub fn inc_cycles_completed(&self) {
        self.inner().cycles_completed.inc();
    }

    pub fn inc_worker_start_failures(&self) {
        self.inner().worker_start_failures.inc();
    }

    pub fn inc_allocation_failures(&self) {
        self.inner().allocation_failures.inc();
    }

    pub fn inc_forced_kills(&self) {
        self.inner().forced_kills.inc();
    }

    /// Record how far a step ran past its budget
    pub fn observe_step_overrun(&self, overrun: Duration) {
        self.inner().step_overrun_seconds.observe(overrun.as_secs_f64());
    }
}

/// Structured logger for stressor events
///
/// Provides consistent JSON-formatted records for the cycle's milestones.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    /// Log the startup banner with the effective configuration
    pub fn log_startup(
        &self,
        version: &str,
        config: &CycleConfig,
        detected_cores: usize,
        startup_delay_max_secs: f64,
        worker_mode: &str,
    ) {
        info!(
            event = "stressor_started",
            instance = %self.instance,
            version = %version,
            high_duration_secs = config.high_duration_secs,
            low_duration_secs = config.low_duration_secs,
            ramp_steps = config.steps,
            ramp_up_duration_secs = config.ramp_up_duration_secs,
            ramp_down_duration_secs = config.ramp_down_duration_secs,
            max_cores = config.max_cores,
            detected_cores = detected_cores,
            max_memory_mb = config.max_memory_mb,
            low_phase_percent = config.low_phase_fraction * 100.0,
            startup_delay_max_secs = startup_delay_max_secs,
            worker_mode = %worker_mode,
            "Cyclical CPU and memory stressor started"
        );
    }

    /// Log the timings chosen for a high phase
    pub fn log_plan(&self, plan: &PhasePlan) {
        if plan.rescaled {
            warn!(
                event = "phase_plan",
                instance = %self.instance,
                ramp_up_secs = plan.ramp_up.as_secs_f64(),
                hold_secs = plan.hold.as_secs_f64(),
                ramp_down_secs = plan.ramp_down.as_secs_f64(),
                steps = plan.steps(),
                "High duration is short for the step count, phase timings adjusted"
            );
        } else {
            info!(
                event = "phase_plan",
                instance = %self.instance,
                ramp_up_secs = plan.ramp_up.as_secs_f64(),
                hold_secs = plan.hold.as_secs_f64(),
                ramp_down_secs = plan.ramp_down.as_secs_f64(),
                cores_per_step = plan.cores_per_step,
                memory_per_step_mb = plan.memory_per_step_mb,
                "Phase durations planned"
            );
        }
    }

    /// Log entry into a phase
    pub fn log_phase_started(&self, phase: Phase, cycle: u64, duration: Duration) {
        info!(
            event = "phase_started",
            instance = %self.instance,
            phase = %phase,
            cycle = cycle,
            duration_secs = duration.as_secs_f64(),
            "Phase started"
        );
    }

    /// Log the outcome of one ramp step
    pub fn log_step(
        &self,
        phase: Phase,
        step: usize,
        steps: usize,
        target_cores: usize,
        snapshot: &PoolSnapshot,
        elapsed: Duration,
    ) {
        info!(
            event = "ramp_step",
            instance = %self.instance,
            phase = %phase,
            step = step + 1,
            steps = steps,
            target_cores = target_cores,
            workers = snapshot.workers,
            memory_blocks = snapshot.memory_blocks,
            memory_mb = snapshot.memory_mb(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Ramp step complete"
        );
    }

    /// Log the load held at the end of a phase
    pub fn log_phase_completed(&self, phase: Phase, snapshot: &PoolSnapshot, config: &CycleConfig) {
        let cpu_percent = snapshot.workers as f64 / config.max_cores.max(1) as f64 * 100.0;
        let memory_percent = snapshot.memory_blocks as f64 / config.steps.max(1) as f64 * 100.0;
        info!(
            event = "phase_completed",
            instance = %self.instance,
            phase = %phase,
            workers = snapshot.workers,
            cpu_percent = cpu_percent,
            memory_blocks = snapshot.memory_blocks,
            memory_mb = snapshot.memory_mb(),
            memory_percent = memory_percent,
            "Phase complete"
        );
    }

    /// Log completion of a whole cycle
    pub fn log_cycle_completed(&self, cycle: u64) {
        info!(
            event = "cycle_completed",
            instance = %self.instance,
            cycle = cycle,
            "Stress cycle complete"
        );
    }

    /// Log shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "stressor_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Stressor shutting down"
        );
    }

    /// Log the result of the final cleanup
    pub fn log_cleanup(&self, released: &PoolSnapshot) {
        info!(
            event = "cleanup_complete",
            instance = %self.instance,
            workers_stopped = released.workers,
            memory_blocks_released = released.memory_blocks,
            memory_mb_released = released.memory_mb(),
            "Cleanup complete"
        );
    }
}
