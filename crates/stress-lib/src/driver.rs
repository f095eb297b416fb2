//! Stress cycle driver
//!
//! Runs ramp-up, hold, ramp-down and low phases in an endless loop against a
//! [`ResourcePool`]. Shutdown is observed between steps and during every
//! sleep; however the loop ends (shutdown, error or panic) the pool is
//! released through the same path before `run` returns.

use crate::health::{components, ComponentStatus, HealthRegistry};
use crate::memory::mb_to_bytes;
use crate::models::{CycleConfig, Phase, PoolSnapshot, ScheduleStep};
use crate::observability::{StressMetrics, StructuredLogger};
use crate::planner::{self, PhasePlan};
use crate::pool::{ChangeReport, ResourcePool, TerminationPolicy};
use crate::worker::WorkerLauncher;
use anyhow::{anyhow, bail, Result};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::time::{sleep_until, Instant};
use tracing::{error, info};

/// Whether the cycle keeps going after a step or phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Listens for the process-wide shutdown broadcast
///
/// Once a shutdown is seen it stays seen, so the signal is consumed exactly
/// once however many checkpoints ask for it.
#[derive(Debug)]
pub struct Shutdown {
    is_shutdown: bool,
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    pub fn new(notify: broadcast::Receiver<()>) -> Self {
        Self {
            is_shutdown: false,
            notify,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    /// Check for a pending shutdown without waiting
    pub fn poll(&mut self) -> bool {
        if !self.is_shutdown {
            match self.notify.try_recv() {
                Err(TryRecvError::Empty) => {}
                // A message, a lag or a dropped sender all mean stop
                _ => self.is_shutdown = true,
            }
        }
        self.is_shutdown
    }

    /// Wait until shutdown is requested
    pub async fn recv(&mut self) {
        if self.is_shutdown {
            return;
        }
        let _ = self.notify.recv().await;
        self.is_shutdown = true;
    }
}

/// Drives the pool through the stress cycle
pub struct CycleDriver {
    config: CycleConfig,
    pool: ResourcePool,
    phase: Phase,
    cycles_completed: u64,
    metrics: StressMetrics,
    logger: StructuredLogger,
    health: HealthRegistry,
}

impl CycleDriver {
    /// Create a driver with an empty pool
    pub fn new(config: CycleConfig, launcher: Arc<dyn WorkerLauncher>) -> Self {
        let pool = ResourcePool::new(launcher, config.max_cores);
        Self {
            config,
            pool,
            phase: Phase::RampingUp,
            cycles_completed: 0,
            metrics: StressMetrics::new(),
            logger: StructuredLogger::new("unknown"),
            health: HealthRegistry::new(),
        }
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Report driver and pool health into `health`
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = health;
        self
    }

    pub fn with_termination_policy(mut self, policy: TerminationPolicy) -> Self {
        self.pool = self.pool.with_termination_policy(policy);
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn pool(&self) -> &ResourcePool {
        &self.pool
    }

    pub fn cycles_completed(&self) -> u64 {
        self.cycles_completed
    }

    /// Run cycles until shutdown, then release every resource
    ///
    /// Returns what the pool held when the loop ended. An error or panic
    /// inside a phase is logged, the pool is still released, and the error
    /// is returned.
    pub async fn run(mut self, shutdown: broadcast::Receiver<()>) -> Result<PoolSnapshot> {
        let mut shutdown = Shutdown::new(shutdown);
        self.health.register(components::DRIVER).await;
        self.health.register(components::POOL).await;

        let outcome = AssertUnwindSafe(self.run_cycles(&mut shutdown))
            .catch_unwind()
            .await;

        let result = match outcome {
            Ok(Ok(())) => {
                info!(phase = %self.phase, "Shutdown requested, cleaning up");
                Ok(())
            }
            Ok(Err(e)) => {
                error!(phase = %self.phase, error = %e, "Stress cycle failed, cleaning up");
                Err(e)
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(phase = %self.phase, panic = %message, "Stress cycle panicked, cleaning up");
                Err(anyhow!("stress cycle panicked: {message}"))
            }
        };

        if let Err(e) = &result {
            self.health
                .set_unhealthy(components::DRIVER, e.to_string())
                .await;
        }

        let released = self.pool.release_all().await;
        self.logger.log_cleanup(&released);
        result.map(|()| released)
    }

    async fn run_cycles(&mut self, shutdown: &mut Shutdown) -> Result<()> {
        loop {
            // Re-planned every cycle; the pool carries over from the last low phase
            let plan = planner::plan(&self.config);
            self.logger.log_plan(&plan);

            if self.ramp_up(&plan, shutdown).await? == Flow::Stop {
                return Ok(());
            }
            if self.hold(&plan, shutdown).await == Flow::Stop {
                return Ok(());
            }
            if self.ramp_down(&plan, shutdown).await? == Flow::Stop {
                return Ok(());
            }
            if self.low(shutdown).await == Flow::Stop {
                return Ok(());
            }

            self.cycles_completed += 1;
            self.metrics.inc_cycles_completed();
            self.logger.log_cycle_completed(self.cycles_completed);
        }
    }

    async fn ramp_up(&mut self, plan: &PhasePlan, shutdown: &mut Shutdown) -> Result<Flow> {
        self.enter(Phase::RampingUp, plan.ramp_up);

        for step in plan.ramp_up_schedule() {
            if shutdown.poll() {
                return Ok(Flow::Stop);
            }
            let started = Instant::now();

            let mut report = self.pool.grow_cores_to(step.target_cores);
            if plan.allocates_memory() && self.pool.memory_blocks() < step.target_memory_chunks {
                report.failed += self.pool.grow_memory_by(plan.memory_per_step_mb).failed;
            }

            self.finish_step(plan, &step, report, started).await?;
            if pause_until(started.checked_add(step.interval), shutdown).await == Flow::Stop {
                return Ok(Flow::Stop);
            }
        }

        self.logger
            .log_phase_completed(Phase::RampingUp, &self.pool.snapshot(), &self.config);
        Ok(Flow::Continue)
    }

    async fn hold(&mut self, plan: &PhasePlan, shutdown: &mut Shutdown) -> Flow {
        self.enter(Phase::Holding, plan.hold);
        pause_until(Instant::now().checked_add(plan.hold), shutdown).await
    }

    async fn ramp_down(&mut self, plan: &PhasePlan, shutdown: &mut Shutdown) -> Result<Flow> {
        self.enter(Phase::RampingDown, plan.ramp_down);

        let live_blocks = self.pool.memory_blocks();
        let low_chunks = plan.low_memory_chunks(live_blocks, self.config.low_phase_fraction);
        info!(
            low_cores = plan.low_cores,
            low_memory_chunks = low_chunks,
            "Target for low phase"
        );

        for step in plan.ramp_down_schedule(live_blocks, low_chunks) {
            if shutdown.poll() {
                return Ok(Flow::Stop);
            }
            let started = Instant::now();

            let mut report = self
                .pool
                .shrink_cores_to(step.target_cores, plan.low_cores)
                .await;
            report.failed += self.pool.shrink_memory_to(step.target_memory_chunks).failed;

            self.finish_step(plan, &step, report, started).await?;
            if pause_until(started.checked_add(step.interval), shutdown).await == Flow::Stop {
                return Ok(Flow::Stop);
            }
        }

        self.logger
            .log_phase_completed(Phase::RampingDown, &self.pool.snapshot(), &self.config);
        Ok(Flow::Continue)
    }

    async fn low(&mut self, shutdown: &mut Shutdown) -> Flow {
        let duration = self.config.low_duration();
        self.enter(Phase::Low, duration);
        pause_until(Instant::now().checked_add(duration), shutdown).await
    }

    fn enter(&mut self, phase: Phase, duration: Duration) {
        self.phase = phase;
        self.metrics.set_phase(phase);
        self.logger
            .log_phase_started(phase, self.cycles_completed + 1, duration);
    }

    /// Verify pool bounds, then log and report one completed step
    async fn finish_step(
        &mut self,
        plan: &PhasePlan,
        step: &ScheduleStep,
        report: ChangeReport,
        started: Instant,
    ) -> Result<()> {
        let snapshot = self.pool.snapshot();
        if snapshot.workers > self.config.max_cores {
            bail!(
                "pool holds {} workers, above the ceiling of {}",
                snapshot.workers,
                self.config.max_cores
            );
        }
        let memory_ceiling = mb_to_bytes(self.config.max_memory_mb + plan.memory_per_step_mb);
        if snapshot.memory_bytes > memory_ceiling as u64 {
            bail!(
                "pool holds {} bytes of memory, above the ceiling of {} bytes",
                snapshot.memory_bytes,
                memory_ceiling
            );
        }

        let elapsed = started.elapsed();
        if elapsed > step.interval {
            self.metrics.observe_step_overrun(elapsed - step.interval);
        }
        self.logger.log_step(
            self.phase,
            step.index,
            plan.steps(),
            step.target_cores,
            &snapshot,
            elapsed,
        );

        if report.is_clean() {
            if self.health.status(components::POOL).await != Some(ComponentStatus::Healthy) {
                self.health.set_healthy(components::POOL).await;
            }
        } else {
            self.health
                .set_degraded(
                    components::POOL,
                    format!(
                        "{} worker or memory operations failed in {} step {}",
                        report.failed,
                        self.phase,
                        step.index + 1
                    ),
                )
                .await;
        }
        Ok(())
    }
}

/// Sleep until `deadline` unless shutdown arrives first
///
/// A deadline too far out to represent only ends on shutdown.
async fn pause_until(deadline: Option<Instant>, shutdown: &mut Shutdown) -> Flow {
    if shutdown.poll() {
        return Flow::Stop;
    }
    let Some(deadline) = deadline else {
        shutdown.recv().await;
        return Flow::Stop;
    };
    if Instant::now() >= deadline {
        return Flow::Continue;
    }
    tokio::select! {
        _ = sleep_until(deadline) => Flow::Continue,
        _ = shutdown.recv() => Flow::Stop,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::testing::MockLauncher;
    use crate::worker::{Worker, WorkerError};
    use std::sync::atomic::Ordering;

    /// The reference configuration: 4 cores, 100MB, 2 steps, half retained
    fn small_config() -> CycleConfig {
        CycleConfig {
            high_duration_secs: 100.0,
            low_duration_secs: 10.0,
            max_cores: 4,
            max_memory_mb: 100.0,
            steps: 2,
            low_phase_fraction: 0.5,
            ramp_up_duration_secs: 2.0,
            ramp_down_duration_secs: 2.0,
        }
    }

    fn small_driver(launcher: &Arc<MockLauncher>) -> CycleDriver {
        CycleDriver::new(small_config(), launcher.clone())
    }

    fn idle_shutdown() -> (broadcast::Sender<()>, Shutdown) {
        let (tx, rx) = broadcast::channel(1);
        (tx, Shutdown::new(rx))
    }

    #[tokio::test]
    async fn test_shutdown_is_sticky() {
        let (tx, mut shutdown) = idle_shutdown();
        assert!(!shutdown.poll());

        tx.send(()).unwrap();
        assert!(shutdown.poll());
        assert!(shutdown.is_shutdown());
        // Already consumed, but still reported
        assert!(shutdown.poll());
        shutdown.recv().await;
    }

    #[tokio::test]
    async fn test_dropped_sender_counts_as_shutdown() {
        let (tx, mut shutdown) = idle_shutdown();
        drop(tx);
        assert!(shutdown.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_cycle_targets() {
        let launcher = Arc::new(MockLauncher::new());
        let mut driver = small_driver(&launcher);
        let plan = planner::plan(&driver.config);
        let (_tx, mut shutdown) = idle_shutdown();

        let started = Instant::now();
        assert_eq!(driver.ramp_up(&plan, &mut shutdown).await.unwrap(), Flow::Continue);
        assert_eq!(driver.pool().worker_count(), 4);
        assert_eq!(driver.pool().memory_blocks(), 2);
        assert_eq!(driver.pool().memory_bytes(), 100 * 1024 * 1024);
        assert_eq!(started.elapsed(), Duration::from_secs(2));

        assert_eq!(driver.hold(&plan, &mut shutdown).await, Flow::Continue);
        assert_eq!(driver.phase(), Phase::Holding);
        assert_eq!(driver.pool().worker_count(), 4);

        assert_eq!(driver.ramp_down(&plan, &mut shutdown).await.unwrap(), Flow::Continue);
        assert_eq!(driver.pool().worker_count(), 2);
        assert_eq!(driver.pool().memory_blocks(), 1);
        assert_eq!(launcher.stop_order(), vec![3, 2]);

        assert_eq!(driver.low(&mut shutdown).await, Flow::Continue);
        assert_eq!(driver.phase(), Phase::Low);
        assert_eq!(driver.pool().worker_count(), 2);
        assert_eq!(started.elapsed(), Duration::from_secs(110));
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_cycle_continues_from_low_phase() {
        let launcher = Arc::new(MockLauncher::new());
        let mut driver = small_driver(&launcher);
        let plan = planner::plan(&driver.config);
        let (_tx, mut shutdown) = idle_shutdown();

        driver.ramp_up(&plan, &mut shutdown).await.unwrap();
        driver.ramp_down(&plan, &mut shutdown).await.unwrap();
        driver.ramp_up(&plan, &mut shutdown).await.unwrap();

        // Two low-phase workers survived, so only two more were started
        assert_eq!(launcher.launched.load(Ordering::SeqCst), 6);
        assert_eq!(driver.pool().worker_count(), 4);
        assert_eq!(driver.pool().memory_blocks(), 2);
        assert_eq!(driver.pool().memory_bytes(), 100 * 1024 * 1024);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ramp_up_survives_failed_starts() {
        let launcher = Arc::new(MockLauncher::failing_on([0]));
        let health = HealthRegistry::new();
        health.register(components::POOL).await;
        let mut driver = small_driver(&launcher).with_health(health.clone());
        let plan = planner::plan(&driver.config);
        let (_tx, mut shutdown) = idle_shutdown();

        assert_eq!(driver.ramp_up(&plan, &mut shutdown).await.unwrap(), Flow::Continue);
        // Index 0 failed in step one; step two tops the pool back up to 4
        assert_eq!(driver.pool().worker_count(), 4);
        assert_eq!(
            health.status(components::POOL).await,
            Some(ComponentStatus::Healthy)
        );

        let launcher = Arc::new(MockLauncher::failing_on([2, 3]));
        let mut driver = small_driver(&launcher).with_health(health.clone());
        driver.ramp_up(&plan, &mut shutdown).await.unwrap();
        assert_eq!(driver.pool().worker_count(), 2);
        assert_eq!(
            health.status(components::POOL).await,
            Some(ComponentStatus::Degraded)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_during_hold_releases_everything() {
        // Stubborn workers force the slowest path: full grace window, then kill
        let launcher = Arc::new(MockLauncher::stubborn());
        let driver = small_driver(&launcher);
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(driver.run(rx));

        // Ramp-up takes 2s and hold runs until 98s
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(launcher.alive(), 4);

        let signalled = Instant::now();
        tx.send(()).unwrap();
        let released = handle.await.unwrap().unwrap();

        assert!(signalled.elapsed() <= Duration::from_secs(6));
        assert_eq!(launcher.alive(), 0);
        assert_eq!(released.workers, 4);
        assert_eq!(released.memory_blocks, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_hold_waits_for_shutdown() {
        let launcher = Arc::new(MockLauncher::new());
        let config = CycleConfig {
            high_duration_secs: 1e20,
            ..small_config()
        };
        let driver = CycleDriver::new(config, launcher.clone());
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(driver.run(rx));

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(launcher.alive(), 4);

        tx.send(()).unwrap();
        let released = handle.await.unwrap().unwrap();
        assert_eq!(launcher.alive(), 0);
        assert_eq!(released.workers, 4);
        assert_eq!(released.memory_blocks, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_low_phase_waits_for_shutdown() {
        let launcher = Arc::new(MockLauncher::new());
        let config = CycleConfig {
            low_duration_secs: 1e19,
            ..small_config()
        };
        let mut driver = CycleDriver::new(config, launcher.clone());
        let (tx, mut shutdown) = idle_shutdown();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            let _ = tx.send(());
        });

        let started = Instant::now();
        assert_eq!(driver.low(&mut shutdown).await, Flow::Stop);
        assert_eq!(started.elapsed(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_ramp_step_waits_for_shutdown() {
        let launcher = Arc::new(MockLauncher::new());
        let config = CycleConfig {
            ramp_up_duration_secs: 1e300,
            ..small_config()
        };
        let driver = CycleDriver::new(config, launcher.clone());
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(driver.run(rx));

        // The first step runs, then its interval never elapses
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(launcher.alive(), 2);

        tx.send(()).unwrap();
        let released = handle.await.unwrap().unwrap();
        assert_eq!(released.workers, 2);
        assert_eq!(launcher.alive(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_before_start_releases_nothing() {
        let launcher = Arc::new(MockLauncher::new());
        let driver = small_driver(&launcher);
        let (tx, rx) = broadcast::channel(1);
        tx.send(()).unwrap();

        let released = driver.run(rx).await.unwrap();
        assert!(released.is_empty());
        assert_eq!(launcher.launched.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycles_repeat_until_shutdown() {
        let launcher = Arc::new(MockLauncher::new());
        let driver = small_driver(&launcher);
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(driver.run(rx));

        // One cycle is 110s; stop in the middle of the third
        tokio::time::sleep(Duration::from_secs(250)).await;
        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(launcher.alive(), 0);
        // 4 in the first ramp-up, 2 more in each later one
        assert_eq!(launcher.launched.load(Ordering::SeqCst), 8);
    }

    /// Delegates to a mock but panics on a chosen launch
    struct PanickingLauncher {
        inner: MockLauncher,
        panic_at: usize,
    }

    impl WorkerLauncher for PanickingLauncher {
        fn launch(&self, index: usize) -> Result<Box<dyn Worker>, WorkerError> {
            if index == self.panic_at {
                panic!("launcher exploded");
            }
            self.inner.launch(index)
        }

        fn kind(&self) -> &'static str {
            "panicking"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_in_phase_still_releases_pool() {
        let launcher = Arc::new(PanickingLauncher {
            inner: MockLauncher::new(),
            panic_at: 3,
        });
        let alive = launcher.inner.alive.clone();
        let health = HealthRegistry::new();
        let driver = CycleDriver::new(small_config(), launcher).with_health(health.clone());
        let (_tx, rx) = broadcast::channel(1);

        let err = driver.run(rx).await.unwrap_err();
        assert!(err.to_string().contains("launcher exploded"));
        assert_eq!(alive.load(Ordering::SeqCst), 0);
        assert_eq!(
            health.status(components::DRIVER).await,
            Some(ComponentStatus::Unhealthy)
        );
    }

    #[test]
    fn test_panic_message_extraction() {
        let boxed: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(boxed.as_ref()), "static message");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned message"));
        assert_eq!(panic_message(boxed.as_ref()), "owned message");
        let boxed: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
