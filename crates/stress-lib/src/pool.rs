//! Resource pool
//!
//! Owns every live worker and memory block. Workers and blocks are kept in
//! launch order and always shrunk from the most recent end, so shrinking is
//! LIFO and reproducible.

use crate::memory::MemoryBlock;
use crate::models::PoolSnapshot;
use crate::observability::StressMetrics;
use crate::worker::{Worker, WorkerLauncher};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Deadlines for stopping workers
#[derive(Debug, Clone)]
pub struct TerminationPolicy {
    /// Total wait after the graceful stop request (default: 5 seconds)
    pub graceful_timeout: Duration,
    /// How often to check for exited workers while waiting (default: 500ms)
    pub poll_interval: Duration,
    /// Wait after killing each straggler (default: 1 second)
    pub kill_timeout: Duration,
}

impl Default for TerminationPolicy {
    fn default() -> Self {
        Self {
            graceful_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(500),
            kill_timeout: Duration::from_secs(1),
        }
    }
}

/// Outcome of a grow or shrink request
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChangeReport {
    /// Units started, stopped, allocated or released
    pub succeeded: usize,
    /// Units that could not be started or did not confirm exit
    pub failed: usize,
}

impl ChangeReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

/// Live workers and memory blocks
pub struct ResourcePool {
    launcher: Arc<dyn WorkerLauncher>,
    policy: TerminationPolicy,
    max_cores: usize,
    workers: Vec<Box<dyn Worker>>,
    blocks: Vec<MemoryBlock>,
    next_worker_index: usize,
    metrics: StressMetrics,
}

impl ResourcePool {
    /// Create an empty pool that never holds more than `max_cores` workers
    pub fn new(launcher: Arc<dyn WorkerLauncher>, max_cores: usize) -> Self {
        Self {
            launcher,
            policy: TerminationPolicy::default(),
            max_cores,
            workers: Vec::new(),
            blocks: Vec::new(),
            next_worker_index: 0,
            metrics: StressMetrics::new(),
        }
    }

    /// Override the termination deadlines
    pub fn with_termination_policy(mut self, policy: TerminationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn memory_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn memory_bytes(&self) -> u64 {
        self.blocks.iter().map(|block| block.len() as u64).sum()
    }

    pub fn max_cores(&self) -> usize {
        self.max_cores
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            workers: self.workers.len(),
            memory_blocks: self.blocks.len(),
            memory_bytes: self.memory_bytes(),
        }
    }

    /// Start workers until `target` are running (capped at `max_cores`)
    ///
    /// A worker that fails to start is logged and skipped; the pool simply
    /// ends up below target.
    pub fn grow_cores_to(&mut self, target: usize) -> ChangeReport {
        let target = target.min(self.max_cores);
        let mut report = ChangeReport::default();
        if target <= self.workers.len() {
            return report;
        }

        let to_start = target - self.workers.len();
        debug!(
            to_start = to_start,
            target = target,
            launcher = self.launcher.kind(),
            "Starting CPU workers"
        );

        for _ in 0..to_start {
            let index = self.next_worker_index;
            self.next_worker_index += 1;

            match self.launcher.launch(index) {
                Ok(worker) => {
                    self.workers.push(worker);
                    report.succeeded += 1;
                }
                Err(e) => {
                    warn!(worker_index = index, error = %e, "Failed to start CPU worker");
                    self.metrics.inc_worker_start_failures();
                    report.failed += 1;
                }
            }
        }

        self.publish();
        report
    }

    /// Stop the most recently started workers until `max(target, floor)`
    /// remain
    pub async fn shrink_cores_to(&mut self, target: usize, floor: usize) -> ChangeReport {
        let keep = target.max(floor);
        if self.workers.len() <= keep {
            return ChangeReport::default();
        }

        let mut to_stop = self.workers.split_off(keep);
        to_stop.reverse();
        let report = terminate(&self.policy, &self.metrics, to_stop).await;
        self.publish();
        report
    }

    /// Reserve one more memory block of `chunk_mb` megabytes
    ///
    /// Allocation failures are logged and leave the pool unchanged.
    pub fn grow_memory_by(&mut self, chunk_mb: f64) -> ChangeReport {
        debug!(chunk_mb = chunk_mb, "Allocating memory block");

        let report = match MemoryBlock::allocate_mb(chunk_mb) {
            Ok(block) => {
                self.blocks.push(block);
                ChangeReport {
                    succeeded: 1,
                    failed: 0,
                }
            }
            Err(e) => {
                warn!(chunk_mb = chunk_mb, error = %e, "Failed to allocate memory block");
                self.metrics.inc_allocation_failures();
                ChangeReport {
                    succeeded: 0,
                    failed: 1,
                }
            }
        };

        self.publish();
        report
    }

    /// Release the most recently reserved blocks until `target` remain
    pub fn shrink_memory_to(&mut self, target: usize) -> ChangeReport {
        let mut report = ChangeReport::default();
        while self.blocks.len() > target {
            if let Some(block) = self.blocks.pop() {
                debug!(bytes = block.len(), "Releasing memory block");
                report.succeeded += 1;
            }
        }

        if report.succeeded > 0 {
            self.publish();
        }
        report
    }

    /// Stop every worker and release every block
    ///
    /// Safe to call on an empty pool. Returns what was held beforehand.
    pub async fn release_all(&mut self) -> PoolSnapshot {
        let released = self.snapshot();

        if !self.workers.is_empty() {
            let mut workers = std::mem::take(&mut self.workers);
            workers.reverse();
            terminate(&self.policy, &self.metrics, workers).await;
        }

        if !self.blocks.is_empty() {
            info!(blocks = self.blocks.len(), "Releasing memory blocks");
            self.blocks.clear();
        }

        self.publish();
        released
    }

    fn publish(&self) {
        self.metrics.set_pool(&self.snapshot());
    }
}

/// Stop the given workers: request, wait, then kill stragglers
///
/// Every worker passed in is dropped by the time this returns, whether or
/// not it confirmed its exit.
async fn terminate(
    policy: &TerminationPolicy,
    metrics: &StressMetrics,
    mut workers: Vec<Box<dyn Worker>>,
) -> ChangeReport {
    let total = workers.len();
    info!(count = total, "Stopping CPU workers");

    for worker in workers.iter_mut() {
        if let Err(e) = worker.request_stop() {
            warn!(worker = %worker.id(), error = %e, "Could not request worker stop");
        }
    }

    let deadline = Instant::now() + policy.graceful_timeout;
    workers.retain_mut(|worker| !exited(worker.as_mut()));
    while !workers.is_empty() && Instant::now() < deadline {
        debug!(remaining = workers.len(), "Waiting for workers to terminate");
        sleep(policy.poll_interval).await;
        workers.retain_mut(|worker| !exited(worker.as_mut()));
    }

    let mut report = ChangeReport {
        succeeded: total - workers.len(),
        failed: 0,
    };

    for mut worker in workers {
        warn!(worker = %worker.id(), "Worker did not stop gracefully, killing");
        if let Err(e) = worker.kill() {
            warn!(worker = %worker.id(), error = %e, "Could not kill worker");
            report.failed += 1;
            continue;
        }
        metrics.inc_forced_kills();

        if wait_for_exit(worker.as_mut(), policy.kill_timeout).await {
            report.succeeded += 1;
        } else {
            warn!(worker = %worker.id(), "Killed worker has not exited yet");
            report.failed += 1;
        }
    }

    if report.failed > 0 {
        warn!(
            stopped = report.succeeded,
            unconfirmed = report.failed,
            "Some CPU workers did not confirm exit"
        );
    } else {
        info!(stopped = report.succeeded, "CPU workers stopped");
    }
    report
}

async fn wait_for_exit(worker: &mut dyn Worker, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let poll = (timeout / 10).max(Duration::from_millis(1));
    loop {
        if exited(worker) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(poll).await;
    }
}

/// Treat a worker whose status can't be read as still running
fn exited(worker: &mut dyn Worker) -> bool {
    match worker.has_exited() {
        Ok(exited) => exited,
        Err(e) => {
            debug!(worker = %worker.id(), error = %e, "Could not read worker status");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::testing::MockLauncher;

    fn pool(launcher: &Arc<MockLauncher>, max_cores: usize) -> ResourcePool {
        ResourcePool::new(launcher.clone(), max_cores)
    }

    #[test]
    fn test_grow_cores_to_target() {
        let launcher = Arc::new(MockLauncher::new());
        let mut pool = pool(&launcher, 8);

        let report = pool.grow_cores_to(3);
        assert_eq!(report, ChangeReport { succeeded: 3, failed: 0 });
        assert_eq!(pool.worker_count(), 3);

        // Already at or above target
        assert_eq!(pool.grow_cores_to(2), ChangeReport::default());
        assert_eq!(pool.worker_count(), 3);
        assert_eq!(launcher.alive(), 3);
    }

    #[test]
    fn test_grow_cores_never_exceeds_max() {
        let launcher = Arc::new(MockLauncher::new());
        let mut pool = pool(&launcher, 4);

        pool.grow_cores_to(10);
        assert_eq!(pool.worker_count(), 4);
    }

    #[test]
    fn test_grow_cores_skips_failed_starts() {
        let launcher = Arc::new(MockLauncher::failing_on([1, 2]));
        let mut pool = pool(&launcher, 8);

        let report = pool.grow_cores_to(4);
        assert_eq!(report, ChangeReport { succeeded: 2, failed: 2 });
        assert!(!report.is_clean());
        assert_eq!(pool.worker_count(), 2);

        // Next attempt uses fresh indices and fills the gap
        let report = pool.grow_cores_to(4);
        assert_eq!(report.succeeded, 2);
        assert_eq!(pool.worker_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shrink_cores_is_lifo() {
        let launcher = Arc::new(MockLauncher::new());
        let mut pool = pool(&launcher, 8);
        pool.grow_cores_to(5);

        let report = pool.shrink_cores_to(2, 1).await;
        assert_eq!(report.succeeded, 3);
        assert_eq!(pool.worker_count(), 2);
        assert_eq!(launcher.stop_order(), vec![4, 3, 2]);
        assert_eq!(launcher.alive(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shrink_cores_respects_floor() {
        let launcher = Arc::new(MockLauncher::new());
        let mut pool = pool(&launcher, 8);
        pool.grow_cores_to(6);

        for (target, floor, expected) in [(0, 3, 3), (1, 2, 2), (2, 2, 2), (0, 5, 2)] {
            pool.shrink_cores_to(target, floor).await;
            assert_eq!(pool.worker_count(), expected, "target={target} floor={floor}");
            assert!(pool.worker_count() >= floor.min(2));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stubborn_workers_are_killed_within_deadline() {
        let launcher = Arc::new(MockLauncher::stubborn());
        let mut pool = pool(&launcher, 4);
        pool.grow_cores_to(2);

        let started = Instant::now();
        let report = pool.shrink_cores_to(0, 0).await;
        let elapsed = started.elapsed();

        assert_eq!(report, ChangeReport { succeeded: 2, failed: 0 });
        assert_eq!(pool.worker_count(), 0);
        assert_eq!(launcher.alive(), 0);
        assert!(elapsed >= Duration::from_secs(5));
        assert!(elapsed <= Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unkillable_workers_are_still_dropped() {
        let launcher = Arc::new(MockLauncher {
            stubborn: true,
            unkillable: true,
            ..MockLauncher::default()
        });
        let mut pool = pool(&launcher, 4);
        pool.grow_cores_to(3);

        let report = pool.shrink_cores_to(1, 1).await;
        assert_eq!(report, ChangeReport { succeeded: 0, failed: 2 });
        assert_eq!(pool.worker_count(), 1);
        assert_eq!(launcher.alive(), 1);
    }

    #[test]
    fn test_memory_grow_and_shrink() {
        let launcher = Arc::new(MockLauncher::new());
        let mut pool = pool(&launcher, 1);

        for _ in 0..3 {
            assert!(pool.grow_memory_by(1.0).is_clean());
        }
        assert_eq!(pool.memory_blocks(), 3);
        assert_eq!(pool.memory_bytes(), 3 * 1024 * 1024);

        let report = pool.shrink_memory_to(1);
        assert_eq!(report.succeeded, 2);
        assert_eq!(pool.memory_blocks(), 1);

        // Shrinking to a larger target is a no-op
        assert_eq!(pool.shrink_memory_to(5), ChangeReport::default());
        assert_eq!(pool.memory_blocks(), 1);
    }

    #[test]
    fn test_failed_allocation_is_noop() {
        let launcher = Arc::new(MockLauncher::new());
        let mut pool = pool(&launcher, 1);

        let report = pool.grow_memory_by(0.0);
        assert_eq!(report, ChangeReport { succeeded: 0, failed: 1 });
        assert_eq!(pool.memory_blocks(), 0);
    }

    #[test]
    fn test_memory_release_is_lifo() {
        let launcher = Arc::new(MockLauncher::new());
        let mut pool = pool(&launcher, 1);

        pool.grow_memory_by(1.0);
        pool.grow_memory_by(2.0);
        pool.grow_memory_by(3.0);

        pool.shrink_memory_to(2);
        assert_eq!(pool.memory_bytes(), 3 * 1024 * 1024);
        pool.shrink_memory_to(1);
        assert_eq!(pool.memory_bytes(), 1024 * 1024);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_all_is_idempotent() {
        let launcher = Arc::new(MockLauncher::new());
        let mut pool = pool(&launcher, 4);
        pool.grow_cores_to(4);
        pool.grow_memory_by(1.0);
        pool.grow_memory_by(1.0);

        let released = pool.release_all().await;
        assert_eq!(released.workers, 4);
        assert_eq!(released.memory_blocks, 2);
        assert!(pool.snapshot().is_empty());
        assert_eq!(launcher.alive(), 0);
        assert_eq!(launcher.stop_order(), vec![3, 2, 1, 0]);

        let released = pool.release_all().await;
        assert!(released.is_empty());
        assert!(pool.snapshot().is_empty());
    }
}
