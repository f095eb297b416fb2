//! In-process thread workers

use super::{Worker, WorkerError, WorkerLauncher};
use std::hint::black_box;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Iterations of busy work between stop-flag checks
const SPIN_BATCH: u64 = 4096;

/// Burn the calling thread until `stop` is set
pub fn spin_until(stop: &AtomicBool) {
    let mut acc = 0u64;
    while !stop.load(Ordering::Relaxed) {
        for i in 0..SPIN_BATCH {
            acc = acc.wrapping_mul(31).wrapping_add(i);
        }
        black_box(acc);
    }
}

/// Launches workers as named OS threads
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadLauncher;

impl WorkerLauncher for ThreadLauncher {
    fn launch(&self, index: usize) -> Result<Box<dyn Worker>, WorkerError> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();

        let handle = thread::Builder::new()
            .name(format!("cpu-worker-{index}"))
            .spawn(move || spin_until(&flag))
            .map_err(WorkerError::Spawn)?;

        Ok(Box::new(ThreadWorker {
            index,
            stop,
            handle: Some(handle),
        }))
    }

    fn kind(&self) -> &'static str {
        "thread"
    }
}

/// A spinning thread; threads can only be asked to stop, never killed
pub struct ThreadWorker {
    index: usize,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Worker for ThreadWorker {
    fn id(&self) -> String {
        format!("cpu-worker-{}", self.index)
    }

    fn request_stop(&mut self) -> Result<(), WorkerError> {
        self.stop.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn has_exited(&mut self) -> Result<bool, WorkerError> {
        let finished = self.handle.as_ref().map_or(true, JoinHandle::is_finished);
        if finished {
            if let Some(handle) = self.handle.take() {
                // A panicking spin loop has exited all the same
                let _ = handle.join();
            }
        }
        Ok(finished)
    }

    fn kill(&mut self) -> Result<(), WorkerError> {
        Err(WorkerError::Unkillable { id: self.id() })
    }
}

impl Drop for ThreadWorker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}
