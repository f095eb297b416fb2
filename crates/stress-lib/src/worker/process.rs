//! Child process workers
//!
//! Each worker is a copy of the stressor binary running the hidden `burn`
//! subcommand with a piped stdin. Closing the pipe is the graceful stop
//! request; a parent that dies closes it too, so children never outlive it
//! by more than one spin batch.

use super::thread::spin_until;
use super::{Worker, WorkerError, WorkerLauncher};
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tokio::process::{Child, ChildStdin, Command};

/// Subcommand that turns the stressor binary into a worker
pub const BURN_SUBCOMMAND: &str = "burn";

/// Worker body: spin one core until stdin reaches end-of-file
pub fn burn_until_stdin_closes() {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();

    thread::spawn(move || {
        let _ = io::copy(&mut io::stdin().lock(), &mut io::sink());
        flag.store(true, Ordering::Relaxed);
    });

    spin_until(&stop);
}

/// Launches workers as child processes
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ProcessLauncher {
    pub fn new(program: impl AsRef<Path>, args: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
        Self {
            program: program.as_ref().into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Launcher re-executing the running binary in burn mode
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, [BURN_SUBCOMMAND]))
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, index: usize) -> Result<Box<dyn Worker>, WorkerError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(WorkerError::Spawn)?;

        let stdin = child.stdin.take();
        let pid = child.id();

        Ok(Box::new(ProcessWorker {
            index,
            pid,
            child,
            stdin,
        }))
    }

    fn kind(&self) -> &'static str {
        "process"
    }
}

/// A running worker process
pub struct ProcessWorker {
    index: usize,
    pid: Option<u32>,
    child: Child,
    /// Held open for as long as the worker should run
    stdin: Option<ChildStdin>,
}

impl ProcessWorker {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl Worker for ProcessWorker {
    fn id(&self) -> String {
        match self.pid {
            Some(pid) => format!("cpu-worker-{} (pid {pid})", self.index),
            None => format!("cpu-worker-{}", self.index),
        }
    }

    fn request_stop(&mut self) -> Result<(), WorkerError> {
        drop(self.stdin.take());
        Ok(())
    }

    fn has_exited(&mut self) -> Result<bool, WorkerError> {
        self.child
            .try_wait()
            .map(|status| status.is_some())
            .map_err(|source| WorkerError::Status {
                id: self.id(),
                source,
            })
    }

    fn kill(&mut self) -> Result<(), WorkerError> {
        self.child.start_kill().map_err(|source| WorkerError::Signal {
            id: self.id(),
            source,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn wait_for_exit(worker: &mut Box<dyn Worker>, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if worker.has_exited().unwrap() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_closing_stdin_stops_worker() {
        // cat exits on end-of-file, just like the burn subcommand
        let launcher = ProcessLauncher::new("cat", Vec::<OsString>::new());
        let mut worker = launcher.launch(3).unwrap();
        assert!(worker.id().starts_with("cpu-worker-3"));
        assert!(!worker.has_exited().unwrap());

        worker.request_stop().unwrap();
        assert!(wait_for_exit(&mut worker, Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_kill_stops_worker_ignoring_stdin() {
        let launcher = ProcessLauncher::new("sleep", ["30"]);
        let mut worker = launcher.launch(0).unwrap();

        worker.request_stop().unwrap();
        assert!(!wait_for_exit(&mut worker, Duration::from_millis(200)).await);

        worker.kill().unwrap();
        assert!(wait_for_exit(&mut worker, Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_spawn() {
        let launcher = ProcessLauncher::new("/nonexistent/ramp-stressor", ["burn"]);
        assert!(matches!(launcher.launch(0), Err(WorkerError::Spawn(_))));
    }

    #[test]
    fn test_current_exe_launcher_uses_burn() {
        let launcher = ProcessLauncher::current_exe().unwrap();
        assert_eq!(launcher.args, vec![OsString::from(BURN_SUBCOMMAND)]);
    }
}
