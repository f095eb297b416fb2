//! CPU-consuming workers
//!
//! A worker pins one core until it is told to stop. The pool only sees the
//! [`Worker`] and [`WorkerLauncher`] traits; this module provides an
//! implementation backed by child processes and one backed by OS threads.

mod process;
mod thread;

pub use process::{burn_until_stdin_closes, ProcessLauncher, ProcessWorker, BURN_SUBCOMMAND};
pub use thread::{spin_until, ThreadLauncher, ThreadWorker};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by worker lifecycle operations
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to signal worker {id}: {source}")]
    Signal {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to query status of worker {id}: {source}")]
    Status {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker {id} cannot be forcibly terminated")]
    Unkillable { id: String },
}

/// Handle to a running worker
pub trait Worker: Send {
    /// Human readable identity used in logs
    fn id(&self) -> String;

    /// Ask the worker to stop on its own
    fn request_stop(&mut self) -> Result<(), WorkerError>;

    /// Whether the worker has finished, reaping it if so
    fn has_exited(&mut self) -> Result<bool, WorkerError>;

    /// Terminate the worker without its cooperation
    fn kill(&mut self) -> Result<(), WorkerError>;
}

/// Factory for workers
pub trait WorkerLauncher: Send + Sync {
    /// Start worker number `index`
    fn launch(&self, index: usize) -> Result<Box<dyn Worker>, WorkerError>;

    /// Short name of the execution backend
    fn kind(&self) -> &'static str;
}

/// Execution backend for workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerMode {
    /// Child processes running the `burn` subcommand
    #[default]
    Process,
    /// Threads inside the stressor process
    Thread,
}

impl fmt::Display for WorkerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerMode::Process => f.write_str("process"),
            WorkerMode::Thread => f.write_str("thread"),
        }
    }
}

impl FromStr for WorkerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "process" => Ok(Self::Process),
            "thread" => Ok(Self::Thread),
            other => Err(format!("unsupported worker mode: {other}")),
        }
    }
}

/// Create the launcher for a worker mode
///
/// Process workers re-execute the current binary; if its path can't be
/// resolved we fall back to threads rather than refusing to start.
pub fn create_launcher(mode: WorkerMode) -> Arc<dyn WorkerLauncher> {
    match mode {
        WorkerMode::Process => match ProcessLauncher::current_exe() {
            Ok(launcher) => {
                tracing::info!(program = %launcher.program().display(), "Using process workers");
                Arc::new(launcher)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not resolve own executable, using thread workers");
                Arc::new(ThreadLauncher)
            }
        },
        WorkerMode::Thread => {
            tracing::info!("Using thread workers");
            Arc::new(ThreadLauncher)
        }
    }
}
