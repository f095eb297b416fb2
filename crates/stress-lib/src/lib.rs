//! Library for the phased CPU and memory ramp stressor
//!
//! This crate provides the core functionality for:
//! - Planning ramp, hold and low phase timings
//! - CPU workers (child processes or threads) and reserved memory blocks
//! - A resource pool that grows and shrinks toward step targets
//! - The cycle driver and its shutdown handling
//! - Health checks and observability

pub mod driver;
pub mod health;
pub mod memory;
pub mod models;
pub mod observability;
pub mod planner;
pub mod pool;
pub mod worker;

pub use driver::{CycleDriver, Shutdown};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use memory::{AllocationError, MemoryBlock};
pub use models::*;
pub use observability::{StressMetrics, StructuredLogger};
pub use planner::PhasePlan;
pub use pool::{ChangeReport, ResourcePool, TerminationPolicy};
pub use worker::{create_launcher, Worker, WorkerError, WorkerLauncher, WorkerMode};
