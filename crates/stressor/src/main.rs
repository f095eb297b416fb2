//! Ramp Stressor - phased CPU and memory load generator
//!
//! Alternates a high phase (ramp up, hold, ramp down) with a low phase until
//! interrupted, then releases every worker and memory block it holds.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use stress_lib::{
    driver::{CycleDriver, Shutdown},
    health::{components, HealthRegistry},
    models::secs,
    observability::{StressMetrics, StructuredLogger},
    worker::{burn_until_stdin_closes, create_launcher},
};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const STRESSOR_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit status when a second signal cuts cleanup short
const FORCED_EXIT_CODE: i32 = 130;

#[derive(Parser)]
#[command(name = "ramp-stressor")]
#[command(author, version, about = "Cyclical CPU and memory stressor", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run stress cycles until interrupted (default)
    Run,

    /// Keep one core busy until stdin closes
    #[command(hide = true)]
    Burn,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Worker children never start a runtime or logging
    if let Some(Commands::Burn) = cli.command {
        burn_until_stdin_closes();
        return Ok(());
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?
        .block_on(run())
}

async fn run() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let detected_cores = num_cpus::get();
    let (config, warnings) = config::StressorConfig::load(detected_cores);
    for warning in &warnings {
        warn!(
            key = %warning.key,
            value = %warning.value,
            default = %warning.default,
            "Invalid configuration value, using default"
        );
    }

    // Must be installed before the banner is logged
    let signals = Signals::install().context("Failed to install signal handlers")?;

    let launcher = create_launcher(config.worker_mode);
    let logger = StructuredLogger::new(&config.instance_name);
    logger.log_startup(
        STRESSOR_VERSION,
        &config.cycle,
        config.detected_cores,
        config.startup_delay_max_secs,
        launcher.kind(),
    );

    // Initialize health registry
    let health_registry = HealthRegistry::new();
    health_registry.register(components::DRIVER).await;
    health_registry.register(components::POOL).await;

    if config.api_port != 0 {
        let app_state = Arc::new(api::AppState::new(
            health_registry.clone(),
            StressMetrics::new(),
        ));
        let port = config.api_port;
        tokio::spawn(async move {
            if let Err(e) = api::serve(port, app_state).await {
                error!(error = %e, port = port, "API server stopped");
            }
        });
    }

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let mut startup = Shutdown::new(shutdown_tx.subscribe());
    tokio::spawn(watch_signals(signals, shutdown_tx, logger.clone()));

    if !startup_delay(config.startup_delay_max_secs, &mut startup).await {
        info!("Shutdown requested before the first cycle");
        return Ok(());
    }

    health_registry.set_ready(true).await;

    let driver = CycleDriver::new(config.cycle.clone(), launcher)
        .with_logger(logger)
        .with_health(health_registry);

    driver
        .run(shutdown_rx)
        .await
        .context("Stress cycle failed")?;

    info!("Stressor stopped");
    Ok(())
}

/// Sleep a random duration up to `max_secs`
///
/// Returns false if shutdown arrived first.
async fn startup_delay(max_secs: f64, shutdown: &mut Shutdown) -> bool {
    if max_secs <= 0.0 {
        return !shutdown.poll();
    }

    let delay = rand::thread_rng().gen_range(0.0..=max_secs);
    info!(delay_secs = delay, "Waiting before first cycle");

    tokio::select! {
        _ = tokio::time::sleep(secs(delay)) => true,
        _ = shutdown.recv() => false,
    }
}

/// Broadcast shutdown on the first signal; exit on the second
async fn watch_signals(
    mut signals: Signals,
    shutdown: broadcast::Sender<()>,
    logger: StructuredLogger,
) {
    let reason = signals.recv().await;
    logger.log_shutdown(reason);
    let _ = shutdown.send(());

    let reason = signals.recv().await;
    warn!(reason = reason, "Second signal received, exiting without cleanup");
    std::process::exit(FORCED_EXIT_CODE);
}

/// SIGINT and SIGTERM listeners
#[cfg(unix)]
struct Signals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT received",
            _ = self.terminate.recv() => "SIGTERM received",
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn install() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> &'static str {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
        "Ctrl-C received"
    }
}
