//! Stressor configuration
//!
//! Every setting comes from an environment variable and is parsed on its
//! own. A missing variable silently takes the default; a malformed or
//! out-of-range one takes the default and produces a [`ConfigWarning`].
//! Nothing here can stop the stressor from starting.

use config::Config;
use std::fmt;
use std::str::FromStr;
use stress_lib::{CycleConfig, WorkerMode};
use tracing::warn;

const DEFAULT_STARTUP_DELAY_MAX_SECS: f64 = 30.0;
const DEFAULT_API_PORT: u16 = 8080;
const DEFAULT_INSTANCE_NAME: &str = "unknown";

/// Longest accepted duration or delay setting, one year
const MAX_DURATION_SECS: f64 = 365.0 * 24.0 * 3600.0;

/// Stressor configuration
#[derive(Debug, Clone)]
pub struct StressorConfig {
    pub cycle: CycleConfig,

    /// Upper bound of the random delay before the first cycle
    pub startup_delay_max_secs: f64,

    /// Logical cores reported by the host
    pub detected_cores: usize,

    pub worker_mode: WorkerMode,

    /// Health/metrics server port, 0 disables the server
    pub api_port: u16,

    /// Instance name attached to structured logs
    pub instance_name: String,
}

/// A setting that was present but unusable
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigWarning {
    pub key: String,
    pub value: String,
    pub default: String,
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid value {:?} for {}, using default {}",
            self.value, self.key, self.default
        )
    }
}

impl StressorConfig {
    /// Load configuration from the process environment
    pub fn load(detected_cores: usize) -> (Self, Vec<ConfigWarning>) {
        match Config::builder()
            .add_source(config::Environment::default())
            .build()
        {
            Ok(source) => Self::from_source(&source, detected_cores),
            Err(e) => {
                warn!(error = %e, "Failed to read environment, using default configuration");
                (Self::defaults(detected_cores), Vec::new())
            }
        }
    }

    /// Defaults for a host with `detected_cores` logical cores
    pub fn defaults(detected_cores: usize) -> Self {
        let detected_cores = detected_cores.max(1);
        Self {
            cycle: CycleConfig {
                max_cores: detected_cores,
                ..CycleConfig::default()
            },
            startup_delay_max_secs: DEFAULT_STARTUP_DELAY_MAX_SECS,
            detected_cores,
            worker_mode: WorkerMode::default(),
            api_port: DEFAULT_API_PORT,
            instance_name: DEFAULT_INSTANCE_NAME.to_string(),
        }
    }

    /// Read every setting from `source`, keyed by lowercased variable name
    pub fn from_source(source: &Config, detected_cores: usize) -> (Self, Vec<ConfigWarning>) {
        let defaults = Self::defaults(detected_cores);
        let base = defaults.cycle.clone();
        let mut reader = Reader {
            source,
            warnings: Vec::new(),
        };

        let cycle = CycleConfig {
            high_duration_secs: reader.read(
                "high_stress_duration",
                base.high_duration_secs,
                duration_secs,
            ),
            low_duration_secs: reader.read(
                "low_stress_duration",
                base.low_duration_secs,
                duration_secs,
            ),
            steps: reader.read("ramp_steps", base.steps, |steps| *steps >= 1),
            ramp_up_duration_secs: reader.read(
                "ramp_up_duration",
                base.ramp_up_duration_secs,
                duration_secs,
            ),
            ramp_down_duration_secs: reader.read(
                "ramp_down_duration",
                base.ramp_down_duration_secs,
                duration_secs,
            ),
            low_phase_fraction: reader.read("low_phase_percent", base.low_phase_fraction, |f| {
                (0.0..=1.0).contains(f)
            }),
            max_cores: reader.read("max_cpu_cores", base.max_cores, |cores| *cores > 0),
            max_memory_mb: reader.read("max_memory_mb", base.max_memory_mb, non_negative),
        };

        let config = Self {
            cycle,
            startup_delay_max_secs: reader.read(
                "startup_random_delay_max_sec",
                defaults.startup_delay_max_secs,
                duration_secs,
            ),
            detected_cores: defaults.detected_cores,
            worker_mode: reader.read("worker_mode", defaults.worker_mode, |_| true),
            api_port: reader.read("api_port", defaults.api_port, |_| true),
            instance_name: reader.read("hostname", defaults.instance_name, |name: &String| {
                !name.is_empty()
            }),
        };

        (config, reader.warnings)
    }
}

fn non_negative(value: &f64) -> bool {
    value.is_finite() && *value >= 0.0
}

fn duration_secs(value: &f64) -> bool {
    non_negative(value) && *value <= MAX_DURATION_SECS
}

struct Reader<'a> {
    source: &'a Config,
    warnings: Vec<ConfigWarning>,
}

impl Reader<'_> {
    fn read<T>(&mut self, key: &str, default: T, valid: impl Fn(&T) -> bool) -> T
    where
        T: FromStr + fmt::Display,
    {
        let Ok(raw) = self.source.get_string(key) else {
            return default;
        };

        match raw.trim().parse::<T>() {
            Ok(value) if valid(&value) => value,
            _ => {
                self.warnings.push(ConfigWarning {
                    key: key.to_uppercase(),
                    value: raw,
                    default: default.to_string(),
                });
                default
            }
        }
    }
}
