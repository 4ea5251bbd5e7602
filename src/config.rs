//! Runtime configuration.
//!
//! Three layers, lowest priority first: built-in defaults, site defaults
//! from the TOML file named by `PYDPIPER_CONFIG_FILE`, and command-line
//! flags. Sites use the config file for things like the batch system's
//! memory request variable so users do not have to repeat them per run.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable naming the site defaults file.
pub const CONFIG_FILE_ENV: &str = "PYDPIPER_CONFIG_FILE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("could not parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Compute substrate executors run on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum QueueType {
    /// Executors are child processes on this host.
    #[default]
    Local,
    /// Executors are submitted as SGE/OGS batch jobs.
    Sge,
    /// Executors are submitted as PBS/Torque batch jobs.
    Pbs,
}

impl QueueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Sge => "sge",
            Self::Pbs => "pbs",
        }
    }
}

/// Scheduler and executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Minutes without a heartbeat before an executor is declared lost.
    pub latency_tolerance: u64,
    /// Minutes a batch-launched executor waits before first contact, so it
    /// does not hammer a server that has not started accepting yet.
    pub executor_start_delay: u64,
    /// Maximum memory in gigabytes an executor may be granted.
    pub mem: f64,
    /// Batch-system resource variable used for memory requests
    /// ("mem" on most sites, "vmem" on some).
    pub mem_request_variable: String,
    /// SGE parallel environment for multi-core executors.
    pub pe: Option<String>,
    /// Run one stage at a time using the executor's full allotment,
    /// for sites with strict batch accounting.
    pub greedy: bool,
    /// Maximum image pairs considered by LSQ12 pipeline builders. Carried
    /// in the config surface for the builders; the scheduler ignores it.
    pub lsq12_max_pairs: u32,
    /// Seconds between executor heartbeats.
    pub heartbeat_interval: u64,
    /// Minutes an idle executor waits for work before draining.
    pub idle_timeout: u64,
    /// Worker cores per executor (0 = detect at startup).
    pub cores: u32,
    /// Substrate executors run on.
    pub queue_type: QueueType,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            latency_tolerance: 10,
            executor_start_delay: 10,
            mem: 16.0,
            mem_request_variable: "mem".to_string(),
            pe: None,
            greedy: false,
            lsq12_max_pairs: 25,
            heartbeat_interval: 60,
            idle_timeout: 10,
            cores: 0,
            queue_type: QueueType::Local,
        }
    }
}

impl Settings {
    pub fn latency_tolerance(&self) -> Duration {
        Duration::from_secs(self.latency_tolerance * 60)
    }

    pub fn executor_start_delay(&self) -> Duration {
        Duration::from_secs(self.executor_start_delay * 60)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout * 60)
    }

    /// Parse a settings file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Apply non-`None` command-line overrides on top of these settings.
    pub fn apply(&mut self, overrides: SettingsOverrides) {
        if let Some(v) = overrides.latency_tolerance {
            self.latency_tolerance = v;
        }
        if let Some(v) = overrides.executor_start_delay {
            self.executor_start_delay = v;
        }
        if let Some(v) = overrides.mem {
            self.mem = v;
        }
        if let Some(v) = overrides.mem_request_variable {
            self.mem_request_variable = v;
        }
        if let Some(v) = overrides.pe {
            self.pe = Some(v);
        }
        if overrides.greedy {
            self.greedy = true;
        }
        if let Some(v) = overrides.lsq12_max_pairs {
            self.lsq12_max_pairs = v;
        }
        if let Some(v) = overrides.heartbeat_interval {
            self.heartbeat_interval = v;
        }
        if let Some(v) = overrides.idle_timeout {
            self.idle_timeout = v;
        }
        if let Some(v) = overrides.cores {
            self.cores = v;
        }
        if let Some(v) = overrides.queue_type {
            self.queue_type = v;
        }
    }
}

/// Command-line values layered over file settings; `None` means the flag
/// was not given.
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub latency_tolerance: Option<u64>,
    pub executor_start_delay: Option<u64>,
    pub mem: Option<f64>,
    pub mem_request_variable: Option<String>,
    pub pe: Option<String>,
    pub greedy: bool,
    pub lsq12_max_pairs: Option<u32>,
    pub heartbeat_interval: Option<u64>,
    pub idle_timeout: Option<u64>,
    pub cores: Option<u32>,
    pub queue_type: Option<QueueType>,
}

/// Load settings from the site config file (if `PYDPIPER_CONFIG_FILE` is
/// set) and apply CLI overrides.
pub fn load_settings(overrides: SettingsOverrides) -> Result<Settings, ConfigError> {
    let mut settings = match std::env::var_os(CONFIG_FILE_ENV) {
        Some(path) => {
            let path = std::path::PathBuf::from(path);
            tracing::info!(path = %path.display(), "loading site config");
            Settings::from_file(&path)?
        }
        None => Settings::default(),
    };
    settings.apply(overrides);
    Ok(settings)
}
