use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tracing::debug;

use crate::benchmark::DEFAULT_IMAGE;
use crate::collection::CollectionPolicy;
use crate::run::{ReadinessPolicy, RunPolicy};

pub const CONFIG_ENV: &str = "KNB_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "knb.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Timing and deployment policy. Every field has a default, so a config file
/// only needs the values it changes.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct KnbConfig {
    pub command_timeout_secs: u64,
    pub pod_readiness: ReadinessConf,
    #[serde(default = "ReadinessConf::service")]
    pub service_readiness: ReadinessConf,
    pub settle_secs: u64,
    pub phase_poll_secs: u64,
    pub benchmark_image: String,
    pub monitor: MonitorConf,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct ReadinessConf {
    pub initial_delay_secs: u64,
    /// Attempts after the first.
    pub retries: u32,
    pub delay_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct MonitorConf {
    pub image: String,
    pub port: u16,
    pub tunnel_wait_secs: u64,
    pub request_timeout_secs: u64,
    pub sysinfo_retries: u32,
    pub sysinfo_delay_secs: u64,
    pub fetch_retries: u32,
    pub fetch_delay_secs: u64,
}

impl Default for KnbConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: 90,
            pod_readiness: ReadinessConf::default(),
            service_readiness: ReadinessConf::service(),
            settle_secs: 5,
            phase_poll_secs: 10,
            benchmark_image: DEFAULT_IMAGE.to_string(),
            monitor: MonitorConf::default(),
        }
    }
}

impl Default for ReadinessConf {
    fn default() -> Self {
        Self {
            initial_delay_secs: 2,
            retries: 30,
            delay_secs: 2,
        }
    }
}

impl ReadinessConf {
    fn service() -> Self {
        Self {
            retries: 10,
            ..Self::default()
        }
    }

    pub fn policy(&self) -> ReadinessPolicy {
        ReadinessPolicy {
            initial_delay: Duration::from_secs(self.initial_delay_secs),
            retries: self.retries,
            delay: Duration::from_secs(self.delay_secs),
        }
    }
}

impl Default for MonitorConf {
    fn default() -> Self {
        Self {
            image: "docker.io/kkourt/kubenetbench-monitor".into(),
            port: knb_monitor::protocol::DEFAULT_PORT,
            tunnel_wait_secs: 10,
            request_timeout_secs: 120,
            sysinfo_retries: 10,
            sysinfo_delay_secs: 4,
            fetch_retries: 5,
            fetch_delay_secs: 5,
        }
    }
}

impl KnbConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn run_policy(&self) -> RunPolicy {
        RunPolicy {
            pod_readiness: self.pod_readiness.policy(),
            service_readiness: self.service_readiness.policy(),
            settle: Duration::from_secs(self.settle_secs),
            phase_poll: Duration::from_secs(self.phase_poll_secs),
        }
    }

    pub fn collection_policy(&self) -> CollectionPolicy {
        CollectionPolicy {
            fetch_retries: self.monitor.fetch_retries,
            fetch_delay: Duration::from_secs(self.monitor.fetch_delay_secs),
        }
    }
}

/// Loads `$KNB_CONFIG`, else `knb.yaml` when present, else the defaults.
pub async fn load_config() -> Result<KnbConfig, ConfigError> {
    match std::env::var(CONFIG_ENV) {
        Ok(path) => load_from(Path::new(&path)).await,
        Err(_) if Path::new(DEFAULT_CONFIG_FILE).exists() => load_from(Path::new(DEFAULT_CONFIG_FILE)).await,
        Err(_) => {
            debug!("no {}, using default config", DEFAULT_CONFIG_FILE);
            Ok(KnbConfig::default())
        }
    }
}

pub async fn load_from(path: &Path) -> Result<KnbConfig, ConfigError> {
    let txt = fs::read_to_string(path).await.map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    if txt.trim().is_empty() {
        return Ok(KnbConfig::default());
    }
    serde_yaml::from_str(&txt).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
