//! Operator configuration
//!
//! Loaded from a TOML file and validated as a whole before any controller
//! starts. Every section has defaults, so an empty file is a valid config
//! with no IPAM networks and no seeds.
//!
//! ```toml
//! [controller]
//! workers = 4
//!
//! [ipam]
//! wait_timeout_secs = 60
//! [[ipam.networks]]
//! cidr = "192.168.0.0/16"
//! gateway = "192.168.0.1"
//! dns_servers = ["8.8.8.8"]
//!
//! [sync]
//! namespace = "fleetplane-system"
//! [[sync.seeds]]
//! name = "europe-west"
//! kubeconfig = "/etc/fleetplane/seeds/europe-west.kubeconfig"
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::controller::{IpamOptions, Pool, QueueBackoff, RetryConfig, SyncOptions};
use crate::error::{Error, Result};

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct OperatorConfig {
    pub controller: ControllerConfig,
    pub updater: UpdaterConfig,
    pub ipam: IpamConfig,
    pub sync: SyncConfig,
}

/// Worker pool and work queue backoff shared by all controllers
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ControllerConfig {
    pub workers: usize,
    pub backoff_base_ms: u64,
    pub backoff_max_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            backoff_base_ms: 500,
            backoff_max_secs: 300,
        }
    }
}

/// Conflict retry of the updater
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct UpdaterConfig {
    /// 0 retries until the write lands
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 10,
            max_delay_ms: 1000,
            backoff_multiplier: 2.0,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    pub cidr: String,
    pub gateway: String,
    #[serde(default)]
    pub dns_servers: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct IpamConfig {
    pub networks: Vec<NetworkConfig>,
    pub wait_timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for IpamConfig {
    fn default() -> Self {
        Self {
            networks: Vec::new(),
            wait_timeout_secs: 60,
            poll_interval_ms: 500,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SeedConfig {
    pub name: String,
    /// Kubeconfig of the seed; absent means the operator's own cluster
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,
    #[serde(default)]
    pub context: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Master namespace holding the locations; all namespaces when unset
    pub namespace: Option<String>,
    pub seeds: Vec<SeedConfig>,
    pub resync_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            seeds: Vec::new(),
            resync_secs: 300,
        }
    }
}

/// Parse `cidr,gateway[,dns...]` as given to `--network`
pub fn parse_network_flag(value: &str) -> Result<NetworkConfig> {
    let mut parts = value.split(',').map(str::trim);
    let cidr = parts.next().filter(|s| !s.is_empty());
    let gateway = parts.next().filter(|s| !s.is_empty());
    match (cidr, gateway) {
        (Some(cidr), Some(gateway)) => Ok(NetworkConfig {
            cidr: cidr.to_string(),
            gateway: gateway.to_string(),
            dns_servers: parts.filter(|s| !s.is_empty()).map(String::from).collect(),
        }),
        _ => Err(Error::ConfigError(format!(
            "network {value:?} must be cidr,gateway[,dns...]"
        ))),
    }
}

fn positive(what: &str, value: u64) -> Result<()> {
    if value == 0 {
        return Err(Error::ConfigError(format!("{what} must be greater than zero")));
    }
    Ok(())
}

impl OperatorConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml(&raw)
            .map_err(|e| Error::ConfigError(format!("{}: {e}", path.display())))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)
            .map_err(|e| Error::ConfigError(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.controller.workers == 0 {
            return Err(Error::ConfigError("controller.workers must be at least 1".into()));
        }
        positive("controller.backoff_base_ms", self.controller.backoff_base_ms)?;
        if Duration::from_millis(self.controller.backoff_base_ms)
            > Duration::from_secs(self.controller.backoff_max_secs)
        {
            return Err(Error::ConfigError(
                "controller.backoff_base_ms exceeds controller.backoff_max_secs".into(),
            ));
        }
        if self.updater.backoff_multiplier < 1.0 {
            return Err(Error::ConfigError(
                "updater.backoff_multiplier must be at least 1.0".into(),
            ));
        }
        positive("ipam.wait_timeout_secs", self.ipam.wait_timeout_secs)?;
        positive("ipam.poll_interval_ms", self.ipam.poll_interval_ms)?;
        positive("sync.resync_secs", self.sync.resync_secs)?;

        self.pools()?;

        let mut names = HashSet::new();
        for seed in &self.sync.seeds {
            if seed.name.trim().is_empty() {
                return Err(Error::ConfigError("sync.seeds[].name must not be empty".into()));
            }
            if !names.insert(seed.name.as_str()) {
                return Err(Error::ConfigError(format!(
                    "seed {:?} is configured twice",
                    seed.name
                )));
            }
        }
        Ok(())
    }

    pub fn pools(&self) -> Result<Vec<Pool>> {
        self.ipam
            .networks
            .iter()
            .map(|n| Pool::new(&n.cidr, &n.gateway, &n.dns_servers))
            .collect()
    }

    pub fn queue_backoff(&self) -> QueueBackoff {
        QueueBackoff {
            base: Duration::from_millis(self.controller.backoff_base_ms),
            max: Duration::from_secs(self.controller.backoff_max_secs),
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.updater.max_attempts,
            initial_delay: Duration::from_millis(self.updater.initial_delay_ms),
            max_delay: Duration::from_millis(self.updater.max_delay_ms),
            backoff_multiplier: self.updater.backoff_multiplier,
        }
    }

    pub fn ipam_options(&self) -> Result<IpamOptions> {
        Ok(IpamOptions {
            pools: self.pools()?,
            wait_timeout: Duration::from_secs(self.ipam.wait_timeout_secs),
            poll_interval: Duration::from_millis(self.ipam.poll_interval_ms),
            retry: self.retry_config(),
        })
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            namespace: self.sync.namespace.clone(),
            resync_period: Duration::from_secs(self.sync.resync_secs),
            retry: self.retry_config(),
        }
    }
}
