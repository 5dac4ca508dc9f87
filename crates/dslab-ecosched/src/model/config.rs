//! Cluster configuration.

use serde::{Deserialize, Serialize};

use crate::common::CpuArch;
use crate::error::ConfigError;

/// Holds configuration of a single physical machine or a set of identical machines.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct HostConfig {
    /// Machine name.
    /// Should be set if count = 1.
    pub name: Option<String>,
    /// Machine name prefix.
    /// Full name is produced by appending machine instance number to the prefix.
    /// Should be set if count > 1.
    pub name_prefix: Option<String>,
    /// CPU architecture.
    pub arch: CpuArch,
    /// Number of cores.
    pub cores: u32,
    /// Memory capacity in MB.
    pub memory: u64,
    /// Power consumption of an idle active machine in watts.
    pub idle_power: Option<f64>,
    /// Power consumption of a fully loaded machine in watts.
    pub max_power: Option<f64>,
    /// Number of such machines.
    pub count: Option<u32>,
}

impl HostConfig {
    /// Expands the config into names of individual machines.
    pub fn names(&self) -> Vec<String> {
        let count = self.count.unwrap_or(1);
        if count == 1 {
            if let Some(name) = &self.name {
                return vec![name.clone()];
            }
        }
        let prefix = self
            .name_prefix
            .clone()
            .or_else(|| self.name.clone())
            .unwrap_or_else(|| self.arch.to_string());
        (1..=count).map(|i| format!("{}{}", prefix, i)).collect()
    }
}

/// Holds raw cluster config parsed from YAML file.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone, Default)]
struct RawClusterConfig {
    pub hosts: Option<Vec<HostConfig>>,
    pub migration_duration: Option<f64>,
    pub state_change_duration: Option<f64>,
}

/// Represents cluster configuration.
///
/// Unknown keys are ignored, so the same file may also hold the controller config.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct ClusterConfig {
    /// Configurations of physical machines, in machine id order.
    pub hosts: Vec<HostConfig>,
    /// Delay in seconds between a migration command and its completion.
    pub migration_duration: f64,
    /// Delay in seconds between a power state change command and its completion.
    pub state_change_duration: f64,
}

impl ClusterConfig {
    /// Creates cluster config by reading parameter values from YAML file
    /// (uses default values if some parameters are absent).
    pub fn from_file(file_name: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(file_name).map_err(|source| ConfigError::Io {
            path: file_name.to_string(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let raw: RawClusterConfig = serde_yaml::from_str(content)?;
        let config = Self {
            hosts: raw.hosts.unwrap_or_default(),
            migration_duration: raw.migration_duration.unwrap_or(5.),
            state_change_duration: raw.state_change_duration.unwrap_or(2.),
        };
        for host in &config.hosts {
            if host.cores == 0 {
                return Err(ConfigError::InvalidValue {
                    name: "hosts.cores",
                    message: format!("host {:?} has no cores", host.names()),
                });
            }
        }
        Ok(config)
    }

    pub fn machine_count(&self) -> u32 {
        self.hosts.iter().map(|host| host.count.unwrap_or(1)).sum()
    }
}
