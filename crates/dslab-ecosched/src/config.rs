//! Controller configuration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::common::{CpuArch, PerformanceLevel, VmType};
use crate::error::ConfigError;

/// When the controller tries to consolidate lightly loaded machines.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsolidationMode {
    /// On every periodic check.
    Periodic,
    /// After every task completion.
    OnTaskComplete,
    Disabled,
}

/// Holds raw controller config parsed from YAML file.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone, Default)]
struct RawControllerConfig {
    pub max_running: Option<u32>,
    pub min_running: Option<u32>,
    pub standby_size: Option<u32>,
    pub overload_threshold: Option<f64>,
    pub underload_threshold: Option<f64>,
    pub consolidation_threshold: Option<f64>,
    pub memory_headroom_ratio: Option<f64>,
    pub sla_rescue_ratio: Option<f64>,
    pub consolidation: Option<ConsolidationMode>,
    pub rebalance: Option<bool>,
    pub performance_bands: Option<[f64; 3]>,
    pub vm_images: Option<BTreeMap<CpuArch, VmType>>,
}

/// Represents controller configuration.
///
/// All thresholds are utilization values, i.e. active tasks per core.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct ControllerConfig {
    /// Number of machines placed in the running tier on init.
    pub max_running: u32,
    /// Idle machines are not demoted while the running tier is this small.
    pub min_running: u32,
    /// Target size of the standby tier.
    pub standby_size: u32,
    /// Machines above this utilization are overloaded.
    pub overload_threshold: f64,
    /// Machines below this utilization are underutilized.
    pub underload_threshold: f64,
    /// Machines below this utilization are consolidation sources.
    pub consolidation_threshold: f64,
    /// Memory relief targets must use less than this fraction of their memory.
    pub memory_headroom_ratio: f64,
    /// SLA rescue targets must have utilization below this fraction of the source utilization.
    pub sla_rescue_ratio: f64,
    /// When consolidation runs.
    pub consolidation: ConsolidationMode,
    /// Whether periodic checks move load off overloaded machines.
    pub rebalance: bool,
    /// Lower utilization bounds (exclusive) of P0, P1 and P2; anything below the last bound runs at P3.
    pub performance_bands: [f64; 3],
    /// VM image used when a VM is created for a machine rather than for a task.
    pub vm_images: BTreeMap<CpuArch, VmType>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::from_raw(RawControllerConfig::default())
    }
}

impl ControllerConfig {
    /// Creates controller config by reading parameter values from YAML file
    /// (uses default values if some parameters are absent).
    pub fn from_file(file_name: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(file_name).map_err(|source| ConfigError::Io {
            path: file_name.to_string(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Creates controller config from YAML string.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let raw: RawControllerConfig = serde_yaml::from_str(content)?;
        let config = Self::from_raw(raw);
        config.validate()?;
        Ok(config)
    }

    fn from_raw(raw: RawControllerConfig) -> Self {
        Self {
            max_running: raw.max_running.unwrap_or(12),
            min_running: raw.min_running.unwrap_or(8),
            standby_size: raw.standby_size.unwrap_or(4),
            overload_threshold: raw.overload_threshold.unwrap_or(0.7),
            underload_threshold: raw.underload_threshold.unwrap_or(0.1),
            consolidation_threshold: raw.consolidation_threshold.unwrap_or(0.3),
            memory_headroom_ratio: raw.memory_headroom_ratio.unwrap_or(0.5),
            sla_rescue_ratio: raw.sla_rescue_ratio.unwrap_or(0.7),
            consolidation: raw.consolidation.unwrap_or(ConsolidationMode::Periodic),
            rebalance: raw.rebalance.unwrap_or(true),
            performance_bands: raw.performance_bands.unwrap_or([0.7, 0.4, 0.2]),
            vm_images: raw.vm_images.unwrap_or_default(),
        }
    }

    /// Checks that thresholds are fractions and performance bands are decreasing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fractions = [
            ("overload_threshold", self.overload_threshold),
            ("underload_threshold", self.underload_threshold),
            ("consolidation_threshold", self.consolidation_threshold),
            ("memory_headroom_ratio", self.memory_headroom_ratio),
            ("sla_rescue_ratio", self.sla_rescue_ratio),
        ];
        for (name, value) in fractions {
            if !(0. ..=1.).contains(&value) {
                return Err(ConfigError::InvalidValue {
                    name,
                    message: format!("{} is outside [0, 1]", value),
                });
            }
        }
        if self.underload_threshold > self.overload_threshold {
            return Err(ConfigError::InvalidValue {
                name: "underload_threshold",
                message: format!(
                    "{} is above overload threshold {}",
                    self.underload_threshold, self.overload_threshold
                ),
            });
        }
        let bands = self.performance_bands;
        if !(bands[0] >= bands[1] && bands[1] >= bands[2]) {
            return Err(ConfigError::InvalidValue {
                name: "performance_bands",
                message: format!("{:?} is not decreasing", bands),
            });
        }
        if self.min_running > self.max_running {
            return Err(ConfigError::InvalidValue {
                name: "min_running",
                message: format!("{} is above max_running {}", self.min_running, self.max_running),
            });
        }
        Ok(())
    }

    /// Returns the VM image for machines of the given architecture.
    pub fn image_for(&self, arch: CpuArch) -> VmType {
        if let Some(vm_type) = self.vm_images.get(&arch) {
            return *vm_type;
        }
        match arch {
            CpuArch::Power => VmType::Aix,
            _ => VmType::Linux,
        }
    }

    /// Maps machine utilization to a performance level; higher utilization never gets a slower level.
    pub fn performance_for(&self, utilization: f64) -> PerformanceLevel {
        let [p0, p1, p2] = self.performance_bands;
        if utilization > p0 {
            PerformanceLevel::P0
        } else if utilization > p1 {
            PerformanceLevel::P1
        } else if utilization > p2 {
            PerformanceLevel::P2
        } else {
            PerformanceLevel::P3
        }
    }
}
