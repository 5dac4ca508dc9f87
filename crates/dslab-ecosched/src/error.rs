//! Error types.

use thiserror::Error;

use crate::common::{MachineId, TaskId, VmId};

/// Failure of a query or command issued to the cluster engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClusterError {
    #[error("machine {0} not found")]
    MachineNotFound(MachineId),

    #[error("vm {0} not found")]
    VmNotFound(VmId),

    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("request rejected: {reason}")]
    Rejected { reason: String },
}

impl ClusterError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        ClusterError::Rejected { reason: reason.into() }
    }

    /// Stale or invalid references are expected and handled by skipping the entity.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ClusterError::MachineNotFound(_) | ClusterError::VmNotFound(_) | ClusterError::TaskNotFound(_)
        )
    }
}

/// Breach of a controller invariant. Never expected; reported to the error log.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvariantViolation {
    #[error("machine {0} is not assigned to any tier")]
    MachineWithoutTier(MachineId),

    #[error("machine {0} is assigned to more than one tier")]
    MachineInSeveralTiers(MachineId),

    #[error("tier partition holds {actual} machines, expected {expected}")]
    TierCountMismatch { expected: u32, actual: u32 },

    #[error("vm {0} completed a migration that was never started")]
    UnexpectedMigrationComplete(VmId),

    #[error("task {task} was placed on vm {vm} with a different architecture")]
    ArchMismatch { task: TaskId, vm: VmId },
}

/// Invalid controller configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("can't read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("can't parse YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid value of {name}: {message}")]
    InvalidValue { name: &'static str, message: String },
}
