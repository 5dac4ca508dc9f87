//! In-memory cluster engine used by tests and drivers.

pub mod cluster;
pub mod config;
pub mod energy;

pub use cluster::{Command, InMemoryCluster};
pub use config::{ClusterConfig, HostConfig};
