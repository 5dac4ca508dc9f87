//! Task placement and power management controller for virtualized clusters.
//!
//! The [`controller::Controller`] reacts to events of a cluster engine (task arrivals and completions, periodic
//! checks, alarms and completions of asynchronous commands). It places tasks on VMs, creates and migrates VMs and
//! moves machines between running, standby and off tiers, balancing SLA compliance against energy consumption.
//! The engine is accessed only through the [`cluster::ClusterApi`] trait; [`model::InMemoryCluster`] is a simple
//! deterministic implementation of it.

pub mod cluster;
pub mod common;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod log;
pub mod migration;
pub mod model;
pub mod pending;
pub mod placement;
pub mod power;
pub mod registry;
pub mod sla;
pub mod tiers;

// Re-export for use in log macros
pub use colored;
