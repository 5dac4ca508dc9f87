//! Identifiers and small value types shared by the controller and the cluster interface.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

pub type MachineId = u32;
pub type VmId = u32;
pub type TaskId = u32;

/// Event time as reported by the engine.
pub type Time = f64;

/// CPU architecture of a machine, a VM or the one required by a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CpuArch {
    Arm,
    Power,
    Riscv,
    X86,
}

impl Display for CpuArch {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            CpuArch::Arm => write!(f, "arm"),
            CpuArch::Power => write!(f, "power"),
            CpuArch::Riscv => write!(f, "riscv"),
            CpuArch::X86 => write!(f, "x86"),
        }
    }
}

/// VM image type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmType {
    Linux,
    LinuxRt,
    Win,
    Aix,
}

impl Display for VmType {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            VmType::Linux => write!(f, "linux"),
            VmType::LinuxRt => write!(f, "linux_rt"),
            VmType::Win => write!(f, "win"),
            VmType::Aix => write!(f, "aix"),
        }
    }
}

/// Service level class of a task, `Sla0` being the strictest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlaClass {
    Sla0,
    Sla1,
    Sla2,
    Sla3,
}

impl SlaClass {
    pub const ALL: [SlaClass; 4] = [SlaClass::Sla0, SlaClass::Sla1, SlaClass::Sla2, SlaClass::Sla3];
}

impl Display for SlaClass {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            SlaClass::Sla0 => write!(f, "SLA0"),
            SlaClass::Sla1 => write!(f, "SLA1"),
            SlaClass::Sla2 => write!(f, "SLA2"),
            SlaClass::Sla3 => write!(f, "SLA3"),
        }
    }
}

/// Scheduling priority of a task inside its VM.
///
/// Variants are declared from lowest to highest, so `Priority::High > Priority::Low`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Mid,
    High,
}

impl Display for Priority {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Mid => write!(f, "mid"),
            Priority::High => write!(f, "high"),
        }
    }
}

/// Coarse power class of a machine state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PowerClass {
    Active,
    Standby,
    Off,
}

/// Machine power state (ACPI-like S-states).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PowerState {
    S0,
    S0i1,
    S1,
    S2,
    S3,
    S4,
    S5,
}

impl PowerState {
    /// Only S0 runs tasks, S5 is powered off, everything in between is some form of standby.
    pub fn class(&self) -> PowerClass {
        match self {
            PowerState::S0 => PowerClass::Active,
            PowerState::S5 => PowerClass::Off,
            _ => PowerClass::Standby,
        }
    }

    pub fn is_active(&self) -> bool {
        self.class() == PowerClass::Active
    }
}

impl Display for PowerState {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            PowerState::S0 => write!(f, "S0"),
            PowerState::S0i1 => write!(f, "S0i1"),
            PowerState::S1 => write!(f, "S1"),
            PowerState::S2 => write!(f, "S2"),
            PowerState::S3 => write!(f, "S3"),
            PowerState::S4 => write!(f, "S4"),
            PowerState::S5 => write!(f, "S5"),
        }
    }
}

/// Per-core performance level (P-state), `P0` being the fastest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PerformanceLevel {
    P0,
    P1,
    P2,
    P3,
}

impl Display for PerformanceLevel {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            PerformanceLevel::P0 => write!(f, "P0"),
            PerformanceLevel::P1 => write!(f, "P1"),
            PerformanceLevel::P2 => write!(f, "P2"),
            PerformanceLevel::P3 => write!(f, "P3"),
        }
    }
}
