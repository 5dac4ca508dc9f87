//! Interface of the cluster engine and read-only accessors over it.
//!
//! The controller owns no physics: machines, VMs and tasks live in the engine, which the controller queries through
//! [`ResourceQuery`] and commands through [`ClusterCommands`]. Commands such as migration or power state change
//! complete asynchronously, the engine reports their completion with a separate event.

use serde::Serialize;

use crate::common::{
    CpuArch, MachineId, PerformanceLevel, PowerState, Priority, SlaClass, TaskId, VmId, VmType,
};
use crate::config::ControllerConfig;
use crate::error::ClusterError;

/// Snapshot of a physical machine.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MachineInfo {
    pub id: MachineId,
    pub arch: CpuArch,
    pub num_cores: u32,
    pub memory_capacity: u64,
    pub memory_used: u64,
    pub active_tasks: u32,
    pub active_vms: u32,
    pub state: PowerState,
    pub performance: PerformanceLevel,
}

/// Snapshot of a virtual machine.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct VmInfo {
    pub id: VmId,
    pub arch: CpuArch,
    pub vm_type: VmType,
    pub machine: Option<MachineId>,
    pub active_tasks: Vec<TaskId>,
}

/// Requirements of a task.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub arch: CpuArch,
    pub vm_type: VmType,
    pub memory: u64,
    pub sla: SlaClass,
    pub priority: Priority,
}

/// Queries answered by the engine.
pub trait ResourceQuery {
    fn machine_count(&self) -> u32;

    fn machine_info(&self, id: MachineId) -> Result<MachineInfo, ClusterError>;

    fn vm_info(&self, id: VmId) -> Result<VmInfo, ClusterError>;

    fn task_info(&self, id: TaskId) -> Result<TaskInfo, ClusterError>;

    /// Whether the task missed its deadline.
    fn is_sla_violation(&self, task: TaskId) -> Result<bool, ClusterError>;

    /// Percentage of tasks of the given class that met their SLA so far.
    fn sla_compliance(&self, class: SlaClass) -> f64;

    /// Energy consumed by the whole cluster so far, in kWh.
    fn cluster_energy(&self) -> f64;
}

/// Commands executed by the engine.
pub trait ClusterCommands {
    fn create_vm(&mut self, vm_type: VmType, arch: CpuArch) -> Result<VmId, ClusterError>;

    fn attach_vm(&mut self, vm: VmId, machine: MachineId) -> Result<(), ClusterError>;

    fn add_task(&mut self, vm: VmId, task: TaskId, priority: Priority) -> Result<(), ClusterError>;

    /// Starts migration, completion is reported by a separate event.
    fn migrate_vm(&mut self, vm: VmId, machine: MachineId) -> Result<(), ClusterError>;

    /// Starts power state change, completion is reported by a separate event.
    fn set_machine_state(&mut self, machine: MachineId, state: PowerState) -> Result<(), ClusterError>;

    fn set_core_performance(
        &mut self,
        machine: MachineId,
        core: u32,
        level: PerformanceLevel,
    ) -> Result<(), ClusterError>;

    fn shutdown_vm(&mut self, vm: VmId) -> Result<(), ClusterError>;

    fn set_task_priority(&mut self, task: TaskId, priority: Priority) -> Result<(), ClusterError>;
}

/// Full engine interface used by the controller.
pub trait ClusterApi: ResourceQuery + ClusterCommands {}

impl<T: ResourceQuery + ClusterCommands> ClusterApi for T {}

////////////////////////////////////////////////////////////////////////////////

/// Load class of a machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Load {
    Underutilized,
    Normal,
    Overloaded,
}

/// Computes machine utilization (active tasks per core); zero-core machines are never loaded.
pub fn utilization(info: &MachineInfo) -> f64 {
    if info.num_cores == 0 {
        return 0.;
    }
    info.active_tasks as f64 / info.num_cores as f64
}

/// Read-only accessors over the engine state.
///
/// Nothing is cached: every call re-queries the engine, since task counts and memory usage change between events.
pub struct ResourceDirectory<'a> {
    query: &'a dyn ClusterApi,
    config: &'a ControllerConfig,
}

impl<'a> ResourceDirectory<'a> {
    pub fn new(query: &'a dyn ClusterApi, config: &'a ControllerConfig) -> Self {
        Self { query, config }
    }

    pub fn machine(&self, id: MachineId) -> Result<MachineInfo, ClusterError> {
        self.query.machine_info(id)
    }

    pub fn vm(&self, id: VmId) -> Result<VmInfo, ClusterError> {
        self.query.vm_info(id)
    }

    pub fn task(&self, id: TaskId) -> Result<TaskInfo, ClusterError> {
        self.query.task_info(id)
    }

    /// Returns the utilization of the machine, or `None` for unknown machines.
    pub fn utilization(&self, id: MachineId) -> Option<f64> {
        self.query.machine_info(id).ok().map(|info| utilization(&info))
    }

    /// Classifies the machine load using the configured thresholds.
    pub fn classify(&self, info: &MachineInfo) -> Load {
        let util = utilization(info);
        if util > self.config.overload_threshold {
            Load::Overloaded
        } else if util < self.config.underload_threshold {
            Load::Underutilized
        } else {
            Load::Normal
        }
    }

    /// Checks that the machine can fit `memory` more megabytes.
    pub fn has_memory_for(&self, info: &MachineInfo, memory: u64) -> bool {
        info.memory_used.saturating_add(memory) <= info.memory_capacity
    }

    /// Checks that the machine uses less than the configured fraction of its memory.
    pub fn has_memory_headroom(&self, info: &MachineInfo) -> bool {
        (info.memory_used as f64) < info.memory_capacity as f64 * self.config.memory_headroom_ratio
    }

    /// Returns the memory required by the tasks running on the VM; unknown tasks are counted as zero.
    pub fn vm_memory(&self, vm: &VmInfo) -> u64 {
        vm.active_tasks
            .iter()
            .filter_map(|task| self.query.task_info(*task).ok())
            .map(|task| task.memory)
            .sum()
    }
}
