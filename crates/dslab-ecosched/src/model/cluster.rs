//! In-memory implementation of the engine interface.
//!
//! The cluster keeps deterministic bookkeeping of machines, VMs and tasks and records every accepted command.
//! Nothing happens by itself: migrations and power state changes stay outstanding until the driver finishes them,
//! tasks run until the driver completes them, and energy is accounted when the driver advances the time.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::cluster::{ClusterCommands, MachineInfo, ResourceQuery, TaskInfo, VmInfo};
use crate::common::{CpuArch, MachineId, PerformanceLevel, PowerState, Priority, SlaClass, TaskId, Time, VmId, VmType};
use crate::error::ClusterError;
use crate::model::config::ClusterConfig;
use crate::model::energy::{EnergyMeter, LinearPowerModel};
use crate::sla::priority_for;

/// Command accepted by the cluster.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum Command {
    CreateVm {
        vm: VmId,
        vm_type: VmType,
        arch: CpuArch,
    },
    AttachVm {
        vm: VmId,
        machine: MachineId,
    },
    AddTask {
        vm: VmId,
        task: TaskId,
        priority: Priority,
    },
    MigrateVm {
        vm: VmId,
        machine: MachineId,
    },
    SetMachineState {
        machine: MachineId,
        state: PowerState,
    },
    SetCorePerformance {
        machine: MachineId,
        core: u32,
        level: PerformanceLevel,
    },
    ShutdownVm {
        vm: VmId,
    },
    SetTaskPriority {
        task: TaskId,
        priority: Priority,
    },
}

impl Command {
    pub fn is_migration(&self) -> bool {
        matches!(self, Command::MigrateVm { .. })
    }

    /// Whether the command changes machine power state or core performance.
    pub fn is_power(&self) -> bool {
        matches!(self, Command::SetMachineState { .. } | Command::SetCorePerformance { .. })
    }
}

struct Machine {
    name: String,
    arch: CpuArch,
    memory_capacity: u64,
    state: PowerState,
    pending_state: Option<PowerState>,
    cores: Vec<PerformanceLevel>,
    power_model: LinearPowerModel,
    energy_meter: EnergyMeter,
}

struct Vm {
    arch: CpuArch,
    vm_type: VmType,
    machine: Option<MachineId>,
    migration_target: Option<MachineId>,
    tasks: Vec<TaskId>,
}

struct Task {
    info: TaskInfo,
    deadline: Time,
    vm: Option<VmId>,
    completed_at: Option<Time>,
}

/// Deterministic in-memory cluster.
#[derive(Default)]
pub struct InMemoryCluster {
    time: Time,
    machines: Vec<Machine>,
    vms: BTreeMap<VmId, Vm>,
    tasks: BTreeMap<TaskId, Task>,
    next_vm_id: VmId,
    next_task_id: TaskId,
    commands: Vec<Command>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a cluster with machines listed in the config, numbered in order.
    pub fn from_config(config: &ClusterConfig) -> Self {
        let mut cluster = Self::new();
        for host in &config.hosts {
            for name in host.names() {
                let machine = cluster.add_machine(host.arch, host.cores, host.memory);
                cluster.machines[machine as usize].name = name;
                if let (Some(idle), Some(max)) = (host.idle_power, host.max_power) {
                    cluster.machines[machine as usize].power_model = LinearPowerModel::new(idle, max);
                }
            }
        }
        cluster.update_energy();
        cluster
    }

    /// Adds an active machine running at the top performance level.
    pub fn add_machine(&mut self, arch: CpuArch, num_cores: u32, memory: u64) -> MachineId {
        let id = self.machines.len() as MachineId;
        let mut energy_meter = EnergyMeter::new();
        let power_model = LinearPowerModel::new(100., 200.);
        energy_meter.update(self.time, power_model.get_power(PowerState::S0, PerformanceLevel::P0, 0.));
        self.machines.push(Machine {
            name: format!("{}-{}", arch, id),
            arch,
            memory_capacity: memory,
            state: PowerState::S0,
            pending_state: None,
            cores: vec![PerformanceLevel::P0; num_cores as usize],
            power_model,
            energy_meter,
        });
        id
    }

    /// Registers a task arriving now. The task must complete within `deadline` seconds to meet its SLA.
    pub fn submit_task(
        &mut self,
        arch: CpuArch,
        vm_type: VmType,
        memory: u64,
        sla: SlaClass,
        deadline: Time,
    ) -> TaskId {
        let id = self.next_task_id;
        self.next_task_id += 1;
        self.tasks.insert(
            id,
            Task {
                info: TaskInfo {
                    id,
                    arch,
                    vm_type,
                    memory,
                    sla,
                    priority: priority_for(sla),
                },
                deadline: self.time + deadline,
                vm: None,
                completed_at: None,
            },
        );
        id
    }

    /// Completes the task at the current time and removes it from its VM.
    pub fn complete_task(&mut self, task: TaskId) -> Result<(), ClusterError> {
        let entry = self.tasks.get_mut(&task).ok_or(ClusterError::TaskNotFound(task))?;
        if entry.completed_at.is_some() {
            return Err(ClusterError::rejected(format!("task {} is already completed", task)));
        }
        let vm = entry
            .vm
            .take()
            .ok_or_else(|| ClusterError::rejected(format!("task {} is not running", task)))?;
        entry.completed_at = Some(self.time);
        if let Some(vm) = self.vms.get_mut(&vm) {
            vm.tasks.retain(|t| *t != task);
        }
        self.update_energy();
        Ok(())
    }

    /// Moves the migrating VM to its target machine.
    pub fn finish_migration(&mut self, vm: VmId) -> Result<(), ClusterError> {
        let entry = self.vms.get_mut(&vm).ok_or(ClusterError::VmNotFound(vm))?;
        let target = entry
            .migration_target
            .take()
            .ok_or_else(|| ClusterError::rejected(format!("vm {} is not migrating", vm)))?;
        entry.machine = Some(target);
        self.update_energy();
        Ok(())
    }

    /// Puts the machine into the last commanded power state.
    pub fn finish_state_change(&mut self, machine: MachineId) -> Result<(), ClusterError> {
        let entry = self
            .machines
            .get_mut(machine as usize)
            .ok_or(ClusterError::MachineNotFound(machine))?;
        let state = entry
            .pending_state
            .take()
            .ok_or_else(|| ClusterError::rejected(format!("machine {} has no state change", machine)))?;
        entry.state = state;
        self.update_energy();
        Ok(())
    }

    /// Accounts energy consumed up to `time` and makes it the current time.
    pub fn advance(&mut self, time: Time) {
        if time > self.time {
            self.time = time;
        }
        self.update_energy();
    }

    pub fn time(&self) -> Time {
        self.time
    }

    /// Commands accepted so far.
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Returns accepted commands and clears the log.
    pub fn take_commands(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.commands)
    }

    pub fn machine_name(&self, machine: MachineId) -> Option<&str> {
        self.machines.get(machine as usize).map(|m| m.name.as_str())
    }

    /// Machine state change commanded but not finished yet.
    pub fn pending_state(&self, machine: MachineId) -> Option<PowerState> {
        self.machines.get(machine as usize).and_then(|m| m.pending_state)
    }

    /// VMs with an unfinished migration.
    pub fn migrating_vms(&self) -> Vec<VmId> {
        self.vms
            .iter()
            .filter(|(_, vm)| vm.migration_target.is_some())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Running tasks in id order.
    pub fn running_tasks(&self) -> Vec<TaskId> {
        self.tasks
            .iter()
            .filter(|(_, task)| task.vm.is_some() && task.completed_at.is_none())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Machines whose hosted tasks need more memory than they have.
    pub fn memory_overloaded(&self) -> Vec<MachineId> {
        (0..self.machines.len() as MachineId)
            .filter(|machine| self.memory_used(*machine) > self.machines[*machine as usize].memory_capacity)
            .collect()
    }

    fn hosted_vms(&self, machine: MachineId) -> impl Iterator<Item = &Vm> + '_ {
        self.vms.values().filter(move |vm| vm.machine == Some(machine))
    }

    fn active_tasks(&self, machine: MachineId) -> u32 {
        self.hosted_vms(machine).map(|vm| vm.tasks.len() as u32).sum()
    }

    fn memory_used(&self, machine: MachineId) -> u64 {
        self.hosted_vms(machine)
            .flat_map(|vm| vm.tasks.iter())
            .filter_map(|task| self.tasks.get(task))
            .map(|task| task.info.memory)
            .sum()
    }

    fn update_energy(&mut self) {
        for id in 0..self.machines.len() {
            let machine = &self.machines[id];
            let cores = machine.cores.len().max(1) as f64;
            let load = self.active_tasks(id as MachineId) as f64 / cores;
            let level = machine.cores.first().copied().unwrap_or(PerformanceLevel::P0);
            let power = machine.power_model.get_power(machine.state, level, load);
            let time = self.time;
            self.machines[id].energy_meter.update(time, power);
        }
    }

    fn machine(&self, machine: MachineId) -> Result<&Machine, ClusterError> {
        self.machines
            .get(machine as usize)
            .ok_or(ClusterError::MachineNotFound(machine))
    }

    fn live_vm(&self, vm: VmId) -> Result<&Vm, ClusterError> {
        self.vms.get(&vm).ok_or(ClusterError::VmNotFound(vm))
    }
}

impl ResourceQuery for InMemoryCluster {
    fn machine_count(&self) -> u32 {
        self.machines.len() as u32
    }

    fn machine_info(&self, id: MachineId) -> Result<MachineInfo, ClusterError> {
        let machine = self.machine(id)?;
        Ok(MachineInfo {
            id,
            arch: machine.arch,
            num_cores: machine.cores.len() as u32,
            memory_capacity: machine.memory_capacity,
            memory_used: self.memory_used(id),
            active_tasks: self.active_tasks(id),
            active_vms: self.hosted_vms(id).count() as u32,
            state: machine.state,
            performance: machine.cores.first().copied().unwrap_or(PerformanceLevel::P0),
        })
    }

    fn vm_info(&self, id: VmId) -> Result<VmInfo, ClusterError> {
        let vm = self.live_vm(id)?;
        Ok(VmInfo {
            id,
            arch: vm.arch,
            vm_type: vm.vm_type,
            machine: vm.machine,
            active_tasks: vm.tasks.clone(),
        })
    }

    fn task_info(&self, id: TaskId) -> Result<TaskInfo, ClusterError> {
        self.tasks
            .get(&id)
            .map(|task| task.info.clone())
            .ok_or(ClusterError::TaskNotFound(id))
    }

    fn is_sla_violation(&self, task: TaskId) -> Result<bool, ClusterError> {
        let task = self.tasks.get(&task).ok_or(ClusterError::TaskNotFound(task))?;
        Ok(task.completed_at.unwrap_or(self.time) > task.deadline)
    }

    fn sla_compliance(&self, class: SlaClass) -> f64 {
        let completed: Vec<&Task> = self
            .tasks
            .values()
            .filter(|task| task.info.sla == class)
            .filter(|task| task.completed_at.is_some())
            .collect();
        if completed.is_empty() {
            return 100.;
        }
        let met = completed
            .iter()
            .filter(|task| task.completed_at.unwrap_or(task.deadline) <= task.deadline)
            .count();
        met as f64 * 100. / completed.len() as f64
    }

    fn cluster_energy(&self) -> f64 {
        self.machines.iter().map(|m| m.energy_meter.energy_consumed()).sum::<f64>() / 3.6e6
    }
}

impl ClusterCommands for InMemoryCluster {
    fn create_vm(&mut self, vm_type: VmType, arch: CpuArch) -> Result<VmId, ClusterError> {
        let id = self.next_vm_id;
        self.next_vm_id += 1;
        self.vms.insert(
            id,
            Vm {
                arch,
                vm_type,
                machine: None,
                migration_target: None,
                tasks: Vec::new(),
            },
        );
        self.commands.push(Command::CreateVm { vm: id, vm_type, arch });
        Ok(id)
    }

    fn attach_vm(&mut self, vm: VmId, machine: MachineId) -> Result<(), ClusterError> {
        let machine_arch = self.machine(machine)?.arch;
        let entry = self.vms.get_mut(&vm).ok_or(ClusterError::VmNotFound(vm))?;
        if entry.arch != machine_arch {
            return Err(ClusterError::rejected(format!(
                "vm {} is {}, machine {} is {}",
                vm, entry.arch, machine, machine_arch
            )));
        }
        if entry.machine.is_some() {
            return Err(ClusterError::rejected(format!("vm {} is already attached", vm)));
        }
        entry.machine = Some(machine);
        self.commands.push(Command::AttachVm { vm, machine });
        Ok(())
    }

    fn add_task(&mut self, vm: VmId, task: TaskId, priority: Priority) -> Result<(), ClusterError> {
        let entry = self.tasks.get(&task).ok_or(ClusterError::TaskNotFound(task))?;
        let target = self.live_vm(vm)?;
        if target.arch != entry.info.arch {
            return Err(ClusterError::rejected(format!(
                "task {} requires {}, vm {} is {}",
                task, entry.info.arch, vm, target.arch
            )));
        }
        if target.machine.is_none() {
            return Err(ClusterError::rejected(format!("vm {} is not attached", vm)));
        }
        if entry.vm.is_some() || entry.completed_at.is_some() {
            return Err(ClusterError::rejected(format!("task {} is already placed", task)));
        }
        if let Some(target) = self.vms.get_mut(&vm) {
            target.tasks.push(task);
        }
        if let Some(entry) = self.tasks.get_mut(&task) {
            entry.vm = Some(vm);
            entry.info.priority = priority;
        }
        self.commands.push(Command::AddTask { vm, task, priority });
        self.update_energy();
        Ok(())
    }

    fn migrate_vm(&mut self, vm: VmId, machine: MachineId) -> Result<(), ClusterError> {
        let machine_arch = self.machine(machine)?.arch;
        let entry = self.vms.get_mut(&vm).ok_or(ClusterError::VmNotFound(vm))?;
        if entry.migration_target.is_some() {
            return Err(ClusterError::rejected(format!("vm {} is already migrating", vm)));
        }
        match entry.machine {
            None => return Err(ClusterError::rejected(format!("vm {} is not attached", vm))),
            Some(source) if source == machine => {
                return Err(ClusterError::rejected(format!("vm {} is already on machine {}", vm, machine)))
            }
            _ => {}
        }
        if entry.arch != machine_arch {
            return Err(ClusterError::rejected(format!(
                "vm {} is {}, machine {} is {}",
                vm, entry.arch, machine, machine_arch
            )));
        }
        entry.migration_target = Some(machine);
        self.commands.push(Command::MigrateVm { vm, machine });
        Ok(())
    }

    fn set_machine_state(&mut self, machine: MachineId, state: PowerState) -> Result<(), ClusterError> {
        let entry = self
            .machines
            .get_mut(machine as usize)
            .ok_or(ClusterError::MachineNotFound(machine))?;
        entry.pending_state = Some(state);
        self.commands.push(Command::SetMachineState { machine, state });
        Ok(())
    }

    fn set_core_performance(
        &mut self,
        machine: MachineId,
        core: u32,
        level: PerformanceLevel,
    ) -> Result<(), ClusterError> {
        let entry = self
            .machines
            .get_mut(machine as usize)
            .ok_or(ClusterError::MachineNotFound(machine))?;
        if !entry.state.is_active() {
            return Err(ClusterError::rejected(format!("machine {} is in {}", machine, entry.state)));
        }
        let slot = entry
            .cores
            .get_mut(core as usize)
            .ok_or_else(|| ClusterError::rejected(format!("machine {} has no core {}", machine, core)))?;
        *slot = level;
        self.commands.push(Command::SetCorePerformance { machine, core, level });
        self.update_energy();
        Ok(())
    }

    fn shutdown_vm(&mut self, vm: VmId) -> Result<(), ClusterError> {
        let entry = self.live_vm(vm)?;
        if entry.migration_target.is_some() {
            return Err(ClusterError::rejected(format!("vm {} is migrating", vm)));
        }
        if let Some(entry) = self.vms.remove(&vm) {
            for task in entry.tasks {
                if let Some(task) = self.tasks.get_mut(&task) {
                    task.vm = None;
                }
            }
        }
        self.commands.push(Command::ShutdownVm { vm });
        self.update_energy();
        Ok(())
    }

    fn set_task_priority(&mut self, task: TaskId, priority: Priority) -> Result<(), ClusterError> {
        let entry = self.tasks.get_mut(&task).ok_or(ClusterError::TaskNotFound(task))?;
        entry.info.priority = priority;
        self.commands.push(Command::SetTaskPriority { task, priority });
        Ok(())
    }
}
