//! Task placement policy.
//!
//! A task is offered to an ordered chain of placement tiers, each tried only if the previous one yields no VM that
//! accepts the task:
//!
//! 1. best fit: least loaded VM of the required architecture and image on a running machine with enough memory,
//! 2. any VM of the required architecture on a running machine with enough memory,
//! 3. a new VM on a running machine with enough memory, or on a standby or off machine that is powered on,
//! 4. emergency: least loaded VM of the required architecture regardless of memory, with the highest priority.
//!
//! If all tiers fail the task stays unplaced.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use crate::cluster::{ClusterApi, ResourceDirectory, TaskInfo, VmInfo};
use crate::common::{MachineId, Priority, TaskId, VmId};
use crate::config::ControllerConfig;
use crate::error::InvariantViolation;
use crate::log::LogContext;
use crate::migration::MigrationCoordinator;
use crate::power::PowerManager;
use crate::registry::VmRegistry;
use crate::sla::priority_for;
use crate::tiers::Tier;
use crate::{log_debug, log_error, log_info, log_warn};

/// Step of the placement chain that placed a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PlacementTier {
    BestFit,
    AnyCompatible,
    Expansion,
    Emergency,
}

impl PlacementTier {
    pub const ALL: [PlacementTier; 4] = [
        PlacementTier::BestFit,
        PlacementTier::AnyCompatible,
        PlacementTier::Expansion,
        PlacementTier::Emergency,
    ];
}

impl Display for PlacementTier {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            PlacementTier::BestFit => write!(f, "best fit"),
            PlacementTier::AnyCompatible => write!(f, "any compatible"),
            PlacementTier::Expansion => write!(f, "expansion"),
            PlacementTier::Emergency => write!(f, "emergency"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum PlacementOutcome {
    Placed {
        vm: VmId,
        tier: PlacementTier,
        priority: Priority,
    },
    Unplaced,
}

/// Places tasks and counts the outcomes.
#[derive(Default)]
pub struct PlacementPolicy {
    placed: BTreeMap<PlacementTier, u32>,
    unplaced: u32,
}

/// Mutable controller state used by placement.
pub struct PlacementState<'a> {
    pub power: &'a mut PowerManager,
    pub vms: &'a mut VmRegistry,
    pub migrations: &'a MigrationCoordinator,
}

impl PlacementPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks placed by the given tier.
    pub fn placed_by(&self, tier: PlacementTier) -> u32 {
        self.placed.get(&tier).copied().unwrap_or(0)
    }

    pub fn unplaced(&self) -> u32 {
        self.unplaced
    }

    pub fn place(
        &mut self,
        ctx: &LogContext,
        api: &mut dyn ClusterApi,
        config: &ControllerConfig,
        state: PlacementState,
        task: TaskId,
    ) -> PlacementOutcome {
        let PlacementState { power, vms, migrations } = state;
        let task = match api.task_info(task) {
            Ok(task) => task,
            Err(e) => {
                log_warn!(ctx, "can't place task {}: {}", task, e);
                self.unplaced += 1;
                return PlacementOutcome::Unplaced;
            }
        };
        let priority = priority_for(task.sla);

        let outcome = self
            .place_on_existing(ctx, api, config, power, vms, migrations, &task, priority)
            .or_else(|| self.expand(ctx, api, config, power, vms, &task, priority))
            .or_else(|| self.place_emergency(ctx, api, config, vms, migrations, &task));

        match outcome {
            Some(PlacementOutcome::Placed { vm, tier, priority }) => {
                *self.placed.entry(tier).or_insert(0) += 1;
                log_info!(ctx, "task {} placed on vm {} by {} (priority {})", task.id, vm, tier, priority);
                PlacementOutcome::Placed { vm, tier, priority }
            }
            _ => {
                self.unplaced += 1;
                log_warn!(ctx, "task {} ({} {}) can't be placed", task.id, task.arch, task.vm_type);
                PlacementOutcome::Unplaced
            }
        }
    }

    /// Best fit and any compatible tiers.
    #[allow(clippy::too_many_arguments)]
    fn place_on_existing(
        &self,
        ctx: &LogContext,
        api: &mut dyn ClusterApi,
        config: &ControllerConfig,
        power: &PowerManager,
        vms: &VmRegistry,
        migrations: &MigrationCoordinator,
        task: &TaskInfo,
        priority: Priority,
    ) -> Option<PlacementOutcome> {
        let (best_fit, compatible) = {
            let dir = ResourceDirectory::new(&*api, config);
            let hosted: Vec<VmInfo> = vms
                .for_arch(task.arch)
                .into_iter()
                .filter(|vm| !migrations.is_migrating(vm.id))
                .filter_map(|vm| dir.vm(vm.id).ok())
                .filter(|vm| host_fits(&dir, power, vm, task.memory))
                .collect();
            let mut best_fit: Vec<&VmInfo> = hosted.iter().filter(|vm| vm.vm_type == task.vm_type).collect();
            best_fit.sort_by_key(|vm| (vm.active_tasks.len(), vm.id));
            let best_fit: Vec<VmInfo> = best_fit.into_iter().cloned().collect();
            (best_fit, hosted)
        };

        for vm in &best_fit {
            if try_add(ctx, api, vm, task, priority) {
                return Some(PlacementOutcome::Placed {
                    vm: vm.id,
                    tier: PlacementTier::BestFit,
                    priority,
                });
            }
        }
        for vm in compatible.iter().filter(|vm| !best_fit.iter().any(|tried| tried.id == vm.id)) {
            if try_add(ctx, api, vm, task, priority) {
                return Some(PlacementOutcome::Placed {
                    vm: vm.id,
                    tier: PlacementTier::AnyCompatible,
                    priority,
                });
            }
        }
        None
    }

    /// Creates a VM for the task, powering on a standby or off machine if no running machine has room.
    #[allow(clippy::too_many_arguments)]
    fn expand(
        &self,
        ctx: &LogContext,
        api: &mut dyn ClusterApi,
        config: &ControllerConfig,
        power: &mut PowerManager,
        vms: &mut VmRegistry,
        task: &TaskInfo,
        priority: Priority,
    ) -> Option<PlacementOutcome> {
        let running: Vec<MachineId> = {
            let dir = ResourceDirectory::new(&*api, config);
            power
                .tiers()
                .machines(task.arch, Tier::Running)
                .into_iter()
                .filter_map(|machine| dir.machine(machine).ok())
                .filter(|info| dir.has_memory_for(info, task.memory))
                .map(|info| info.id)
                .collect()
        };
        for machine in running {
            if let Some(vm) = create_vm_for(ctx, api, vms, machine, task, priority) {
                return Some(PlacementOutcome::Placed {
                    vm,
                    tier: PlacementTier::Expansion,
                    priority,
                });
            }
        }

        for from in [Tier::Standby, Tier::Off] {
            let machine = match power.tiers().first_in(task.arch, from) {
                Some(machine) => machine,
                None => continue,
            };
            if let Err(e) = power.promote(ctx, api, machine) {
                log_warn!(ctx, "can't power on machine {}: {}", machine, e);
                continue;
            }
            if from == Tier::Standby {
                if let Some(refill) = power.refill_standby(ctx, api, config, task.arch) {
                    log_debug!(ctx, "machine {} moved to standby", refill);
                }
            }
            if let Some(vm) = create_vm_for(ctx, api, vms, machine, task, priority) {
                return Some(PlacementOutcome::Placed {
                    vm,
                    tier: PlacementTier::Expansion,
                    priority,
                });
            }
        }
        None
    }

    /// Forces the task onto the least loaded VM of its architecture with the highest priority.
    fn place_emergency(
        &self,
        ctx: &LogContext,
        api: &mut dyn ClusterApi,
        config: &ControllerConfig,
        vms: &VmRegistry,
        migrations: &MigrationCoordinator,
        task: &TaskInfo,
    ) -> Option<PlacementOutcome> {
        let candidates: Vec<VmInfo> = {
            let dir = ResourceDirectory::new(&*api, config);
            let mut candidates: Vec<VmInfo> = vms
                .for_arch(task.arch)
                .into_iter()
                .filter(|vm| !migrations.is_migrating(vm.id))
                .filter_map(|vm| dir.vm(vm.id).ok())
                .filter(|vm| vm.machine.is_some())
                .collect();
            candidates.sort_by_key(|vm| (vm.active_tasks.len(), vm.id));
            candidates
        };
        for vm in &candidates {
            if try_add(ctx, api, vm, task, Priority::High) {
                return Some(PlacementOutcome::Placed {
                    vm: vm.id,
                    tier: PlacementTier::Emergency,
                    priority: Priority::High,
                });
            }
        }
        None
    }
}

/// Whether the VM is hosted by a running machine that can fit `memory` more.
fn host_fits(dir: &ResourceDirectory, power: &PowerManager, vm: &VmInfo, memory: u64) -> bool {
    let machine = match vm.machine {
        Some(machine) => machine,
        None => return false,
    };
    if power.tiers().tier_of(machine) != Some(Tier::Running) {
        return false;
    }
    dir.machine(machine)
        .map(|info| dir.has_memory_for(&info, memory))
        .unwrap_or(false)
}

/// Adds the task to the VM. Returns `false` if the engine refuses it.
fn try_add(ctx: &LogContext, api: &mut dyn ClusterApi, vm: &VmInfo, task: &TaskInfo, priority: Priority) -> bool {
    if vm.arch != task.arch {
        log_error!(ctx, "{}", InvariantViolation::ArchMismatch { task: task.id, vm: vm.id });
        return false;
    }
    match api.add_task(vm.id, task.id, priority) {
        Ok(()) => true,
        Err(e) => {
            log_debug!(ctx, "vm {} refused task {}: {}", vm.id, task.id, e);
            false
        }
    }
}

/// Creates a VM of the task image on the machine and adds the task to it.
fn create_vm_for(
    ctx: &LogContext,
    api: &mut dyn ClusterApi,
    vms: &mut VmRegistry,
    machine: MachineId,
    task: &TaskInfo,
    priority: Priority,
) -> Option<VmId> {
    let vm = vms.launch(ctx, api, task.vm_type, task.arch, machine)?;
    match api.add_task(vm, task.id, priority) {
        Ok(()) => Some(vm),
        Err(e) => {
            log_warn!(ctx, "new vm {} refused task {}: {}", vm, task.id, e);
            None
        }
    }
}
