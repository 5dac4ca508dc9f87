//! Coordinator of VM migrations.
//!
//! All migrations go through [`MigrationCoordinator::try_migrate`], which checks the migrating set and records the VM
//! in it in the same call that issues the migrate command. Since event handlers never interleave, this guarantees
//! that no VM is the subject of two outstanding migrations.

use std::fmt::{Display, Formatter};

use crate::cluster::{utilization, ClusterApi, Load, MachineInfo, ResourceDirectory, VmInfo};
use crate::common::{MachineId, TaskId, VmId};
use crate::config::ControllerConfig;
use crate::error::{ClusterError, InvariantViolation};
use crate::log::LogContext;
use crate::pending::{MigrationOp, MigrationReason, PendingOps};
use crate::power::PowerManager;
use crate::registry::VmRegistry;
use crate::{log_debug, log_error, log_info, log_warn};

/// What triggers a migration and how its source is selected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MigrationCriterion {
    /// Empty the least utilized machine below the consolidation threshold.
    Consolidation,
    /// Move load off the given machine if it is overloaded.
    Rebalance { machine: MachineId },
    /// Relieve the given machine that ran out of memory.
    MemoryPressure { machine: MachineId },
    /// Move the VM hosting the given task to a less utilized machine.
    SlaRescue { task: TaskId },
}

/// Outcome of a migration attempt.
#[derive(Clone, Debug, PartialEq)]
pub enum MigrationVerdict {
    Started {
        vm: VmId,
        source: MachineId,
        target: MachineId,
    },
    NoCandidate,
    AlreadyMigrating(VmId),
    Failed(ClusterError),
}

impl Display for MigrationVerdict {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            MigrationVerdict::Started { vm, source, target } => {
                write!(f, "started migration of vm {} from machine {} to {}", vm, source, target)
            }
            MigrationVerdict::NoCandidate => write!(f, "no suitable candidate"),
            MigrationVerdict::AlreadyMigrating(vm) => write!(f, "vm {} is already migrating", vm),
            MigrationVerdict::Failed(e) => write!(f, "migration failed: {}", e),
        }
    }
}

/// A selected migration, not yet issued.
struct Selection {
    vm: VmId,
    source: MachineId,
    target: MachineId,
}

/// Owns the set of VMs with an outstanding migration.
#[derive(Default)]
pub struct MigrationCoordinator {
    migrations: PendingOps<VmId, MigrationOp>,
}

impl MigrationCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_migrating(&self, vm: VmId) -> bool {
        self.migrations.is_pending(vm)
    }

    /// VMs with an outstanding migration, in id order.
    pub fn migrating(&self) -> Vec<VmId> {
        self.migrations.pending().map(|(vm, _)| vm).collect()
    }

    pub fn in_flight(&self) -> usize {
        self.migrations.pending_count()
    }

    /// Whether some VM is migrating away from the machine.
    pub fn has_outgoing(&self, machine: MachineId) -> bool {
        self.migrations.pending().any(|(_, op)| op.source == machine)
    }

    /// Whether some VM is migrating to the machine.
    pub fn has_incoming(&self, machine: MachineId) -> bool {
        self.migrations.pending().any(|(_, op)| op.target == machine)
    }

    /// Whether the machine is the source or the target of an outstanding migration.
    pub fn is_busy(&self, machine: MachineId) -> bool {
        self.has_outgoing(machine) || self.has_incoming(machine)
    }

    /// Clears the VM from the migrating set.
    pub fn on_migration_complete(&mut self, ctx: &LogContext, vm: VmId) -> Option<MigrationOp> {
        match self.migrations.confirm(vm) {
            Some(op) => {
                log_debug!(
                    ctx,
                    "migration of vm {} from machine {} to {} completed",
                    vm,
                    op.source,
                    op.target
                );
                Some(op)
            }
            None => {
                log_error!(ctx, "{}", InvariantViolation::UnexpectedMigrationComplete(vm));
                None
            }
        }
    }

    /// Selects and starts at most one migration matching the criterion.
    pub fn try_migrate(
        &mut self,
        ctx: &LogContext,
        api: &mut dyn ClusterApi,
        config: &ControllerConfig,
        power: &PowerManager,
        vms: &VmRegistry,
        criterion: MigrationCriterion,
    ) -> MigrationVerdict {
        let selection = {
            let dir = ResourceDirectory::new(&*api, config);
            match criterion {
                MigrationCriterion::Consolidation => {
                    if self.in_flight() > 0 {
                        log_debug!(ctx, "consolidation postponed, {} migrations in flight", self.in_flight());
                        return MigrationVerdict::NoCandidate;
                    }
                    self.select_consolidation(&dir, config, power, vms)
                }
                MigrationCriterion::Rebalance { machine } => self.select_rebalance(&dir, config, power, vms, machine),
                MigrationCriterion::MemoryPressure { machine } => {
                    self.select_memory_relief(&dir, power, vms, machine)
                }
                MigrationCriterion::SlaRescue { task } => {
                    match self.select_sla_rescue(&dir, config, power, vms, task) {
                        Ok(selection) => selection,
                        Err(verdict) => return verdict,
                    }
                }
            }
        };

        match selection {
            Some(selection) => self.start(ctx, api, selection, reason_of(criterion)),
            None => MigrationVerdict::NoCandidate,
        }
    }

    /// Issues the migrate command and records the VM in the migrating set.
    fn start(
        &mut self,
        ctx: &LogContext,
        api: &mut dyn ClusterApi,
        selection: Selection,
        reason: MigrationReason,
    ) -> MigrationVerdict {
        let Selection { vm, source, target } = selection;
        if self.is_migrating(vm) {
            return MigrationVerdict::AlreadyMigrating(vm);
        }
        match api.migrate_vm(vm, target) {
            Ok(()) => {
                let op = MigrationOp { source, target, reason };
                if self.migrations.begin(vm, op).is_err() {
                    return MigrationVerdict::AlreadyMigrating(vm);
                }
                log_info!(
                    ctx,
                    "migrating vm {} from machine {} to {} ({:?})",
                    vm,
                    source,
                    target,
                    reason
                );
                MigrationVerdict::Started { vm, source, target }
            }
            Err(e) => {
                log_warn!(ctx, "can't migrate vm {} to machine {}: {}", vm, target, e);
                MigrationVerdict::Failed(e)
            }
        }
    }

    /// Non-migrating VMs of the registry currently hosted on the machine.
    fn hosted_vms(&self, dir: &ResourceDirectory, vms: &VmRegistry, machine: MachineId) -> Vec<VmInfo> {
        vms.ids()
            .into_iter()
            .filter(|vm| !self.is_migrating(*vm))
            .filter_map(|vm| dir.vm(vm).ok())
            .filter(|info| info.machine == Some(machine))
            .collect()
    }

    fn select_consolidation(
        &self,
        dir: &ResourceDirectory,
        config: &ControllerConfig,
        power: &PowerManager,
        vms: &VmRegistry,
    ) -> Option<Selection> {
        let running = power.settled_running(dir, None);
        let mut sources: Vec<&MachineInfo> = running
            .iter()
            .filter(|info| info.active_tasks > 0 && utilization(info) < config.consolidation_threshold)
            .filter(|info| !self.is_busy(info.id))
            .collect();
        sources.sort_by(|a, b| utilization(a).total_cmp(&utilization(b)).then(a.id.cmp(&b.id)));

        for source in sources {
            let source_util = utilization(source);
            let mut candidates: Vec<VmInfo> = self
                .hosted_vms(dir, vms, source.id)
                .into_iter()
                .filter(|vm| !vm.active_tasks.is_empty())
                .collect();
            candidates.sort_by_key(|vm| (vm.active_tasks.len(), vm.id));

            for vm in candidates {
                let vm_memory = dir.vm_memory(&vm);
                let vm_tasks = vm.active_tasks.len() as u32;
                let target = running
                    .iter()
                    .filter(|info| info.id != source.id && info.arch == vm.arch)
                    .filter(|info| !self.has_outgoing(info.id))
                    .filter(|info| utilization(info) >= source_util)
                    .filter(|info| {
                        let util_new = (info.active_tasks + vm_tasks) as f64 / info.num_cores.max(1) as f64;
                        util_new <= config.overload_threshold
                    })
                    .filter(|info| dir.has_memory_for(info, vm_memory))
                    .max_by(|a, b| utilization(a).total_cmp(&utilization(b)).then(b.id.cmp(&a.id)));
                if let Some(target) = target {
                    return Some(Selection {
                        vm: vm.id,
                        source: source.id,
                        target: target.id,
                    });
                }
            }
        }
        None
    }

    /// Moves the smallest VM that the target can take without becoming overloaded itself.
    fn select_rebalance(
        &self,
        dir: &ResourceDirectory,
        config: &ControllerConfig,
        power: &PowerManager,
        vms: &VmRegistry,
        machine: MachineId,
    ) -> Option<Selection> {
        let source = dir.machine(machine).ok()?;
        if dir.classify(&source) != Load::Overloaded || self.has_outgoing(machine) {
            return None;
        }
        let mut candidates: Vec<VmInfo> = self
            .hosted_vms(dir, vms, machine)
            .into_iter()
            .filter(|vm| !vm.active_tasks.is_empty())
            .collect();
        candidates.sort_by_key(|vm| (vm.active_tasks.len(), vm.id));

        let targets = power.settled_running(dir, Some(source.arch));
        for vm in candidates {
            let vm_memory = dir.vm_memory(&vm);
            let vm_tasks = vm.active_tasks.len() as u32;
            let target = targets
                .iter()
                .filter(|info| info.id != machine)
                .filter(|info| dir.classify(info) == Load::Underutilized)
                .filter(|info| !self.is_busy(info.id))
                .filter(|info| {
                    let util_new = (info.active_tasks + vm_tasks) as f64 / info.num_cores.max(1) as f64;
                    util_new <= config.overload_threshold
                })
                .filter(|info| dir.has_memory_for(info, vm_memory))
                .min_by(|a, b| utilization(a).total_cmp(&utilization(b)).then(a.id.cmp(&b.id)));
            if let Some(target) = target {
                return Some(Selection {
                    vm: vm.id,
                    source: machine,
                    target: target.id,
                });
            }
        }
        None
    }

    fn select_memory_relief(
        &self,
        dir: &ResourceDirectory,
        power: &PowerManager,
        vms: &VmRegistry,
        machine: MachineId,
    ) -> Option<Selection> {
        let candidates = self
            .hosted_vms(dir, vms, machine)
            .into_iter()
            .filter(|vm| !vm.active_tasks.is_empty());
        for vm in candidates {
            let target = power
                .settled_running(dir, Some(vm.arch))
                .into_iter()
                .find(|info| info.id != machine && dir.has_memory_headroom(info));
            if let Some(target) = target {
                return Some(Selection {
                    vm: vm.id,
                    source: machine,
                    target: target.id,
                });
            }
        }
        None
    }

    fn select_sla_rescue(
        &self,
        dir: &ResourceDirectory,
        config: &ControllerConfig,
        power: &PowerManager,
        vms: &VmRegistry,
        task: TaskId,
    ) -> Result<Option<Selection>, MigrationVerdict> {
        let host_vm = vms
            .ids()
            .into_iter()
            .filter_map(|vm| dir.vm(vm).ok())
            .find(|info| info.active_tasks.contains(&task));
        let vm = match host_vm {
            Some(vm) => vm,
            None => return Ok(None),
        };
        if self.is_migrating(vm.id) {
            return Err(MigrationVerdict::AlreadyMigrating(vm.id));
        }
        let source = match vm.machine.and_then(|machine| dir.machine(machine).ok()) {
            Some(source) => source,
            None => return Ok(None),
        };
        let limit = utilization(&source) * config.sla_rescue_ratio;
        let vm_memory = dir.vm_memory(&vm);
        let target = power
            .settled_running(dir, Some(vm.arch))
            .into_iter()
            .filter(|info| info.id != source.id && !self.has_outgoing(info.id))
            .filter(|info| utilization(info) < limit)
            .filter(|info| dir.has_memory_for(info, vm_memory))
            .min_by(|a, b| utilization(a).total_cmp(&utilization(b)).then(a.id.cmp(&b.id)));
        Ok(target.map(|target| Selection {
            vm: vm.id,
            source: source.id,
            target: target.id,
        }))
    }
}

fn reason_of(criterion: MigrationCriterion) -> MigrationReason {
    match criterion {
        MigrationCriterion::Consolidation => MigrationReason::Consolidation,
        MigrationCriterion::Rebalance { .. } => MigrationReason::Rebalance,
        MigrationCriterion::MemoryPressure { .. } => MigrationReason::MemoryPressure,
        MigrationCriterion::SlaRescue { .. } => MigrationReason::SlaRescue,
    }
}
