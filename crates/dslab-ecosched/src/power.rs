//! Power and tier management.
//!
//! [`PowerManager`] owns the partition of machines into tiers and drives machine power states. A tier move and the
//! state change command are issued together, while the state change itself completes asynchronously: until the engine
//! confirms it the machine is "unsettled" and is not used as a migration target, demoted or re-tuned.

use std::collections::BTreeMap;

use crate::cluster::{utilization, ClusterApi, Load, MachineInfo, ResourceDirectory, VmInfo};
use crate::common::{CpuArch, MachineId, PerformanceLevel, PowerState};
use crate::config::{ConsolidationMode, ControllerConfig};
use crate::error::ClusterError;
use crate::log::LogContext;
use crate::migration::{MigrationCoordinator, MigrationCriterion, MigrationVerdict};
use crate::pending::{PendingOps, StateChangeOp};
use crate::registry::VmRegistry;
use crate::tiers::{Tier, TierSet};
use crate::{log_debug, log_info, log_warn};

/// Commands issued by a periodic check.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CheckSummary {
    pub overloaded: Vec<MachineId>,
    pub underutilized: Vec<MachineId>,
    /// Started migrations.
    pub migrations: Vec<MigrationVerdict>,
    pub demoted: Vec<(MachineId, Tier)>,
    /// Machines whose performance level was changed.
    pub performance_changes: u32,
}

impl CheckSummary {
    /// Whether the check issued no commands at all.
    pub fn is_quiet(&self) -> bool {
        self.migrations.is_empty() && self.demoted.is_empty() && self.performance_changes == 0
    }
}

/// Owns machine tiers, outstanding power state changes and commanded performance levels.
#[derive(Default)]
pub struct PowerManager {
    tiers: TierSet,
    state_changes: PendingOps<MachineId, StateChangeOp>,
    performance: BTreeMap<MachineId, PerformanceLevel>,
}

impl PowerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tiers(&self) -> &TierSet {
        &self.tiers
    }

    /// Whether the machine has no outstanding state change.
    pub fn is_settled(&self, machine: MachineId) -> bool {
        !self.state_changes.is_pending(machine)
    }

    /// Returns the state the machine was last commanded to, if the change is not confirmed yet.
    pub fn pending_state(&self, machine: MachineId) -> Option<PowerState> {
        self.state_changes.get_pending(machine).map(|op| op.to)
    }

    /// Returns the performance level last commanded for the machine.
    pub fn performance_of(&self, machine: MachineId) -> Option<PerformanceLevel> {
        self.performance.get(&machine).copied()
    }

    /// Running machines (of the architecture, if given) that are active and have no outstanding state change.
    pub fn settled_running(&self, dir: &ResourceDirectory, arch: Option<CpuArch>) -> Vec<MachineInfo> {
        let machines = match arch {
            Some(arch) => self.tiers.machines(arch, Tier::Running),
            None => self.tiers.all(Tier::Running),
        };
        machines
            .into_iter()
            .filter(|machine| self.is_settled(*machine))
            .filter_map(|machine| dir.machine(machine).ok())
            .filter(|info| info.state.is_active())
            .collect()
    }

    /// Partitions machines into tiers: the first `max_running` are running, the next `standby_size` are put to
    /// standby and the rest are powered off. Returns the running machines.
    pub fn init_tiers(
        &mut self,
        ctx: &LogContext,
        api: &mut dyn ClusterApi,
        config: &ControllerConfig,
    ) -> Vec<MachineInfo> {
        let mut running = Vec::new();
        let mut standby = 0;
        for machine in 0..api.machine_count() {
            let info = match api.machine_info(machine) {
                Ok(info) => info,
                Err(e) => {
                    log_warn!(ctx, "machine {} is left out of tiers: {}", machine, e);
                    continue;
                }
            };
            let (tier, state) = if (running.len() as u32) < config.max_running {
                (Tier::Running, PowerState::S0)
            } else if standby < config.standby_size {
                standby += 1;
                (Tier::Standby, PowerState::S1)
            } else {
                (Tier::Off, PowerState::S5)
            };
            self.tiers.insert(machine, info.arch, tier);
            if info.state != state {
                if let Err(e) = self.command_state(ctx, api, machine, info.state, state) {
                    log_warn!(ctx, "can't put machine {} to {}: {}", machine, state, e);
                }
            }
            if tier == Tier::Running {
                running.push(info);
            }
        }
        log_info!(
            ctx,
            "tiers initialized: {} running, {} standby, {} off",
            self.tiers.count(Tier::Running),
            self.tiers.count(Tier::Standby),
            self.tiers.count(Tier::Off)
        );
        running
    }

    /// Moves the machine to the running tier and powers it on.
    pub fn promote(
        &mut self,
        ctx: &LogContext,
        api: &mut dyn ClusterApi,
        machine: MachineId,
    ) -> Result<(), ClusterError> {
        self.move_machine(ctx, api, machine, Tier::Running)
    }

    /// Moves the machine to a lower tier and commands the matching power state.
    pub fn demote(
        &mut self,
        ctx: &LogContext,
        api: &mut dyn ClusterApi,
        machine: MachineId,
        tier: Tier,
    ) -> Result<(), ClusterError> {
        self.move_machine(ctx, api, machine, tier)
    }

    /// Moves one off machine (of the preferred architecture if possible) to standby when the standby tier has shrunk
    /// below half of its target size.
    pub fn refill_standby(
        &mut self,
        ctx: &LogContext,
        api: &mut dyn ClusterApi,
        config: &ControllerConfig,
        prefer: CpuArch,
    ) -> Option<MachineId> {
        if self.tiers.count(Tier::Standby) as u32 >= config.standby_size / 2 {
            return None;
        }
        let machine = self
            .tiers
            .first_in(prefer, Tier::Off)
            .or_else(|| self.tiers.all(Tier::Off).into_iter().next())?;
        match self.move_machine(ctx, api, machine, Tier::Standby) {
            Ok(()) => Some(machine),
            Err(e) => {
                log_warn!(ctx, "can't refill standby with machine {}: {}", machine, e);
                None
            }
        }
    }

    /// Confirms the outstanding state change if the machine reached the commanded state.
    pub fn on_state_change_complete(&mut self, ctx: &LogContext, api: &dyn ClusterApi, machine: MachineId) {
        let op = match self.state_changes.get_pending(machine) {
            Some(op) => *op,
            None => {
                log_warn!(ctx, "unexpected state change completion on machine {}", machine);
                return;
            }
        };
        match api.machine_info(machine) {
            Ok(info) if info.state == op.to => {
                self.state_changes.confirm(machine);
                log_debug!(ctx, "machine {} changed state from {} to {}", machine, op.from, op.to);
            }
            Ok(info) => log_debug!(
                ctx,
                "machine {} reported state {} while change to {} is outstanding",
                machine,
                info.state,
                op.to
            ),
            Err(e) => log_warn!(ctx, "can't query machine {}: {}", machine, e),
        }
    }

    /// Rebalances overloaded machines, consolidates, demotes idle machines and tunes performance levels.
    ///
    /// Issues no commands when called again with unchanged cluster state.
    pub fn periodic_check(
        &mut self,
        ctx: &LogContext,
        api: &mut dyn ClusterApi,
        config: &ControllerConfig,
        migrations: &mut MigrationCoordinator,
        vms: &mut VmRegistry,
    ) -> CheckSummary {
        let mut summary = CheckSummary::default();
        {
            let dir = ResourceDirectory::new(&*api, config);
            for info in self.settled_running(&dir, None) {
                match dir.classify(&info) {
                    Load::Overloaded => summary.overloaded.push(info.id),
                    Load::Underutilized => summary.underutilized.push(info.id),
                    Load::Normal => {}
                }
            }
        }
        log_debug!(
            ctx,
            "periodic check: {} overloaded, {} underutilized machines",
            summary.overloaded.len(),
            summary.underutilized.len()
        );

        if config.rebalance {
            for &machine in &summary.overloaded {
                let verdict =
                    migrations.try_migrate(ctx, api, config, self, vms, MigrationCriterion::Rebalance { machine });
                if let MigrationVerdict::Started { .. } = verdict {
                    summary.migrations.push(verdict);
                }
            }
        }
        if config.consolidation == ConsolidationMode::Periodic {
            let verdict = migrations.try_migrate(ctx, api, config, self, vms, MigrationCriterion::Consolidation);
            if let MigrationVerdict::Started { .. } = verdict {
                summary.migrations.push(verdict);
            }
        }

        summary.demoted = self.demote_idle(ctx, api, config, migrations, vms);
        summary.performance_changes = self.apply_performance(ctx, api, config);
        summary
    }

    /// Demotes running machines without tasks while the running tier is above `min_running`.
    fn demote_idle(
        &mut self,
        ctx: &LogContext,
        api: &mut dyn ClusterApi,
        config: &ControllerConfig,
        migrations: &MigrationCoordinator,
        vms: &mut VmRegistry,
    ) -> Vec<(MachineId, Tier)> {
        let candidates: Vec<(MachineId, Vec<VmInfo>)> = {
            let dir = ResourceDirectory::new(&*api, config);
            let mut idle: Vec<MachineInfo> = self
                .settled_running(&dir, None)
                .into_iter()
                .filter(|info| info.active_tasks == 0 && dir.classify(info) == Load::Underutilized)
                .filter(|info| !migrations.is_busy(info.id))
                .collect();
            // most recently promoted machines go first
            idle.reverse();
            idle.into_iter()
                .map(|info| {
                    let hosted = vms
                        .ids()
                        .into_iter()
                        .filter_map(|vm| dir.vm(vm).ok())
                        .filter(|vm| vm.machine == Some(info.id))
                        .collect();
                    (info.id, hosted)
                })
                .collect()
        };

        let mut demoted = Vec::new();
        for (machine, hosted) in candidates {
            if self.tiers.count(Tier::Running) as u32 <= config.min_running {
                break;
            }
            if hosted
                .iter()
                .any(|vm| migrations.is_migrating(vm.id) || !vm.active_tasks.is_empty())
            {
                log_debug!(ctx, "machine {} still hosts busy vms", machine);
                continue;
            }
            if !self.shutdown_hosted(ctx, api, vms, machine, &hosted) {
                continue;
            }
            let tier = if (self.tiers.count(Tier::Standby) as u32) < config.standby_size {
                Tier::Standby
            } else {
                Tier::Off
            };
            match self.move_machine(ctx, api, machine, tier) {
                Ok(()) => demoted.push((machine, tier)),
                Err(e) => log_warn!(ctx, "can't demote machine {}: {}", machine, e),
            }
        }
        demoted
    }

    /// Shuts down the empty VMs of a machine about to be demoted and drops them from the registry.
    fn shutdown_hosted(
        &mut self,
        ctx: &LogContext,
        api: &mut dyn ClusterApi,
        vms: &mut VmRegistry,
        machine: MachineId,
        hosted: &[VmInfo],
    ) -> bool {
        for vm in hosted {
            match api.shutdown_vm(vm.id) {
                Ok(()) => {
                    vms.remove(vm.id);
                    log_debug!(ctx, "shut down idle vm {} on machine {}", vm.id, machine);
                }
                Err(e) if e.is_not_found() => {
                    vms.remove(vm.id);
                }
                Err(e) => {
                    log_warn!(ctx, "can't shut down vm {} on machine {}: {}", vm.id, machine, e);
                    return false;
                }
            }
        }
        true
    }

    /// Sets the performance level of every core of settled running machines, skipping machines already at the
    /// level. Returns the number of machines changed.
    fn apply_performance(&mut self, ctx: &LogContext, api: &mut dyn ClusterApi, config: &ControllerConfig) -> u32 {
        let targets: Vec<(MachineId, u32, PerformanceLevel)> = {
            let dir = ResourceDirectory::new(&*api, config);
            self.settled_running(&dir, None)
                .iter()
                .map(|info| (info.id, info.num_cores, config.performance_for(utilization(info))))
                .filter(|(machine, _, level)| self.performance.get(machine) != Some(level))
                .collect()
        };

        let mut changes = 0;
        'machines: for (machine, num_cores, level) in targets {
            for core in 0..num_cores {
                if let Err(e) = api.set_core_performance(machine, core, level) {
                    log_warn!(ctx, "can't set performance of machine {} core {}: {}", machine, core, e);
                    continue 'machines;
                }
            }
            self.performance.insert(machine, level);
            log_debug!(ctx, "machine {} cores set to {}", machine, level);
            changes += 1;
        }
        changes
    }

    fn move_machine(
        &mut self,
        ctx: &LogContext,
        api: &mut dyn ClusterApi,
        machine: MachineId,
        tier: Tier,
    ) -> Result<(), ClusterError> {
        let info = api.machine_info(machine)?;
        let state = match tier {
            Tier::Running => PowerState::S0,
            Tier::Standby => PowerState::S1,
            Tier::Off => PowerState::S5,
        };
        let prev = self
            .tiers
            .move_to(machine, tier)
            .ok_or(ClusterError::MachineNotFound(machine))?;
        if info.state != state || self.state_changes.is_pending(machine) {
            if let Err(e) = self.command_state(ctx, api, machine, info.state, state) {
                self.tiers.move_to(machine, prev);
                return Err(e);
            }
        }
        if tier != Tier::Running {
            self.performance.remove(&machine);
        }
        log_info!(ctx, "machine {} moved from {} to {} tier", machine, prev, tier);
        Ok(())
    }

    /// Issues the state change, superseding the outstanding one.
    fn command_state(
        &mut self,
        ctx: &LogContext,
        api: &mut dyn ClusterApi,
        machine: MachineId,
        from: PowerState,
        to: PowerState,
    ) -> Result<(), ClusterError> {
        api.set_machine_state(machine, to)?;
        if let Some(prev) = self.state_changes.supersede(machine, StateChangeOp { from, to }) {
            log_debug!(ctx, "machine {}: change to {} supersedes change to {}", machine, to, prev.to);
        }
        log_debug!(ctx, "machine {} commanded from {} to {}", machine, from, to);
        Ok(())
    }
}
