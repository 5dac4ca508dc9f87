//! Event router and controller lifecycle.

use std::fmt::{Display, Formatter};

use crate::cluster::ClusterApi;
use crate::common::{MachineId, TaskId, Time, VmId};
use crate::config::{ConsolidationMode, ControllerConfig};
use crate::events::ControllerEvent;
use crate::log::{log_ignored_event, LogContext};
use crate::migration::{MigrationCoordinator, MigrationCriterion, MigrationVerdict};
use crate::placement::{PlacementOutcome, PlacementPolicy, PlacementState};
use crate::power::{CheckSummary, PowerManager};
use crate::registry::VmRegistry;
use crate::sla::{SlaMonitor, SlaStats};
use crate::tiers::TierSet;
use crate::{log_debug, log_error, log_info, log_warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Running,
    ShuttingDown,
    Stopped,
}

impl Display for Lifecycle {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            Lifecycle::Uninitialized => write!(f, "uninitialized"),
            Lifecycle::Running => write!(f, "running"),
            Lifecycle::ShuttingDown => write!(f, "shutting_down"),
            Lifecycle::Stopped => write!(f, "stopped"),
        }
    }
}

/// Task placement and power management controller.
///
/// The controller reacts to engine events one at a time. It owns the VM registry, machine tiers and the set of
/// in-flight operations, and never holds a reference to the engine between events: every entry point receives the
/// engine as `api` along with the event time.
pub struct Controller {
    config: ControllerConfig,
    ctx: LogContext,
    lifecycle: Lifecycle,
    power: PowerManager,
    vms: VmRegistry,
    migrations: MigrationCoordinator,
    placement: PlacementPolicy,
    sla: SlaMonitor,
}

impl Controller {
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            config,
            ctx: LogContext::new("controller"),
            lifecycle: Lifecycle::Uninitialized,
            power: PowerManager::new(),
            vms: VmRegistry::new(),
            migrations: MigrationCoordinator::new(),
            placement: PlacementPolicy::new(),
            sla: SlaMonitor::new(),
        }
    }

    /// Dispatches the event to the matching handler.
    pub fn on(&mut self, api: &mut dyn ClusterApi, time: Time, event: ControllerEvent) {
        match event {
            ControllerEvent::Init => self.init(api, time),
            ControllerEvent::NewTask { task_id } => {
                self.on_new_task(api, time, task_id);
            }
            ControllerEvent::TaskComplete { task_id } => self.on_task_complete(api, time, task_id),
            ControllerEvent::MigrationComplete { vm_id } => self.on_migration_complete(api, time, vm_id),
            ControllerEvent::PeriodicCheck => {
                self.on_periodic_check(api, time);
            }
            ControllerEvent::MemoryWarning { machine_id } => {
                self.on_memory_warning(api, time, machine_id);
            }
            ControllerEvent::SlaWarning { task_id } => {
                self.on_sla_warning(api, time, task_id);
            }
            ControllerEvent::StateChangeComplete { machine_id } => self.on_state_change_complete(api, time, machine_id),
            ControllerEvent::Shutdown => self.shutdown(api, time),
        }
    }

    /// Splits machines into tiers and creates one VM of the default image on every running machine.
    pub fn init(&mut self, api: &mut dyn ClusterApi, time: Time) {
        self.ctx.set_time(time);
        if self.lifecycle != Lifecycle::Uninitialized {
            log_ignored_event(&self.ctx, &ControllerEvent::Init, &self.lifecycle.to_string());
            return;
        }
        log_info!(self.ctx, "initializing with {} machines", api.machine_count());

        let running = self.power.init_tiers(&self.ctx, api, &self.config);
        for machine in running {
            let vm_type = self.config.image_for(machine.arch);
            self.vms.launch(&self.ctx, api, vm_type, machine.arch, machine.id);
        }

        self.lifecycle = Lifecycle::Running;
        self.check_partition(api);
    }

    /// Places the arriving task.
    pub fn on_new_task(&mut self, api: &mut dyn ClusterApi, time: Time, task: TaskId) -> PlacementOutcome {
        if !self.accepts(time, &ControllerEvent::NewTask { task_id: task }) {
            return PlacementOutcome::Unplaced;
        }
        let state = PlacementState {
            power: &mut self.power,
            vms: &mut self.vms,
            migrations: &self.migrations,
        };
        self.placement.place(&self.ctx, api, &self.config, state, task)
    }

    pub fn on_task_complete(&mut self, api: &mut dyn ClusterApi, time: Time, task: TaskId) {
        if !self.accepts(time, &ControllerEvent::TaskComplete { task_id: task }) {
            return;
        }
        log_debug!(self.ctx, "task {} completed", task);
        self.sla.on_task_complete(&self.ctx, &*api, task);
        if self.config.consolidation == ConsolidationMode::OnTaskComplete {
            self.migrations.try_migrate(
                &self.ctx,
                api,
                &self.config,
                &self.power,
                &self.vms,
                MigrationCriterion::Consolidation,
            );
        }
    }

    pub fn on_migration_complete(&mut self, _api: &mut dyn ClusterApi, time: Time, vm: VmId) {
        if !self.accepts(time, &ControllerEvent::MigrationComplete { vm_id: vm }) {
            return;
        }
        self.migrations.on_migration_complete(&self.ctx, vm);
    }

    pub fn on_periodic_check(&mut self, api: &mut dyn ClusterApi, time: Time) -> CheckSummary {
        if !self.accepts(time, &ControllerEvent::PeriodicCheck) {
            return CheckSummary::default();
        }
        let summary = self
            .power
            .periodic_check(&self.ctx, api, &self.config, &mut self.migrations, &mut self.vms);
        self.check_partition(api);
        summary
    }

    /// Moves one VM off the machine that ran out of memory.
    pub fn on_memory_warning(&mut self, api: &mut dyn ClusterApi, time: Time, machine: MachineId) -> MigrationVerdict {
        if !self.accepts(time, &ControllerEvent::MemoryWarning { machine_id: machine }) {
            return MigrationVerdict::NoCandidate;
        }
        log_debug!(self.ctx, "memory warning on machine {}", machine);
        let verdict = self.migrations.try_migrate(
            &self.ctx,
            api,
            &self.config,
            &self.power,
            &self.vms,
            MigrationCriterion::MemoryPressure { machine },
        );
        if let MigrationVerdict::NoCandidate = verdict {
            log_debug!(self.ctx, "no memory relief for machine {}", machine);
        }
        verdict
    }

    /// Escalates the violating task and tries to move its VM to a less loaded machine.
    pub fn on_sla_warning(&mut self, api: &mut dyn ClusterApi, time: Time, task: TaskId) -> MigrationVerdict {
        if !self.accepts(time, &ControllerEvent::SlaWarning { task_id: task }) {
            return MigrationVerdict::NoCandidate;
        }
        if !self.sla.on_sla_warning(&self.ctx, api, task) {
            return MigrationVerdict::NoCandidate;
        }
        let verdict = self.migrations.try_migrate(
            &self.ctx,
            api,
            &self.config,
            &self.power,
            &self.vms,
            MigrationCriterion::SlaRescue { task },
        );
        self.sla.on_rescue_attempt(&self.ctx, task, &verdict);
        verdict
    }

    pub fn on_state_change_complete(&mut self, api: &mut dyn ClusterApi, time: Time, machine: MachineId) {
        if !self.accepts(time, &ControllerEvent::StateChangeComplete { machine_id: machine }) {
            return;
        }
        self.power.on_state_change_complete(&self.ctx, &*api, machine);
    }

    /// Shuts down every VM that is not migrating, each exactly once.
    pub fn shutdown(&mut self, api: &mut dyn ClusterApi, time: Time) {
        if !self.accepts(time, &ControllerEvent::Shutdown) {
            return;
        }
        self.lifecycle = Lifecycle::ShuttingDown;
        let mut skipped = 0;
        for vm in self.vms.ids() {
            if self.migrations.is_migrating(vm) {
                log_debug!(self.ctx, "vm {} is migrating, left running", vm);
                skipped += 1;
                continue;
            }
            if let Err(e) = api.shutdown_vm(vm) {
                log_warn!(self.ctx, "can't shut down vm {}: {}", vm, e);
            }
            self.vms.remove(vm);
        }
        log_info!(
            self.ctx,
            "shutdown complete, {} migrating vms left running, energy used: {:.3} kWh",
            skipped,
            api.cluster_energy()
        );
        self.lifecycle = Lifecycle::Stopped;
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn tiers(&self) -> &TierSet {
        self.power.tiers()
    }

    pub fn power(&self) -> &PowerManager {
        &self.power
    }

    pub fn vms(&self) -> &VmRegistry {
        &self.vms
    }

    /// VMs with an outstanding migration.
    pub fn migrating(&self) -> Vec<VmId> {
        self.migrations.migrating()
    }

    pub fn placement(&self) -> &PlacementPolicy {
        &self.placement
    }

    pub fn sla_stats(&self) -> &SlaStats {
        self.sla.stats()
    }

    /// Sets the event time and checks that the controller handles steady-state events.
    fn accepts(&mut self, time: Time, event: &ControllerEvent) -> bool {
        self.ctx.set_time(time);
        if self.lifecycle != Lifecycle::Running {
            log_ignored_event(&self.ctx, event, &self.lifecycle.to_string());
            return false;
        }
        true
    }

    fn check_partition(&self, api: &dyn ClusterApi) {
        if let Err(e) = self.power.tiers().check_partition(api.machine_count()) {
            log_error!(self.ctx, "{}", e);
        }
    }
}
