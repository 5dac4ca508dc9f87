//! SLA class to priority mapping and reaction to SLA violations.

use crate::cluster::ClusterApi;
use crate::common::{Priority, SlaClass, TaskId};
use crate::log::LogContext;
use crate::migration::MigrationVerdict;
use crate::{log_debug, log_info, log_warn};

/// Priority assigned to a task of the given class on arrival.
pub fn priority_for(sla: SlaClass) -> Priority {
    match sla {
        SlaClass::Sla0 => Priority::High,
        SlaClass::Sla1 => Priority::Mid,
        _ => Priority::Low,
    }
}

/// Counters of SLA related events.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SlaStats {
    /// SLA warnings received from the engine.
    pub warnings: u32,
    /// Completed tasks that missed their SLA.
    pub violations_on_completion: u32,
    /// Migrations started to rescue a task.
    pub rescues_started: u32,
}

/// Tracks SLA violations and escalates priorities of violating tasks.
#[derive(Default)]
pub struct SlaMonitor {
    stats: SlaStats,
}

impl SlaMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &SlaStats {
        &self.stats
    }

    /// Checks whether the completed task met its SLA.
    pub fn on_task_complete(&mut self, ctx: &LogContext, api: &dyn ClusterApi, task: TaskId) {
        match api.is_sla_violation(task) {
            Ok(true) => {
                self.stats.violations_on_completion += 1;
                log_info!(ctx, "task {} violated its SLA", task);
            }
            Ok(false) => {}
            Err(e) => log_warn!(ctx, "can't check SLA of task {}: {}", task, e),
        }
    }

    /// Raises the priority of the violating task to the top tier.
    /// Returns `false` if the engine does not know the task.
    pub fn on_sla_warning(&mut self, ctx: &LogContext, api: &mut dyn ClusterApi, task: TaskId) -> bool {
        self.stats.warnings += 1;
        match api.set_task_priority(task, Priority::High) {
            Ok(()) => {
                log_debug!(ctx, "raised priority of task {} to {}", task, Priority::High);
                true
            }
            Err(e) => {
                log_warn!(ctx, "can't raise priority of task {}: {}", task, e);
                false
            }
        }
    }

    /// Records the outcome of a rescue attempt. Rescue is best effort, the next periodic check re-evaluates the load.
    pub fn on_rescue_attempt(&mut self, ctx: &LogContext, task: TaskId, verdict: &MigrationVerdict) {
        match verdict {
            MigrationVerdict::Started { vm, .. } => {
                self.stats.rescues_started += 1;
                log_debug!(ctx, "rescuing task {} by migrating vm {}", task, vm);
            }
            other => log_debug!(ctx, "no rescue for task {}: {}", task, other),
        }
    }
}
