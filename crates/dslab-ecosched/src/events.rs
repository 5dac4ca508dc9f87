//! Events delivered by the engine to the controller.

use serde::Serialize;

use crate::common::{MachineId, TaskId, VmId};

/// An engine callback, as a value.
///
/// Drivers that keep their own event queue can store these and hand them to
/// [`Controller::on`](crate::controller::Controller::on) instead of calling the entry points directly.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ControllerEvent {
    Init,
    NewTask { task_id: TaskId },
    TaskComplete { task_id: TaskId },
    MigrationComplete { vm_id: VmId },
    PeriodicCheck,
    MemoryWarning { machine_id: MachineId },
    SlaWarning { task_id: TaskId },
    StateChangeComplete { machine_id: MachineId },
    Shutdown,
}
