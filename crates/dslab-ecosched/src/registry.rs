//! Registry of VMs created by the controller.

use indexmap::IndexMap;

use crate::cluster::ClusterApi;
use crate::common::{CpuArch, MachineId, VmId, VmType};
use crate::log::LogContext;
use crate::{log_debug, log_warn};

/// Immutable attributes of a VM. Host machine and tasks are always queried from the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VmRecord {
    pub id: VmId,
    pub arch: CpuArch,
    pub vm_type: VmType,
}

/// VMs owned by the controller, in creation order.
#[derive(Clone, Debug, Default)]
pub struct VmRegistry {
    vms: IndexMap<VmId, VmRecord>,
}

impl VmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: VmRecord) {
        self.vms.insert(record.id, record);
    }

    /// Creates a VM, attaches it to the machine and registers it.
    ///
    /// A VM the engine refuses to attach is shut down right away and never registered.
    pub fn launch(
        &mut self,
        ctx: &LogContext,
        api: &mut dyn ClusterApi,
        vm_type: VmType,
        arch: CpuArch,
        machine: MachineId,
    ) -> Option<VmId> {
        let vm = match api.create_vm(vm_type, arch) {
            Ok(vm) => vm,
            Err(e) => {
                log_warn!(ctx, "can't create {} vm for machine {}: {}", vm_type, machine, e);
                return None;
            }
        };
        if let Err(e) = api.attach_vm(vm, machine) {
            log_warn!(ctx, "can't attach vm {} to machine {}: {}", vm, machine, e);
            if let Err(e) = api.shutdown_vm(vm) {
                log_debug!(ctx, "can't discard vm {}: {}", vm, e);
            }
            return None;
        }
        self.insert(VmRecord { id: vm, arch, vm_type });
        log_debug!(ctx, "created {} vm {} on machine {}", vm_type, vm, machine);
        Some(vm)
    }

    pub fn remove(&mut self, id: VmId) -> Option<VmRecord> {
        self.vms.shift_remove(&id)
    }

    pub fn contains(&self, id: VmId) -> bool {
        self.vms.contains_key(&id)
    }

    pub fn get(&self, id: VmId) -> Option<&VmRecord> {
        self.vms.get(&id)
    }

    pub fn ids(&self) -> Vec<VmId> {
        self.vms.keys().cloned().collect()
    }

    /// VMs of the architecture, in creation order.
    pub fn for_arch(&self, arch: CpuArch) -> Vec<VmRecord> {
        self.vms.values().filter(|vm| vm.arch == arch).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.vms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vms.is_empty()
    }
}
