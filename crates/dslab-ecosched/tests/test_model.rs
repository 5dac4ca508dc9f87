use dslab_ecosched::cluster::{ClusterCommands, ResourceQuery};
use dslab_ecosched::common::{CpuArch, PerformanceLevel, PowerState, Priority, SlaClass, VmType};
use dslab_ecosched::error::ClusterError;
use dslab_ecosched::model::InMemoryCluster;

#[test]
// The engine refuses tasks of another architecture, a second shutdown, a second migration and unknown ids.
fn test_rejections() {
    let mut cluster = InMemoryCluster::new();
    let x86 = cluster.add_machine(CpuArch::X86, 4, 1000);
    let x86_other = cluster.add_machine(CpuArch::X86, 4, 1000);
    let arm = cluster.add_machine(CpuArch::Arm, 4, 1000);

    let vm = cluster.create_vm(VmType::Linux, CpuArch::X86).unwrap();
    assert!(matches!(cluster.attach_vm(vm, arm), Err(ClusterError::Rejected { .. })));
    cluster.attach_vm(vm, x86).unwrap();

    let arm_task = cluster.submit_task(CpuArch::Arm, VmType::Linux, 100, SlaClass::Sla1, 10.);
    assert!(matches!(
        cluster.add_task(vm, arm_task, Priority::Mid),
        Err(ClusterError::Rejected { .. })
    ));
    let task = cluster.submit_task(CpuArch::X86, VmType::Linux, 100, SlaClass::Sla1, 10.);
    cluster.add_task(vm, task, Priority::Mid).unwrap();
    assert!(cluster.add_task(vm, task, Priority::Mid).is_err());

    cluster.migrate_vm(vm, x86_other).unwrap();
    assert!(matches!(cluster.migrate_vm(vm, x86_other), Err(ClusterError::Rejected { .. })));
    assert!(cluster.shutdown_vm(vm).is_err());
    cluster.finish_migration(vm).unwrap();
    assert_eq!(cluster.vm_info(vm).unwrap().machine, Some(x86_other));

    cluster.shutdown_vm(vm).unwrap();
    assert!(cluster.shutdown_vm(vm).is_err());

    assert_eq!(cluster.machine_info(7), Err(ClusterError::MachineNotFound(7)));
    assert_eq!(cluster.vm_info(7), Err(ClusterError::VmNotFound(7)));
    assert_eq!(cluster.task_info(7), Err(ClusterError::TaskNotFound(7)));
    assert!(cluster.set_task_priority(7, Priority::High).unwrap_err().is_not_found());
}

#[test]
// Power state changes take effect only when finished; cores of a sleeping machine can't be tuned.
fn test_state_changes() {
    let mut cluster = InMemoryCluster::new();
    let machine = cluster.add_machine(CpuArch::X86, 2, 1000);

    cluster.set_machine_state(machine, PowerState::S1).unwrap();
    assert_eq!(cluster.machine_info(machine).unwrap().state, PowerState::S0);
    assert_eq!(cluster.pending_state(machine), Some(PowerState::S1));
    cluster.finish_state_change(machine).unwrap();
    assert_eq!(cluster.machine_info(machine).unwrap().state, PowerState::S1);
    assert!(cluster.finish_state_change(machine).is_err());

    assert!(cluster.set_core_performance(machine, 0, PerformanceLevel::P2).is_err());
    cluster.set_machine_state(machine, PowerState::S0).unwrap();
    cluster.finish_state_change(machine).unwrap();
    cluster.set_core_performance(machine, 1, PerformanceLevel::P2).unwrap();
    assert!(cluster.set_core_performance(machine, 2, PerformanceLevel::P2).is_err());
}

#[test]
// An idle active machine draws 100 W: 36 s give 3600 J, i.e. 0.001 kWh.
// Powered off machines draw nothing.
fn test_energy() {
    let mut cluster = InMemoryCluster::new();
    let machine = cluster.add_machine(CpuArch::X86, 4, 1000);
    cluster.advance(36.);
    assert!((cluster.cluster_energy() - 0.001).abs() < 1e-12);

    cluster.set_machine_state(machine, PowerState::S5).unwrap();
    cluster.finish_state_change(machine).unwrap();
    cluster.advance(100.);
    assert!((cluster.cluster_energy() - 0.001).abs() < 1e-12);
}
