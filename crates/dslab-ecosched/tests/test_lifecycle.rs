use dslab_ecosched::cluster::{ClusterCommands, MachineInfo, ResourceQuery, TaskInfo, VmInfo};
use dslab_ecosched::common::{
    CpuArch, MachineId, PerformanceLevel, PowerState, Priority, SlaClass, TaskId, VmId, VmType,
};
use dslab_ecosched::config::ControllerConfig;
use dslab_ecosched::controller::{Controller, Lifecycle};
use dslab_ecosched::error::ClusterError;
use dslab_ecosched::events::ControllerEvent;
use dslab_ecosched::migration::MigrationVerdict;
use dslab_ecosched::model::{Command, InMemoryCluster};
use dslab_ecosched::placement::PlacementOutcome;
use dslab_ecosched::power::CheckSummary;
use dslab_ecosched::sla::{priority_for, SlaStats};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn cluster(count: u32) -> InMemoryCluster {
    let mut cluster = InMemoryCluster::new();
    for _ in 0..count {
        cluster.add_machine(CpuArch::X86, 4, 16000);
    }
    cluster
}

fn shutdowns(cluster: &InMemoryCluster) -> Vec<u32> {
    cluster
        .commands()
        .iter()
        .filter_map(|c| match c {
            Command::ShutdownVm { vm } => Some(*vm),
            _ => None,
        })
        .collect()
}

#[test]
// Events arriving before init are ignored and issue no commands.
fn test_events_before_init_are_ignored() {
    init_logger();
    let mut cluster = cluster(2);
    let mut controller = Controller::new(ControllerConfig::default());
    let task = cluster.submit_task(CpuArch::X86, VmType::Linux, 100, SlaClass::Sla0, 10.);

    assert_eq!(controller.on_new_task(&mut cluster, 1., task), PlacementOutcome::Unplaced);
    assert_eq!(controller.on_periodic_check(&mut cluster, 2.), CheckSummary::default());
    controller.shutdown(&mut cluster, 3.);
    assert_eq!(controller.lifecycle(), Lifecycle::Uninitialized);
    assert!(cluster.commands().is_empty());

    controller.init(&mut cluster, 4.);
    assert_eq!(controller.lifecycle(), Lifecycle::Running);
    assert_eq!(controller.vms().len(), 2);

    // second init is ignored
    controller.init(&mut cluster, 5.);
    assert_eq!(controller.vms().len(), 2);
}

// Engine that refuses to attach VMs to one machine.
struct AttachRefusingCluster {
    inner: InMemoryCluster,
    machine: MachineId,
}

impl ResourceQuery for AttachRefusingCluster {
    fn machine_count(&self) -> u32 {
        self.inner.machine_count()
    }

    fn machine_info(&self, id: MachineId) -> Result<MachineInfo, ClusterError> {
        self.inner.machine_info(id)
    }

    fn vm_info(&self, id: VmId) -> Result<VmInfo, ClusterError> {
        self.inner.vm_info(id)
    }

    fn task_info(&self, id: TaskId) -> Result<TaskInfo, ClusterError> {
        self.inner.task_info(id)
    }

    fn is_sla_violation(&self, task: TaskId) -> Result<bool, ClusterError> {
        self.inner.is_sla_violation(task)
    }

    fn sla_compliance(&self, class: SlaClass) -> f64 {
        self.inner.sla_compliance(class)
    }

    fn cluster_energy(&self) -> f64 {
        self.inner.cluster_energy()
    }
}

impl ClusterCommands for AttachRefusingCluster {
    fn create_vm(&mut self, vm_type: VmType, arch: CpuArch) -> Result<VmId, ClusterError> {
        self.inner.create_vm(vm_type, arch)
    }

    fn attach_vm(&mut self, vm: VmId, machine: MachineId) -> Result<(), ClusterError> {
        if machine == self.machine {
            return Err(ClusterError::rejected(format!("machine {} takes no vms", machine)));
        }
        self.inner.attach_vm(vm, machine)
    }

    fn add_task(&mut self, vm: VmId, task: TaskId, priority: Priority) -> Result<(), ClusterError> {
        self.inner.add_task(vm, task, priority)
    }

    fn migrate_vm(&mut self, vm: VmId, machine: MachineId) -> Result<(), ClusterError> {
        self.inner.migrate_vm(vm, machine)
    }

    fn set_machine_state(&mut self, machine: MachineId, state: PowerState) -> Result<(), ClusterError> {
        self.inner.set_machine_state(machine, state)
    }

    fn set_core_performance(
        &mut self,
        machine: MachineId,
        core: u32,
        level: PerformanceLevel,
    ) -> Result<(), ClusterError> {
        self.inner.set_core_performance(machine, core, level)
    }

    fn shutdown_vm(&mut self, vm: VmId) -> Result<(), ClusterError> {
        self.inner.shutdown_vm(vm)
    }

    fn set_task_priority(&mut self, task: TaskId, priority: Priority) -> Result<(), ClusterError> {
        self.inner.set_task_priority(task, priority)
    }
}

#[test]
// The engine refuses to attach VM 1 to machine 1 during init: the VM is shut down and never registered,
// the other running machines get their VMs as usual.
fn test_init_discards_unattached_vm() {
    init_logger();
    let mut cluster = AttachRefusingCluster {
        inner: cluster(3),
        machine: 1,
    };
    let mut controller = Controller::new(ControllerConfig::default());
    controller.init(&mut cluster, 0.);

    assert_eq!(controller.lifecycle(), Lifecycle::Running);
    assert_eq!(controller.vms().ids(), vec![0, 2]);
    assert_eq!(shutdowns(&cluster.inner), vec![1]);
    assert_eq!(cluster.inner.vm_info(1), Err(ClusterError::VmNotFound(1)));
    assert_eq!(cluster.inner.vm_info(2).unwrap().machine, Some(2));
}

#[test]
// VM 0 is migrating at shutdown: it is skipped, every other VM is shut down exactly once.
// After shutdown the controller ignores all events.
fn test_shutdown_skips_migrating_vms() {
    init_logger();
    let mut cluster = cluster(3);
    let mut controller = Controller::new(ControllerConfig::default());
    controller.init(&mut cluster, 0.);
    assert!(matches!(
        controller.on_memory_warning(&mut cluster, 1., 0),
        MigrationVerdict::Started { vm: 0, .. }
    ));
    cluster.take_commands();

    controller.shutdown(&mut cluster, 2.);
    assert_eq!(controller.lifecycle(), Lifecycle::Stopped);
    assert_eq!(shutdowns(&cluster), vec![1, 2]);
    assert_eq!(controller.vms().ids(), vec![0]);

    controller.shutdown(&mut cluster, 3.);
    controller.on_periodic_check(&mut cluster, 4.);
    controller.on_migration_complete(&mut cluster, 5., 0);
    assert_eq!(shutdowns(&cluster), vec![1, 2]);
    assert_eq!(cluster.commands().len(), 2);
    assert_eq!(controller.migrating(), vec![0]);
}

#[test]
// The dispatch entry point routes events to their handlers.
fn test_dispatch_events() {
    init_logger();
    let mut cluster = cluster(1);
    let mut controller = Controller::new(ControllerConfig::default());
    controller.on(&mut cluster, 0., ControllerEvent::Init);
    let task = cluster.submit_task(CpuArch::X86, VmType::Linux, 100, SlaClass::Sla1, 10.);
    controller.on(&mut cluster, 1., ControllerEvent::NewTask { task_id: task });
    assert!(cluster.commands().contains(&Command::AddTask {
        vm: 0,
        task,
        priority: Priority::Mid,
    }));

    controller.on(&mut cluster, 2., ControllerEvent::Shutdown);
    assert_eq!(controller.lifecycle(), Lifecycle::Stopped);

    assert_eq!(
        serde_json::to_string(&ControllerEvent::NewTask { task_id: 3 }).unwrap(),
        r#"{"type":"NewTask","task_id":3}"#
    );
}

#[test]
// Three tasks run on machine 0 (utilization 0.75), machine 1 is idle.
// An SLA warning raises the task priority and moves its VM to machine 1;
// a warning for another task of the same VM finds it already migrating.
fn test_sla_warning_rescues_task() {
    init_logger();
    let mut cluster = cluster(2);
    let mut controller = Controller::new(ControllerConfig::default());
    controller.init(&mut cluster, 0.);
    let tasks: Vec<u32> = (0..3)
        .map(|_| {
            let task = cluster.submit_task(CpuArch::X86, VmType::Win, 100, SlaClass::Sla2, 10.);
            controller.on_new_task(&mut cluster, 1., task);
            task
        })
        .collect();
    cluster.take_commands();

    let verdict = controller.on_sla_warning(&mut cluster, 2., tasks[0]);
    assert_eq!(
        verdict,
        MigrationVerdict::Started {
            vm: 0,
            source: 0,
            target: 1,
        }
    );
    assert_eq!(cluster.task_info(tasks[0]).unwrap().priority, Priority::High);

    let verdict = controller.on_sla_warning(&mut cluster, 3., tasks[1]);
    assert_eq!(verdict, MigrationVerdict::AlreadyMigrating(0));
    assert_eq!(cluster.task_info(tasks[1]).unwrap().priority, Priority::High);

    // unknown task
    assert_eq!(controller.on_sla_warning(&mut cluster, 4., 42), MigrationVerdict::NoCandidate);

    assert_eq!(
        controller.sla_stats(),
        &SlaStats {
            warnings: 3,
            violations_on_completion: 0,
            rescues_started: 1,
        }
    );
    assert_eq!(
        cluster.commands(),
        &[
            Command::SetTaskPriority {
                task: tasks[0],
                priority: Priority::High,
            },
            Command::MigrateVm { vm: 0, machine: 1 },
            Command::SetTaskPriority {
                task: tasks[1],
                priority: Priority::High,
            },
        ]
    );
}

#[test]
// A task with a 10 s deadline completes at 15 s and is counted as a violation.
fn test_violation_on_completion() {
    init_logger();
    let mut cluster = cluster(1);
    let mut controller = Controller::new(ControllerConfig::default());
    controller.init(&mut cluster, 0.);
    let late = cluster.submit_task(CpuArch::X86, VmType::Linux, 100, SlaClass::Sla0, 10.);
    let on_time = cluster.submit_task(CpuArch::X86, VmType::Linux, 100, SlaClass::Sla1, 100.);
    controller.on_new_task(&mut cluster, 0., late);
    controller.on_new_task(&mut cluster, 0., on_time);

    cluster.advance(15.);
    cluster.complete_task(late).unwrap();
    controller.on_task_complete(&mut cluster, 15., late);
    cluster.complete_task(on_time).unwrap();
    controller.on_task_complete(&mut cluster, 15., on_time);

    assert_eq!(controller.sla_stats().violations_on_completion, 1);
    assert_eq!(cluster.sla_compliance(SlaClass::Sla0), 0.);
    assert_eq!(cluster.sla_compliance(SlaClass::Sla1), 100.);
    assert_eq!(cluster.sla_compliance(SlaClass::Sla3), 100.);
}

#[test]
// The strictest class gets the highest priority, the middle class the medium one, the rest the lowest.
fn test_priority_mapping() {
    assert_eq!(priority_for(SlaClass::Sla0), Priority::High);
    assert_eq!(priority_for(SlaClass::Sla1), Priority::Mid);
    assert_eq!(priority_for(SlaClass::Sla2), Priority::Low);
    assert_eq!(priority_for(SlaClass::Sla3), Priority::Low);
    assert!(Priority::High > Priority::Mid && Priority::Mid > Priority::Low);
}
