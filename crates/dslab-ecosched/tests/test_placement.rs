use dslab_ecosched::cluster::{ClusterCommands, ResourceQuery};
use dslab_ecosched::common::{CpuArch, PowerState, Priority, SlaClass, VmType};
use dslab_ecosched::config::ControllerConfig;
use dslab_ecosched::controller::Controller;
use dslab_ecosched::migration::MigrationVerdict;
use dslab_ecosched::model::{Command, InMemoryCluster};
use dslab_ecosched::placement::{PlacementOutcome, PlacementTier};
use dslab_ecosched::tiers::Tier;

fn config(max_running: u32, min_running: u32, standby_size: u32) -> ControllerConfig {
    ControllerConfig {
        max_running,
        min_running,
        standby_size,
        ..ControllerConfig::default()
    }
}

fn add_machines(cluster: &mut InMemoryCluster, arch: CpuArch, count: u32, memory: u64) {
    for _ in 0..count {
        cluster.add_machine(arch, 4, memory);
    }
}

// Finishes all outstanding power state changes and reports them to the controller.
fn settle(cluster: &mut InMemoryCluster, controller: &mut Controller) {
    for machine in 0..cluster.machine_count() {
        if cluster.pending_state(machine).is_some() {
            cluster.finish_state_change(machine).unwrap();
            controller.on_state_change_complete(cluster, 0., machine);
        }
    }
}

fn start(cluster: &mut InMemoryCluster, config: ControllerConfig) -> Controller {
    let mut controller = Controller::new(config);
    controller.init(cluster, 0.);
    settle(cluster, &mut controller);
    cluster.take_commands();
    controller
}

#[test]
// Two x86 machines are running, three ARM machines are powered off.
// An ARM task must power on exactly one ARM machine and get a new VM there within the same call.
fn test_task_powers_on_machine_of_its_arch() {
    let mut cluster = InMemoryCluster::new();
    add_machines(&mut cluster, CpuArch::X86, 2, 16000);
    add_machines(&mut cluster, CpuArch::Arm, 3, 16000);
    let mut controller = start(&mut cluster, config(2, 1, 0));
    assert_eq!(controller.tiers().machines(CpuArch::Arm, Tier::Off), vec![2, 3, 4]);

    let task = cluster.submit_task(CpuArch::Arm, VmType::Linux, 100, SlaClass::Sla1, 100.);
    let outcome = controller.on_new_task(&mut cluster, 1., task);

    assert_eq!(
        outcome,
        PlacementOutcome::Placed {
            vm: 2,
            tier: PlacementTier::Expansion,
            priority: Priority::Mid,
        }
    );
    assert_eq!(
        cluster.commands(),
        &[
            Command::SetMachineState {
                machine: 2,
                state: PowerState::S0,
            },
            Command::CreateVm {
                vm: 2,
                vm_type: VmType::Linux,
                arch: CpuArch::Arm,
            },
            Command::AttachVm { vm: 2, machine: 2 },
            Command::AddTask {
                vm: 2,
                task,
                priority: Priority::Mid,
            },
        ]
    );
    assert_eq!(cluster.vm_info(2).unwrap().arch, CpuArch::Arm);
    assert_eq!(controller.tiers().tier_of(2), Some(Tier::Running));
    assert_eq!(controller.tiers().machines(CpuArch::Arm, Tier::Off), vec![3, 4]);
    assert_eq!(controller.tiers().check_partition(5), Ok(()));
}

#[test]
// Tasks of the strictest and a loose SLA class arrive for one idle VM.
// Both are placed there, the strict one with a strictly higher priority.
fn test_priority_follows_sla_class() {
    let mut cluster = InMemoryCluster::new();
    add_machines(&mut cluster, CpuArch::X86, 1, 16000);
    let mut controller = start(&mut cluster, ControllerConfig::default());

    let strict = cluster.submit_task(CpuArch::X86, VmType::Linux, 100, SlaClass::Sla0, 100.);
    let loose = cluster.submit_task(CpuArch::X86, VmType::Linux, 100, SlaClass::Sla2, 100.);
    let strict_outcome = controller.on_new_task(&mut cluster, 1., strict);
    let loose_outcome = controller.on_new_task(&mut cluster, 1., loose);

    let priority_of = |outcome: &PlacementOutcome| match outcome {
        PlacementOutcome::Placed { vm, priority, .. } => {
            assert_eq!(*vm, 0);
            *priority
        }
        PlacementOutcome::Unplaced => panic!("task is not placed"),
    };
    assert_eq!(priority_of(&strict_outcome), Priority::High);
    assert_eq!(priority_of(&loose_outcome), Priority::Low);
    assert!(priority_of(&strict_outcome) > priority_of(&loose_outcome));
    assert_eq!(cluster.task_info(strict).unwrap().priority, Priority::High);
    assert_eq!(cluster.vm_info(0).unwrap().active_tasks, vec![strict, loose]);
}

#[test]
// Best fit prefers the VM with fewer tasks and breaks ties by the lowest VM id.
fn test_best_fit_balances_vms() {
    let mut cluster = InMemoryCluster::new();
    add_machines(&mut cluster, CpuArch::X86, 2, 16000);
    let mut controller = start(&mut cluster, ControllerConfig::default());

    let mut vms = Vec::new();
    for _ in 0..3 {
        let task = cluster.submit_task(CpuArch::X86, VmType::Linux, 100, SlaClass::Sla2, 100.);
        match controller.on_new_task(&mut cluster, 1., task) {
            PlacementOutcome::Placed { vm, tier, .. } => {
                assert_eq!(tier, PlacementTier::BestFit);
                vms.push(vm);
            }
            PlacementOutcome::Unplaced => panic!("task {} is not placed", task),
        }
    }
    assert_eq!(vms, vec![0, 1, 0]);
    assert_eq!(controller.placement().placed_by(PlacementTier::BestFit), 3);
}

#[test]
// No VM runs the requested image, so the task goes to the first VM of the right architecture.
fn test_any_compatible_vm_when_image_differs() {
    let mut cluster = InMemoryCluster::new();
    add_machines(&mut cluster, CpuArch::X86, 2, 16000);
    let mut controller = start(&mut cluster, ControllerConfig::default());

    let task = cluster.submit_task(CpuArch::X86, VmType::Win, 100, SlaClass::Sla3, 100.);
    assert_eq!(
        controller.on_new_task(&mut cluster, 1., task),
        PlacementOutcome::Placed {
            vm: 0,
            tier: PlacementTier::AnyCompatible,
            priority: Priority::Low,
        }
    );
}

#[test]
// Five x86 machines with 1000 MB each: one running, two standby, two off; tasks need 800 MB.
// The second task wakes up the first standby machine. The third one wakes up the last standby machine,
// which empties the standby tier, so an off machine is moved to standby.
fn test_expansion_promotes_standby_and_refills_it() {
    let mut cluster = InMemoryCluster::new();
    add_machines(&mut cluster, CpuArch::X86, 5, 1000);
    let mut controller = start(&mut cluster, config(1, 1, 2));
    assert_eq!(controller.tiers().machines(CpuArch::X86, Tier::Standby), vec![1, 2]);
    assert_eq!(controller.tiers().machines(CpuArch::X86, Tier::Off), vec![3, 4]);

    let mut place = |cluster: &mut InMemoryCluster| {
        let task = cluster.submit_task(CpuArch::X86, VmType::Linux, 800, SlaClass::Sla1, 100.);
        (task, controller.on_new_task(cluster, 1., task))
    };

    let (_, outcome) = place(&mut cluster);
    assert!(matches!(
        outcome,
        PlacementOutcome::Placed {
            vm: 0,
            tier: PlacementTier::BestFit,
            ..
        }
    ));

    let (_, outcome) = place(&mut cluster);
    assert!(matches!(
        outcome,
        PlacementOutcome::Placed {
            vm: 1,
            tier: PlacementTier::Expansion,
            ..
        }
    ));
    cluster.take_commands();

    let (task, outcome) = place(&mut cluster);
    assert!(matches!(
        outcome,
        PlacementOutcome::Placed {
            vm: 2,
            tier: PlacementTier::Expansion,
            ..
        }
    ));
    assert_eq!(
        cluster.commands(),
        &[
            Command::SetMachineState {
                machine: 2,
                state: PowerState::S0,
            },
            Command::SetMachineState {
                machine: 3,
                state: PowerState::S1,
            },
            Command::CreateVm {
                vm: 2,
                vm_type: VmType::Linux,
                arch: CpuArch::X86,
            },
            Command::AttachVm { vm: 2, machine: 2 },
            Command::AddTask {
                vm: 2,
                task,
                priority: Priority::Mid,
            },
        ]
    );

    let tiers = controller.tiers();
    assert_eq!(tiers.machines(CpuArch::X86, Tier::Running), vec![0, 1, 2]);
    assert_eq!(tiers.machines(CpuArch::X86, Tier::Standby), vec![3]);
    assert_eq!(tiers.machines(CpuArch::X86, Tier::Off), vec![4]);
    assert_eq!(tiers.check_partition(5), Ok(()));
}

#[test]
// The only machine is out of memory and there is nothing to power on.
// The task is forced onto the existing VM with the highest priority.
fn test_emergency_placement() {
    let mut cluster = InMemoryCluster::new();
    add_machines(&mut cluster, CpuArch::X86, 1, 1000);
    let mut controller = start(&mut cluster, config(1, 1, 0));

    let first = cluster.submit_task(CpuArch::X86, VmType::Linux, 800, SlaClass::Sla3, 100.);
    controller.on_new_task(&mut cluster, 1., first);
    let second = cluster.submit_task(CpuArch::X86, VmType::Linux, 800, SlaClass::Sla3, 100.);
    assert_eq!(
        controller.on_new_task(&mut cluster, 1., second),
        PlacementOutcome::Placed {
            vm: 0,
            tier: PlacementTier::Emergency,
            priority: Priority::High,
        }
    );
    assert_eq!(cluster.task_info(second).unwrap().priority, Priority::High);
    assert_eq!(controller.placement().placed_by(PlacementTier::Emergency), 1);
}

#[test]
// There are no RISC-V machines at all: the task stays unplaced and no command is issued.
fn test_unplaced_task() {
    let mut cluster = InMemoryCluster::new();
    add_machines(&mut cluster, CpuArch::X86, 2, 16000);
    let mut controller = start(&mut cluster, ControllerConfig::default());

    let task = cluster.submit_task(CpuArch::Riscv, VmType::Linux, 100, SlaClass::Sla0, 100.);
    assert_eq!(controller.on_new_task(&mut cluster, 1., task), PlacementOutcome::Unplaced);
    assert!(cluster.commands().is_empty());
    assert_eq!(controller.placement().unplaced(), 1);

    // unknown task
    assert_eq!(controller.on_new_task(&mut cluster, 1., 42), PlacementOutcome::Unplaced);
    assert_eq!(controller.placement().unplaced(), 2);
}

#[test]
// VM 1 is the least loaded one but it is migrating, so the next task goes to VM 0.
fn test_migrating_vm_is_not_a_target() {
    let mut cluster = InMemoryCluster::new();
    add_machines(&mut cluster, CpuArch::X86, 2, 16000);
    let mut controller = start(&mut cluster, ControllerConfig::default());

    for _ in 0..3 {
        let task = cluster.submit_task(CpuArch::X86, VmType::Linux, 100, SlaClass::Sla2, 100.);
        controller.on_new_task(&mut cluster, 1., task);
    }
    assert_eq!(cluster.vm_info(0).unwrap().active_tasks.len(), 2);
    assert_eq!(cluster.vm_info(1).unwrap().active_tasks.len(), 1);

    let verdict = controller.on_memory_warning(&mut cluster, 2., 1);
    assert_eq!(
        verdict,
        MigrationVerdict::Started {
            vm: 1,
            source: 1,
            target: 0,
        }
    );

    let task = cluster.submit_task(CpuArch::X86, VmType::Linux, 100, SlaClass::Sla2, 100.);
    assert!(matches!(
        controller.on_new_task(&mut cluster, 3., task),
        PlacementOutcome::Placed { vm: 0, .. }
    ));
}

#[test]
// VM 0 disappeared from the engine without the controller noticing; placement skips it.
fn test_stale_vm_is_skipped() {
    let mut cluster = InMemoryCluster::new();
    add_machines(&mut cluster, CpuArch::X86, 2, 16000);
    let mut controller = start(&mut cluster, ControllerConfig::default());

    let task = cluster.submit_task(CpuArch::X86, VmType::Linux, 100, SlaClass::Sla2, 100.);
    cluster.shutdown_vm(0).unwrap();
    assert!(matches!(
        controller.on_new_task(&mut cluster, 1., task),
        PlacementOutcome::Placed { vm: 1, .. }
    ));
}
