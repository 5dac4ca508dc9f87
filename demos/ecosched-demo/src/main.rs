mod queue;

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::time::Instant;

use clap::Parser;
use env_logger::Builder;
use rand::prelude::*;
use rand_pcg::Pcg64;

use dslab_ecosched::cluster::ResourceQuery;
use dslab_ecosched::common::{CpuArch, MachineId, SlaClass, TaskId, Time, VmId, VmType};
use dslab_ecosched::config::ControllerConfig;
use dslab_ecosched::controller::Controller;
use dslab_ecosched::events::ControllerEvent;
use dslab_ecosched::log::LogContext;
use dslab_ecosched::model::{ClusterConfig, Command, InMemoryCluster};
use dslab_ecosched::placement::PlacementTier;
use dslab_ecosched::{log_debug, log_info};

use crate::queue::EventQueue;

fn init_logger() {
    Builder::from_default_env()
        .format(|buf, record| writeln!(buf, "{}", record.args()))
        .init();
}

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
/// Runs the controller against a synthetic workload on an in-memory cluster
struct Args {
    /// Path to YAML file with cluster and controller parameters
    #[clap(short, long)]
    config: String,

    /// Number of tasks to submit
    #[clap(short, long, default_value_t = 200)]
    tasks: u32,

    /// Random seed of the workload
    #[clap(short, long, default_value_t = 123)]
    seed: u64,

    /// Interval between periodic checks in seconds
    #[clap(long, default_value_t = 10.)]
    check_interval: f64,
}

enum DemoEvent {
    Arrival,
    Controller(ControllerEvent),
    TaskFinished(TaskId),
    MigrationFinished(VmId),
    StateChangeFinished(MachineId),
    Deadline(TaskId),
}

struct TaskSpec {
    arch: CpuArch,
    vm_type: VmType,
    memory: u64,
    sla: SlaClass,
    duration: Time,
    deadline: Time,
}

/// Random task stream over the architectures present in the cluster.
struct Workload {
    rng: Pcg64,
    archs: Vec<CpuArch>,
    remaining: u32,
}

impl Workload {
    fn new(seed: u64, config: &ClusterConfig, tasks: u32) -> Self {
        let mut archs: Vec<CpuArch> = config.hosts.iter().map(|h| h.arch).collect();
        archs.sort();
        archs.dedup();
        Self {
            rng: Pcg64::seed_from_u64(seed),
            archs,
            remaining: tasks,
        }
    }

    fn next_delay(&mut self) -> Time {
        self.rng.gen_range(0.2..2.)
    }

    fn next_task(&mut self) -> Option<TaskSpec> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let arch = *self.archs.choose(&mut self.rng)?;
        let vm_type = match arch {
            CpuArch::Power => VmType::Aix,
            CpuArch::X86 if self.rng.gen_bool(0.3) => VmType::Win,
            CpuArch::Arm | CpuArch::Riscv if self.rng.gen_bool(0.2) => VmType::LinuxRt,
            _ => VmType::Linux,
        };
        let sla = SlaClass::ALL[self.rng.gen_range(0..SlaClass::ALL.len())];
        let duration = self.rng.gen_range(5.0..60.);
        let slack = match sla {
            SlaClass::Sla0 => 1.2,
            SlaClass::Sla1 => 1.5,
            SlaClass::Sla2 => 2.,
            SlaClass::Sla3 => 3.,
        };
        Some(TaskSpec {
            arch,
            vm_type,
            memory: self.rng.gen_range(256..4096),
            sla,
            duration,
            deadline: duration * slack,
        })
    }
}

struct Simulation {
    ctx: LogContext,
    queue: EventQueue<DemoEvent>,
    cluster: InMemoryCluster,
    controller: Controller,
    workload: Workload,
    cluster_config: ClusterConfig,
    check_interval: f64,
    durations: BTreeMap<TaskId, Time>,
    running: BTreeSet<TaskId>,
}

impl Simulation {
    fn new(args: &Args, cluster_config: ClusterConfig, controller_config: ControllerConfig) -> Self {
        Self {
            ctx: LogContext::new("demo"),
            queue: EventQueue::new(),
            cluster: InMemoryCluster::from_config(&cluster_config),
            controller: Controller::new(controller_config),
            workload: Workload::new(args.seed, &cluster_config, args.tasks),
            cluster_config,
            check_interval: args.check_interval,
            durations: BTreeMap::new(),
            running: BTreeSet::new(),
        }
    }

    fn run(&mut self) -> Time {
        self.queue.push(0., DemoEvent::Controller(ControllerEvent::Init));
        self.queue.push(0., DemoEvent::Arrival);
        self.queue.push(self.check_interval, DemoEvent::Controller(ControllerEvent::PeriodicCheck));

        let mut time = 0.;
        while let Some(event) = self.queue.pop() {
            time = event.time;
            self.ctx.set_time(time);
            self.cluster.advance(time);
            self.handle(time, event.data);
        }
        time
    }

    fn handle(&mut self, time: Time, event: DemoEvent) {
        match event {
            DemoEvent::Arrival => {
                if let Some(spec) = self.workload.next_task() {
                    let task = self
                        .cluster
                        .submit_task(spec.arch, spec.vm_type, spec.memory, spec.sla, spec.deadline);
                    self.durations.insert(task, spec.duration);
                    self.queue.push(time + spec.deadline, DemoEvent::Deadline(task));
                    self.dispatch(time, ControllerEvent::NewTask { task_id: task });
                    let delay = self.workload.next_delay();
                    self.queue.push(time + delay, DemoEvent::Arrival);
                }
            }
            DemoEvent::TaskFinished(task) => {
                if self.cluster.complete_task(task).is_ok() {
                    self.running.remove(&task);
                    self.dispatch(time, ControllerEvent::TaskComplete { task_id: task });
                }
            }
            DemoEvent::MigrationFinished(vm) => {
                if self.cluster.finish_migration(vm).is_ok() {
                    self.dispatch(time, ControllerEvent::MigrationComplete { vm_id: vm });
                }
            }
            DemoEvent::StateChangeFinished(machine) => match self.cluster.finish_state_change(machine) {
                Ok(()) => self.dispatch(time, ControllerEvent::StateChangeComplete { machine_id: machine }),
                Err(e) => log_debug!(self.ctx, "superseded state change of machine {}: {}", machine, e),
            },
            DemoEvent::Deadline(task) => {
                if self.running.contains(&task) {
                    self.dispatch(time, ControllerEvent::SlaWarning { task_id: task });
                }
            }
            DemoEvent::Controller(ControllerEvent::PeriodicCheck) => {
                for machine in self.cluster.memory_overloaded() {
                    self.dispatch(time, ControllerEvent::MemoryWarning { machine_id: machine });
                }
                self.dispatch(time, ControllerEvent::PeriodicCheck);
                if self.workload.remaining > 0 || !self.running.is_empty() {
                    self.queue.push(
                        time + self.check_interval,
                        DemoEvent::Controller(ControllerEvent::PeriodicCheck),
                    );
                } else {
                    self.queue.push(time, DemoEvent::Controller(ControllerEvent::Shutdown));
                }
            }
            DemoEvent::Controller(event) => self.dispatch(time, event),
        }
    }

    /// Delivers the event and schedules completion of the commands it produced.
    fn dispatch(&mut self, time: Time, event: ControllerEvent) {
        self.controller.on(&mut self.cluster, time, event);
        for command in self.cluster.take_commands() {
            match command {
                Command::AddTask { vm, task, .. } => {
                    if let Some(duration) = self.durations.remove(&task) {
                        let finish = time + duration * self.slowdown(vm);
                        self.running.insert(task);
                        self.queue.push(finish, DemoEvent::TaskFinished(task));
                    }
                }
                Command::MigrateVm { vm, .. } => {
                    let finish = time + self.cluster_config.migration_duration;
                    self.queue.push(finish, DemoEvent::MigrationFinished(vm));
                }
                Command::SetMachineState { machine, .. } => {
                    let finish = time + self.cluster_config.state_change_duration;
                    self.queue.push(finish, DemoEvent::StateChangeFinished(machine));
                }
                _ => {}
            }
        }
    }

    /// Tasks run slower on busy machines.
    fn slowdown(&self, vm: VmId) -> f64 {
        let machine = self.cluster.vm_info(vm).ok().and_then(|info| info.machine);
        match machine.and_then(|m| self.cluster.machine_info(m).ok()) {
            Some(info) if info.num_cores > 0 => 1. + info.active_tasks as f64 / info.num_cores as f64,
            _ => 1.,
        }
    }

    fn report(&self) {
        let placement = self.controller.placement();
        for tier in PlacementTier::ALL {
            println!("Placed by {}: {}", tier, placement.placed_by(tier));
        }
        println!("Unplaced: {}", placement.unplaced());
        for class in SlaClass::ALL {
            println!("{} compliance: {:.1}%", class, self.cluster.sla_compliance(class));
        }
        let stats = self.controller.sla_stats();
        println!(
            "SLA warnings: {}, violations: {}, rescues: {}",
            stats.warnings, stats.violations_on_completion, stats.rescues_started
        );
        println!("Energy consumed: {:.3} kWh", self.cluster.cluster_energy());
    }
}

fn main() {
    init_logger();
    let args = Args::parse();
    let cluster_config =
        ClusterConfig::from_file(&args.config).unwrap_or_else(|e| panic!("Can't load cluster config: {}", e));
    let controller_config =
        ControllerConfig::from_file(&args.config).unwrap_or_else(|e| panic!("Can't load controller config: {}", e));

    let t = Instant::now();
    let mut sim = Simulation::new(&args, cluster_config, controller_config);
    let end_time = sim.run();
    log_info!(sim.ctx, "simulation finished with {} tasks", args.tasks);
    println!("Simulated time: {:.2} s", end_time);
    println!("Elapsed time: {:.2}s", t.elapsed().as_secs_f64());
    sim.report();
}
