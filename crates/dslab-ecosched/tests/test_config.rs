use dslab_ecosched::cluster::ResourceQuery;
use dslab_ecosched::common::{CpuArch, VmType};
use dslab_ecosched::config::{ConsolidationMode, ControllerConfig};
use dslab_ecosched::error::ConfigError;
use dslab_ecosched::model::{ClusterConfig, InMemoryCluster};

fn name_wrapper(file_name: &str) -> String {
    format!("test-configs/{}", file_name)
}

#[test]
// Values present in the file override the defaults, everything else keeps the default value.
fn test_controller_config_from_file() {
    let config = ControllerConfig::from_file(&name_wrapper("controller.yaml")).unwrap();
    assert_eq!(config.max_running, 6);
    assert_eq!(config.min_running, 3);
    assert_eq!(config.standby_size, 4);
    assert_eq!(config.overload_threshold, 0.8);
    assert_eq!(config.underload_threshold, 0.1);
    assert_eq!(config.consolidation_threshold, 0.3);
    assert_eq!(config.consolidation, ConsolidationMode::OnTaskComplete);
    assert!(config.rebalance);
    assert_eq!(config.performance_bands, [0.7, 0.4, 0.2]);

    assert_eq!(config.image_for(CpuArch::X86), VmType::Win);
    assert_eq!(config.image_for(CpuArch::Power), VmType::Aix);
    assert_eq!(config.image_for(CpuArch::Arm), VmType::Linux);
}

#[test]
// Default config holds the reference thresholds.
fn test_default_config() {
    let config = ControllerConfig::default();
    assert_eq!(config, ControllerConfig::from_yaml("{}").unwrap());
    assert_eq!((config.max_running, config.min_running, config.standby_size), (12, 8, 4));
    assert_eq!(config.overload_threshold, 0.7);
    assert_eq!(config.consolidation, ConsolidationMode::Periodic);
    assert!(config.validate().is_ok());
}

#[test]
// Inconsistent thresholds and bands are rejected with the name of the offending parameter.
fn test_invalid_config() {
    match ControllerConfig::from_file(&name_wrapper("invalid_thresholds.yaml")) {
        Err(ConfigError::InvalidValue { name, .. }) => assert_eq!(name, "underload_threshold"),
        other => panic!("unexpected result: {:?}", other),
    }
    match ControllerConfig::from_file(&name_wrapper("invalid_bands.yaml")) {
        Err(ConfigError::InvalidValue { name, .. }) => assert_eq!(name, "performance_bands"),
        other => panic!("unexpected result: {:?}", other),
    }
    match ControllerConfig::from_yaml("sla_rescue_ratio: 1.5") {
        Err(ConfigError::InvalidValue { name, .. }) => assert_eq!(name, "sla_rescue_ratio"),
        other => panic!("unexpected result: {:?}", other),
    }
    assert!(matches!(
        ControllerConfig::from_yaml("consolidation: sometimes"),
        Err(ConfigError::Parse(_))
    ));
    assert!(matches!(
        ControllerConfig::from_file(&name_wrapper("missing.yaml")),
        Err(ConfigError::Io { .. })
    ));
}

#[test]
// The cluster file also holds controller parameters; both configs are read from it.
// Three x86 hosts are expanded from the prefix, followed by one named POWER host.
fn test_cluster_config() {
    let path = name_wrapper("cluster.yaml");
    let cluster_config = ClusterConfig::from_file(&path).unwrap();
    assert_eq!(cluster_config.machine_count(), 4);
    assert_eq!(cluster_config.migration_duration, 3.);
    assert_eq!(cluster_config.state_change_duration, 2.);
    assert_eq!(cluster_config.hosts[0].names(), vec!["x86-1", "x86-2", "x86-3"]);

    let controller_config = ControllerConfig::from_file(&path).unwrap();
    assert_eq!(controller_config.min_running, 2);

    let cluster = InMemoryCluster::from_config(&cluster_config);
    assert_eq!(cluster.machine_count(), 4);
    assert_eq!(cluster.machine_name(2), Some("x86-3"));
    assert_eq!(cluster.machine_name(3), Some("power-big"));
    let big = cluster.machine_info(3).unwrap();
    assert_eq!(big.arch, CpuArch::Power);
    assert_eq!(big.num_cores, 16);
    assert_eq!(big.memory_capacity, 64000);
}
