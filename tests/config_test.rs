//! Tests for configuration loading and validation

use std::collections::HashMap;

use dodo_scheduler::builders::build_broker;
use dodo_scheduler::config::{BrokerConfig, ConfigError, WorkerConfig};
use dodo_scheduler::core::{FixedGroupResolver, GROUP_ANY, TASKTYPE_ANY};

fn props(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

#[test]
fn test_worker_config_from_properties() {
    let cfg = WorkerConfig::from_properties(&props(&[
        ("workerId", "worker-7"),
        ("maxThreads", "4"),
        ("maxThreadsByTaskType", "report:2, any:1"),
        ("groups", "972,0"),
        ("excludedGroups", "5"),
        ("resourcesLimits", "db:3"),
    ]))
    .unwrap();

    assert_eq!(cfg.worker_id, "worker-7");
    assert_eq!(cfg.max_threads, 4);
    assert_eq!(cfg.max_threads_by_task_type["report"], 2);
    assert_eq!(cfg.max_threads_by_task_type[TASKTYPE_ANY], 1);
    assert_eq!(cfg.groups, vec![972, GROUP_ANY]);
    assert!(cfg.excluded_groups.contains(&5));

    let capacity = cfg.capacity();
    assert_eq!(capacity.max_threads, 4);
    assert_eq!(capacity.resource_limits["db"], 3);
    assert_eq!(capacity.groups, cfg.groups);
}

#[test]
fn test_worker_config_requires_worker_id() {
    let err = WorkerConfig::from_properties(&props(&[("maxThreads", "4")])).unwrap_err();
    assert!(matches!(err, ConfigError::Missing("workerId")));
}

#[test]
fn test_worker_config_rejects_bad_values() {
    let err = WorkerConfig::from_properties(&props(&[("workerId", "w"), ("maxThreads", "lots")]))
        .unwrap_err();
    assert!(err.to_string().contains("maxThreads"));

    let err = WorkerConfig::from_properties(&props(&[("workerId", "w"), ("maxThreads", "0")]))
        .unwrap_err();
    assert!(matches!(err, ConfigError::Validation(_)));
}

#[test]
fn test_worker_config_from_json() {
    let cfg = WorkerConfig::from_json_str(r#"{"worker_id": "w1", "groups": [3, 0]}"#).unwrap();
    assert_eq!(cfg.groups, vec![3, GROUP_ANY]);
    assert_eq!(cfg.max_threads, WorkerConfig::default().max_threads);

    assert!(matches!(
        WorkerConfig::from_json_str("{not json"),
        Err(ConfigError::Parse(_))
    ));
    assert!(matches!(
        WorkerConfig::from_json_str(r#"{"worker_id": "w1", "groups": []}"#),
        Err(ConfigError::Validation(_))
    ));
}

#[test]
fn test_broker_config_defaults_and_overrides() {
    let cfg = BrokerConfig::default();
    assert!(cfg.validate().is_ok());
    assert_eq!(cfg.max_fragmentation, 10_000);

    let cfg = BrokerConfig::from_properties(&props(&[
        ("maxFragmentation", "50"),
        ("globalResourceLimits", "db:10,ftp:2"),
    ]))
    .unwrap();
    assert_eq!(cfg.max_fragmentation, 50);
    assert_eq!(cfg.global_resource_limits["ftp"], 2);

    let broker = build_broker(cfg, FixedGroupResolver(1)).unwrap();
    assert_eq!(broker.heap().max_fragmentation(), 50);
}

#[test]
fn test_broker_config_validation() {
    let cfg = BrokerConfig {
        max_fragmentation: 0,
        ..BrokerConfig::default()
    };
    assert!(cfg.validate().is_err());
    assert!(build_broker(cfg, FixedGroupResolver(1)).is_err());

    let cfg = BrokerConfig::from_json_str(r#"{"shared_secret": ""}"#);
    assert!(matches!(cfg, Err(ConfigError::Validation(_))));
}
