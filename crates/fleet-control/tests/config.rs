use std::io::Write;
use std::time::Duration;

use fleet_control::config::{ControlConfig, ExpiryPolicy};

#[test]
fn defaults() {
    let conf = ControlConfig::default();
    assert_eq!(8, conf.host_lock.max_per_host);
    assert_eq!(Duration::from_secs(900), conf.host_lock.default_ttl());
    assert_eq!(ExpiryPolicy::Release, conf.host_lock.on_expire);
    assert_eq!(10, conf.node.outbound_buffer);
    assert_eq!(Duration::from_millis(100), conf.node.poll_interval());
    assert_eq!(3, conf.store.default_concurrency);
    assert_eq!(10, conf.store.max_concurrency);
    assert_eq!(Duration::from_secs(300), conf.store.feedback_window());
    assert_eq!(Duration::from_secs(30), conf.dispatch.node_wait());
    assert_eq!(Duration::from_secs(30), conf.registry.watch_interval());
    conf.validate().unwrap();
}

#[test]
fn partial_yaml_keeps_defaults() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "hostLock:\n  maxPerHost: 2\n  onExpire: forget\nstore:\n  defaultConcurrency: 4\n"
    )
    .unwrap();

    let conf = ControlConfig::from_yaml_file(file.path()).unwrap();
    assert_eq!(2, conf.host_lock.max_per_host);
    assert_eq!(ExpiryPolicy::Forget, conf.host_lock.on_expire);
    assert_eq!(900, conf.host_lock.default_ttl_secs);
    assert_eq!(4, conf.store.default_concurrency);
    assert_eq!(10, conf.store.max_concurrency);
    assert_eq!(5000, conf.node.heartbeat_interval_ms);
}

#[test]
fn invalid_yaml_is_rejected() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "store:\n  defaultConcurrency: 12\n  maxConcurrency: 5\n").unwrap();
    assert!(ControlConfig::from_yaml_file(file.path()).is_err());

    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "hostLock:\n  maxPerHost: 0\n").unwrap();
    assert!(ControlConfig::from_yaml_file(file.path()).is_err());
}

#[test]
fn missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = ControlConfig::from_yaml_file(dir.path().join("absent.yaml")).unwrap_err();
    assert!(err.to_string().contains("absent.yaml"));
}
