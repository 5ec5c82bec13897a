// Copyright The pvelb Authors
// SPDX-License-Identifier: Apache-2.0

//! File-based loading tests for the configuration model.

use pvelb_config::{Config, Error, Toggle};
use std::io::Write;

const FULL: &str = r#"
proxmox:
  url: { ip: "pve.example.org", port: 8006 }
  auth: { username: "balancer@pve", password: "hunter2" }
parameters:
  deviation: 10
  threshold: 85
  lxc_migration: ON
  migration_timeout: 600
  only_on_master: ON
  test_mode: OFF
exclusions:
  vms: ["7000-7002"]
  nodes: [quarantine]
groups:
  blue: [node1, node2]
  green: [node3, node4]
balancing:
  weight_ram: 1.5
  weight_cpu: 0.5
  memory_oom_threshold: 90
  cpu_threshold: 95
mail:
  sending: ON
  message_subject: "pvelb alert"
  from: balancer@example.org
  to: ops@example.org
  login: balancer
  password: hunter2
  server: { address: smtp.example.org, port: 587 }
  ssl_tls: ON
logging_level: DEBUG
"#;

#[test]
fn full_config_loads_from_file() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(FULL.as_bytes()).expect("write config");

    let config = Config::from_yaml_file(file.path()).expect("full config must load");
    assert_eq!(config.proxmox.url.base_url(), "https://pve.example.org:8006");
    assert_eq!(config.parameters.lxc_migration, Toggle::On);
    assert_eq!(config.parameters.migration_timeout, 600);
    assert_eq!(config.logging_level, "DEBUG");
    assert_eq!(config.group_of("node4"), Some("green"));
    assert_eq!(
        config
            .exclusions
            .guest_ids()
            .expect("exclusions must expand")
            .len(),
        3
    );
    assert_eq!(config.mail.server.port, 587);
}

#[test]
fn missing_file_reports_path() {
    let err = Config::from_yaml_file("/nonexistent/pvelb.yaml").expect_err("must fail");
    match err {
        Error::FileReadError { path, .. } => assert!(path.contains("pvelb.yaml")),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn syntax_error_is_a_deserialization_error() {
    let err = Config::from_yaml("proxmox: [").expect_err("must fail");
    assert!(matches!(err, Error::DeserializationError { .. }));
}
