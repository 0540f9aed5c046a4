//! Configuration system tests
//!
//! Tests configuration loading, validation, and environment overrides

mod common;

use assert_cmd::Command;
use predicates::prelude::*;

use common::{invalid_config_fixture, valid_config_fixture, ConfigFixture};
use dmq_node::config::NodeConfig;
use dmq_node::{Error, ErrorCode};

fn node_cmd(fixture: &ConfigFixture) -> Command {
    let mut cmd = Command::cargo_bin("dmq-node").unwrap();
    cmd.current_dir(fixture.dir().path());
    cmd
}

#[test]
fn test_fixtures_exist() {
    assert!(valid_config_fixture().exists(), "Valid config fixture should exist");
    assert!(invalid_config_fixture().exists(), "Invalid config fixture should exist");
}

// ─────────────────────────────────────────────────────────────────
// Valid Configuration Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_minimal_config() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[node]
server_address = "sip:10.0.0.1:5060"
"#,
    );

    let config = NodeConfig::load(Some(fixture.path())).unwrap();
    assert_eq!(config.server_address(), "sip:10.0.0.1:5060");
    assert_eq!(config.dmq.num_workers, 2);
    assert_eq!(config.dmq.hop_limit, 1);
    assert!(config.node.bootstrap_addresses.is_empty());
}

#[test]
fn test_full_config_fixture() {
    let path = valid_config_fixture();
    let config = NodeConfig::load(path.to_str()).unwrap();

    assert_eq!(config.node.bootstrap_addresses.len(), 2);
    assert_eq!(config.dmq.num_workers, 4);
    assert_eq!(config.transport.max_message_size, 32768);
    assert!(config.logging.json_format);

    let dmq = config.dmq_config();
    assert_eq!(dmq.server_address, "sip:10.0.0.1:5060");
    assert_eq!(dmq.num_workers, 4);
    assert_eq!(dmq.hop_limit, 3);
    assert_eq!(dmq.ping_interval.as_millis(), 15000);
    assert_eq!(dmq.stale_timeout.map(|t| t.as_millis()), Some(45000));
    assert_eq!(dmq.bootstrap, vec!["sip:10.0.0.2:5060", "sips:dmq.example.com"]);

    let tcp = config.tcp_config();
    assert_eq!(tcp.connect_timeout.as_millis(), 2000);
    assert_eq!(tcp.response_timeout.as_millis(), 10000);
    assert_eq!(tcp.max_frame, 32768);
}

#[test]
fn test_stale_timeout_zero_disables_eviction() {
    let fixture = ConfigFixture::new();
    fixture.write_config("[dmq]\nstale_timeout_ms = 0\n");

    let config = NodeConfig::load(Some(fixture.path())).unwrap();
    assert!(config.dmq_config().stale_timeout.is_none());
}

#[test]
fn test_validate_full_config_via_cli() {
    let fixture = ConfigFixture::new();
    node_cmd(&fixture)
        .args(["config", "validate", "--config"])
        .arg(valid_config_fixture())
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid"));
}

// ─────────────────────────────────────────────────────────────────
// Invalid Configuration Tests
// ─────────────────────────────────────────────────────────────────

fn validation_field(err: Error) -> Option<String> {
    match err {
        Error::ConfigValidation { field, .. } => field,
        other => panic!("expected a validation error, got {:?}", other),
    }
}

#[test]
fn test_invalid_fixture_rejected() {
    let path = invalid_config_fixture();
    let err = NodeConfig::load(path.to_str()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::ConfigValidation);
    assert_eq!(validation_field(err).as_deref(), Some("node.bootstrap_addresses"));
}

#[test]
fn test_invalid_hop_limit() {
    let fixture = ConfigFixture::new();
    fixture.write_config("[dmq]\nhop_limit = 17\n");

    let err = NodeConfig::load(Some(fixture.path())).unwrap_err();
    assert_eq!(validation_field(err).as_deref(), Some("dmq.hop_limit"));
}

#[test]
fn test_ping_interval_too_short() {
    let fixture = ConfigFixture::new();
    fixture.write_config("[dmq]\nping_interval_ms = 10\n");

    let err = NodeConfig::load(Some(fixture.path())).unwrap_err();
    assert_eq!(validation_field(err).as_deref(), Some("dmq.ping_interval_ms"));
}

#[test]
fn test_invalid_server_address() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[node]
server_address = "http://10.0.0.1"
"#,
    );

    node_cmd(&fixture)
        .args(["config", "validate", "--config", fixture.path()])
        .assert()
        .failure()
        .code(10)
        .stderr(predicate::str::contains("E102"))
        .stderr(predicate::str::contains("http://10.0.0.1"));
}

#[test]
fn test_invalid_listen_addr() {
    let fixture = ConfigFixture::new();
    fixture.write_config("[transport]\nlisten_addr = \"not an address\"\n");

    let err = NodeConfig::load(Some(fixture.path())).unwrap_err();
    assert_eq!(validation_field(err).as_deref(), Some("transport.listen_addr"));
}

#[test]
fn test_invalid_log_level() {
    let fixture = ConfigFixture::new();
    fixture.write_config("[logging]\nlevel = \"invalid_level\"\n");

    node_cmd(&fixture)
        .args(["config", "validate", "--config", fixture.path()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid_level"));
}

#[test]
fn test_malformed_toml() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[dmq
hop_limit = 2
"#,
    );

    let err = NodeConfig::load(Some(fixture.path())).unwrap_err();
    assert_eq!(err.code(), ErrorCode::ConfigParseError);

    node_cmd(&fixture)
        .args(["config", "validate", "--config", fixture.path()])
        .assert()
        .failure()
        .code(10)
        .stderr(predicate::str::contains("E101"));
}

// ─────────────────────────────────────────────────────────────────
// Config Show Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_config_show_custom() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[node]
server_address = "sip:custom.example.com:5080"

[dmq]
num_workers = 7
"#,
    );

    node_cmd(&fixture)
        .args(["config", "show", "--config", fixture.path()])
        .assert()
        .success()
        .stdout(predicate::str::contains("sip:custom.example.com:5080"))
        .stdout(predicate::str::contains("num_workers = 7"));
}

// ─────────────────────────────────────────────────────────────────
// Config Init Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_config_init_output_is_valid() {
    let fixture = ConfigFixture::new();
    let path = fixture.dir().path().join("generated.toml");

    node_cmd(&fixture)
        .args(["config", "init", "--path", path.to_str().unwrap()])
        .assert()
        .success();

    let config = NodeConfig::load(path.to_str()).unwrap();
    assert_eq!(config.dmq.ping_interval_ms, 60_000);
    assert_eq!(config.transport.listen_addr, "0.0.0.0:5060");
}

#[test]
fn test_config_init_force_overwrite() {
    let fixture = ConfigFixture::new();
    fixture.write_config("[dmq]\nnum_workers = 99\n");

    node_cmd(&fixture)
        .args(["config", "init", "--force", "--path", fixture.path()])
        .assert()
        .success();

    let content = std::fs::read_to_string(fixture.path()).unwrap();
    assert!(!content.contains("num_workers = 99"));
}

// ─────────────────────────────────────────────────────────────────
// Environment Variable Override Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_env_override_server_address() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[node]
server_address = "sip:file.example.com"
"#,
    );

    node_cmd(&fixture)
        .args(["config", "show", "--config", fixture.path()])
        .env("DMQ_SERVER_ADDRESS", "sip:env.example.com")
        .assert()
        .success()
        .stdout(predicate::str::contains("sip:env.example.com"))
        .stdout(predicate::str::contains("file.example.com").not());
}

#[test]
fn test_env_override_is_validated() {
    let fixture = ConfigFixture::new();

    node_cmd(&fixture)
        .args(["config", "validate"])
        .env("DMQ_HOP_LIMIT", "64")
        .assert()
        .failure()
        .stderr(predicate::str::contains("hop_limit"));
}

#[test]
fn test_env_override_workers_and_timeouts() {
    let fixture = ConfigFixture::new();

    node_cmd(&fixture)
        .args(["config", "show"])
        .env("DMQ_NUM_WORKERS", "6")
        .env("DMQ_CONNECT_TIMEOUT_MS", "1234")
        .env("DMQ_MAX_MESSAGE_SIZE", "8192")
        .assert()
        .success()
        .stdout(predicate::str::contains("num_workers = 6"))
        .stdout(predicate::str::contains("connect_timeout_ms = 1234"))
        .stdout(predicate::str::contains("max_message_size = 8192"));
}

// ─────────────────────────────────────────────────────────────────
// Path Expansion Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_tilde_expansion_in_log_file() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[logging]
file = "~/dmq/node.log"
"#,
    );

    let config = NodeConfig::load(Some(fixture.path())).unwrap();
    let file = config.logging.file.unwrap();
    assert!(!file.starts_with('~'));
    assert!(file.ends_with("dmq/node.log"));
}
