//! Configuration loading and validation tests
//!
//! Exercise loading from real files, including error paths a deployment hits.

use robot_relay::config::{ConfigError, RelayConfig};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

fn write_config(contents: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    write!(temp_file, "{contents}").unwrap();
    temp_file
}

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let temp_file = write_config(
        r#"
[broker]
host = "10.0.0.5"
port = 1884
client_id = "relay-line-3"

[server]
listen_port = 9000
outbound_queue = 64
default_subscriptions = ["scale/#"]

[reconnect]
base_delay_ms = 500
max_delay_ms = 8000
multiplier = 2.0
max_attempts = 5

[health]
interval_secs = 10
"#,
    );

    let config = RelayConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.broker.host, "10.0.0.5");
    assert_eq!(config.broker.port, 1884);
    assert_eq!(config.broker.client_id, "relay-line-3");
    assert_eq!(config.server.listen_port, 9000);
    assert_eq!(config.server.outbound_queue, 64);
    assert_eq!(config.server.default_subscriptions, vec!["scale/#"]);
    assert_eq!(config.reconnect.multiplier, 2.0);
    assert_eq!(config.reconnect.max_attempts, 5);
    assert_eq!(config.health.interval_secs, 10);
    // Untouched sections keep their defaults
    assert_eq!(config.buffer.capacity, 1000);
    assert_eq!(config.topics.control_prefix, "robot/control");
}

#[test]
fn test_missing_file_reports_read_error() {
    let result = RelayConfig::load_from_file(Path::new("/nonexistent/robot-relay.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_malformed_toml_reports_parse_error() {
    let temp_file = write_config("[broker\nhost = ");
    let result = RelayConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_wrong_field_type_reports_parse_error() {
    let temp_file = write_config("[broker]\nport = \"not a port\"\n");
    let result = RelayConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_invalid_backoff_is_rejected() {
    let temp_file = write_config("[reconnect]\nbase_delay_ms = 5000\nmax_delay_ms = 1000\n");
    let result = RelayConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidConfig(msg)) if msg.contains("max_delay_ms")));

    let temp_file = write_config("[reconnect]\nmultiplier = 0.5\n");
    let result = RelayConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidConfig(msg)) if msg.contains("multiplier")));
}

#[test]
fn test_credentials_resolved_from_environment() {
    std::env::set_var("ROBOT_RELAY_IT_USER", "operator");
    std::env::set_var("ROBOT_RELAY_IT_PASS", "s3cret");
    let temp_file = write_config(
        r#"
[broker]
username_env = "ROBOT_RELAY_IT_USER"
password_env = "ROBOT_RELAY_IT_PASS"
require_credentials = true
"#,
    );

    let config = RelayConfig::load_from_file(temp_file.path()).unwrap();
    let credentials = config.broker.credentials.clone().unwrap();
    assert_eq!(credentials.username, "operator");
    assert_eq!(credentials.password, "s3cret");
    // Never leaks through Debug
    assert!(!format!("{:?}", config.broker).contains("s3cret"));

    std::env::remove_var("ROBOT_RELAY_IT_USER");
    std::env::remove_var("ROBOT_RELAY_IT_PASS");
}

#[test]
fn test_serialized_config_round_trips_without_credentials() {
    std::env::set_var("ROBOT_RELAY_IT_ROUNDTRIP_USER", "viewer");
    let config = RelayConfig::from_toml_str(
        "[broker]\nusername_env = \"ROBOT_RELAY_IT_ROUNDTRIP_USER\"\n",
    )
    .unwrap();
    assert!(config.broker.credentials.is_some());

    let shown = toml::to_string_pretty(&config).unwrap();
    assert!(!shown.contains("viewer"));
    assert!(shown.contains("ROBOT_RELAY_IT_ROUNDTRIP_USER"));

    let reloaded = RelayConfig::from_toml_str(&shown).unwrap();
    assert_eq!(reloaded.limits, config.limits);
    assert_eq!(reloaded.topics, config.topics);
    std::env::remove_var("ROBOT_RELAY_IT_ROUNDTRIP_USER");
}
