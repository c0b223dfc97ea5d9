//! Configuration loading and validation tests
//!
//! Tests focus on BEHAVIOR of configuration loading, validation, and error handling.
//! We test observable outcomes, not implementation details of TOML parsing.

use brokerlink::config::{ConfigError, LinkConfig};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    write!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let temp_file = write_config(
        r#"
[mqtt]
host = "mqtts://broker.example.com:8883"
client_id = "plant-gateway"
keep_alive_secs = 30
ping_interval_secs = 5
publish_retry_interval_secs = 2.5
subscription_batch_delay_secs = 0.5
"#,
    );

    let config = LinkConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.mqtt.host, "mqtts://broker.example.com:8883");
    assert_eq!(config.mqtt.client_id, "plant-gateway");
    assert_eq!(config.mqtt.keep_alive(), Duration::from_secs(30));
    assert_eq!(config.mqtt.ping_interval(), Duration::from_secs(5));
    assert_eq!(config.mqtt.publish_retry_interval(), Duration::from_millis(2500));
    assert_eq!(config.mqtt.subscription_batch_delay(), Duration::from_millis(500));
    assert_eq!(config.mqtt.operation_timeout(), Duration::from_secs(150));

    let options = config.mqtt.connect_options().unwrap();
    assert_eq!(options.host, "broker.example.com");
    assert_eq!(options.port, 8883);
    assert!(options.use_tls);
}

#[test]
fn test_missing_fields_use_defaults() {
    let temp_file = write_config("[mqtt]\nhost = \"localhost\"\n");

    let config = LinkConfig::load_from_file(temp_file.path()).unwrap();

    assert!(config.mqtt.client_id.starts_with("brokerlink-"));
    assert_eq!(config.mqtt.keep_alive(), Duration::from_secs(60));
    assert_eq!(config.mqtt.ping_interval(), Duration::from_secs(10));
    assert_eq!(config.mqtt.publish_retry_interval(), Duration::from_secs(12));
    assert_eq!(config.mqtt.subscription_batch_delay(), Duration::from_secs(1));
    assert_eq!(config.mqtt.handler_timeout(), Duration::from_secs(1800));
    assert!(!config.mqtt.disable_connection);
    assert!(config.mqtt.credentials.is_none());
}

#[test]
fn test_empty_file_gives_default_config() {
    let temp_file = write_config("");
    let config = LinkConfig::load_from_file(temp_file.path()).unwrap();
    assert_eq!(config.mqtt.host, "localhost");
}

#[test]
fn test_missing_file_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let result = LinkConfig::load_from_file(&dir.path().join("absent.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_malformed_toml_is_reported() {
    let temp_file = write_config("[mqtt\nhost = ");
    let result = LinkConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_invalid_values_fail_validation() {
    let temp_file = write_config("[mqtt]\nping_interval_secs = -1\n");
    let result = LinkConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));

    let temp_file = write_config("[mqtt]\nhost = \"http://broker:1883\"\n");
    let result = LinkConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidHost(_))));
}

#[test]
fn test_credentials_prefer_environment() {
    std::env::set_var("BROKERLINK_TEST_USER", "env-user");
    let temp_file = write_config(
        r#"
[mqtt]
host = "localhost"

[mqtt.credentials]
user = "file-user"
pass = "file-pass"
user_env = "BROKERLINK_TEST_USER"
pass_env = "BROKERLINK_TEST_PASS_UNSET"
"#,
    );

    let config = LinkConfig::load_from_file(temp_file.path()).unwrap();
    let credentials = config.mqtt.resolved_credentials().unwrap();
    assert_eq!(credentials.user, "env-user");
    assert_eq!(credentials.pass, "file-pass");

    let rendered = format!("{:?}", config.mqtt);
    assert!(!rendered.contains("file-pass"));
    std::env::remove_var("BROKERLINK_TEST_USER");
}

#[test]
fn test_config_round_trips_through_toml() {
    let temp_file = write_config("[mqtt]\nhost = \"broker:1884\"\nclient_id = \"rt\"\n");
    let config = LinkConfig::load_from_file(temp_file.path()).unwrap();

    let rendered = config.to_toml_string().unwrap();
    let reparsed = LinkConfig::from_toml_str(&rendered).unwrap();
    assert_eq!(reparsed, config);
}
