//! Configuration parsing, defaults and validation.

use std::time::Duration;

use companion_bridge::config::{BridgeConfig, TimeoutOutcome};
use companion_bridge::AppError;

fn sample_toml(workspace: &str) -> String {
    format!(
        r#"
bind_address = "0.0.0.0"
http_port = 4100
default_working_directory = '{workspace}'

[backend]
host_cli = "claude"
host_cli_args = ["-p", "--output-format", "stream-json"]
probe_timeout_seconds = 5

[timeouts]
permission_seconds = 120
prompt_seconds = 0

[stream]
buffer_capacity = 32
channel_capacity = 16

[sessions]
idle_timeout_seconds = 600
eviction_interval_seconds = 30
retired_capacity = 10

[permissions]
timeout_outcome = "abort"
decline_closes_session = false

[auth]
required = false
"#
    )
}

const MINIMAL_TOML: &str = r#"
[backend]
host_cli = "claude"
"#;

#[test]
fn parses_valid_config() {
    let temp = tempfile::tempdir().expect("tempdir");
    let toml = sample_toml(temp.path().to_str().expect("utf8 path"));

    let config = BridgeConfig::from_toml_str(&toml).expect("config parses");

    assert_eq!(config.bind_address, "0.0.0.0");
    assert_eq!(config.http_port, 4100);
    assert_eq!(config.backend.host_cli_args.len(), 3);
    assert_eq!(config.stream.buffer_capacity, 32);
    assert_eq!(config.sessions.retired_capacity, 10);
    assert_eq!(config.permissions.timeout_outcome, TimeoutOutcome::Abort);
    assert!(!config.permissions.decline_closes_session);
    assert!(!config.auth.required);
    assert_eq!(
        config.default_working_directory,
        Some(temp.path().canonicalize().expect("canonical"))
    );
}

#[test]
fn minimal_config_uses_defaults() {
    let config = BridgeConfig::from_toml_str(MINIMAL_TOML).expect("config parses");

    assert_eq!(config.bind_address, "127.0.0.1");
    assert_eq!(config.http_port, 3000);
    assert_eq!(config.backend.version_args, vec!["--version".to_owned()]);
    assert_eq!(config.permission_timeout(), Duration::from_secs(300));
    assert_eq!(config.prompt_timeout(), Some(Duration::from_secs(1800)));
    assert_eq!(config.idle_timeout(), Some(Duration::from_secs(3600)));
    assert_eq!(config.permissions.timeout_outcome, TimeoutOutcome::Deny);
    assert!(config.permissions.decline_closes_session);
    assert!(config.auth.required);
    assert!(config.auth.token.is_none());
}

#[test]
fn zero_prompt_timeout_means_unlimited() {
    let temp = tempfile::tempdir().expect("tempdir");
    let toml = sample_toml(temp.path().to_str().expect("utf8 path"));
    let config = BridgeConfig::from_toml_str(&toml).expect("config parses");
    assert_eq!(config.prompt_timeout(), None);
}

#[test]
fn empty_host_cli_is_rejected() {
    let result = BridgeConfig::from_toml_str("[backend]\nhost_cli = \"  \"\n");
    assert!(matches!(result, Err(AppError::Config(ref msg)) if msg.contains("host_cli")));
}

#[test]
fn zero_permission_timeout_is_rejected() {
    let toml = format!("{MINIMAL_TOML}\n[timeouts]\npermission_seconds = 0\n");
    let result = BridgeConfig::from_toml_str(&toml);
    assert!(matches!(result, Err(AppError::Config(ref msg)) if msg.contains("permission_seconds")));
}

#[test]
fn zero_buffer_capacity_is_rejected() {
    let toml = format!("{MINIMAL_TOML}\n[stream]\nbuffer_capacity = 0\n");
    assert!(matches!(
        BridgeConfig::from_toml_str(&toml),
        Err(AppError::Config(_))
    ));
}

#[test]
fn missing_default_working_directory_is_rejected() {
    let toml = format!("default_working_directory = '/definitely/not/here'\n{MINIMAL_TOML}");
    let result = BridgeConfig::from_toml_str(&toml);
    assert!(
        matches!(result, Err(AppError::Config(ref msg)) if msg.contains("default_working_directory"))
    );
}

#[test]
fn missing_backend_section_is_rejected() {
    let result = BridgeConfig::from_toml_str("http_port = 3000\n");
    assert!(matches!(result, Err(AppError::Config(_))));
}

#[test]
fn unknown_timeout_outcome_is_rejected() {
    let toml = format!("{MINIMAL_TOML}\n[permissions]\ntimeout_outcome = \"maybe\"\n");
    assert!(matches!(
        BridgeConfig::from_toml_str(&toml),
        Err(AppError::Config(_))
    ));
}

#[test]
fn load_from_path_reads_file() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("config.toml");
    std::fs::write(&path, MINIMAL_TOML).expect("write config");
    let config = BridgeConfig::load_from_path(&path).expect("config loads");
    assert_eq!(config.backend.host_cli, "claude");

    let missing = BridgeConfig::load_from_path(temp.path().join("absent.toml"));
    assert!(matches!(missing, Err(AppError::Config(_))));
}
