use super::{Settings, load_config, load_config_from};
use crate::mux::BackoffSequence;
use serial_test::serial;
use std::fs;
use std::time::Duration;
use tempfile::tempdir;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.server.host, "0.0.0.0");
    assert_eq!(settings.server.http_port, 7777);
    assert_eq!(settings.server.ws_port, 7778);
    assert_eq!(settings.broker.url, "ws://127.0.0.1:8080");
    assert_eq!(settings.broker.max_retries, 20);
    assert_eq!(settings.broker.backoff, BackoffSequence::Fibonacci);
    assert_eq!(settings.gateway.mailbox_capacity, 64);
    assert_eq!(settings.gateway.log_level, "info");
}

#[test]
fn test_retry_policy_from_settings() {
    let mut settings = Settings::default();
    settings.broker.backoff = BackoffSequence::Exponential;
    settings.broker.base_interval_ms = 100;
    settings.broker.max_interval_ms = 1_000;

    let policy = settings.retry_policy();
    assert_eq!(policy.base_interval, Duration::from_millis(100));
    assert_eq!(policy.delay(5), Duration::from_secs(1));
    assert_eq!(policy.attempt_timeout, Duration::from_secs(5));

    let mux = settings.mux_settings();
    assert_eq!(mux.address, "ws://127.0.0.1:8080");
    assert_eq!(mux.retry, policy);
    assert_eq!(settings.http_addr(), "0.0.0.0:7777");
    assert_eq!(settings.ws_addr(), "0.0.0.0:7778");
}

#[test]
#[serial]
fn test_missing_file_yields_defaults() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("absent");
    let settings = temp_env::with_vars_unset(
        ["GATEWAY__BROKER__URL", "GATEWAY__SERVER__HTTP_PORT"],
        || load_config_from(path.to_str().unwrap()).unwrap(),
    );
    assert_eq!(settings, Settings::default());
}

#[test]
#[serial]
fn test_partial_file_merges_over_defaults() {
    let dir = tempdir().unwrap();
    let config_dir = dir.path().join("config");
    fs::create_dir(&config_dir).unwrap();
    fs::write(
        config_dir.join("default.toml"),
        r#"
[server]
http_port = 9000

[broker]
url = "ws://broker.local:8080"
backoff = "exponential"
token = "s3cret"
"#,
    )
    .unwrap();

    let previous = std::env::current_dir().unwrap();
    std::env::set_current_dir(dir.path()).unwrap();
    let result = load_config();
    std::env::set_current_dir(previous).unwrap();

    let settings = result.unwrap();
    assert_eq!(settings.server.http_port, 9000);
    assert_eq!(settings.server.ws_port, 7778);
    assert_eq!(settings.broker.url, "ws://broker.local:8080");
    assert_eq!(settings.broker.backoff, BackoffSequence::Exponential);
    assert_eq!(settings.broker.token.as_deref(), Some("s3cret"));
    assert_eq!(settings.broker.max_retries, 20);
}

#[test]
#[serial]
fn test_environment_overrides() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("absent");
    let settings = temp_env::with_vars(
        [
            ("GATEWAY__BROKER__URL", Some("ws://10.0.0.5:8080")),
            ("GATEWAY__BROKER__MAX_RETRIES", Some("3")),
            ("GATEWAY__GATEWAY__MAILBOX_CAPACITY", Some("8")),
            ("GATEWAY__SERVER__WS_PORT", Some("9001")),
        ],
        || load_config_from(path.to_str().unwrap()).unwrap(),
    );
    assert_eq!(settings.broker.url, "ws://10.0.0.5:8080");
    assert_eq!(settings.broker.max_retries, 3);
    assert_eq!(settings.gateway.mailbox_capacity, 8);
    assert_eq!(settings.server.ws_port, 9001);
    assert_eq!(settings.server.http_port, 7777);
}
