//! Configuration tests

use std::time::Duration;

use super::*;

#[test]
fn defaults_are_sane() {
    let config = Config::default();
    assert_eq!(config.server.bind.port(), 1883);
    assert_eq!(config.limits.connect_timeout, Duration::from_secs(10));
    assert_eq!(config.mqtt.max_qos, 2);
    assert!(config.mqtt.retain_available);
    assert!(config.validate().is_ok());
}

#[test]
fn parses_partial_toml() {
    let config = Config::from_toml(
        r#"
        [server]
        bind = "127.0.0.1:2883"

        [limits]
        connect_timeout = "3s"

        [mqtt]
        max_qos = 1
        "#,
    )
    .unwrap();

    assert_eq!(config.server.bind.port(), 2883);
    assert_eq!(config.limits.connect_timeout, Duration::from_secs(3));
    assert_eq!(config.mqtt.max_qos, 1);
    // untouched sections keep defaults
    assert_eq!(config.session.max_inflight, 32);
}

#[test]
fn rejects_invalid_max_qos() {
    let result = Config::from_toml(
        r#"
        [mqtt]
        max_qos = 3
        "#,
    );
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn substitutes_env_vars_with_defaults() {
    let config = Config::from_toml(
        r#"
        [server]
        ws_path = "${RELAYMQ_TEST_UNSET_VAR:-/ws}"
        "#,
    )
    .unwrap();
    assert_eq!(config.server.ws_path, "/ws");
}

#[test]
fn broker_config_mirrors_sections() {
    let config = Config::from_toml(
        r#"
        [session]
        max_pending = 10
        max_inflight = 4
        "#,
    )
    .unwrap();

    let broker = config.broker_config();
    assert_eq!(broker.max_pending, 10);
    assert_eq!(broker.max_inflight, 4);
    assert_eq!(broker.max_qos, crate::protocol::QoS::ExactlyOnce);
}
