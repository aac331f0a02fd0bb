//! Loading settings from files and building connectors from them.

use std::fs;
use std::sync::Arc;

use connector_runtime::config::{WhenExhausted, load_config, load_settings};
use connector_runtime::transport::{MemoryBroker, MemoryTransport};
use connector_runtime::{Connector, ConnectorError, RuntimeContext};
use tempfile::TempDir;

const ORDERS: &str = r#"
[runtime]
shutdown_timeout_ms = 250

[connector]
name = "orders"
protocol = "memory"
supported_protocols = ["memory:async"]

[connector.dispatcher_threading]
max_threads_active = 4
pool_exhausted_action = "wait"

[connector.retry]
count = 3
frequency_ms = 10

[receiver]
address = "orders"
frequency_ms = 50
transacted = true
"#;

#[test]
fn settings_load_from_an_explicit_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("orders.toml");
    fs::write(&path, ORDERS).unwrap();

    let settings = load_settings(Some(&path)).unwrap();

    assert_eq!(settings.runtime.shutdown_timeout_ms, 250);
    assert_eq!(settings.connector.name, "orders");
    assert_eq!(settings.connector.dispatcher_threading.max_threads_active, 4);
    assert_eq!(
        settings.connector.dispatcher_threading.pool_exhausted_action,
        WhenExhausted::Wait
    );
    assert_eq!(settings.connector.retry.as_ref().map(|r| r.count), Some(3));
    assert_eq!(settings.receiver.address, "orders");
    assert!(settings.receiver.transacted);
    // Untouched sections keep their defaults
    assert_eq!(settings.connector.requester_threading.max_threads_active, 16);
}

#[test]
fn invalid_file_errors_name_the_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.toml");
    fs::write(&path, "[receiver]\nfrequency_ms = 0\n").unwrap();

    let err = load_config(&path).unwrap_err();

    assert!(matches!(err, ConnectorError::Config { .. }), "got {err:?}");
    assert!(err.to_string().contains("broken.toml"));
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = TempDir::new().unwrap();

    let err = load_config(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, ConnectorError::Io(_)), "got {err:?}");
}

#[tokio::test]
async fn loaded_settings_configure_a_connector() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("orders.toml");
    fs::write(&path, ORDERS).unwrap();
    let settings = load_config(&path).unwrap();

    let runtime = Arc::new(RuntimeContext::new(&settings.runtime).unwrap());
    let connector = Connector::new(
        settings.connector.clone(),
        Arc::new(MemoryTransport::new(MemoryBroker::new())),
        runtime,
    )
    .unwrap();
    connector.initialise().await.unwrap();

    assert!(connector.supports_protocol("memory:async"));
    assert_eq!(connector.max_dispatchers_active().unwrap(), 4);
    assert_eq!(connector.retry_policy().config().count, 3);
    assert_eq!(
        connector.runtime().shutdown_timeout().as_duration().as_millis(),
        250
    );
    connector.dispose().await.unwrap();
}
