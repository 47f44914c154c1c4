//! End-to-end controller service tests
//!
//! Starts a full `ControllerService` over simulated instruments and talks to it the way a
//! remote client would: JSON envelopes in, JSON records out.

use lab_control::config::{ControllerConfig, InstrumentDefinition};
use lab_control::device::sim::{SimDevice, SimResourceManager};
use lab_control::driver::DriverRegistry;
use lab_control::transport::ChannelSink;
use lab_control::{ControllerService, Envelope};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn resources() -> SimResourceManager {
    SimResourceManager::new()
        .with_device("SIM::1", SimDevice::new("PowerSupply-4321"))
        .with_device("SIM::2", SimDevice::new("VNA-1234"))
}

fn config() -> ControllerConfig {
    let mut config = ControllerConfig::default();
    config.executor.shutdown_timeout_ms = 500;
    config.instruments.push(InstrumentDefinition {
        resource: "SIM::1".to_string(),
        station: "bench_A".to_string(),
    });
    config
}

async fn next_record(rx: &mut UnboundedReceiver<String>) -> Value {
    let line = timeout(WAIT, rx.recv())
        .await
        .expect("record within deadline")
        .expect("service still running");
    serde_json::from_str(&line).expect("records are JSON")
}

#[tokio::test]
async fn test_remote_session() {
    let (sink, mut rx) = ChannelSink::new();
    let service = ControllerService::start(
        config(),
        Arc::new(resources()),
        DriverRegistry::builtin(),
        sink,
    )
    .await
    .unwrap();
    let inbound = service.inbound();

    assert_eq!(
        next_record(&mut rx).await,
        json!("controller / create_interface: PowerSupply (4321) [bench_A] @ SIM::1")
    );

    inbound.push(
        json!({"id": "controller", "cmd": "create_interface", "args": ["SIM::2", "bench_B"], "kwargs": {}})
            .to_string(),
    );
    assert_eq!(
        next_record(&mut rx).await,
        json!("controller / create_interface: VNA (1234) [bench_B] @ SIM::2")
    );

    inbound.push(
        json!({"id": "4321", "cmd": "set_voltage", "args": [], "kwargs": {"vdc": 2.5}}).to_string(),
    );
    assert!(inbound
        .push_envelope(&Envelope::new("4321", "get_voltage", vec![], Map::new()))
        .unwrap());
    assert_eq!(
        next_record(&mut rx).await,
        json!("4321 (PowerSupply) / set_voltage: 2.5 V")
    );
    assert_eq!(
        next_record(&mut rx).await,
        json!("4321 (PowerSupply) / get_voltage: 2.50 V")
    );

    inbound.push(json!({"id": "controller", "cmd": "list_instruments", "args": [], "kwargs": {}}).to_string());
    assert_eq!(
        next_record(&mut rx).await,
        json!({
            "1234": {"station": "bench_B", "resource_name": "SIM::2", "type": "VNA"},
            "4321": {"station": "bench_A", "resource_name": "SIM::1", "type": "PowerSupply"},
        })
    );

    inbound.push(json!({"id": "controller", "cmd": "self_destruct", "args": [], "kwargs": {}}).to_string());
    assert_eq!(
        next_record(&mut rx).await,
        json!("Invalid command: controller self_destruct [] {}")
    );

    inbound.push("{not json");
    let malformed = next_record(&mut rx).await;
    assert!(malformed.as_str().unwrap().starts_with("Invalid message"), "{malformed}");

    service.shutdown().await.unwrap();
    assert!(rx.recv().await.is_none(), "pump ends once every producer is gone");
}

#[tokio::test]
async fn test_reader_feeds_router_until_eof() {
    let (sink, mut rx) = ChannelSink::new();
    let mut service = ControllerService::start(
        config(),
        Arc::new(resources()),
        DriverRegistry::builtin(),
        sink,
    )
    .await
    .unwrap();

    let (mut client, server) = tokio::io::duplex(1024);
    service.spawn_reader(BufReader::new(server));

    client
        .write_all(b"{\"id\":\"4321\",\"cmd\":\"idn\",\"args\":[],\"kwargs\":{}}\n\n")
        .await
        .unwrap();
    client
        .write_all(b"{\"id\":\"4321\",\"cmd\":\"list_methods\",\"args\":[],\"kwargs\":{}}\n")
        .await
        .unwrap();
    drop(client);

    assert_eq!(service.wait_for_readers().await.unwrap(), 2);
    assert_eq!(
        next_record(&mut rx).await,
        json!("controller / create_interface: PowerSupply (4321) [bench_A] @ SIM::1")
    );

    // Either may land first: list_methods reports at once, idn waits on queued device I/O.
    let (first, second) = (next_record(&mut rx).await, next_record(&mut rx).await);
    let (methods, idn) = if first.is_object() {
        (first, second)
    } else {
        (second, first)
    };
    assert_eq!(idn, json!("4321 / idn: PowerSupply-4321"));

    let names: Vec<&str> = methods
        .as_object()
        .expect("method listing is an object")
        .keys()
        .map(String::as_str)
        .collect();
    assert!(names.contains(&"set_voltage"));
    assert!(!names.contains(&"write_async"));

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reader_survives_bytes_that_are_not_utf8() {
    let (sink, mut rx) = ChannelSink::new();
    let mut service = ControllerService::start(
        config(),
        Arc::new(resources()),
        DriverRegistry::builtin(),
        sink,
    )
    .await
    .unwrap();
    assert_eq!(
        next_record(&mut rx).await,
        json!("controller / create_interface: PowerSupply (4321) [bench_A] @ SIM::1")
    );

    let (mut client, server) = tokio::io::duplex(1024);
    service.spawn_reader(BufReader::new(server));
    client.write_all(b"\xff\xfe garbage\n").await.unwrap();
    client
        .write_all(b"{\"id\":\"4321\",\"cmd\":\"idn\",\"args\":[],\"kwargs\":{}}\n")
        .await
        .unwrap();
    drop(client);

    assert_eq!(service.wait_for_readers().await.unwrap(), 2);
    let rejected = next_record(&mut rx).await;
    assert!(rejected.as_str().unwrap().starts_with("Invalid message"), "{rejected}");
    assert_eq!(next_record(&mut rx).await, json!("4321 / idn: PowerSupply-4321"));

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_with_command_in_flight() {
    let (sink, _rx) = ChannelSink::new();
    let service = ControllerService::start(
        config(),
        Arc::new(resources()),
        DriverRegistry::builtin(),
        sink,
    )
    .await
    .unwrap();

    service
        .inbound()
        .push(json!({"id": "4321", "cmd": "sleep", "args": [60], "kwargs": {}}).to_string());
    tokio::time::sleep(Duration::from_millis(50)).await;

    timeout(WAIT, service.shutdown())
        .await
        .expect("shutdown is bounded")
        .unwrap();
}
