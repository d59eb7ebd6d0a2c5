//! Integration tests for the relay orchestrator: gateway batches in,
//! `rftransmit` lines out.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, spawn_gateway, GatewayMode, MemoryOpener};
use local_relay::protocol::{
    ControlCommand, GatewayToHub, ShockerCommandType, ShockerModel, WireMessage,
};
use local_relay::{ConfigStore, ConnectOutcome, ConnectionState, RelayEvent, RelayOrchestrator};
use tempfile::TempDir;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn command(id: u16, command_type: ShockerCommandType) -> ControlCommand {
    ControlCommand {
        shocker_id: id,
        model: ShockerModel::PetTrainer,
        command_type,
        intensity: 30,
        duration_ms: 500,
    }
}

fn relay_in(dir: &TempDir, opener: &Arc<MemoryOpener>) -> RelayOrchestrator {
    let store = ConfigStore::open_in(dir.path().to_path_buf()).unwrap();
    RelayOrchestrator::new(store, Arc::clone(opener) as _)
}

#[tokio::test]
async fn test_batch_dispatched_in_arrival_order() {
    let dir = TempDir::new().unwrap();
    let opener = MemoryOpener::new();
    let relay = relay_in(&dir, &opener);
    relay.select_port("ttyTEST0").await.unwrap();

    let batch = [
        command(3, ShockerCommandType::Shock),
        command(1, ShockerCommandType::Sound),
        command(2, ShockerCommandType::Stop),
    ];
    assert_eq!(relay.dispatch_batch(&batch), 3);

    let port = opener.last();
    assert!(eventually(Duration::from_secs(2), || port.written_text().lines().count() == 3).await);
    let written = port.written_text();
    let types: Vec<&str> = written
        .lines()
        .map(|line| line.split("\"type\":\"").nth(1).unwrap().split('"').next().unwrap())
        .collect();
    assert_eq!(types, vec!["shock", "sound", "stop"]);

    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_batch_without_port_is_dropped() {
    let dir = TempDir::new().unwrap();
    let opener = MemoryOpener::new();
    let relay = relay_in(&dir, &opener);

    assert_eq!(relay.dispatch_batch(&[command(1, ShockerCommandType::Vibrate)]), 0);
}

#[tokio::test]
async fn test_select_port_replaces_previous_and_persists() {
    let dir = TempDir::new().unwrap();
    let opener = MemoryOpener::new();
    let relay = relay_in(&dir, &opener);

    relay.select_port("ttyTEST0").await.unwrap();
    relay.select_port("ttyTEST1").await.unwrap();

    let ports = opener.opened();
    assert!(ports[0].released());
    assert_eq!(relay.serial_port().as_deref(), Some("ttyTEST1"));
    assert_eq!(relay.config().get().serial_port.as_deref(), Some("ttyTEST1"));

    relay.shutdown().await.unwrap();
    let saved = std::fs::read_to_string(dir.path().join("config.json")).unwrap();
    assert!(saved.contains("ttyTEST1"));
}

#[tokio::test]
async fn test_failed_port_open_is_reported() {
    let dir = TempDir::new().unwrap();
    let opener = MemoryOpener::new();
    let relay = relay_in(&dir, &opener);

    assert!(relay.select_port("missing0").await.is_err());
    assert!(relay.serial_port().is_none());
    assert!(relay.config().get().serial_port.is_none());
}

#[tokio::test]
async fn test_console_updates_are_forwarded() {
    let dir = TempDir::new().unwrap();
    let opener = MemoryOpener::new();
    let relay = relay_in(&dir, &opener);
    let mut events = relay.subscribe();
    relay.select_port("ttyTEST0").await.unwrap();

    opener.last().feed(b"boot ok\n");

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, RelayEvent::ConsoleUpdated);
    let (lines, _) = relay.completed_console_lines_since(0);
    assert_eq!(lines, vec!["boot ok\n"]);

    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_nil_hub_stops_session() {
    let dir = TempDir::new().unwrap();
    let opener = MemoryOpener::new();
    let relay = relay_in(&dir, &opener);

    assert_eq!(relay.select_hub(Uuid::nil()).await.unwrap(), None);
    assert_eq!(relay.state(), ConnectionState::Disconnected);
    assert_eq!(relay.config().get().hub_id, None);
}

#[tokio::test]
async fn test_select_hub_requires_token() {
    let dir = TempDir::new().unwrap();
    let opener = MemoryOpener::new();
    let relay = relay_in(&dir, &opener);

    let err = relay.select_hub(Uuid::new_v4()).await.unwrap_err();
    assert!(err.to_string().contains("token"));
}

#[tokio::test]
async fn test_gateway_commands_reach_serial_device() {
    let batch = vec![ControlCommand {
        shocker_id: 1,
        model: ShockerModel::CaiXianlin,
        command_type: ShockerCommandType::Vibrate,
        intensity: 50,
        duration_ms: 200,
    }];
    let greeting = GatewayToHub::ShockerCommandList { commands: batch }.encode();
    let gateway = spawn_gateway(GatewayMode::Accept, vec![greeting]).await;

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/1/device/assignLCG"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": { "fqdn": gateway.host() }
        })))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let opener = MemoryOpener::new();
    let relay = relay_in(&dir, &opener);
    relay.config().update(|c| {
        c.backend = server.uri();
        c.device_token = "tok".to_string();
    });

    relay.select_port("ttyTEST0").await.unwrap();
    let hub = Uuid::new_v4();
    assert_eq!(
        relay.select_hub(hub).await.unwrap(),
        Some(ConnectOutcome::Connected)
    );
    assert!(eventually(Duration::from_secs(2), || relay.state() == ConnectionState::Connected).await);
    assert!(relay.has_hub_session());

    let port = opener.last();
    let expected =
        "rftransmit {\"id\":1,\"model\":\"caixianlin\",\"type\":\"vibrate\",\"intensity\":50,\"durationMs\":200}\r\n";
    assert!(eventually(Duration::from_secs(3), || port.written_text() == expected).await);

    relay.stop_hub().await;
    assert_eq!(relay.state(), ConnectionState::Disconnected);
    assert!(!relay.has_hub_session());

    relay.shutdown().await.unwrap();
    let saved = std::fs::read_to_string(dir.path().join("config.json")).unwrap();
    assert!(saved.contains(&hub.to_string()));
}

#[tokio::test]
async fn test_unknown_device_releases_hub_session() {
    let gateway = spawn_gateway(GatewayMode::RejectNotFound, Vec::new()).await;
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/1/device/assignLCG"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": { "fqdn": gateway.host() }
        })))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let opener = MemoryOpener::new();
    let relay = relay_in(&dir, &opener);
    relay.config().update(|c| {
        c.backend = server.uri();
        c.device_token = "tok".to_string();
    });
    let mut events = relay.subscribe();

    assert_eq!(
        relay.select_hub(Uuid::new_v4()).await.unwrap(),
        Some(ConnectOutcome::DeviceNotFound)
    );

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, RelayEvent::DeviceNotFound);
    assert!(eventually(Duration::from_secs(2), || !relay.has_hub_session()).await);
    assert_eq!(relay.state(), ConnectionState::Disconnected);

    relay.stop_hub().await;
    relay.shutdown().await.unwrap();
}
