//! Control-surface plumbing against a live reference device on loopback.

use std::collections::BTreeMap;
use std::time::Duration;

use keyholder_core::config::HealthConfig;
use keyholder_core::{
    DeviceCommand, DeviceDetails, DeviceFeatures, Forwarder, HealthMonitor, KeyholderError, Phase,
    ProvisioningState, Registry, SessionConfig, SessionLimits, SessionMachine, SessionStatus,
    Sighting, TriggerStrategy, WifiCredentials,
};
use keyholder_device::{api, DeviceIdentity, DeviceRuntime};
use tokio::task::JoinHandle;

const ID: &str = "mdns:hall-ddeeff";

async fn spawn_device() -> (u16, JoinHandle<()>) {
    let runtime = DeviceRuntime::new(
        SessionMachine::new(SessionLimits::default(), DeviceFeatures::default()),
        DeviceIdentity {
            name: "Hall".to_string(),
            mac: Some("AA:BB:CC:DD:EE:FF".to_string()),
        },
        None,
        None,
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        axum::serve(listener, api::router(runtime)).await.unwrap();
    });
    (port, handle)
}

async fn registry_with_device(port: u16) -> Registry {
    let registry = Registry::new();
    registry
        .upsert(Sighting {
            id: ID.to_string(),
            name: "Hall".to_string(),
            state: ProvisioningState::Ready,
            address: Some("127.0.0.1".to_string()),
            port: Some(port),
            mac: Some("AA:BB:CC:DD:EE:FF".to_string()),
            peripheral: None,
        })
        .await;
    registry
}

fn forwarder(registry: &Registry) -> Forwarder {
    Forwarder::new(
        registry.clone(),
        reqwest::Client::new(),
        Duration::from_secs(2),
    )
}

fn countdown(duration_secs: u32) -> SessionConfig {
    SessionConfig {
        strategy: TriggerStrategy::AutoCountdown,
        duration_secs,
        penalty_secs: 60,
        hide_timer: false,
        channel_delays: BTreeMap::from([(1, 30)]),
    }
}

fn phase(data: &serde_json::Value) -> Phase {
    serde_json::from_value::<SessionStatus>(data.clone())
        .unwrap()
        .phase
}

#[tokio::test]
async fn test_session_round_trip_through_forwarder() {
    let (port, _device) = spawn_device().await;
    let registry = registry_with_device(port).await;
    let forwarder = forwarder(&registry);

    let status = forwarder.forward(ID, &DeviceCommand::Status).await.unwrap();
    assert_eq!(status.status, 200);
    assert_eq!(phase(&status.data), Phase::Ready);

    let armed = forwarder
        .forward(ID, &DeviceCommand::Arm(countdown(600)))
        .await
        .unwrap();
    assert_eq!(phase(&armed.data), Phase::Armed);

    let again = forwarder.forward(ID, &DeviceCommand::Arm(countdown(600))).await;
    assert!(matches!(again, Err(KeyholderError::Busy(_))));

    let reset = forwarder.forward(ID, &DeviceCommand::FactoryReset).await;
    assert!(matches!(reset, Err(KeyholderError::Busy(_))));

    let aborted = forwarder.forward(ID, &DeviceCommand::Abort).await.unwrap();
    assert_eq!(phase(&aborted.data), Phase::Ready);

    let missing = forwarder.forward("mdns:nobody", &DeviceCommand::Status).await;
    assert!(matches!(missing, Err(KeyholderError::NotFound(_))));
}

#[tokio::test]
async fn test_validation_and_management_commands() {
    let (port, _device) = spawn_device().await;
    let registry = registry_with_device(port).await;
    let forwarder = forwarder(&registry);

    let short = forwarder.forward(ID, &DeviceCommand::Arm(countdown(1))).await;
    assert!(matches!(short, Err(KeyholderError::Validation(_))));

    forwarder
        .forward(
            ID,
            &DeviceCommand::UpdateWifi(WifiCredentials {
                ssid: "attic".to_string(),
                password: "hunter22".to_string(),
            }),
        )
        .await
        .unwrap();

    let details = forwarder.forward(ID, &DeviceCommand::Details).await.unwrap();
    let details: DeviceDetails = serde_json::from_value(details.data).unwrap();
    assert_eq!(details.name, "Hall");
    assert_eq!(details.wifi_ssid.as_deref(), Some("attic"));

    let log = forwarder.forward(ID, &DeviceCommand::Log).await.unwrap();
    assert!(log.data.as_array().is_some_and(|lines| !lines.is_empty()));

    let reset = forwarder
        .forward(ID, &DeviceCommand::FactoryReset)
        .await
        .unwrap();
    assert_eq!(reset.data["rebooting"], true);
}

#[tokio::test]
async fn test_health_round_evicts_dead_device() {
    let (port, device) = spawn_device().await;
    let registry = registry_with_device(port).await;
    let config = HealthConfig {
        probe_timeout_ms: 500,
        failure_threshold: 1,
        ..HealthConfig::default()
    };
    // No pooled connections, so a stopped listener is observed immediately.
    let client = reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .build()
        .unwrap();
    let monitor = HealthMonitor::new(registry.clone(), client, &config);

    let report = monitor.run_round().await;
    assert_eq!(report.probed, 1);
    assert_eq!(report.healthy, 1);

    device.abort();
    let _ = device.await;

    let report = monitor.run_round().await;
    assert_eq!(report.evicted, vec![ID.to_string()]);
    assert!(registry.get(ID).await.is_none());
}
