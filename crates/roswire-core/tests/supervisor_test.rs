// Supervisor behavior: background connect, loss detection + reconnect,
// and the credential-rejection halt.

mod support;

use std::time::Duration;

use secrecy::SecretString;

use roswire_core::{DeviceConfig, DeviceRegistry, Generation, Supervisor, SupervisorConfig};
use support::{MockOptions, MockRouter};

fn device_config(port: u16) -> DeviceConfig {
    DeviceConfig::new("127.0.0.1", "admin", SecretString::from("hunter2".to_string())).with_port(port)
}

fn fast_supervisor() -> SupervisorConfig {
    SupervisorConfig {
        probe_interval: Duration::from_millis(50),
        probe_timeout: Duration::from_secs(2),
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(100),
    }
}

/// Poll until `predicate` holds or the deadline passes.
async fn wait_until<F>(what: &str, mut predicate: F)
where
    F: AsyncFnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !predicate().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn supervisor_connects_tracked_devices_in_the_background() {
    let mock = MockRouter::spawn(MockOptions::default()).await;
    let registry = DeviceRegistry::new();
    registry.add_device("gw-lab", device_config(mock.port())).await.unwrap();

    let supervisor = Supervisor::start(registry.clone(), fast_supervisor());

    wait_until("supervisor to connect the device", async || {
        registry.status("gw-lab").await.unwrap().connected
    })
    .await;

    let status = registry.status("gw-lab").await.unwrap();
    assert_eq!(status.generation, Generation::Modern);
    assert_eq!(status.last_error, None);

    supervisor.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn supervisor_restores_a_lost_connection() {
    let mock = MockRouter::spawn(MockOptions::default()).await;
    let registry = DeviceRegistry::new();
    registry.add_device("gw-lab", device_config(mock.port())).await.unwrap();

    let router = registry.resolve("gw-lab").await.unwrap();
    assert_eq!(mock.connections_accepted(), 1);

    let supervisor = Supervisor::start(registry.clone(), fast_supervisor());

    mock.kill_connections().await;
    wait_until("old connection to close", async || !router.is_connected()).await;

    wait_until("supervisor to reconnect", async || {
        mock.connections_accepted() >= 2 && registry.status("gw-lab").await.unwrap().connected
    })
    .await;

    // detected generation survives the reconnect
    let status = registry.status("gw-lab").await.unwrap();
    assert_eq!(status.generation, Generation::Modern);

    supervisor.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn supervisor_halts_after_a_credential_rejection() {
    let mock = MockRouter::spawn(MockOptions {
        reject_logins: true,
        ..MockOptions::default()
    })
    .await;
    let registry = DeviceRegistry::new();
    registry.add_device("gw-lab", device_config(mock.port())).await.unwrap();

    let supervisor = Supervisor::start(registry.clone(), fast_supervisor());

    wait_until("the rejected attempt to be recorded", async || {
        registry.status("gw-lab").await.unwrap().last_error.is_some()
    })
    .await;

    // several sweep intervals later, no further attempts were made
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(
        mock.connections_accepted(),
        1,
        "bad credentials must not be retried automatically"
    );

    let status = registry.status("gw-lab").await.unwrap();
    assert!(!status.connected);
    assert!(status.last_error.unwrap().contains("authentication failed"));

    supervisor.shutdown().await;
}
