use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use mpx_client::{
    ConnectedTransport, Connector, DisablePersistence, ProcessRegistry, ServerHandshake,
    ToolDescriptor,
};
use mpx_config::ServerConfig;
use mpx_core::{ProxyError, ServerState};
use mpx_events::EventBus;

use crate::fleet::{FleetManager, FleetSettings};

#[derive(Debug)]
struct GaugeTransport;

#[async_trait]
impl ConnectedTransport for GaugeTransport {
    fn handshake(&self) -> ServerHandshake {
        ServerHandshake::default()
    }

    async fn list_tools(&self) -> anyhow::Result<Vec<ToolDescriptor>> {
        Ok(vec![])
    }

    async fn call_tool(&self, _name: &str, _arguments: Option<Value>) -> anyhow::Result<Value> {
        Ok(Value::Null)
    }

    fn process_group(&self) -> Option<i32> {
        None
    }

    async fn close(self: Box<Self>) {}
}

/// Connector that records peak concurrency and follows a per-server script
/// of success flags (missing script entries mean success).
struct GaugeConnector {
    current: AtomicUsize,
    peak: AtomicUsize,
    attempts: Mutex<HashMap<String, usize>>,
    scripts: Mutex<HashMap<String, VecDeque<bool>>>,
    delay: Duration,
}

impl GaugeConnector {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            attempts: Mutex::new(HashMap::new()),
            scripts: Mutex::new(HashMap::new()),
            delay,
        })
    }

    fn script(&self, server: &str, outcomes: &[bool]) {
        self.scripts
            .lock()
            .unwrap()
            .insert(server.to_string(), outcomes.iter().copied().collect());
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn attempts_for(&self, server: &str) -> usize {
        self.attempts.lock().unwrap().get(server).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Connector for GaugeConnector {
    async fn connect(&self, config: &ServerConfig) -> anyhow::Result<Box<dyn ConnectedTransport>> {
        let in_flight = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(in_flight, Ordering::SeqCst);
        *self
            .attempts
            .lock()
            .unwrap()
            .entry(config.name.clone())
            .or_insert(0) += 1;

        tokio::time::sleep(self.delay).await;
        self.current.fetch_sub(1, Ordering::SeqCst);

        let ok = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&config.name)
            .and_then(VecDeque::pop_front)
            .unwrap_or(true);
        if ok {
            Ok(Box::new(GaugeTransport))
        } else {
            anyhow::bail!("scripted failure")
        }
    }
}

#[derive(Default)]
struct RecordingPersistence {
    calls: Mutex<Vec<String>>,
}

impl DisablePersistence for RecordingPersistence {
    fn persist_auto_disable(&self, server: &str, _reason: &str) -> mpx_core::Result<()> {
        self.calls.lock().unwrap().push(server.to_string());
        Ok(())
    }
}

fn fast_settings() -> FleetSettings {
    FleetSettings {
        retry_backoff: Duration::from_millis(10),
        ..FleetSettings::default()
    }
}

fn fleet_with(
    settings: FleetSettings,
    connector: Arc<GaugeConnector>,
    persistence: Option<Arc<RecordingPersistence>>,
) -> FleetManager {
    FleetManager::new(
        settings,
        connector as Arc<dyn Connector>,
        Arc::new(EventBus::new()),
        Arc::new(ProcessRegistry::new()),
        persistence.map(|p| p as Arc<dyn DisablePersistence>),
    )
}

#[tokio::test]
async fn test_connect_all_bounds_parallelism() {
    let connector = GaugeConnector::new(Duration::from_millis(40));
    let fleet = fleet_with(fast_settings(), connector.clone(), None);

    for i in 0..30 {
        fleet
            .add_server(ServerConfig::stdio(&format!("s{i:02}"), "echo", &[]))
            .await
            .unwrap();
    }

    let report = fleet.connect_all(&CancellationToken::new()).await;

    assert_eq!(report.attempted, 30);
    assert_eq!(report.connected.len(), 30);
    assert!(report.failed.is_empty());
    assert!(
        connector.peak() <= 10,
        "peak concurrency {} exceeded the bound",
        connector.peak()
    );
}

#[tokio::test]
async fn test_connect_all_retries_flaky_server() {
    let connector = GaugeConnector::new(Duration::from_millis(5));
    connector.script("flaky", &[false, false, true]);
    let fleet = fleet_with(fast_settings(), connector.clone(), None);

    fleet
        .add_server(ServerConfig::stdio("flaky", "echo", &[]))
        .await
        .unwrap();
    fleet
        .add_server(ServerConfig::stdio("steady", "echo", &[]))
        .await
        .unwrap();

    let report = fleet.connect_all(&CancellationToken::new()).await;

    assert!(report.failed.is_empty(), "failed: {:?}", report.failed);
    assert_eq!(connector.attempts_for("flaky"), 3);
    assert_eq!(connector.attempts_for("steady"), 1);
    assert!(fleet.get_client("flaky").await.unwrap().is_connected());
}

#[tokio::test]
async fn test_connect_all_exhausts_retry_passes() {
    let connector = GaugeConnector::new(Duration::from_millis(5));
    connector.script("dead", &[false; 8]);
    let settings = FleetSettings {
        // Threshold above the attempt count keeps auto-disable out of this
        // test's way.
        global_auto_disable_threshold: 100,
        ..fast_settings()
    };
    let fleet = fleet_with(settings, connector.clone(), None);

    fleet
        .add_server(ServerConfig::stdio("dead", "echo", &[]))
        .await
        .unwrap();

    let report = fleet.connect_all(&CancellationToken::new()).await;

    // Initial pass plus three retries.
    assert_eq!(connector.attempts_for("dead"), 4);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "dead");
    let client = fleet.get_client("dead").await.unwrap();
    assert!(!client.is_connected());
    assert_eq!(client.connection_info().consecutive_failures, 4);
}

#[tokio::test]
async fn test_connect_all_skips_non_active_servers() {
    let connector = GaugeConnector::new(Duration::from_millis(5));
    let fleet = fleet_with(fast_settings(), connector.clone(), None);

    let mut lazy = ServerConfig::stdio("lazy", "echo", &[]);
    lazy.startup_mode = ServerState::LazyLoading;
    let mut disabled = ServerConfig::stdio("disabled", "echo", &[]);
    disabled.startup_mode = ServerState::Disabled;
    fleet.add_server(lazy).await.unwrap();
    fleet.add_server(disabled).await.unwrap();
    fleet
        .add_server(ServerConfig::stdio("active", "echo", &[]))
        .await
        .unwrap();

    let report = fleet.connect_all(&CancellationToken::new()).await;

    assert_eq!(report.attempted, 1);
    assert_eq!(report.connected, vec!["active".to_string()]);
    assert_eq!(connector.attempts_for("lazy"), 0);
    assert_eq!(connector.attempts_for("disabled"), 0);
}

#[tokio::test]
async fn test_auto_disable_mid_startup_stops_retrying() {
    let connector = GaugeConnector::new(Duration::from_millis(5));
    connector.script("sick", &[false; 8]);
    let persistence = Arc::new(RecordingPersistence::default());
    let settings = FleetSettings {
        global_auto_disable_threshold: 2,
        ..fast_settings()
    };
    let fleet = fleet_with(settings, connector.clone(), Some(persistence.clone()));

    fleet
        .add_server(ServerConfig::stdio("sick", "echo", &[]))
        .await
        .unwrap();

    let report = fleet.connect_all(&CancellationToken::new()).await;

    // Second failure trips the threshold; no third attempt happens.
    assert_eq!(connector.attempts_for("sick"), 2);
    assert_eq!(
        fleet.get_client("sick").await.unwrap().server_state(),
        ServerState::AutoDisabled
    );
    assert_eq!(persistence.calls.lock().unwrap().as_slice(), ["sick"]);
    assert_eq!(report.failed.len(), 1);
}

#[tokio::test]
async fn test_add_server_is_idempotent_for_unchanged_config() {
    let connector = GaugeConnector::new(Duration::from_millis(1));
    let fleet = fleet_with(fast_settings(), connector, None);

    let config = ServerConfig::stdio("s1", "echo", &["a"]);
    let first = fleet.add_server(config.clone()).await.unwrap();
    let second = fleet.add_server(config).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
}

#[tokio::test]
async fn test_add_server_recreates_on_transport_change() {
    let connector = GaugeConnector::new(Duration::from_millis(1));
    let fleet = fleet_with(fast_settings(), connector, None);

    let first = fleet
        .add_server(ServerConfig::stdio("s1", "echo", &["a"]))
        .await
        .unwrap();
    let second = fleet
        .add_server(ServerConfig::stdio("s1", "echo", &["b"]))
        .await
        .unwrap();

    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(fleet.server_names().await, vec!["s1".to_string()]);
}

#[tokio::test]
async fn test_remove_server_unknown_fails() {
    let connector = GaugeConnector::new(Duration::from_millis(1));
    let fleet = fleet_with(fast_settings(), connector, None);
    let err = fleet.remove_server("ghost").await.unwrap_err();
    assert!(matches!(err, ProxyError::ServerNotFound(_)));
}

#[tokio::test]
async fn test_disconnect_all_disconnects_every_client() {
    let connector = GaugeConnector::new(Duration::from_millis(1));
    let fleet = fleet_with(fast_settings(), connector, None);

    for i in 0..5 {
        fleet
            .add_server(ServerConfig::stdio(&format!("s{i}"), "echo", &[]))
            .await
            .unwrap();
    }
    fleet.connect_all(&CancellationToken::new()).await;

    fleet.disconnect_all().await.unwrap();
    for client in fleet.all_clients().await {
        assert!(!client.is_connected(), "{} still connected", client.name());
    }
}

#[tokio::test]
async fn test_connect_all_respects_cancellation() {
    let connector = GaugeConnector::new(Duration::from_millis(5));
    let fleet = fleet_with(fast_settings(), connector.clone(), None);
    for i in 0..3 {
        fleet
            .add_server(ServerConfig::stdio(&format!("s{i}"), "echo", &[]))
            .await
            .unwrap();
    }

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = fleet.connect_all(&cancel).await;

    assert!(report.connected.is_empty());
    assert_eq!(report.failed.len(), 3);
    assert!(
        report
            .failed
            .iter()
            .all(|(_, e)| matches!(e, ProxyError::Cancelled))
    );
}
