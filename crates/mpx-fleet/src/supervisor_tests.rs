use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use mpx_client::{ConnectedTransport, Connector, ServerHandshake, ToolDescriptor};
use mpx_config::{ProxyConfig, ServerConfig};
use mpx_core::{AppState, ProxyError, ServerState};
use mpx_events::{EventType, wait_for_event};
use mpx_store::StateStore;

use crate::fleet::FleetSettings;
use crate::supervisor::{Supervisor, SupervisorOptions};

#[derive(Debug)]
struct NullTransport;

#[async_trait]
impl ConnectedTransport for NullTransport {
    fn handshake(&self) -> ServerHandshake {
        ServerHandshake {
            name: Some("fake".to_string()),
            version: Some("1.0.0".to_string()),
        }
    }

    async fn list_tools(&self) -> anyhow::Result<Vec<ToolDescriptor>> {
        Ok(vec![ToolDescriptor::new("echo")])
    }

    async fn call_tool(&self, _name: &str, _arguments: Option<Value>) -> anyhow::Result<Value> {
        Ok(Value::Null)
    }

    fn process_group(&self) -> Option<i32> {
        None
    }

    async fn close(self: Box<Self>) {}
}

/// Per-server scripted outcomes; servers without a script always succeed.
#[derive(Default)]
struct NamedConnector {
    scripts: Mutex<HashMap<String, VecDeque<bool>>>,
    attempts: Mutex<HashMap<String, usize>>,
}

impl NamedConnector {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn script(&self, server: &str, outcomes: &[bool]) {
        self.scripts
            .lock()
            .unwrap()
            .insert(server.to_string(), outcomes.iter().copied().collect());
    }

    fn attempts_for(&self, server: &str) -> usize {
        self.attempts.lock().unwrap().get(server).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Connector for NamedConnector {
    async fn connect(&self, config: &ServerConfig) -> anyhow::Result<Box<dyn ConnectedTransport>> {
        *self
            .attempts
            .lock()
            .unwrap()
            .entry(config.name.clone())
            .or_insert(0) += 1;
        let ok = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&config.name)
            .and_then(VecDeque::pop_front)
            .unwrap_or(true);
        if ok {
            Ok(Box::new(NullTransport))
        } else {
            anyhow::bail!("scripted refusal")
        }
    }
}

fn fast_fleet_settings() -> FleetSettings {
    FleetSettings {
        retry_backoff: Duration::from_millis(5),
        ..FleetSettings::default()
    }
}

fn active(name: &str) -> ServerConfig {
    ServerConfig::stdio(name, "echo", &[])
}

fn build(
    config: ProxyConfig,
    store: StateStore,
    connector: Arc<NamedConnector>,
    mut options: SupervisorOptions,
) -> Arc<Supervisor> {
    options.connector = Some(connector as Arc<dyn Connector>);
    options.fleet_settings.get_or_insert_with(|| FleetSettings {
        global_auto_disable_threshold: config.auto_disable_threshold,
        max_concurrent_connections: config.max_concurrent_connections,
        ..fast_fleet_settings()
    });
    Supervisor::new(config, store, options)
}

async fn await_connected(supervisor: &Arc<Supervisor>, name: &str) {
    for _ in 0..100 {
        if supervisor.get_server(name).await.unwrap().connection.state
            == mpx_core::ConnectionState::Ready
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("server '{name}' never connected");
}

#[tokio::test]
async fn test_start_connects_active_servers_only() {
    let mut config = ProxyConfig::default();
    config.enable_lazy_loading = true;
    config.servers.push(active("a"));
    config.servers.push(active("b"));
    let mut lazy = active("lazy");
    lazy.startup_mode = ServerState::LazyLoading;
    config.servers.push(lazy);

    let supervisor = build(
        config,
        StateStore::open_in_memory().unwrap(),
        NamedConnector::new(),
        SupervisorOptions::default(),
    );
    let report = supervisor.start().await.unwrap();

    assert_eq!(report.attempted, 2);
    assert!(report.all_connected());
    assert_eq!(supervisor.app_state(), AppState::Running);

    let lazy_snapshot = supervisor.get_server("lazy").await.unwrap();
    assert_eq!(
        lazy_snapshot.connection.state,
        mpx_core::ConnectionState::Disconnected
    );
}

#[tokio::test]
async fn test_partial_startup_failure_degrades_app_state() {
    let connector = NamedConnector::new();
    connector.script("bad", &[false; 8]);

    let mut config = ProxyConfig::default();
    config.servers.push(active("good"));
    config.servers.push(active("bad"));
    // Threshold above the retry budget keeps the server plain-failed.
    config.auto_disable_threshold = 50;

    let supervisor = build(
        config,
        StateStore::open_in_memory().unwrap(),
        connector,
        SupervisorOptions::default(),
    );
    let report = supervisor.start().await.unwrap();

    assert_eq!(report.connected, vec!["good".to_string()]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(supervisor.app_state(), AppState::Degraded);
}

#[tokio::test]
async fn test_auto_disable_survives_process_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("state.db");

    let connector = NamedConnector::new();
    connector.script("s1", &[false; 8]);

    let mut config = ProxyConfig::default();
    let mut s1 = active("s1");
    s1.auto_disable_threshold = 3;
    config.servers.push(s1);

    let supervisor = build(
        config.clone(),
        StateStore::open(&db_path).unwrap(),
        connector,
        SupervisorOptions::default(),
    );
    supervisor.start().await.unwrap();

    let snapshot = supervisor.get_server("s1").await.unwrap();
    assert_eq!(snapshot.server_state, ServerState::AutoDisabled);
    assert_eq!(
        snapshot.auto_disable_reason.as_deref(),
        Some("automatically disabled after 3 consecutive failures")
    );

    let record = supervisor.store().get("s1").unwrap().unwrap();
    assert_eq!(record.server_state, ServerState::AutoDisabled);

    supervisor.shutdown().await;

    // New process: config still says active, the database wins.
    let connector = NamedConnector::new();
    let supervisor = build(
        config,
        StateStore::open(&db_path).unwrap(),
        connector.clone(),
        SupervisorOptions::default(),
    );
    let report = supervisor.start().await.unwrap();

    assert_eq!(report.attempted, 0);
    assert_eq!(connector.attempts_for("s1"), 0);
    let snapshot = supervisor.get_server("s1").await.unwrap();
    assert_eq!(snapshot.server_state, ServerState::AutoDisabled);
    assert_eq!(
        snapshot.auto_disable_reason.as_deref(),
        Some("automatically disabled after 3 consecutive failures")
    );
}

#[tokio::test]
async fn test_fourth_rapid_restart_is_blocked() {
    let mut config = ProxyConfig::default();
    config.servers.push(active("s1"));

    let supervisor = build(
        config,
        StateStore::open_in_memory().unwrap(),
        NamedConnector::new(),
        SupervisorOptions::default(),
    );
    let mut loop_events = supervisor.subscribe_events(EventType::ServerRestartLoopDetected);
    supervisor.start().await.unwrap();

    for i in 0..3 {
        supervisor
            .restart_server("s1")
            .await
            .unwrap_or_else(|e| panic!("restart {i} should pass: {e}"));
    }

    let err = supervisor.restart_server("s1").await.unwrap_err();
    assert!(matches!(err, ProxyError::RestartLoopBlocked { .. }), "{err}");

    let event = wait_for_event(&mut loop_events, Duration::from_secs(1), |_| true)
        .await
        .unwrap();
    assert_eq!(event.field("restarts_in_window").unwrap(), 4);
    assert_eq!(event.field("window_seconds").unwrap(), 300);
    assert_eq!(event.field("cooldown_seconds").unwrap(), 600);
}

#[tokio::test]
async fn test_manual_reenable_clears_everything_and_reconnects() {
    let connector = NamedConnector::new();
    connector.script("s1", &[false, true]);

    let mut config = ProxyConfig::default();
    config.auto_disable_threshold = 1;
    config.enable_lazy_loading = true;
    let mut s1 = active("s1");
    s1.startup_mode = ServerState::LazyLoading;
    config.servers.push(s1);

    let supervisor = build(
        config,
        StateStore::open_in_memory().unwrap(),
        connector,
        SupervisorOptions::default(),
    );
    supervisor.start().await.unwrap();

    // One failed on-demand connect trips the threshold of 1.
    let err = supervisor.connect_server("s1").await.unwrap_err();
    assert!(matches!(err, ProxyError::Transport { .. }));
    assert_eq!(
        supervisor.get_server("s1").await.unwrap().server_state,
        ServerState::AutoDisabled
    );

    supervisor.clear_auto_disable("s1").await.unwrap();

    let snapshot = supervisor.get_server("s1").await.unwrap();
    assert_eq!(snapshot.server_state, ServerState::Active);
    assert!(snapshot.auto_disable_reason.is_none());
    assert_eq!(snapshot.connection.consecutive_failures, 0);

    let record = supervisor.store().get("s1").unwrap().unwrap();
    assert_eq!(record.server_state, ServerState::Active);
    assert!(record.auto_disable_reason.is_none());

    // The re-enable kicked off a reconnect.
    await_connected(&supervisor, "s1").await;
}

#[tokio::test]
async fn test_explicit_disabled_config_overrides_runtime_protection() {
    let store = StateStore::open_in_memory().unwrap();
    store.persist_auto_disable("s1", "kept failing").unwrap();

    let mut config = ProxyConfig::default();
    config.servers.push(active("s1"));

    let supervisor = build(
        config.clone(),
        store,
        NamedConnector::new(),
        SupervisorOptions::default(),
    );
    supervisor.start().await.unwrap();

    // Database protection outranks the configured `active`.
    assert_eq!(
        supervisor.get_server("s1").await.unwrap().server_state,
        ServerState::AutoDisabled
    );

    // The operator explicitly parks it disabled: config wins now.
    let mut edited = config.clone();
    edited.server_mut("s1").unwrap().startup_mode = ServerState::Disabled;
    supervisor.apply_config(edited).await.unwrap();

    assert_eq!(
        supervisor.get_server("s1").await.unwrap().server_state,
        ServerState::Disabled
    );
    let record = supervisor.store().get("s1").unwrap().unwrap();
    assert_eq!(record.server_state, ServerState::Disabled);
    assert!(record.auto_disable_reason.is_none());

    // With the protection cleared, flipping back to active connects.
    let mut edited = config;
    edited.server_mut("s1").unwrap().startup_mode = ServerState::Active;
    supervisor.apply_config(edited).await.unwrap();
    await_connected(&supervisor, "s1").await;
}

#[tokio::test]
async fn test_enable_then_disable_lands_on_disabled() {
    let mut config = ProxyConfig::default();
    let mut s1 = active("s1");
    s1.startup_mode = ServerState::Disabled;
    config.servers.push(s1);

    let supervisor = build(
        config,
        StateStore::open_in_memory().unwrap(),
        NamedConnector::new(),
        SupervisorOptions::default(),
    );
    supervisor.start().await.unwrap();

    supervisor.enable_server("s1").await.unwrap();
    supervisor.disable_server("s1").await.unwrap();

    let snapshot = supervisor.get_server("s1").await.unwrap();
    assert_eq!(snapshot.server_state, ServerState::Disabled);
    assert_eq!(
        snapshot.connection.state,
        mpx_core::ConnectionState::Disconnected
    );
}

#[tokio::test]
async fn test_quarantine_disconnects_and_blocks_connects() {
    let mut config = ProxyConfig::default();
    config.servers.push(active("s1"));

    let supervisor = build(
        config,
        StateStore::open_in_memory().unwrap(),
        NamedConnector::new(),
        SupervisorOptions::default(),
    );
    supervisor.start().await.unwrap();
    assert_eq!(
        supervisor.get_server("s1").await.unwrap().connection.state,
        mpx_core::ConnectionState::Ready
    );

    supervisor.quarantine_server("s1").await.unwrap();

    let snapshot = supervisor.get_server("s1").await.unwrap();
    assert_eq!(snapshot.server_state, ServerState::Quarantined);
    assert_eq!(
        snapshot.connection.state,
        mpx_core::ConnectionState::Disconnected
    );

    let err = supervisor.connect_server("s1").await.unwrap_err();
    assert!(matches!(err, ProxyError::NotEligible { .. }));

    supervisor.unquarantine_server("s1").await.unwrap();
    await_connected(&supervisor, "s1").await;
}

#[tokio::test]
async fn test_disconnect_server_marks_user_stopped() {
    let mut config = ProxyConfig::default();
    config.servers.push(active("s1"));

    let supervisor = build(
        config,
        StateStore::open_in_memory().unwrap(),
        NamedConnector::new(),
        SupervisorOptions::default(),
    );
    supervisor.start().await.unwrap();

    supervisor.disconnect_server("s1").await.unwrap();
    let snapshot = supervisor.get_server("s1").await.unwrap();
    assert!(snapshot.connection.user_stopped);
    assert_eq!(
        snapshot.connection.state,
        mpx_core::ConnectionState::Disconnected
    );
}

#[tokio::test]
async fn test_add_server_rejects_duplicates() {
    let supervisor = build(
        ProxyConfig::default(),
        StateStore::open_in_memory().unwrap(),
        NamedConnector::new(),
        SupervisorOptions::default(),
    );
    supervisor.start().await.unwrap();

    supervisor.add_server(active("s1")).await.unwrap();
    let err = supervisor.add_server(active("s1")).await.unwrap_err();
    assert!(matches!(err, ProxyError::DuplicateServer(_)));
}

#[tokio::test]
async fn test_remove_connected_server_requires_force() {
    let mut config = ProxyConfig::default();
    config.servers.push(active("s1"));

    let supervisor = build(
        config,
        StateStore::open_in_memory().unwrap(),
        NamedConnector::new(),
        SupervisorOptions::default(),
    );
    supervisor.start().await.unwrap();

    let err = supervisor.remove_server("s1", false).await.unwrap_err();
    assert!(matches!(err, ProxyError::Config(_)));

    supervisor.remove_server("s1", true).await.unwrap();
    assert!(supervisor.get_server("s1").await.is_err());
    assert!(supervisor.store().get("s1").unwrap().is_none());
}

#[tokio::test]
async fn test_shutdown_is_idempotent_and_closes_the_store() {
    let mut config = ProxyConfig::default();
    for name in ["a", "b", "c"] {
        config.servers.push(active(name));
    }

    let supervisor = build(
        config,
        StateStore::open_in_memory().unwrap(),
        NamedConnector::new(),
        SupervisorOptions::default(),
    );
    supervisor.start().await.unwrap();

    let first = supervisor.shutdown().await;
    assert!(first.is_clean(), "errors: {:?}", first.errors);
    assert_eq!(supervisor.app_state(), AppState::Stopped);
    for snapshot in supervisor.list_servers(None).await {
        assert_eq!(
            snapshot.connection.state,
            mpx_core::ConnectionState::Disconnected
        );
    }
    assert!(supervisor.store().get("a").is_err(), "store should be closed");

    let second = supervisor.shutdown().await;
    assert_eq!(first.errors, second.errors);
    assert_eq!(first.completed_phases, second.completed_phases);
}

#[tokio::test]
async fn test_add_server_persists_to_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mcpproxy.json");
    ProxyConfig::default().save_atomic(&path).unwrap();

    let supervisor = build(
        ProxyConfig::load(&path).unwrap(),
        StateStore::open_in_memory().unwrap(),
        NamedConnector::new(),
        SupervisorOptions {
            config_path: Some(path.clone()),
            ..SupervisorOptions::default()
        },
    );
    supervisor.start().await.unwrap();

    supervisor.add_server(active("github")).await.unwrap();

    let written = std::fs::read_to_string(&path).unwrap();
    assert!(written.contains("\"github\""));
    let reloaded = ProxyConfig::load(&path).unwrap();
    assert!(reloaded.server("github").is_some());
}

#[tokio::test]
async fn test_auto_disable_mirrors_to_config_when_opted_in() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mcpproxy.json");

    let connector = NamedConnector::new();
    connector.script("s1", &[false; 8]);

    let mut config = ProxyConfig::default();
    config.persist_auto_disable_to_config = true;
    config.auto_disable_threshold = 2;
    config.servers.push(active("s1"));
    config.save_atomic(&path).unwrap();

    let supervisor = build(
        config,
        StateStore::open_in_memory().unwrap(),
        connector,
        SupervisorOptions {
            config_path: Some(path.clone()),
            ..SupervisorOptions::default()
        },
    );
    supervisor.start().await.unwrap();

    assert_eq!(
        supervisor.get_server("s1").await.unwrap().server_state,
        ServerState::AutoDisabled
    );

    let written = ProxyConfig::load(&path).unwrap();
    let entry = written.server("s1").unwrap();
    assert_eq!(entry.startup_mode, ServerState::AutoDisabled);
    assert_eq!(
        entry.auto_disable_reason.as_deref(),
        Some("automatically disabled after 2 consecutive failures")
    );
}

#[tokio::test]
async fn test_lazy_servers_connect_eagerly_when_lazy_loading_is_off() {
    let mut config = ProxyConfig::default();
    assert!(!config.enable_lazy_loading);
    let mut s1 = active("s1");
    s1.startup_mode = ServerState::LazyLoading;
    config.servers.push(s1);

    let supervisor = build(
        config,
        StateStore::open_in_memory().unwrap(),
        NamedConnector::new(),
        SupervisorOptions::default(),
    );
    let report = supervisor.start().await.unwrap();

    assert_eq!(report.attempted, 1);
    assert_eq!(
        supervisor.get_server("s1").await.unwrap().connection.state,
        mpx_core::ConnectionState::Ready
    );
}
