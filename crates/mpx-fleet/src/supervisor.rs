//! The supervisor facade: the one entry point external callers use to
//! manage the fleet, backed by the config file, the state store, the event
//! bus, the restart tracker, and the shutdown coordinator.

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use mpx_client::process::DEFAULT_KILL_GRACE;
use mpx_client::{Connector, DisablePersistence, ManagedClient, ProcessRegistry, RmcpConnector};
use mpx_config::{ConfigWatcher, ProxyConfig, ServerConfig};
use mpx_core::{
    AppState, ConnectionInfo, ConnectionState, ProxyError, RestartDecision, RestartTracker,
    RestartTrackerConfig, Result, ServerState,
};
use mpx_events::{Event, EventBus, EventType};
use mpx_store::{StateStore, UpstreamRecord, reconcile_startup_mode};

use crate::fleet::{ConnectAllReport, FleetManager, FleetSettings};
use crate::shutdown::{DEFAULT_TOTAL_TIMEOUT, ShutdownCoordinator, ShutdownPhase, ShutdownReport};

/// Bound on waiting for a client to actually reach `Disconnected` during a
/// restart. A wait, not a sleep: the state change resolves it immediately.
const RESTART_DISCONNECT_WAIT: Duration = Duration::from_secs(10);

#[derive(Default)]
pub struct SupervisorOptions {
    /// Config file to persist changes to and watch for external edits.
    pub config_path: Option<PathBuf>,
    pub restart: Option<RestartTrackerConfig>,
    pub total_shutdown_timeout: Option<Duration>,
    /// Overrides the settings derived from the config (retry pacing etc.).
    pub fleet_settings: Option<FleetSettings>,
    /// Test seam; defaults to the rmcp-backed connector.
    pub connector: Option<Arc<dyn Connector>>,
}

/// Read-model row for `list_servers` / `get_server`.
#[derive(Debug, Clone, Serialize)]
pub struct ServerSnapshot {
    pub name: String,
    pub server_state: ServerState,
    #[serde(flatten)]
    pub connection: ConnectionInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_disable_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub name: String,
    pub healthy: bool,
    pub detail: String,
}

/// Durable side of auto-disable: the database always, the config file when
/// the operator opted in.
struct StorePersistence {
    store: Arc<StateStore>,
    config: Arc<StdRwLock<ProxyConfig>>,
    config_path: Option<PathBuf>,
    watcher: Arc<StdMutex<Option<ConfigWatcher>>>,
}

impl DisablePersistence for StorePersistence {
    fn persist_auto_disable(&self, server: &str, reason: &str) -> Result<()> {
        self.store.persist_auto_disable(server, reason)?;

        let mirror_to_config = self.lock_config_read().persist_auto_disable_to_config;
        if let (true, Some(path)) = (mirror_to_config, self.config_path.as_ref()) {
            let mut config = self.lock_config_write();
            if let Some(entry) = config.server_mut(server) {
                entry.startup_mode = ServerState::AutoDisabled;
                entry.auto_disable_reason = Some(reason.to_string());
            }
            if let Some(watcher) = self
                .watcher
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .as_ref()
            {
                watcher.suppress_next_reload();
            }
            config
                .save_atomic(path)
                .map_err(|e| ProxyError::Persistence(format!("{e:#}")))?;
        }
        Ok(())
    }
}

impl StorePersistence {
    fn lock_config_read(&self) -> std::sync::RwLockReadGuard<'_, ProxyConfig> {
        self.config.read().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_config_write(&self) -> std::sync::RwLockWriteGuard<'_, ProxyConfig> {
        self.config.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// External API over the upstream fleet.
pub struct Supervisor {
    config: Arc<StdRwLock<ProxyConfig>>,
    config_path: Option<PathBuf>,
    fleet: Arc<FleetManager>,
    store: Arc<StateStore>,
    bus: Arc<EventBus>,
    tracker: RestartTracker,
    coordinator: Arc<ShutdownCoordinator>,
    processes: Arc<ProcessRegistry>,
    app_state: StdMutex<AppState>,
    watcher: Arc<StdMutex<Option<ConfigWatcher>>>,
    cancel: CancellationToken,
    /// Handle to ourselves for the config-reload task; never keeps the
    /// supervisor alive on its own.
    weak_self: Weak<Supervisor>,
}

impl Supervisor {
    pub fn new(config: ProxyConfig, store: StateStore, options: SupervisorOptions) -> Arc<Self> {
        let store = Arc::new(store);
        let bus = Arc::new(EventBus::new());
        let processes = Arc::new(ProcessRegistry::new());
        let shared_config = Arc::new(StdRwLock::new(config.clone()));
        let watcher = Arc::new(StdMutex::new(None));

        let connector = options
            .connector
            .unwrap_or_else(|| Arc::new(RmcpConnector::new(config.expose_secret_env)));
        let persistence: Arc<dyn DisablePersistence> = Arc::new(StorePersistence {
            store: Arc::clone(&store),
            config: Arc::clone(&shared_config),
            config_path: options.config_path.clone(),
            watcher: Arc::clone(&watcher),
        });

        let fleet = Arc::new(FleetManager::new(
            options
                .fleet_settings
                .unwrap_or_else(|| FleetSettings::from(&config)),
            connector,
            Arc::clone(&bus),
            Arc::clone(&processes),
            Some(persistence),
        ));

        let coordinator = Arc::new(ShutdownCoordinator::new(
            options.total_shutdown_timeout.unwrap_or(DEFAULT_TOTAL_TIMEOUT),
        ));

        // The core's own teardown handlers. Outer surfaces (HTTP sessions,
        // WebSockets) register theirs into the earlier phases.
        let fleet_handle = Arc::clone(&fleet);
        coordinator.register("upstream-fleet", ShutdownPhase::Upstreams, 0, None, move || {
            let fleet = Arc::clone(&fleet_handle);
            async move { fleet.disconnect_all().await.map_err(anyhow::Error::from) }
        });
        let process_handle = Arc::clone(&processes);
        coordinator.register(
            "process-groups",
            ShutdownPhase::Processes,
            0,
            None,
            move || {
                let processes = Arc::clone(&process_handle);
                async move {
                    let killed = processes.kill_lingering(DEFAULT_KILL_GRACE).await;
                    if killed > 0 {
                        warn!(killed, "force-terminated lingering process groups");
                    }
                    Ok(())
                }
            },
        );
        let store_handle = Arc::clone(&store);
        coordinator.register("state-store", ShutdownPhase::Storage, 0, None, move || {
            let store = Arc::clone(&store_handle);
            async move { store.close().map_err(anyhow::Error::from) }
        });

        Arc::new_cyclic(|weak_self| Self {
            config: shared_config,
            config_path: options.config_path,
            fleet,
            store,
            bus,
            tracker: RestartTracker::new(options.restart.unwrap_or_default()),
            coordinator,
            processes,
            app_state: StdMutex::new(AppState::Starting),
            watcher,
            cancel: CancellationToken::new(),
            weak_self: weak_self.clone(),
        })
    }

    /// Registers every configured server (reconciled against the store) and
    /// connects the active ones. Also arms the config file watcher.
    pub async fn start(&self) -> Result<ConnectAllReport> {
        let (servers, lazy_enabled) = {
            let config = self.lock_config_read();
            (config.servers.clone(), config.enable_lazy_loading)
        };
        for server in servers {
            let mut effective = self.reconciled(server)?;
            // With lazy loading switched off there is no at-rest state:
            // everything configured lazy connects eagerly.
            if !lazy_enabled && effective.startup_mode == ServerState::LazyLoading {
                effective.startup_mode = ServerState::Active;
            }
            self.fleet.add_server(effective).await?;
        }

        let report = self.fleet.connect_all(&self.cancel).await;

        let next = if report.all_connected() {
            AppState::Running
        } else {
            AppState::Degraded
        };
        self.set_app_state(next);

        if let Some(path) = &self.config_path {
            self.spawn_config_watcher(path.clone())?;
        }
        Ok(report)
    }

    /// Resolves a configured server against its durable record: effective
    /// startup mode per the priority rule, reason carried over.
    fn reconciled(&self, mut config: ServerConfig) -> Result<ServerConfig> {
        let record = self.store.get(&config.name)?;
        let effective = reconcile_startup_mode(config.startup_mode, record.as_ref());
        if effective == ServerState::AutoDisabled && config.startup_mode != effective {
            debug!(
                server = %config.name,
                configured = %config.startup_mode,
                "runtime auto-disable overrides configured startup mode"
            );
        }
        if effective == ServerState::AutoDisabled && config.auto_disable_reason.is_none() {
            config.auto_disable_reason = record.and_then(|r| r.auto_disable_reason);
        }
        config.startup_mode = effective;
        Ok(config)
    }

    // ---- server CRUD -----------------------------------------------------

    pub async fn add_server(&self, config: ServerConfig) -> Result<()> {
        if self.fleet.get_client(&config.name).await.is_some() {
            return Err(ProxyError::DuplicateServer(config.name));
        }

        self.store
            .upsert(&UpstreamRecord::new(&config.name, config.startup_mode))?;
        {
            let mut current = self.lock_config_write();
            current.servers.retain(|s| s.name != config.name);
            current.servers.push(config.clone());
        }
        self.persist_config()?;

        let client = self.fleet.add_server(config).await?;
        info!(server = %client.name(), mode = %client.server_state(), "server added");
        if client.server_state() == ServerState::Active {
            self.spawn_connect(client);
        }
        Ok(())
    }

    pub async fn remove_server(&self, name: &str, force: bool) -> Result<()> {
        let client = self.client(name).await?;
        if client.is_connected() && !force {
            return Err(ProxyError::Config(format!(
                "server '{name}' is connected; disconnect it first or pass force"
            )));
        }

        self.fleet.remove_server(name).await?;
        self.store.remove(name)?;
        self.tracker.reset(name);
        {
            let mut current = self.lock_config_write();
            current.servers.retain(|s| s.name != name);
        }
        self.persist_config()?;
        info!(server = %name, "server removed");
        Ok(())
    }

    pub async fn update_server(&self, name: &str, config: ServerConfig) -> Result<()> {
        if config.name != name {
            return Err(ProxyError::Config(format!(
                "update for '{name}' carries mismatched name '{}'",
                config.name
            )));
        }
        self.client(name).await?;

        self.store
            .upsert(&UpstreamRecord::new(name, config.startup_mode))?;
        {
            let mut current = self.lock_config_write();
            current.servers.retain(|s| s.name != name);
            current.servers.push(config.clone());
        }
        self.persist_config()?;

        let client = self.fleet.add_server(config).await?;
        if client.server_state() == ServerState::Active && !client.is_connected() {
            self.spawn_connect(client);
        }
        Ok(())
    }

    // ---- administrative state changes ------------------------------------

    pub async fn enable_server(&self, name: &str) -> Result<()> {
        self.set_server_mode(name, ServerState::Active).await
    }

    pub async fn disable_server(&self, name: &str) -> Result<()> {
        self.set_server_mode(name, ServerState::Disabled).await
    }

    pub async fn quarantine_server(&self, name: &str) -> Result<()> {
        self.set_server_mode(name, ServerState::Quarantined).await
    }

    pub async fn unquarantine_server(&self, name: &str) -> Result<()> {
        self.set_server_mode(name, ServerState::Active).await
    }

    /// Manual re-enable of an auto-disabled server.
    pub async fn clear_auto_disable(&self, name: &str) -> Result<()> {
        self.set_server_mode(name, ServerState::Active).await
    }

    async fn set_server_mode(&self, name: &str, target: ServerState) -> Result<()> {
        let client = self.client(name).await?;
        let old = client.server_state();
        if old == target {
            return Ok(());
        }

        let old_reason = client.auto_disable_reason();
        let transition = client.transition(target)?;

        if !target.is_connectable() && client.is_connected() {
            client
                .disconnect(&format!("server {}", target.as_str()))
                .await?;
        }

        // Durable state first; the in-memory transition reverts if the write
        // fails.
        if let Err(e) = self.persist_mode_change(name, target) {
            let _ = client.transition(transition.from);
            if let Some(reason) = old_reason {
                client.set_auto_disable_reason(&reason);
            }
            return Err(e);
        }

        self.bus
            .publish(Event::server_state_changed(name, transition.from, target));

        if target == ServerState::Active {
            self.tracker.reset(name);
            self.spawn_connect(client);
        }
        info!(server = %name, from = %transition.from, to = %target, "server state changed");
        Ok(())
    }

    fn persist_mode_change(&self, name: &str, target: ServerState) -> Result<()> {
        self.store.clear_auto_disable(name, target)?;
        {
            let mut config = self.lock_config_write();
            if let Some(entry) = config.server_mut(name) {
                entry.startup_mode = target;
                entry.auto_disable_reason = None;
            }
        }
        self.persist_config()
    }

    // ---- connection control ----------------------------------------------

    pub async fn connect_server(&self, name: &str) -> Result<()> {
        let client = self.client(name).await?;
        client.set_user_stopped(false);
        client.connect(&self.cancel.child_token()).await
    }

    pub async fn disconnect_server(&self, name: &str) -> Result<()> {
        let client = self.client(name).await?;
        client.set_user_stopped(true);
        client.disconnect("stopped by user").await
    }

    /// Restart with loop protection: refuse when the tracker says no, verify
    /// the disconnect actually lands, then reconnect.
    pub async fn restart_server(&self, name: &str) -> Result<()> {
        let client = self.client(name).await?;

        match self.tracker.record_restart(name) {
            RestartDecision::Allowed { total_restarts } => {
                debug!(server = %name, total_restarts, "restart allowed");
            }
            RestartDecision::CoolingDown { retry_after } => {
                return Err(ProxyError::RestartLoopBlocked {
                    server: name.to_string(),
                    retry_after_secs: retry_after.as_secs(),
                });
            }
            RestartDecision::LoopDetected {
                restarts_in_window,
                window,
                cooldown,
            } => {
                warn!(
                    server = %name,
                    restarts_in_window,
                    "restart loop detected, cooling down"
                );
                self.bus.publish(Event::server_restart_loop_detected(
                    name,
                    restarts_in_window,
                    window.as_secs(),
                    cooldown.as_secs(),
                ));
                return Err(ProxyError::RestartLoopBlocked {
                    server: name.to_string(),
                    retry_after_secs: cooldown.as_secs(),
                });
            }
        }

        client.disconnect("restarting").await?;
        if !client
            .wait_for_connection_state(ConnectionState::Disconnected, RESTART_DISCONNECT_WAIT)
            .await
        {
            return Err(ProxyError::Transport {
                server: name.to_string(),
                message: format!(
                    "did not reach disconnected within {}s",
                    RESTART_DISCONNECT_WAIT.as_secs()
                ),
            });
        }

        client.connect(&self.cancel.child_token()).await
    }

    // ---- read model ------------------------------------------------------

    pub async fn list_servers(&self, filter: Option<ServerState>) -> Vec<ServerSnapshot> {
        self.fleet
            .all_clients()
            .await
            .into_iter()
            .filter(|c| filter.is_none_or(|f| c.server_state() == f))
            .map(|c| snapshot_of(&c))
            .collect()
    }

    pub async fn get_server(&self, name: &str) -> Result<ServerSnapshot> {
        let client = self.client(name).await?;
        Ok(snapshot_of(&client))
    }

    /// Connectivity check over the named servers (all when empty). With
    /// `fix`, disconnected-but-active servers get a reconnect attempt.
    pub async fn health_check(&self, names: &[String], fix: bool) -> Vec<HealthReport> {
        let clients = if names.is_empty() {
            self.fleet.all_clients().await
        } else {
            let mut selected = Vec::new();
            for name in names {
                if let Some(client) = self.fleet.get_client(name).await {
                    selected.push(client);
                }
            }
            selected
        };

        let mut reports = Vec::new();
        for client in clients {
            let name = client.name().to_string();
            if client.is_connected() {
                reports.push(HealthReport {
                    name,
                    healthy: true,
                    detail: "connected".to_string(),
                });
                continue;
            }

            let state = client.server_state();
            if fix && state == ServerState::Active {
                let detail = match client.connect(&self.cancel.child_token()).await {
                    Ok(()) => "reconnected".to_string(),
                    Err(e) => format!("reconnect failed: {e}"),
                };
                let healthy = client.is_connected();
                reports.push(HealthReport {
                    name,
                    healthy,
                    detail,
                });
            } else {
                reports.push(HealthReport {
                    name,
                    healthy: false,
                    detail: format!("{state}, {}", client.connection_state()),
                });
            }
        }
        reports
    }

    pub fn subscribe_events(&self, event_type: EventType) -> mpsc::Receiver<Event> {
        self.bus.subscribe(event_type)
    }

    pub fn subscribe_all_events(&self) -> mpsc::Receiver<Event> {
        self.bus.subscribe_all()
    }

    pub fn app_state(&self) -> AppState {
        *self.app_state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    pub fn store(&self) -> Arc<StateStore> {
        Arc::clone(&self.store)
    }

    pub fn coordinator(&self) -> Arc<ShutdownCoordinator> {
        Arc::clone(&self.coordinator)
    }

    pub fn processes(&self) -> Arc<ProcessRegistry> {
        Arc::clone(&self.processes)
    }

    // ---- shutdown --------------------------------------------------------

    /// Runs the phased shutdown. Safe to call repeatedly; later calls return
    /// the first result.
    pub async fn shutdown(&self) -> ShutdownReport {
        if self.coordinator.has_run() {
            return self.coordinator.shutdown().await;
        }

        self.cancel.cancel();
        self.set_app_state(AppState::Stopping);
        let report = self.coordinator.shutdown().await;
        self.set_app_state(AppState::Stopped);
        self.bus.close();
        report
    }

    // ---- internals -------------------------------------------------------

    async fn client(&self, name: &str) -> Result<Arc<ManagedClient>> {
        self.fleet
            .get_client(name)
            .await
            .ok_or_else(|| ProxyError::ServerNotFound(name.to_string()))
    }

    fn spawn_connect(&self, client: Arc<ManagedClient>) {
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            if let Err(e) = client.connect(&cancel).await {
                warn!(server = %client.name(), error = %e, "background connect failed");
            }
        });
    }

    fn set_app_state(&self, new: AppState) {
        let mut guard = self.app_state.lock().unwrap_or_else(|e| e.into_inner());
        let old = *guard;
        if old == new {
            return;
        }
        *guard = new;
        drop(guard);
        info!(from = %old, to = %new, "application state changed");
        self.bus.publish(Event::app_state_changed(old, new));
    }

    fn persist_config(&self) -> Result<()> {
        let Some(path) = &self.config_path else {
            return Ok(());
        };
        if let Some(watcher) = self
            .watcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            watcher.suppress_next_reload();
        }
        let config = self.lock_config_read().clone();
        config
            .save_atomic(path)
            .map_err(|e| ProxyError::Persistence(format!("{e:#}")))
    }

    fn spawn_config_watcher(&self, path: PathBuf) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<ProxyConfig>();
        let watcher = ConfigWatcher::spawn(&path, move |config| {
            let _ = tx.send(config);
        })
        .map_err(|e| ProxyError::Config(format!("{e:#}")))?;
        *self.watcher.lock().unwrap_or_else(|e| e.into_inner()) = Some(watcher);

        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            while let Some(config) = rx.recv().await {
                let Some(supervisor) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = supervisor.apply_config(config).await {
                    error!(error = %e, "failed to apply reloaded config");
                }
            }
        });
        Ok(())
    }

    /// Applies an externally edited config: add new servers, drop removed
    /// ones, recreate changed ones. Runtime auto-disables still outrank
    /// reloaded `active` entries.
    pub async fn apply_config(&self, new: ProxyConfig) -> Result<()> {
        let previous_names = self.fleet.server_names().await;

        for name in &previous_names {
            if new.server(name).is_none() {
                info!(server = %name, "server removed from config");
                self.fleet.remove_server(name).await?;
                self.store.remove(name)?;
                self.tracker.reset(name);
            }
        }

        for server in &new.servers {
            let known = previous_names.iter().any(|n| n == &server.name);
            let mut effective = self.reconciled(server.clone())?;

            // An operator explicitly parking a server in a non-connectable
            // mode takes control back from the runtime protection.
            if known && !server.startup_mode.is_connectable() {
                self.store
                    .clear_auto_disable(&server.name, server.startup_mode)?;
                effective.startup_mode = server.startup_mode;
                effective.auto_disable_reason = None;
            }

            let client = self.fleet.add_server(effective).await?;
            if !known {
                info!(server = %server.name, "server added from config");
                self.store
                    .upsert(&UpstreamRecord::new(&server.name, client.server_state()))?;
            }
            if client.server_state() == ServerState::Active && !client.is_connected() {
                self.spawn_connect(client);
            } else if !client.server_state().is_connectable() && client.is_connected() {
                client.disconnect("disabled by config change").await?;
            }
        }

        *self.lock_config_write() = new;
        self.bus.publish(Event::config_changed());
        Ok(())
    }

    fn lock_config_read(&self) -> std::sync::RwLockReadGuard<'_, ProxyConfig> {
        self.config.read().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_config_write(&self) -> std::sync::RwLockWriteGuard<'_, ProxyConfig> {
        self.config.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn snapshot_of(client: &Arc<ManagedClient>) -> ServerSnapshot {
    ServerSnapshot {
        name: client.name().to_string(),
        server_state: client.server_state(),
        connection: client.connection_info(),
        auto_disable_reason: client.auto_disable_reason(),
    }
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;
