//! The managed client: owns one transport, one state machine, and the
//! connection protocol around them.

use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mpx_config::ServerConfig;
use mpx_core::{
    ConnectionInfo, ConnectionState, FailureOutcome, ProxyError, Result, ServerState,
    ServerStateMachine, Transition,
};
use mpx_events::{Event, EventBus};

use crate::health;
use crate::process::ProcessRegistry;
use crate::tools::{ToolCache, ToolDescriptor};
use crate::transport::{ConnectError, ConnectedTransport, Connector, connect_with_timeout};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(30);

/// Writes auto-disable decisions durably before the in-memory transition is
/// allowed to stand. Implemented by the supervisor over the state store.
pub trait DisablePersistence: Send + Sync {
    fn persist_auto_disable(&self, server: &str, reason: &str) -> Result<()>;
}

/// Effective per-client tunables, resolved from config defaults.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub connect_timeout: Duration,
    /// Effective consecutive-failure threshold for this server.
    pub auto_disable_threshold: u32,
    pub tool_cache_ttl: Duration,
    pub health_check_interval: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            auto_disable_threshold: mpx_core::DEFAULT_AUTO_DISABLE_THRESHOLD,
            tool_cache_ttl: Duration::from_secs(300),
            health_check_interval: DEFAULT_HEALTH_INTERVAL,
        }
    }
}

struct HealthTask {
    token: CancellationToken,
    _handle: JoinHandle<()>,
}

/// One upstream server as managed by the fleet.
///
/// Owns the transport handle, the administrative state machine, and the
/// runtime connection info. All connection-state transitions are serialized
/// through the transport lock; observers get a monotonic sequence via the
/// watch channel.
pub struct ManagedClient {
    name: String,
    config: ServerConfig,
    settings: ClientSettings,
    machine: ServerStateMachine,
    info: StdMutex<ConnectionInfo>,
    state_tx: watch::Sender<ConnectionState>,
    transport: AsyncMutex<Option<Box<dyn ConnectedTransport>>>,
    connector: Arc<dyn Connector>,
    bus: Arc<EventBus>,
    tool_cache: ToolCache,
    processes: Arc<ProcessRegistry>,
    persistence: Option<Arc<dyn DisablePersistence>>,
    health: StdMutex<Option<HealthTask>>,
    /// Handle to ourselves for background tasks; never keeps the client
    /// alive on its own.
    weak_self: Weak<ManagedClient>,
}

impl ManagedClient {
    pub fn new(
        config: ServerConfig,
        settings: ClientSettings,
        connector: Arc<dyn Connector>,
        bus: Arc<EventBus>,
        processes: Arc<ProcessRegistry>,
        persistence: Option<Arc<dyn DisablePersistence>>,
    ) -> Arc<Self> {
        let machine = match (&config.startup_mode, &config.auto_disable_reason) {
            (ServerState::AutoDisabled, Some(reason)) => {
                ServerStateMachine::restore_auto_disabled(reason.clone())
            }
            (mode, _) => ServerStateMachine::new(*mode),
        };
        let tool_cache = ToolCache::new(settings.tool_cache_ttl);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        Arc::new_cyclic(|weak_self| Self {
            name: config.name.clone(),
            info: StdMutex::new(ConnectionInfo::new(settings.auto_disable_threshold)),
            config,
            settings,
            machine,
            state_tx,
            transport: AsyncMutex::new(None),
            connector,
            bus,
            tool_cache,
            processes,
            persistence,
            health: StdMutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn server_state(&self) -> ServerState {
        self.machine.state()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Ready
    }

    pub fn auto_disable_reason(&self) -> Option<String> {
        self.machine.auto_disable_reason()
    }

    /// Snapshot of the runtime metrics.
    pub fn connection_info(&self) -> ConnectionInfo {
        let mut snapshot = self.lock_info().clone();
        snapshot.state = self.connection_state();
        snapshot
    }

    pub fn set_user_stopped(&self, stopped: bool) {
        self.lock_info().user_stopped = stopped;
    }

    /// Applies an administrative transition. The caller (supervisor) is
    /// responsible for publishing the resulting event and for tearing down
    /// the transport when the new state forbids one.
    pub fn transition(&self, to: ServerState) -> Result<Transition> {
        let transition = self.machine.transition(to)?;
        if to == ServerState::Active || transition.from == ServerState::AutoDisabled {
            self.lock_info().consecutive_failures = 0;
        }
        Ok(transition)
    }

    /// Establishes the transport and runs the MCP handshake.
    ///
    /// Fails with `NotEligible` unless the administrative state allows a
    /// connection. Already-connected clients return `Ok` immediately.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(ProxyError::Cancelled);
        }
        let state = self.machine.state();
        if !state.is_connectable() {
            return Err(ProxyError::NotEligible {
                server: self.name.clone(),
                state,
            });
        }

        let mut guard = self.transport.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        self.set_connection_state(ConnectionState::Connecting);
        {
            let mut info = self.lock_info();
            if info.consecutive_failures > 0 {
                info.total_retries = info.total_retries.saturating_add(1);
            }
        }

        let timeout = self
            .config
            .effective_connection_timeout(self.settings.connect_timeout);
        let connected = tokio::select! {
            _ = cancel.cancelled() => {
                self.set_connection_state(ConnectionState::Disconnected);
                return Err(ProxyError::Cancelled);
            }
            result = connect_with_timeout(self.connector.as_ref(), &self.config, timeout) => result,
        };

        match connected {
            Ok(transport) => {
                let handshake = transport.handshake();
                if let Some(pgid) = transport.process_group() {
                    self.processes.register(&self.name, pgid);
                }

                // Discover tools while still holding the transport slot so
                // the connected event can carry a real count.
                let tool_count = match transport.list_tools().await {
                    Ok(tools) => {
                        let count = tools.len();
                        self.store_discovered_tools(tools);
                        Some(count)
                    }
                    Err(e) => {
                        warn!(server = %self.name, error = %e, "tool discovery after connect failed");
                        None
                    }
                };

                *guard = Some(transport);
                drop(guard);

                self.machine.record_success();
                self.lock_info()
                    .record_success(handshake.name.clone(), handshake.version.clone());
                self.set_connection_state(ConnectionState::Ready);

                info!(
                    server = %self.name,
                    version = handshake.version.as_deref().unwrap_or("unknown"),
                    tools = tool_count.unwrap_or(0),
                    "upstream connected"
                );
                self.bus.publish(Event::server_connected(
                    &self.name,
                    handshake.version.as_deref(),
                    tool_count.unwrap_or(0),
                ));
                if let Some(count) = tool_count {
                    self.bus.publish(Event::tools_discovered(&self.name, count));
                }
                self.start_health_probe_if_configured();
                Ok(())
            }
            Err(err) => {
                drop(guard);
                let proxy_err = match err {
                    ConnectError::Timeout(d) => ProxyError::ConnectTimeout {
                        server: self.name.clone(),
                        timeout_secs: d.as_secs(),
                    },
                    ConnectError::Transport(e) => {
                        ProxyError::transport(&self.name, format!("{e:#}"))
                    }
                };

                self.set_connection_state(ConnectionState::Error);
                self.set_connection_state(ConnectionState::Disconnected);
                let reason = proxy_err.to_string();
                if let Some(persist_err) = self.count_failure(&reason) {
                    return Err(persist_err);
                }
                self.bus
                    .publish(Event::server_disconnected(&self.name, &reason));
                Err(proxy_err)
            }
        }
    }

    /// Tears the transport down: MCP goodbye, process-group kill for stdio
    /// children, container stop for isolated ones.
    pub async fn disconnect(&self, reason: &str) -> Result<()> {
        self.stop_health_probe();
        self.teardown_transport(reason).await;
        Ok(())
    }

    /// Lists the upstream's tools, serving cache hits without touching the
    /// transport. Lazy-loading clients connect on demand.
    pub async fn list_tools(&self, cancel: &CancellationToken) -> Result<Vec<ToolDescriptor>> {
        if let Some(tools) = self.tool_cache.get() {
            return Ok(tools);
        }

        self.ensure_connected(cancel).await?;

        let guard = self.transport.lock().await;
        let transport = guard.as_ref().ok_or_else(|| ProxyError::Transport {
            server: self.name.clone(),
            message: "not connected".to_string(),
        })?;

        let tools = tokio::select! {
            _ = cancel.cancelled() => return Err(ProxyError::Cancelled),
            result = transport.list_tools() => {
                result.map_err(|e| ProxyError::transport(&self.name, format!("{e:#}")))?
            }
        };
        drop(guard);

        let count = tools.len();
        self.store_discovered_tools(tools.clone());
        self.bus.publish(Event::tools_discovered(&self.name, count));
        Ok(tools)
    }

    /// Invokes one tool on the upstream.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        self.ensure_connected(cancel).await?;

        let guard = self.transport.lock().await;
        let transport = guard.as_ref().ok_or_else(|| ProxyError::Transport {
            server: self.name.clone(),
            message: "not connected".to_string(),
        })?;

        tokio::select! {
            _ = cancel.cancelled() => Err(ProxyError::Cancelled),
            result = transport.call_tool(tool, arguments) => {
                result.map_err(|e| ProxyError::transport(&self.name, format!("{e:#}")))
            }
        }
    }

    /// Blocks until the connection state equals `target`, bounded by
    /// `timeout`. Returns whether the state was reached.
    pub async fn wait_for_connection_state(
        &self,
        target: ConnectionState,
        timeout: Duration,
    ) -> bool {
        let mut rx = self.state_tx.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == target))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    /// Rolls an unpersisted auto-disable back. Exposed for the supervisor's
    /// manual re-enable path.
    pub fn rollback_auto_disable(&self, transition: &Transition) {
        self.machine.rollback_auto_disable(transition);
    }

    /// Reinstates the auto-disable reason after a rolled-back mode change.
    pub fn set_auto_disable_reason(&self, reason: &str) {
        self.machine.set_auto_disable_reason(reason);
    }

    /// Flags a disconnected client as queued for another startup pass.
    pub fn mark_retrying(&self) {
        if self.connection_state() == ConnectionState::Disconnected {
            self.set_connection_state(ConnectionState::Retrying);
        }
    }

    async fn ensure_connected(&self, cancel: &CancellationToken) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.connect(cancel).await
    }

    /// Counts one failure against the threshold, persisting and publishing
    /// an auto-disable when it trips. Returns a persistence error when the
    /// durable write failed and the transition was rolled back.
    fn count_failure(&self, reason: &str) -> Option<ProxyError> {
        self.lock_info().record_failure(reason);

        match self
            .machine
            .record_connection_failure(self.settings.auto_disable_threshold)
        {
            FailureOutcome::Ignored | FailureOutcome::Counted { .. } => None,
            FailureOutcome::AutoDisabled {
                transition,
                consecutive_failures,
                threshold,
                reason: disable_reason,
            } => {
                if let Some(persistence) = &self.persistence {
                    if let Err(e) = persistence.persist_auto_disable(&self.name, &disable_reason)
                    {
                        warn!(
                            server = %self.name,
                            error = %e,
                            "failed to persist auto-disable, rolling back"
                        );
                        self.machine.rollback_auto_disable(&transition);
                        return Some(e);
                    }
                }

                info!(server = %self.name, reason = %disable_reason, "upstream auto-disabled");
                self.bus.publish(Event::server_state_changed(
                    &self.name,
                    transition.from,
                    transition.to,
                ));
                self.bus.publish(Event::server_auto_disabled(
                    &self.name,
                    &disable_reason,
                    consecutive_failures,
                    threshold,
                ));
                None
            }
        }
    }

    async fn teardown_transport(&self, reason: &str) {
        let mut guard = self.transport.lock().await;
        let transport = guard.take();
        let was_connected = transport.is_some();
        if let Some(transport) = transport {
            transport.close().await;
            self.processes.unregister(&self.name);
        }
        drop(guard);

        self.tool_cache.invalidate();
        self.set_connection_state(ConnectionState::Disconnected);
        if was_connected {
            debug!(server = %self.name, reason = %reason, "upstream disconnected");
            self.bus
                .publish(Event::server_disconnected(&self.name, reason));
        }
    }

    fn store_discovered_tools(&self, tools: Vec<ToolDescriptor>) {
        let count = tools.len();
        let (_, changed) = self.tool_cache.store(&self.name, tools);
        let mut info = self.lock_info();
        info.tool_count = Some(count);
        if changed {
            debug!(server = %self.name, count, "tool list changed");
        }
    }

    fn start_health_probe_if_configured(&self) {
        if !self.config.health_check {
            return;
        }
        let interval = self
            .config
            .health_check_interval
            .unwrap_or(self.settings.health_check_interval);
        let token = CancellationToken::new();
        let handle =
            health::spawn_probe(self.weak_self.clone(), &self.name, interval, token.clone());
        let mut slot = self.lock_health();
        if let Some(previous) = slot.replace(HealthTask {
            token,
            _handle: handle,
        }) {
            previous.token.cancel();
        }
    }

    fn stop_health_probe(&self) {
        if let Some(task) = self.lock_health().take() {
            task.token.cancel();
        }
    }

    /// Probe hook: verifies the transport still answers. Broken transports
    /// are torn down and counted like connect failures.
    pub(crate) async fn run_health_probe(&self) {
        if !self.is_connected() {
            return;
        }

        let probe = {
            let guard = self.transport.lock().await;
            match guard.as_ref() {
                Some(transport) => transport.list_tools().await.map(|_| ()),
                None => return,
            }
        };

        if let Err(e) = probe {
            let reason = format!("health check failed: {e:#}");
            warn!(server = %self.name, error = %e, "health probe failed");
            self.teardown_transport(&reason).await;
            let _ = self.count_failure(&reason);
            if self.machine.state() == ServerState::AutoDisabled {
                self.stop_health_probe();
            }
        }
    }

    fn set_connection_state(&self, new: ConnectionState) {
        let old = *self.state_tx.borrow();
        if old == new {
            return;
        }
        self.lock_info().state = new;
        self.state_tx.send_replace(new);
        self.bus
            .publish(Event::connection_state_changed(&self.name, old, new));
    }

    fn lock_info(&self) -> std::sync::MutexGuard<'_, ConnectionInfo> {
        self.info.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_health(&self) -> std::sync::MutexGuard<'_, Option<HealthTask>> {
        self.health.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
