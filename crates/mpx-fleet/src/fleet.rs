//! The fleet manager: owns every managed client and runs bounded-parallel
//! operations across them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mpx_client::{ClientSettings, Connector, DisablePersistence, ManagedClient, ProcessRegistry};
use mpx_config::{ProxyConfig, ServerConfig};
use mpx_core::{ProxyError, Result, ServerState};
use mpx_events::EventBus;

pub const DEFAULT_RETRY_PASSES: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Fleet-wide tunables resolved from the top-level config.
#[derive(Debug, Clone)]
pub struct FleetSettings {
    pub max_concurrent_connections: usize,
    /// Retry passes after the initial startup pass.
    pub retry_passes: u32,
    /// Backoff before the first retry pass; doubles per pass.
    pub retry_backoff: Duration,
    pub global_auto_disable_threshold: u32,
    pub default_connect_timeout: Duration,
    pub tool_cache_ttl: Duration,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            max_concurrent_connections: mpx_config::DEFAULT_MAX_CONCURRENT_CONNECTIONS,
            retry_passes: DEFAULT_RETRY_PASSES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            global_auto_disable_threshold: mpx_config::DEFAULT_AUTO_DISABLE_THRESHOLD,
            default_connect_timeout: mpx_config::DEFAULT_CONNECTION_TIMEOUT,
            tool_cache_ttl: Duration::from_secs(mpx_config::DEFAULT_TOOL_CACHE_TTL_SECS),
        }
    }
}

impl From<&ProxyConfig> for FleetSettings {
    fn from(config: &ProxyConfig) -> Self {
        Self {
            max_concurrent_connections: config.max_concurrent_connections.max(1),
            global_auto_disable_threshold: config.auto_disable_threshold,
            tool_cache_ttl: config.tool_cache_ttl(),
            ..Self::default()
        }
    }
}

/// Outcome of one `connect_all` run.
#[derive(Debug, Default)]
pub struct ConnectAllReport {
    pub attempted: usize,
    pub connected: Vec<String>,
    /// Servers that never reached `Ready`, with their final error.
    pub failed: Vec<(String, ProxyError)>,
}

impl ConnectAllReport {
    pub fn all_connected(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Holds the collection of managed clients, in insertion order.
pub struct FleetManager {
    clients: RwLock<Vec<Arc<ManagedClient>>>,
    settings: FleetSettings,
    connector: Arc<dyn Connector>,
    bus: Arc<EventBus>,
    processes: Arc<ProcessRegistry>,
    persistence: Option<Arc<dyn DisablePersistence>>,
}

impl FleetManager {
    pub fn new(
        settings: FleetSettings,
        connector: Arc<dyn Connector>,
        bus: Arc<EventBus>,
        processes: Arc<ProcessRegistry>,
        persistence: Option<Arc<dyn DisablePersistence>>,
    ) -> Self {
        Self {
            clients: RwLock::new(Vec::new()),
            settings,
            connector,
            bus,
            processes,
            persistence,
        }
    }

    pub fn processes(&self) -> Arc<ProcessRegistry> {
        Arc::clone(&self.processes)
    }

    /// Registers a server, constructing its managed client.
    ///
    /// Re-adding an existing name is a no-op unless the transport, isolation,
    /// or startup mode changed, in which case the client is torn down and
    /// recreated in place.
    pub async fn add_server(&self, config: ServerConfig) -> Result<Arc<ManagedClient>> {
        let mut clients = self.clients.write().await;

        if let Some(pos) = clients.iter().position(|c| c.name() == config.name) {
            let existing = Arc::clone(&clients[pos]);
            if !config.requires_recreate(existing.config()) {
                return Ok(existing);
            }
            info!(server = %config.name, "configuration changed, recreating client");
            existing.disconnect("configuration changed").await?;
            let client = self.build_client(config);
            clients[pos] = Arc::clone(&client);
            return Ok(client);
        }

        debug!(server = %config.name, mode = %config.startup_mode, "server registered");
        let client = self.build_client(config);
        clients.push(Arc::clone(&client));
        Ok(client)
    }

    /// Removes a server, disconnecting it first.
    pub async fn remove_server(&self, name: &str) -> Result<()> {
        let client = {
            let mut clients = self.clients.write().await;
            let pos = clients
                .iter()
                .position(|c| c.name() == name)
                .ok_or_else(|| ProxyError::ServerNotFound(name.to_string()))?;
            clients.remove(pos)
        };
        client.disconnect("server removed").await
    }

    pub async fn get_client(&self, name: &str) -> Option<Arc<ManagedClient>> {
        self.clients
            .read()
            .await
            .iter()
            .find(|c| c.name() == name)
            .cloned()
    }

    pub async fn all_clients(&self) -> Vec<Arc<ManagedClient>> {
        self.clients.read().await.clone()
    }

    pub async fn server_names(&self) -> Vec<String> {
        self.clients
            .read()
            .await
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    /// Connects every `active` server with bounded parallelism, then retries
    /// the stragglers over up to `retry_passes` backoff passes.
    ///
    /// Partial failure is normal: servers that exhaust their retries stay
    /// disconnected with their accumulated failure counts (or auto-disabled
    /// when the threshold tripped mid-startup).
    pub async fn connect_all(&self, cancel: &CancellationToken) -> ConnectAllReport {
        let mut pending: Vec<Arc<ManagedClient>> = self
            .all_clients()
            .await
            .into_iter()
            .filter(|c| c.server_state() == ServerState::Active && !c.is_connected())
            .collect();

        let mut report = ConnectAllReport {
            attempted: pending.len(),
            ..ConnectAllReport::default()
        };
        if pending.is_empty() {
            return report;
        }

        info!(
            servers = pending.len(),
            parallelism = self.settings.max_concurrent_connections,
            "connecting fleet"
        );

        for pass in 0..=self.settings.retry_passes {
            if pass > 0 {
                let backoff = self.settings.retry_backoff * 2u32.pow(pass - 1);
                debug!(pass, backoff_secs = backoff.as_secs(), "startup retry pass");
                for client in &pending {
                    client.mark_retrying();
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }

            let failures = self.run_connect_pass(&pending, cancel).await;

            for client in &pending {
                if client.is_connected() {
                    report.connected.push(client.name().to_string());
                }
            }

            // Only transport-level failures on still-eligible servers are
            // worth another pass.
            pending = failures
                .into_iter()
                .filter_map(|(client, error)| {
                    let retryable = matches!(
                        error,
                        ProxyError::Transport { .. } | ProxyError::ConnectTimeout { .. }
                    ) && client.server_state() == ServerState::Active;
                    if retryable && pass < self.settings.retry_passes {
                        Some(client)
                    } else {
                        report.failed.push((client.name().to_string(), error));
                        None
                    }
                })
                .collect();

            if pending.is_empty() || cancel.is_cancelled() {
                break;
            }
        }

        info!(
            connected = report.connected.len(),
            failed = report.failed.len(),
            "fleet startup finished"
        );
        report
    }

    /// Disconnects every client concurrently, aggregating all failures.
    pub async fn disconnect_all(&self) -> Result<()> {
        let clients = self.all_clients().await;
        let mut join_set = JoinSet::new();
        for client in clients {
            join_set.spawn(async move {
                let name = client.name().to_string();
                (name, client.disconnect("shutting down").await)
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((name, Err(e))) => failures.push(format!("{name}: {e}")),
                Err(e) => failures.push(format!("join error: {e}")),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            failures.sort();
            Err(ProxyError::Aggregate { failures })
        }
    }

    /// One bounded-parallel pass over `clients`, in insertion order.
    async fn run_connect_pass(
        &self,
        clients: &[Arc<ManagedClient>],
        cancel: &CancellationToken,
    ) -> Vec<(Arc<ManagedClient>, ProxyError)> {
        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrent_connections));
        let mut join_set = JoinSet::new();

        for client in clients {
            let client = Arc::clone(client);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            join_set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (client, Some(ProxyError::Cancelled));
                };
                if cancel.is_cancelled() {
                    return (client, Some(ProxyError::Cancelled));
                }
                match client.connect(&cancel).await {
                    Ok(()) => (client, None),
                    Err(e) => {
                        warn!(server = %client.name(), error = %e, "startup connect failed");
                        (client, Some(e))
                    }
                }
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            if let Ok((client, Some(error))) = joined {
                failures.push((client, error));
            }
        }
        failures
    }

    fn build_client(&self, config: ServerConfig) -> Arc<ManagedClient> {
        let settings = ClientSettings {
            connect_timeout: config
                .effective_connection_timeout(self.settings.default_connect_timeout),
            auto_disable_threshold: config
                .effective_auto_disable_threshold(self.settings.global_auto_disable_threshold),
            tool_cache_ttl: self.settings.tool_cache_ttl,
            health_check_interval: mpx_client::client::DEFAULT_HEALTH_INTERVAL,
        };
        ManagedClient::new(
            config,
            settings,
            Arc::clone(&self.connector),
            Arc::clone(&self.bus),
            Arc::clone(&self.processes),
            self.persistence.clone(),
        )
    }
}

#[cfg(test)]
#[path = "fleet_tests.rs"]
mod tests;
