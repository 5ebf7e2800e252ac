use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use mpx_core::{AppState, ConnectionState, ServerState};

/// Lifecycle event categories published by the supervisor core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ServerStateChanged,
    ServerConnected,
    ServerDisconnected,
    ServerAutoDisabled,
    ServerRestartLoopDetected,
    AppStateChanged,
    ToolsDiscovered,
    ConfigChanged,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServerStateChanged => "server_state_changed",
            Self::ServerConnected => "server_connected",
            Self::ServerDisconnected => "server_disconnected",
            Self::ServerAutoDisabled => "server_auto_disabled",
            Self::ServerRestartLoopDetected => "server_restart_loop_detected",
            Self::AppStateChanged => "app_state_changed",
            Self::ToolsDiscovered => "tools_discovered",
            Self::ConfigChanged => "config_changed",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable lifecycle event.
///
/// The timestamp is stamped by the bus on enqueue when the publisher leaves
/// it unset.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    pub data: Map<String, Value>,
}

impl Event {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            server_name: None,
            timestamp: None,
            data: Map::new(),
        }
    }

    pub fn for_server(event_type: EventType, server: impl Into<String>) -> Self {
        Self {
            server_name: Some(server.into()),
            ..Self::new(event_type)
        }
    }

    /// Builder-style payload entry.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn server_state_changed(server: &str, old: ServerState, new: ServerState) -> Self {
        Self::for_server(EventType::ServerStateChanged, server)
            .with("old_state", old.as_str())
            .with("new_state", new.as_str())
    }

    /// Runtime transport-state change of one managed client. Shares the
    /// `server_state_changed` schema; the value vocabulary tells the two
    /// apart.
    pub fn connection_state_changed(
        server: &str,
        old: ConnectionState,
        new: ConnectionState,
    ) -> Self {
        Self::for_server(EventType::ServerStateChanged, server)
            .with("old_state", old.as_str())
            .with("new_state", new.as_str())
    }

    pub fn server_connected(server: &str, version: Option<&str>, tool_count: usize) -> Self {
        Self::for_server(EventType::ServerConnected, server)
            .with("server_version", version.map(str::to_owned))
            .with("tool_count", tool_count)
    }

    pub fn server_disconnected(server: &str, reason: &str) -> Self {
        Self::for_server(EventType::ServerDisconnected, server).with("reason", reason)
    }

    pub fn server_auto_disabled(
        server: &str,
        reason: &str,
        consecutive_failures: u32,
        threshold: u32,
    ) -> Self {
        Self::for_server(EventType::ServerAutoDisabled, server)
            .with("reason", reason)
            .with("consecutive_failures", consecutive_failures)
            .with("threshold", threshold)
    }

    pub fn server_restart_loop_detected(
        server: &str,
        restarts_in_window: u32,
        window_seconds: u64,
        cooldown_seconds: u64,
    ) -> Self {
        Self::for_server(EventType::ServerRestartLoopDetected, server)
            .with("restarts_in_window", restarts_in_window)
            .with("window_seconds", window_seconds)
            .with("cooldown_seconds", cooldown_seconds)
    }

    pub fn app_state_changed(old: AppState, new: AppState) -> Self {
        Self::new(EventType::AppStateChanged)
            .with("old_state", old.as_str())
            .with("new_state", new.as_str())
    }

    pub fn tools_discovered(server: &str, count: usize) -> Self {
        Self::for_server(EventType::ToolsDiscovered, server).with("count", count)
    }

    pub fn config_changed() -> Self {
        Self::new(EventType::ConfigChanged)
    }

    /// Convenience accessor for payload fields in tests and observers.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }
}

impl From<Event> for Value {
    fn from(event: Event) -> Self {
        json!({
            "type": event.event_type.as_str(),
            "server_name": event.server_name,
            "timestamp": event.timestamp,
            "data": Value::Object(event.data),
        })
    }
}
