use serde::{Deserialize, Serialize};

/// Administrative (desired) state of an upstream server. Persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    /// Connect on startup and keep connected.
    Active,
    /// Stay disconnected until a tool call demands a connection.
    LazyLoading,
    /// Administratively off; never connects.
    Disabled,
    /// Reachable but untrusted; tool invocation is blocked.
    Quarantined,
    /// Protective state entered after repeated connection failures.
    AutoDisabled,
}

impl ServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::LazyLoading => "lazy_loading",
            Self::Disabled => "disabled",
            Self::Quarantined => "quarantined",
            Self::AutoDisabled => "auto_disabled",
        }
    }

    /// Whether a server in this state may hold a live transport.
    pub fn is_connectable(&self) -> bool {
        matches!(self, Self::Active | Self::LazyLoading)
    }
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ServerState {
    type Err = crate::ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "lazy_loading" => Ok(Self::LazyLoading),
            "disabled" => Ok(Self::Disabled),
            "quarantined" => Ok(Self::Quarantined),
            "auto_disabled" => Ok(Self::AutoDisabled),
            other => Err(crate::ProxyError::Config(format!(
                "unknown startup_mode '{other}' (expected: active, lazy_loading, \
                 disabled, quarantined, auto_disabled)"
            ))),
        }
    }
}

/// Validates an administrative transition against the declared table.
///
/// Unknown pairs are denied: only the pairs listed here are legal, everything
/// else (including self-transitions) returns false.
pub const fn transition_allowed(from: ServerState, to: ServerState) -> bool {
    use ServerState::{Active, AutoDisabled, Disabled, LazyLoading, Quarantined};
    matches!(
        (from, to),
        (Active, LazyLoading | Disabled | Quarantined | AutoDisabled)
            | (LazyLoading, Active | Disabled | Quarantined | AutoDisabled)
            | (Disabled, Active | LazyLoading | Quarantined)
            | (Quarantined, Active | LazyLoading | Disabled)
            | (AutoDisabled, Active | LazyLoading | Disabled | Quarantined)
    )
}

/// Runtime transport state of one managed client. In memory only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Ready,
    Error,
    Retrying,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Error => "error",
            Self::Retrying => "retrying",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process-level lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppState {
    Starting,
    Running,
    Degraded,
    Stopping,
    Stopped,
}

impl AppState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Degraded => "degraded",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
