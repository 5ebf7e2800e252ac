use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use mpx_core::ServerState;

/// Transport descriptor for one upstream.
///
/// Serialized with `#[serde(tag = "protocol")]` so JSON carries
/// `"protocol": "stdio"` etc.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "protocol")]
pub enum TransportConfig {
    /// Spawn a child process speaking MCP over stdin/stdout.
    #[serde(rename = "stdio")]
    Stdio {
        command: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        env: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        working_dir: Option<PathBuf>,
    },
    #[serde(rename = "http")]
    Http {
        url: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
    /// Legacy SSE endpoint; connected through the streamable-HTTP client.
    #[serde(rename = "sse")]
    Sse {
        url: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
    #[serde(rename = "streamable-http")]
    StreamableHttp {
        url: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
}

impl TransportConfig {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Stdio { .. } => "stdio",
            Self::Http { .. } => "http",
            Self::Sse { .. } => "sse",
            Self::StreamableHttp { .. } => "streamable-http",
        }
    }

    pub fn is_stdio(&self) -> bool {
        matches!(self, Self::Stdio { .. })
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Stdio { .. } => None,
            Self::Http { url, .. } | Self::Sse { url, .. } | Self::StreamableHttp { url, .. } => {
                Some(url)
            }
        }
    }
}

/// Optional container isolation for stdio upstreams.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IsolationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
}

/// Desired configuration for one upstream server.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ServerConfig {
    pub name: String,
    #[serde(flatten)]
    pub transport: TransportConfig,
    pub startup_mode: ServerState,
    /// Opaque OAuth block, passed through to the transport layer untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth: Option<Value>,
    /// Per-server handshake timeout; `None` inherits the global default.
    #[serde(
        default,
        with = "crate::duration::opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub connection_timeout: Option<Duration>,
    /// Consecutive failures before auto-disable; 0 inherits the global value.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub auto_disable_threshold: u32,
    /// Set by the supervisor while `startup_mode = auto_disabled`. Read-only
    /// for the operator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_disable_reason: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub health_check: bool,
    #[serde(
        default,
        with = "crate::duration::opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub health_check_interval: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation: Option<IsolationConfig>,
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

impl ServerConfig {
    pub fn stdio(name: &str, command: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            transport: TransportConfig::Stdio {
                command: command.to_string(),
                args: args.iter().map(ToString::to_string).collect(),
                env: HashMap::new(),
                working_dir: None,
            },
            startup_mode: ServerState::Active,
            oauth: None,
            connection_timeout: None,
            auto_disable_threshold: 0,
            auto_disable_reason: None,
            health_check: false,
            health_check_interval: None,
            isolation: None,
        }
    }

    pub fn http(name: &str, url: &str) -> Self {
        Self {
            transport: TransportConfig::Http {
                url: url.to_string(),
                headers: HashMap::new(),
            },
            ..Self::stdio(name, "", &[])
        }
    }

    /// Per-server timeout, falling back to the supplied global default.
    /// Zero counts as unset.
    pub fn effective_connection_timeout(&self, default: Duration) -> Duration {
        match self.connection_timeout {
            Some(timeout) if !timeout.is_zero() => timeout,
            _ => default,
        }
    }

    /// Per-server threshold if set, else the global one.
    pub fn effective_auto_disable_threshold(&self, global: u32) -> u32 {
        if self.auto_disable_threshold > 0 {
            self.auto_disable_threshold
        } else {
            global
        }
    }

    /// Whether replacing `other` with `self` requires tearing down and
    /// recreating the managed client.
    pub fn requires_recreate(&self, other: &Self) -> bool {
        self.transport != other.transport
            || self.isolation != other.isolation
            || self.startup_mode != other.startup_mode
    }
}

/// Custom deserializer that accepts current and deprecated layouts.
///
/// Handles:
/// 1. Explicit `protocol` field (including `"auto"` inference).
/// 2. No `protocol` + `command` present -> stdio; `url` present -> streamable.
/// 3. Deprecated boolean flags (`enabled`, `quarantined`, `auto_disabled`,
///    `start_on_boot`, `stopped`) migrated into `startup_mode` when it is
///    absent. They are never written back.
impl<'de> Deserialize<'de> for ServerConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            name: String,
            protocol: Option<String>,
            // Stdio fields
            command: Option<String>,
            #[serde(default)]
            args: Vec<String>,
            #[serde(default)]
            env: HashMap<String, String>,
            working_dir: Option<PathBuf>,
            // Remote fields
            url: Option<String>,
            #[serde(default)]
            headers: HashMap<String, String>,
            // Common
            startup_mode: Option<ServerState>,
            oauth: Option<Value>,
            #[serde(default, with = "crate::duration::opt")]
            connection_timeout: Option<Duration>,
            #[serde(default)]
            auto_disable_threshold: u32,
            auto_disable_reason: Option<String>,
            #[serde(default)]
            health_check: bool,
            #[serde(default, with = "crate::duration::opt")]
            health_check_interval: Option<Duration>,
            isolation: Option<IsolationConfig>,
            // Deprecated flags, accepted on read only
            enabled: Option<bool>,
            quarantined: Option<bool>,
            auto_disabled: Option<bool>,
            start_on_boot: Option<bool>,
            #[allow(dead_code)]
            stopped: Option<bool>,
        }

        let raw = Raw::deserialize(deserializer)?;

        let transport = resolve_transport(
            &raw.name,
            raw.protocol.as_deref(),
            raw.command,
            raw.args,
            raw.env,
            raw.working_dir,
            raw.url,
            raw.headers,
        )
        .map_err(serde::de::Error::custom)?;
        let startup_mode = match raw.startup_mode {
            Some(mode) => mode,
            None => migrate_deprecated_flags(
                raw.enabled,
                raw.quarantined,
                raw.auto_disabled,
                raw.start_on_boot,
            ),
        };

        Ok(ServerConfig {
            name: raw.name,
            transport,
            startup_mode,
            oauth: raw.oauth,
            connection_timeout: raw.connection_timeout,
            auto_disable_threshold: raw.auto_disable_threshold,
            auto_disable_reason: raw.auto_disable_reason,
            health_check: raw.health_check,
            health_check_interval: raw.health_check_interval,
            isolation: raw.isolation,
        })
    }
}

#[allow(clippy::too_many_arguments)]
fn resolve_transport(
    name: &str,
    protocol: Option<&str>,
    command: Option<String>,
    args: Vec<String>,
    env: HashMap<String, String>,
    working_dir: Option<PathBuf>,
    url: Option<String>,
    headers: HashMap<String, String>,
) -> Result<TransportConfig, String> {
    let require_command = |command: Option<String>| {
        command.filter(|c| !c.is_empty()).ok_or_else(|| {
            format!("server '{name}': protocol \"stdio\" requires a 'command' field")
        })
    };
    let require_url = |url: Option<String>, proto: &str| {
        url.filter(|u| !u.is_empty())
            .ok_or_else(|| format!("server '{name}': protocol \"{proto}\" requires a 'url' field"))
    };

    match protocol {
        Some("stdio") => Ok(TransportConfig::Stdio {
            command: require_command(command)?,
            args,
            env,
            working_dir,
        }),
        Some("http") => Ok(TransportConfig::Http {
            url: require_url(url, "http")?,
            headers,
        }),
        Some("sse") => Ok(TransportConfig::Sse {
            url: require_url(url, "sse")?,
            headers,
        }),
        Some("streamable-http") => Ok(TransportConfig::StreamableHttp {
            url: require_url(url, "streamable-http")?,
            headers,
        }),
        // "auto" and absent both infer from which fields are present.
        Some("auto") | None => {
            if let Some(command) = command.filter(|c| !c.is_empty()) {
                Ok(TransportConfig::Stdio {
                    command,
                    args,
                    env,
                    working_dir,
                })
            } else if let Some(url) = url.filter(|u| !u.is_empty()) {
                Ok(TransportConfig::StreamableHttp { url, headers })
            } else {
                Err(format!(
                    "server '{name}': cannot infer protocol; provide 'command' (stdio) \
                     or 'url' (http)"
                ))
            }
        }
        Some(other) => Err(format!(
            "server '{name}': unknown protocol '{other}' \
             (expected: stdio, http, sse, streamable-http, auto)"
        )),
    }
}

/// Migration priority for the deprecated boolean flags:
/// quarantined > auto_disabled > enabled && start_on_boot -> active >
/// enabled -> lazy_loading > else disabled.
fn migrate_deprecated_flags(
    enabled: Option<bool>,
    quarantined: Option<bool>,
    auto_disabled: Option<bool>,
    start_on_boot: Option<bool>,
) -> ServerState {
    if quarantined == Some(true) {
        return ServerState::Quarantined;
    }
    if auto_disabled == Some(true) {
        return ServerState::AutoDisabled;
    }
    match (enabled, start_on_boot) {
        (Some(true), Some(true)) => ServerState::Active,
        (Some(true), _) => ServerState::LazyLoading,
        (Some(false), _) => ServerState::Disabled,
        // No deprecated flags at all: a plain modern entry defaults to
        // connecting on startup.
        (None, _) => {
            if quarantined.is_none() && auto_disabled.is_none() && start_on_boot.is_none() {
                ServerState::Active
            } else {
                ServerState::Disabled
            }
        }
    }
}
