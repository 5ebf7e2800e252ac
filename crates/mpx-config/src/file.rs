use std::collections::HashSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::server::ServerConfig;

pub const DEFAULT_MAX_CONCURRENT_CONNECTIONS: usize = 10;
pub const DEFAULT_AUTO_DISABLE_THRESHOLD: u32 = 5;
pub const DEFAULT_TOOL_CACHE_TTL_SECS: u64 = 300;
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Top-level proxy configuration (`mcpproxy.json`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProxyConfig {
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_connections: usize,
    /// Global consecutive-failure threshold; per-server values override it.
    #[serde(default = "default_threshold")]
    pub auto_disable_threshold: u32,
    /// Mirror auto-disable decisions into this file, not only the database.
    #[serde(default)]
    pub persist_auto_disable_to_config: bool,
    #[serde(default)]
    pub enable_lazy_loading: bool,
    /// Tool list cache TTL in seconds.
    #[serde(default = "default_tool_cache_ttl")]
    pub tool_cache_ttl: u64,
    /// Directory for the runtime database; defaults next to the config file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    /// Pass unredacted secret-looking env vars through to stdio children.
    #[serde(default)]
    pub expose_secret_env: bool,
}

fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT_CONNECTIONS
}

fn default_threshold() -> u32 {
    DEFAULT_AUTO_DISABLE_THRESHOLD
}

fn default_tool_cache_ttl() -> u64 {
    DEFAULT_TOOL_CACHE_TTL_SECS
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            max_concurrent_connections: DEFAULT_MAX_CONCURRENT_CONNECTIONS,
            auto_disable_threshold: DEFAULT_AUTO_DISABLE_THRESHOLD,
            persist_auto_disable_to_config: false,
            enable_lazy_loading: false,
            tool_cache_ttl: DEFAULT_TOOL_CACHE_TTL_SECS,
            data_dir: None,
            expose_secret_env: false,
        }
    }
}

impl ProxyConfig {
    /// Loads and validates a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        let mut config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates invariants, coercing recoverable mistakes with a warning.
    pub fn validate(&mut self) -> Result<()> {
        let mut seen = HashSet::new();
        for server in &self.servers {
            if server.name.is_empty() {
                bail!("server with empty name");
            }
            if !seen.insert(server.name.as_str()) {
                bail!("duplicate server name '{}'", server.name);
            }
        }

        if self.max_concurrent_connections == 0 {
            warn!(
                default = DEFAULT_MAX_CONCURRENT_CONNECTIONS,
                "max_concurrent_connections = 0 is invalid, using default"
            );
            self.max_concurrent_connections = DEFAULT_MAX_CONCURRENT_CONNECTIONS;
        }
        if self.tool_cache_ttl == 0 {
            self.tool_cache_ttl = DEFAULT_TOOL_CACHE_TTL_SECS;
        }
        Ok(())
    }

    /// Writes the config atomically: `<path>.tmp`, best-effort fsync, rename.
    ///
    /// Deprecated fields never appear in the output; serialization only emits
    /// the current schema.
    pub fn save_atomic(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("failed to serialize config")?;
        let tmp = path.with_extension("json.tmp");

        fs::write(&tmp, json.as_bytes())
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        if let Ok(file) = File::open(&tmp) {
            let _ = file.sync_all();
        }
        fs::rename(&tmp, path).with_context(|| {
            format!("failed to rename {} over {}", tmp.display(), path.display())
        })?;
        Ok(())
    }

    pub fn server(&self, name: &str) -> Option<&ServerConfig> {
        self.servers.iter().find(|s| s.name == name)
    }

    pub fn server_mut(&mut self, name: &str) -> Option<&mut ServerConfig> {
        self.servers.iter_mut().find(|s| s.name == name)
    }

    pub fn tool_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.tool_cache_ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mpx_core::ServerState;
    use tempfile::tempdir;

    fn write_config(dir: &Path, raw: &str) -> PathBuf {
        let path = dir.join("mcpproxy.json");
        fs::write(&path, raw).unwrap();
        path
    }

    #[test]
    fn test_load_defaults() {
        let dir = tempdir().unwrap();
        let path = write_config(dir.path(), "{}");
        let config = ProxyConfig::load(&path).unwrap();
        assert_eq!(config, ProxyConfig::default());
        assert_eq!(config.max_concurrent_connections, 10);
        assert_eq!(config.auto_disable_threshold, 5);
        assert_eq!(config.tool_cache_ttl, 300);
    }

    #[test]
    fn test_load_servers_with_deprecated_flags() {
        let dir = tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"{
                "servers": [
                    {"name": "a", "command": "echo", "enabled": true, "start_on_boot": true},
                    {"name": "b", "url": "https://b/mcp", "quarantined": true}
                ]
            }"#,
        );
        let config = ProxyConfig::load(&path).unwrap();
        assert_eq!(config.servers[0].startup_mode, ServerState::Active);
        assert_eq!(config.servers[1].startup_mode, ServerState::Quarantined);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let dir = tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"{"servers": [
                {"name": "a", "command": "echo"},
                {"name": "a", "command": "true"}
            ]}"#,
        );
        let err = ProxyConfig::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("duplicate server name 'a'"));
    }

    #[test]
    fn test_zero_max_concurrent_coerced_to_default() {
        let dir = tempdir().unwrap();
        let path = write_config(dir.path(), r#"{"max_concurrent_connections": 0}"#);
        let config = ProxyConfig::load(&path).unwrap();
        assert_eq!(config.max_concurrent_connections, 10);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mcpproxy.json");

        let mut config = ProxyConfig::default();
        config.servers.push(ServerConfig::stdio("a", "echo", &["hi"]));
        config.servers.push(ServerConfig::http("b", "https://b/mcp"));
        config.max_concurrent_connections = 4;

        config.save_atomic(&path).unwrap();
        let loaded = ProxyConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_saved_file_never_contains_deprecated_keys() {
        let dir = tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"{"servers": [
                {"name": "a", "command": "echo", "enabled": true, "stopped": false,
                 "start_on_boot": true, "quarantined": false, "auto_disabled": false}
            ]}"#,
        );
        let config = ProxyConfig::load(&path).unwrap();

        let out = dir.path().join("out.json");
        config.save_atomic(&out).unwrap();
        let written = fs::read_to_string(&out).unwrap();
        for key in ["enabled", "quarantined", "auto_disabled", "start_on_boot", "stopped"] {
            assert!(!written.contains(key), "deprecated key '{key}' in output");
        }
    }

    #[test]
    fn test_load_missing_file_fails_with_path() {
        let err = ProxyConfig::load(Path::new("/nonexistent/mcpproxy.json")).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/mcpproxy.json"));
    }

    #[test]
    fn test_load_invalid_json_fails() {
        let dir = tempdir().unwrap();
        let path = write_config(dir.path(), "{");
        let err = ProxyConfig::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("failed to parse config"));
    }

    #[test]
    fn test_server_lookup() {
        let mut config = ProxyConfig::default();
        config.servers.push(ServerConfig::stdio("a", "echo", &[]));
        assert!(config.server("a").is_some());
        assert!(config.server("missing").is_none());
        config.server_mut("a").unwrap().health_check = true;
        assert!(config.server("a").unwrap().health_check);
    }
}
