//! Proxy configuration: JSON model, validation, deprecated-field migration,
//! atomic writes, and file watching.

pub mod duration;
pub mod file;
pub mod server;
pub mod watcher;

pub use duration::{format_duration, parse_duration};
pub use file::{
    DEFAULT_AUTO_DISABLE_THRESHOLD, DEFAULT_CONNECTION_TIMEOUT,
    DEFAULT_MAX_CONCURRENT_CONNECTIONS, DEFAULT_TOOL_CACHE_TTL_SECS, ProxyConfig,
};
pub use server::{IsolationConfig, ServerConfig, TransportConfig};
pub use watcher::ConfigWatcher;
