//! Tool discovery cache, keyed by fingerprint with TTL expiry.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// One tool as reported by an upstream server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            input_schema: Value::Null,
        }
    }
}

/// Content hash of a server's tool list: server name plus sorted tool names.
pub fn tool_fingerprint(server: &str, tools: &[ToolDescriptor]) -> String {
    let mut names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    names.sort_unstable();

    let mut hasher = Sha256::new();
    hasher.update(server.as_bytes());
    for name in names {
        hasher.update([0u8]);
        hasher.update(name.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

struct CacheEntry {
    tools: Vec<ToolDescriptor>,
    fingerprint: String,
    fetched_at: Instant,
}

/// Per-client tool list cache.
pub struct ToolCache {
    ttl: Duration,
    entry: Mutex<Option<CacheEntry>>,
}

impl ToolCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entry: Mutex::new(None),
        }
    }

    /// Returns the cached list if present and fresh.
    pub fn get(&self) -> Option<Vec<ToolDescriptor>> {
        let guard = self.lock();
        let entry = guard.as_ref()?;
        if entry.fetched_at.elapsed() >= self.ttl {
            return None;
        }
        Some(entry.tools.clone())
    }

    /// Stores a freshly fetched list. Returns the new fingerprint and
    /// whether it differs from the previously cached one.
    pub fn store(&self, server: &str, tools: Vec<ToolDescriptor>) -> (String, bool) {
        let fingerprint = tool_fingerprint(server, &tools);
        let mut guard = self.lock();
        let changed = guard
            .as_ref()
            .is_none_or(|entry| entry.fingerprint != fingerprint);
        *guard = Some(CacheEntry {
            tools,
            fingerprint: fingerprint.clone(),
            fetched_at: Instant::now(),
        });
        (fingerprint, changed)
    }

    pub fn invalidate(&self) {
        *self.lock() = None;
    }

    pub fn fingerprint(&self) -> Option<String> {
        self.lock().as_ref().map(|e| e.fingerprint.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<CacheEntry>> {
        self.entry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tools(names: &[&str]) -> Vec<ToolDescriptor> {
        names.iter().map(|n| ToolDescriptor::new(*n)).collect()
    }

    #[test]
    fn test_fingerprint_ignores_order() {
        let a = tool_fingerprint("s1", &tools(&["read", "write"]));
        let b = tool_fingerprint("s1", &tools(&["write", "read"]));
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_depends_on_server_and_tools() {
        let base = tool_fingerprint("s1", &tools(&["read"]));
        assert_ne!(base, tool_fingerprint("s2", &tools(&["read"])));
        assert_ne!(base, tool_fingerprint("s1", &tools(&["read", "write"])));
    }

    #[test]
    fn test_empty_cache_misses() {
        let cache = ToolCache::new(Duration::from_secs(300));
        assert!(cache.get().is_none());
    }

    #[test]
    fn test_store_then_get_hits() {
        let cache = ToolCache::new(Duration::from_secs(300));
        let (fingerprint, changed) = cache.store("s1", tools(&["read"]));
        assert!(changed);
        assert_eq!(cache.fingerprint(), Some(fingerprint));

        let hit = cache.get().unwrap();
        assert_eq!(hit.len(), 1);
        assert_eq!(hit[0].name, "read");
    }

    #[test]
    fn test_expired_entry_misses() {
        let cache = ToolCache::new(Duration::ZERO);
        cache.store("s1", tools(&["read"]));
        assert!(cache.get().is_none());
    }

    #[test]
    fn test_restore_same_list_is_unchanged() {
        let cache = ToolCache::new(Duration::from_secs(300));
        cache.store("s1", tools(&["read", "write"]));
        let (_, changed) = cache.store("s1", tools(&["write", "read"]));
        assert!(!changed);
    }

    #[test]
    fn test_invalidate_clears() {
        let cache = ToolCache::new(Duration::from_secs(300));
        cache.store("s1", tools(&["read"]));
        cache.invalidate();
        assert!(cache.get().is_none());
        assert!(cache.fingerprint().is_none());
    }
}
