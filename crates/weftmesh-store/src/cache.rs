//! Cache (C8): a TTL key/value accelerator in front of manifest lookups.
//!
//! There is no remote backend in this workspace's dependency stack, so the
//! "bounded in-memory fallback" the spec describes *is* the implementation —
//! operations never fail; they just miss (§4.8).

use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Default time-to-live for an entry with no explicit TTL (§4.8, §5).
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Upper bound on resident entries; `set` evicts the earliest-expiring entry
/// to make room rather than growing unbounded.
const MAX_ENTRIES: usize = 10_000;

fn now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

struct Entry {
    value: serde_json::Value,
    expires_at: u64,
}

/// Performance-only accelerator; never a source of truth (§4.8).
pub struct Cache {
    entries: RwLock<HashMap<String, Entry>>,
    default_ttl: Duration,
}

impl Cache {
    pub fn new() -> Self {
        Self::with_default_ttl(DEFAULT_TTL)
    }

    pub fn with_default_ttl(default_ttl: Duration) -> Self {
        Self { entries: RwLock::new(HashMap::new()), default_ttl }
    }

    /// Store `value` under `key` with an explicit TTL, or [`DEFAULT_TTL`]
    /// when `ttl` is `None`.
    pub fn set(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let expires_at = now() + ttl.as_secs();
        let mut entries = self.entries.write();
        if entries.len() >= MAX_ENTRIES && !entries.contains_key(key) {
            if let Some(oldest) = entries.iter().min_by_key(|(_, e)| e.expires_at).map(|(k, _)| k.clone()) {
                entries.remove(&oldest);
            }
        }
        entries.insert(key.to_string(), Entry { value, expires_at });
    }

    /// Fetch a live value, if present and unexpired.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let entries = self.entries.read();
        let entry = entries.get(key)?;
        if entry.expires_at <= now() {
            return None;
        }
        Some(entry.value.clone())
    }

    /// Remove an entry unconditionally.
    pub fn del(&self, key: &str) {
        self.entries.write().remove(key);
    }

    /// Whether a live (unexpired) entry exists for `key`.
    pub fn exists(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Drop every entry.
    pub fn flush(&self) {
        self.entries.write().clear();
    }

    /// Drop expired entries, returning how many were removed.
    pub fn cleanup(&self) -> usize {
        let at = now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > at);
        before - entries.len()
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_roundtrip() {
        let cache = Cache::new();
        cache.set("k", serde_json::json!({"a": 1}), None);
        assert_eq!(cache.get("k"), Some(serde_json::json!({"a": 1})));
        assert!(cache.exists("k"));
    }

    #[test]
    fn expired_entry_is_invisible() {
        let cache = Cache::new();
        cache.set("k", serde_json::json!(1), Some(Duration::from_secs(0)));
        assert_eq!(cache.get("k"), None);
        assert!(!cache.exists("k"));
    }

    #[test]
    fn del_and_flush() {
        let cache = Cache::new();
        cache.set("a", serde_json::json!(1), None);
        cache.set("b", serde_json::json!(2), None);
        cache.del("a");
        assert!(cache.get("a").is_none());
        cache.flush();
        assert!(cache.get("b").is_none());
    }

    #[test]
    fn cleanup_removes_only_expired() {
        let cache = Cache::new();
        cache.set("fresh", serde_json::json!(1), Some(Duration::from_secs(300)));
        cache.set("stale", serde_json::json!(2), Some(Duration::from_secs(0)));
        let removed = cache.cleanup();
        assert_eq!(removed, 1);
        assert!(cache.get("fresh").is_some());
    }
}
