//! Durable key-value storage for clone snapshots.
//!
//! The manager only needs `get`/`set`/`delete`/`keys`. Every caller works
//! through a [`NamespacedStore`] so unrelated components never collide on
//! keys, whichever backend sits underneath:
//!
//! - [`MemoryStore`] - process-local, for tests and ephemeral runs
//! - [`FileStore`] - one JSON file per key under a directory
//! - [`RedisStore`] - shared Redis instance

pub mod file;
pub mod memory;
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use crate::error::StoreError;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use self::redis::RedisStore;

/// Minimal key-value contract.
///
/// `keys` takes a glob pattern where `*` matches any run of characters and
/// `?` matches exactly one.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Returns the value stored under `key`, if present and not expired.
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Stores `value` under `key`, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>)
        -> Result<bool, StoreError>;

    /// Deletes `key`. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Returns every live key matching `pattern`.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;
}

/// A compiled `keys` pattern: `*` matches any run of characters and `?`
/// exactly one. Everything else matches literally.
#[derive(Debug, Clone)]
pub struct KeyPattern(Regex);

impl KeyPattern {
    pub fn new(pattern: &str) -> Result<Self, StoreError> {
        let mut source = String::from("(?s)^");
        let mut literal = [0u8; 4];
        for c in pattern.chars() {
            match c {
                '*' => source.push_str(".*"),
                '?' => source.push('.'),
                other => source.push_str(&regex::escape(other.encode_utf8(&mut literal))),
            }
        }
        source.push('$');
        Ok(Self(Regex::new(&source)?))
    }

    pub fn matches(&self, key: &str) -> bool {
        self.0.is_match(key)
    }
}

/// A view of a store where every key is prefixed with `<namespace>:`.
#[derive(Clone)]
pub struct NamespacedStore {
    inner: Arc<dyn KeyValueStore>,
    prefix: String,
}

impl NamespacedStore {
    /// Wraps `inner`, prefixing keys with `namespace`.
    pub fn new(inner: Arc<dyn KeyValueStore>, namespace: impl Into<String>) -> Self {
        Self {
            inner,
            prefix: format!("{}:", namespace.into()),
        }
    }

    /// The namespace, without the trailing separator.
    pub fn namespace(&self) -> &str {
        self.prefix.trim_end_matches(':')
    }

    fn full_key(&self, key: &str) -> Result<String, StoreError> {
        if key.is_empty() {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(format!("{}{}", self.prefix, key))
    }
}

impl std::fmt::Debug for NamespacedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespacedStore")
            .field("namespace", &self.namespace())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl KeyValueStore for NamespacedStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.inner.get(&self.full_key(key)?).await
    }

    async fn set(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        self.inner.set(&self.full_key(key)?, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.delete(&self.full_key(key)?).await
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let keys = self
            .inner
            .keys(&format!("{}{}", self.prefix, pattern))
            .await?;
        Ok(keys
            .into_iter()
            .filter_map(|key| key.strip_prefix(&self.prefix).map(str::to_string))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn matches(pattern: &str, key: &str) -> bool {
        KeyPattern::new(pattern).unwrap().matches(key)
    }

    #[test]
    fn test_key_pattern() {
        assert!(matches("*", ""));
        assert!(matches("*", "anything"));
        assert!(matches("clone:*", "clone:abc"));
        assert!(!matches("clone:*", "queue:abc"));
        assert!(matches("c?one:*", "clone:1"));
        assert!(matches("*:done", "a:b:done"));
        assert!(!matches("*:done", "a:b:don"));
        assert!(matches("a*b*c", "axxbyyc"));
        assert!(!matches("a*b*c", "axxbyy"));
        assert!(matches("exact", "exact"));
        assert!(!matches("exact", "exactly"));
    }

    #[test]
    fn test_key_pattern_treats_regex_syntax_literally() {
        assert!(matches("clone.[1]+", "clone.[1]+"));
        assert!(!matches("clone.[1]+", "clonex1"));
        assert!(matches("(a|b)*", "(a|b):tail"));
        assert!(!matches("(a|b)*", "a:tail"));
    }

    #[tokio::test]
    async fn test_namespaces_do_not_collide() {
        let backend: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let manager = NamespacedStore::new(Arc::clone(&backend), "manager");
        let other = NamespacedStore::new(Arc::clone(&backend), "other");

        manager.set("clone:1", json!({"a": 1}), None).await.unwrap();
        other.set("clone:1", json!({"b": 2}), None).await.unwrap();

        assert_eq!(manager.get("clone:1").await.unwrap(), Some(json!({"a": 1})));
        assert_eq!(other.get("clone:1").await.unwrap(), Some(json!({"b": 2})));
        assert_eq!(manager.keys("clone:*").await.unwrap(), vec!["clone:1"]);

        assert!(manager.delete("clone:1").await.unwrap());
        assert_eq!(manager.get("clone:1").await.unwrap(), None);
        assert_eq!(other.get("clone:1").await.unwrap(), Some(json!({"b": 2})));

        let mut raw = backend.keys("*").await.unwrap();
        raw.sort();
        assert_eq!(raw, vec!["other:clone:1"]);
    }

    #[tokio::test]
    async fn test_namespaced_rejects_empty_key() {
        let store = NamespacedStore::new(Arc::new(MemoryStore::new()), "ns");
        assert!(matches!(
            store.get("").await,
            Err(StoreError::InvalidKey(_))
        ));
        assert_eq!(store.namespace(), "ns");
    }
}
