use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::Instant;

/// Errors surfaced by a coordination-store backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),
    #[error("coordination store error: {0}")]
    Backend(String),
    #[error("malformed record at {key}: {source}")]
    Codec {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Shared key/value store with per-key TTL, used for fleet-wide
/// heartbeat, health and metrics publication.
///
/// Every write carries a TTL so a crashed node's records decay without
/// explicit deregistration.
#[async_trait]
pub trait CoordStore: Send + Sync {
    /// Round-trip liveness probe.
    async fn ping(&self) -> StoreResult<()>;

    /// Write `value` under `key`, expiring after `ttl`.
    async fn set_ex(&self, key: &str, ttl: Duration, value: String) -> StoreResult<()>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Delete `key`. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// List every live key starting with `prefix`.
    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Release the backend connection. Further calls may fail.
    async fn close(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// Serialize `value` as JSON and write it with a TTL.
pub async fn put_json<T: Serialize + ?Sized>(
    store: &dyn CoordStore,
    key: &str,
    ttl: Duration,
    value: &T,
) -> StoreResult<()> {
    let json = serde_json::to_string(value).map_err(|source| StoreError::Codec {
        key: key.to_string(),
        source,
    })?;
    store.set_ex(key, ttl, json).await
}

/// Read and decode a JSON record. A missing key yields `Ok(None)`.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn CoordStore,
    key: &str,
) -> StoreResult<Option<T>> {
    match store.get(key).await? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| StoreError::Codec {
                key: key.to_string(),
                source,
            }),
        None => Ok(None),
    }
}

/// Open the store named by `url`.
///
/// - `memory://`: in-process store (single node / development)
/// - `etcd://host:2379[,host:2379...]`: etcd cluster
pub async fn connect(url: &str, op_timeout: Duration) -> anyhow::Result<Arc<dyn CoordStore>> {
    if url.starts_with("memory://") {
        return Ok(Arc::new(MemoryStore::new()));
    }
    match crate::etcd::EtcdStore::parse_endpoints(url) {
        Some(endpoints) => {
            let store = crate::etcd::EtcdStore::connect(&endpoints, op_timeout).await?;
            Ok(Arc::new(store))
        }
        None => anyhow::bail!(
            "Unsupported store URL '{}' (expected memory:// or etcd://host:port)",
            url
        ),
    }
}

// ============================================================================
// In-process backend
// ============================================================================

struct Entry {
    value: String,
    expires_at: Instant,
}

/// In-process store with lazy TTL expiry.
///
/// Used for single-node deployments (`memory://`) and as the test fixture.
/// Expiry follows `tokio::time`, so paused-clock tests can advance it.
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    offline: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            offline: AtomicBool::new(false),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: while offline every operation fails with
    /// `StoreError::Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of live (unexpired) keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_online(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        // A poisoned map still holds consistent entries; each write is a single insert.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl CoordStore for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        self.check_online()
    }

    async fn set_ex(&self, key: &str, ttl: Duration, value: String) -> StoreResult<()> {
        self.check_online()?;
        let expires_at = Instant::now() + ttl;
        self.lock()
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_online()?;
        let now = Instant::now();
        let mut map = self.lock();
        let expired = match map.get(key) {
            Some(entry) if entry.expires_at > now => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            map.remove(key);
        }
        Ok(None)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.check_online()?;
        self.lock().remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.check_online()?;
        let now = Instant::now();
        let mut map = self.lock();
        map.retain(|_, e| e.expires_at > now);
        let mut keys: Vec<String> = map
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Rec {
        n: u32,
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = MemoryStore::new();
        store
            .set_ex("a", Duration::from_secs(10), "1".into())
            .await
            .unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));
        store.delete("a").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
        // Deleting twice is fine
        store.delete("a").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let store = MemoryStore::new();
        store
            .set_ex("a", Duration::from_secs(5), "1".into())
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(store.get("a").await.unwrap().is_some());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.get("a").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_by_prefix_skips_expired() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(10);
        store.set_ex("node:heartbeat:a", ttl, "x".into()).await.unwrap();
        store
            .set_ex("node:heartbeat:b", Duration::from_secs(1), "x".into())
            .await
            .unwrap();
        store.set_ex("node:health:a", ttl, "x".into()).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        let keys = store.keys("node:heartbeat:").await.unwrap();
        assert_eq!(keys, vec!["node:heartbeat:a".to_string()]);
    }

    #[tokio::test]
    async fn test_offline_fails_every_operation() {
        let store = MemoryStore::new();
        store.set_offline(true);
        assert!(matches!(store.ping().await, Err(StoreError::Unavailable(_))));
        assert!(store.get("a").await.is_err());
        assert!(store.keys("").await.is_err());
        store.set_offline(false);
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_json_helpers() {
        let store = MemoryStore::new();
        put_json(&store, "r", Duration::from_secs(5), &Rec { n: 3 })
            .await
            .unwrap();
        let rec: Option<Rec> = get_json(&store, "r").await.unwrap();
        assert_eq!(rec, Some(Rec { n: 3 }));

        store
            .set_ex("bad", Duration::from_secs(5), "{not json".into())
            .await
            .unwrap();
        let bad: StoreResult<Option<Rec>> = get_json(&store, "bad").await;
        assert!(matches!(bad, Err(StoreError::Codec { .. })));

        let missing: Option<Rec> = get_json(&store, "missing").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_connect_memory_url() {
        let store = connect("memory://", Duration::from_secs(1)).await.unwrap();
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_scheme() {
        let result = connect("redis://localhost:6379", Duration::from_secs(1)).await;
        let err = format!("{}", result.err().unwrap());
        assert!(err.contains("Unsupported store URL"));
    }
}
