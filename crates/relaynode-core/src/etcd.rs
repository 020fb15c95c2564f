use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use etcd_client::{Client, GetOptions, PutOptions};
use tracing::debug;

use crate::store::{CoordStore, StoreError, StoreResult};

/// A granted lease is shared by writes with the same TTL for this fraction
/// of the TTL. Keys written late in the window live at least
/// `ttl * (1 - 1/LEASE_REUSE_DIVISOR)`.
const LEASE_REUSE_DIVISOR: u32 = 10;

/// Leases shared between writes, keyed by TTL in seconds.
///
/// Bounds live leases to about `LEASE_REUSE_DIVISOR` per TTL class no
/// matter how often keys are overwritten or how many history keys exist.
#[derive(Debug, Default)]
struct LeaseCache {
    leases: Mutex<HashMap<u64, (i64, Instant)>>,
}

impl LeaseCache {
    fn get(&self, ttl_secs: u64, now: Instant) -> Option<i64> {
        let window = Duration::from_secs(ttl_secs) / LEASE_REUSE_DIVISOR;
        let leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        leases
            .get(&ttl_secs)
            .filter(|(_, granted)| now.saturating_duration_since(*granted) < window)
            .map(|(id, _)| *id)
    }

    fn insert(&self, ttl_secs: u64, id: i64, granted: Instant) {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        leases.insert(ttl_secs, (id, granted));
    }

    /// Drop `id` if it is still the cached lease for `ttl_secs`.
    fn forget(&self, ttl_secs: u64, id: i64) {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        if leases.get(&ttl_secs).is_some_and(|(cached, _)| *cached == id) {
            leases.remove(&ttl_secs);
        }
    }
}

/// etcd-backed coordination store.
///
/// Per-key TTLs are implemented with leases: the key dies with its lease,
/// so a node that stops refreshing simply disappears. Writes with the same
/// TTL share a recently granted lease instead of granting one each.
pub struct EtcdStore {
    client: Client,
    op_timeout: Duration,
    leases: LeaseCache,
}

impl EtcdStore {
    /// Connect to an etcd cluster.
    pub async fn connect(endpoints: &[String], op_timeout: Duration) -> Result<Self> {
        let client = tokio::time::timeout(op_timeout, Client::connect(endpoints, None))
            .await
            .with_context(|| format!("Timed out connecting to etcd at {:?}", endpoints))?
            .with_context(|| format!("Failed to connect to etcd at {:?}", endpoints))?;
        debug!(endpoints = ?endpoints, "Connected to etcd");
        Ok(Self {
            client,
            op_timeout,
            leases: LeaseCache::default(),
        })
    }

    /// Parse `etcd://host1:2379,host2:2379` into gRPC endpoint URLs.
    pub fn parse_endpoints(url: &str) -> Option<Vec<String>> {
        let rest = url.strip_prefix("etcd://")?;
        let endpoints: Vec<String> = rest
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|host| format!("http://{host}"))
            .collect();
        if endpoints.is_empty() {
            None
        } else {
            Some(endpoints)
        }
    }

    async fn bounded<T, F>(&self, op: &str, fut: F) -> StoreResult<T>
    where
        F: Future<Output = std::result::Result<T, etcd_client::Error>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(StoreError::Backend(format!("{op}: {e}"))),
            Err(_) => Err(StoreError::Unavailable(format!(
                "{op} timed out after {}ms",
                self.op_timeout.as_millis()
            ))),
        }
    }

    async fn lease_for(&self, ttl_secs: u64) -> StoreResult<i64> {
        if let Some(id) = self.leases.get(ttl_secs, Instant::now()) {
            return Ok(id);
        }
        let mut client = self.client.clone();
        let granted = Instant::now();
        let lease = self
            .bounded("lease_grant", client.lease_grant(ttl_secs as i64, None))
            .await?;
        self.leases.insert(ttl_secs, lease.id(), granted);
        Ok(lease.id())
    }
}

#[async_trait]
impl CoordStore for EtcdStore {
    async fn ping(&self) -> StoreResult<()> {
        let mut client = self.client.clone();
        self.bounded("status", client.status()).await?;
        Ok(())
    }

    async fn set_ex(&self, key: &str, ttl: Duration, value: String) -> StoreResult<()> {
        let ttl_secs = ttl.as_secs().max(1);
        let lease = self.lease_for(ttl_secs).await?;
        let mut client = self.client.clone();
        let options = PutOptions::new().with_lease(lease);
        if let Err(e) = self.bounded("put", client.put(key, value, Some(options))).await {
            // The lease may have been revoked or expired server-side.
            self.leases.forget(ttl_secs, lease);
            return Err(e);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut client = self.client.clone();
        let resp = self.bounded("get", client.get(key, None)).await?;
        match resp.kvs().first() {
            Some(kv) => kv
                .value_str()
                .map(|v| Some(v.to_string()))
                .map_err(|e| StoreError::Backend(format!("non-utf8 value at {key}: {e}"))),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut client = self.client.clone();
        self.bounded("delete", client.delete(key, None)).await?;
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut client = self.client.clone();
        let options = GetOptions::new().with_prefix().with_keys_only();
        let resp = self
            .bounded("get prefix", client.get(prefix, Some(options)))
            .await?;
        let mut keys: Vec<String> = resp
            .kvs()
            .iter()
            .filter_map(|kv| kv.key_str().ok().map(str::to_string))
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoints() {
        let eps = EtcdStore::parse_endpoints("etcd://10.0.0.1:2379, 10.0.0.2:2379").unwrap();
        assert_eq!(eps, vec!["http://10.0.0.1:2379", "http://10.0.0.2:2379"]);
    }

    #[test]
    fn test_parse_endpoints_rejects_other_schemes() {
        assert!(EtcdStore::parse_endpoints("memory://").is_none());
        assert!(EtcdStore::parse_endpoints("etcd://").is_none());
    }

    #[test]
    fn test_lease_reused_within_window() {
        let cache = LeaseCache::default();
        let t0 = Instant::now();
        cache.insert(60, 7, t0);

        assert_eq!(cache.get(60, t0), Some(7));
        assert_eq!(cache.get(60, t0 + Duration::from_secs(5)), Some(7));
        // 60s / 10 = 6s reuse window.
        assert_eq!(cache.get(60, t0 + Duration::from_secs(6)), None);
    }

    #[test]
    fn test_lease_cache_is_per_ttl() {
        let cache = LeaseCache::default();
        let t0 = Instant::now();
        cache.insert(60, 7, t0);
        cache.insert(3600, 8, t0);

        assert_eq!(cache.get(60, t0), Some(7));
        assert_eq!(cache.get(3600, t0), Some(8));
        assert_eq!(cache.get(120, t0), None);
    }

    #[test]
    fn test_forget_only_drops_matching_lease() {
        let cache = LeaseCache::default();
        let t0 = Instant::now();
        cache.insert(60, 7, t0);

        cache.forget(60, 99);
        assert_eq!(cache.get(60, t0), Some(7));
        cache.forget(60, 7);
        assert_eq!(cache.get(60, t0), None);
    }
}
