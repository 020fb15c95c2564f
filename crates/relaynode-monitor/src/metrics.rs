use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use relaynode_core::config::NodeConfig;
use relaynode_core::events::{EventBus, NodeEvent};
use relaynode_core::keys;
use relaynode_core::node::{FleetAggregate, NodeMetricsSample};
use relaynode_core::store::{CoordStore, get_json, put_json};
use relaynode_core::time::now_ms;
use relaynode_tunnel::SessionRegistry;
use tracing::{debug, warn};

use crate::host::HostProbe;

/// Default window for history queries.
pub const DEFAULT_RANGE: Duration = Duration::from_secs(3600);

/// Periodic sampler of host and tunnel load.
pub struct MetricsCollector {
    config: Arc<NodeConfig>,
    store: Arc<dyn CoordStore>,
    host: Arc<dyn HostProbe>,
    registry: SessionRegistry,
    events: EventBus,
    started: Instant,
}

impl MetricsCollector {
    pub fn new(
        config: Arc<NodeConfig>,
        store: Arc<dyn CoordStore>,
        host: Arc<dyn HostProbe>,
        registry: SessionRegistry,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            store,
            host,
            registry,
            events,
            started: Instant::now(),
        }
    }

    /// Build a sample from the host probe and the registry summary.
    pub fn sample(&self) -> NodeMetricsSample {
        let host = self.host.sample();
        let tunnel = self.registry.connection_summary();
        NodeMetricsSample {
            node_id: self.config.node.id.clone(),
            region: self.config.node.region.clone(),
            timestamp: now_ms(),
            connections: tunnel.total_connections as u64,
            packets_forwarded: tunnel.total_packets,
            bytes_transferred: tunnel.total_bytes,
            avg_latency: tunnel.avg_latency,
            cpu_usage: host.cpu_usage,
            memory_usage: host.memory_usage,
            network_load: host.network_load(self.config.metrics.network_capacity_mbps),
            uptime: self.started.elapsed().as_millis() as u64,
        }
    }

    /// One collection tick: sample, write history and latest, announce.
    pub async fn collect(&self) -> Result<NodeMetricsSample> {
        let sample = self.sample();
        let id = &self.config.node.id;

        put_json(
            self.store.as_ref(),
            &keys::metrics_sample(id, sample.timestamp),
            keys::METRICS_TTL,
            &sample,
        )
        .await
        .context("Failed to store metrics sample")?;
        put_json(
            self.store.as_ref(),
            &keys::latest_metrics(id),
            keys::LATEST_TTL,
            &sample,
        )
        .await
        .context("Failed to store latest metrics")?;

        debug!(
            connections = sample.connections,
            cpu = sample.cpu_usage,
            memory = sample.memory_usage,
            "Metrics collected"
        );
        self.events
            .emit(NodeEvent::MetricsCollected(Box::new(sample.clone())));
        Ok(sample)
    }

    /// This node's history within `range` (default one hour), oldest first.
    pub async fn get_metrics(&self, range: Option<Duration>) -> Result<Vec<NodeMetricsSample>> {
        let range = range.unwrap_or(DEFAULT_RANGE);
        let since = now_ms().saturating_sub(range.as_millis() as u64);
        let sample_keys = self
            .store
            .keys(&keys::metrics_prefix(&self.config.node.id))
            .await
            .context("Failed to list metrics samples")?;

        let mut samples = Vec::new();
        for key in sample_keys {
            match keys::metrics_sample_timestamp(&key) {
                Some(ts) if ts >= since => {}
                _ => continue,
            }
            match get_json::<NodeMetricsSample>(self.store.as_ref(), &key).await {
                Ok(Some(sample)) => samples.push(sample),
                Ok(None) => {}
                Err(e) => warn!(key = %key, error = %e, "Skipping unreadable metrics sample"),
            }
        }
        samples.sort_by_key(|s| s.timestamp);
        Ok(samples)
    }

    /// The most recent sample, or `None` before the first tick.
    pub async fn get_latest_metrics(&self) -> Result<Option<NodeMetricsSample>> {
        let key = keys::latest_metrics(&self.config.node.id);
        match get_json(self.store.as_ref(), &key).await {
            Ok(sample) => Ok(sample),
            Err(relaynode_core::store::StoreError::Codec { key, source }) => {
                warn!(key = %key, error = %source, "Latest metrics unreadable");
                Ok(None)
            }
            Err(e) => Err(e).context("Failed to read latest metrics"),
        }
    }

    /// Reduce every node's latest sample, optionally restricted to `regions`.
    pub async fn get_aggregated_metrics(&self, regions: Option<&[String]>) -> Result<FleetAggregate> {
        let latest_keys = self
            .store
            .keys(keys::LATEST_PREFIX)
            .await
            .context("Failed to list latest metrics")?;

        let mut samples = Vec::with_capacity(latest_keys.len());
        for key in latest_keys {
            match get_json::<NodeMetricsSample>(self.store.as_ref(), &key).await {
                Ok(Some(sample)) => samples.push(sample),
                Ok(None) => {}
                Err(e) => warn!(key = %key, error = %e, "Skipping unreadable latest metrics"),
            }
        }
        if let Some(regions) = regions.filter(|r| !r.is_empty()) {
            samples.retain(|s| regions.contains(&s.region));
        }
        Ok(aggregate(&samples))
    }
}

/// Fleet reduction. Empty input yields the zeroed aggregate.
pub fn aggregate(samples: &[NodeMetricsSample]) -> FleetAggregate {
    if samples.is_empty() {
        return FleetAggregate::default();
    }
    let n = samples.len() as f64;
    let mean = |f: fn(&NodeMetricsSample) -> f64| samples.iter().map(f).sum::<f64>() / n;
    let regions: BTreeSet<&str> = samples.iter().map(|s| s.region.as_str()).collect();

    FleetAggregate {
        total_nodes: samples.len() as u64,
        total_connections: samples.iter().map(|s| s.connections).sum(),
        total_packets_forwarded: samples.iter().map(|s| s.packets_forwarded).sum(),
        total_bytes_transferred: samples.iter().map(|s| s.bytes_transferred).sum(),
        avg_latency: mean(|s| s.avg_latency),
        avg_cpu_usage: mean(|s| s.cpu_usage),
        avg_memory_usage: mean(|s| s.memory_usage),
        avg_network_load: mean(|s| s.network_load),
        regions: regions.into_iter().map(str::to_string).collect(),
        last_updated: samples.iter().map(|s| s.timestamp).max(),
    }
}
