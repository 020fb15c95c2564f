use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use relaynode_core::config::NodeConfig;
use relaynode_core::events::{EventBus, NodeEvent};
use relaynode_core::keys;
use relaynode_core::node::{CheckResult, HealthState, HealthStatus, NodeHeartbeat, NodeRegistration};
use relaynode_core::store::{CoordStore, get_json, put_json};
use relaynode_core::time::now_ms;
use tracing::{debug, info, warn};

use crate::control_plane::ControlPlane;
use crate::host::HostProbe;

pub const CHECK_STORE: &str = "store";
pub const CHECK_MEMORY: &str = "memory";
pub const CHECK_CPU: &str = "cpu";
pub const CHECK_BACKEND: &str = "backend";

/// Self-diagnosis and fleet presence for one node.
///
/// Every health tick recomputes [`HealthStatus`] from scratch; nothing is
/// carried over between ticks except the cached result.
pub struct HealthMonitor {
    config: Arc<NodeConfig>,
    store: Arc<dyn CoordStore>,
    host: Arc<dyn HostProbe>,
    control_plane: Option<Arc<dyn ControlPlane>>,
    events: EventBus,
    started: Instant,
    latest: RwLock<Option<HealthStatus>>,
}

impl HealthMonitor {
    pub fn new(
        config: Arc<NodeConfig>,
        store: Arc<dyn CoordStore>,
        host: Arc<dyn HostProbe>,
        control_plane: Option<Arc<dyn ControlPlane>>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            store,
            host,
            control_plane,
            events,
            started: Instant::now(),
            latest: RwLock::new(None),
        }
    }

    fn node_id(&self) -> &str {
        &self.config.node.id
    }

    pub fn uptime_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    // ========================================================================
    // Health checks
    // ========================================================================

    /// Run the check battery once.
    ///
    /// The backend check is only present when a control plane is configured.
    pub async fn run_checks(&self) -> BTreeMap<String, CheckResult> {
        let mut checks = BTreeMap::new();
        checks.insert(CHECK_STORE.to_string(), self.check_store().await);

        let host = self.host.sample();
        let thresholds = &self.config.health;
        checks.insert(
            CHECK_MEMORY.to_string(),
            threshold_check("Memory", host.memory_usage, thresholds.memory_threshold),
        );
        checks.insert(
            CHECK_CPU.to_string(),
            threshold_check("CPU", host.cpu_usage, thresholds.cpu_threshold),
        );

        if let Some(cp) = &self.control_plane {
            checks.insert(CHECK_BACKEND.to_string(), check_backend(cp.as_ref()).await);
        }
        checks
    }

    async fn check_store(&self) -> CheckResult {
        let start = Instant::now();
        match tokio::time::timeout(self.config.store_timeout(), self.store.ping()).await {
            Ok(Ok(())) => CheckResult::pass().with_duration(start.elapsed().as_millis() as u64),
            Ok(Err(e)) => CheckResult::fail(format!("Coordination store unreachable: {}", e)),
            Err(_) => CheckResult::fail(format!(
                "Coordination store ping timed out after {}ms",
                self.config.store.timeout_ms
            )),
        }
    }

    /// One health tick: recompute, cache, mirror to the store, announce.
    ///
    /// A failed store write is logged; the computed status is still cached
    /// and returned.
    pub async fn tick(&self) -> HealthStatus {
        let checks = self.run_checks().await;
        let status = HealthStatus::from_checks(
            checks,
            now_ms(),
            self.uptime_ms(),
            env!("CARGO_PKG_VERSION"),
        );
        let failed: Vec<String> = status.failed_checks().iter().map(|s| s.to_string()).collect();

        self.set_latest(status.clone());

        if let Err(e) = put_json(
            self.store.as_ref(),
            &keys::health(self.node_id()),
            keys::HEALTH_TTL,
            &status,
        )
        .await
        {
            warn!(error = %e, "Failed to publish health status");
        }

        if status.status == HealthState::Healthy {
            debug!(checks = status.checks.len(), "Health check passed");
        } else {
            warn!(status = %status.status, failed = ?failed, "Health check failed");
        }
        self.events.emit(NodeEvent::HealthChanged {
            status: status.status,
            failed_checks: failed,
        });
        status
    }

    /// Most recent health computation, if a tick has run.
    pub fn get_health_status(&self) -> Option<HealthStatus> {
        self.latest.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_latest(&self, status: HealthStatus) {
        *self.latest.write().unwrap_or_else(|e| e.into_inner()) = Some(status);
    }

    fn current_state(&self) -> HealthState {
        self.get_health_status()
            .map(|s| s.status)
            .unwrap_or_default()
    }

    // ========================================================================
    // Heartbeat
    // ========================================================================

    pub fn heartbeat_record(&self) -> NodeHeartbeat {
        NodeHeartbeat {
            id: self.config.node.id.clone(),
            region: self.config.node.region.clone(),
            ip: self.config.node.public_ip.clone(),
            port: self.config.node.port,
            status: self.current_state(),
            last_heartbeat: now_ms(),
        }
    }

    /// Publish this node's heartbeat and forward it to the control plane.
    ///
    /// The control-plane call runs detached so a slow backend never delays
    /// the next tick; only the store write decides the result.
    pub async fn publish_heartbeat(&self) -> Result<NodeHeartbeat> {
        let heartbeat = self.heartbeat_record();

        if let Some(cp) = &self.control_plane {
            let cp = Arc::clone(cp);
            let record = heartbeat.clone();
            tokio::spawn(async move {
                if let Err(e) = cp.send_heartbeat(&record).await {
                    warn!(error = %e, "Failed to forward heartbeat to control plane");
                }
            });
        }

        put_json(
            self.store.as_ref(),
            &keys::heartbeat(self.node_id()),
            keys::HEARTBEAT_TTL,
            &heartbeat,
        )
        .await
        .context("Failed to publish heartbeat")?;
        debug!(status = %heartbeat.status, "Heartbeat published");
        Ok(heartbeat)
    }

    // ========================================================================
    // Fleet records
    // ========================================================================

    /// Delete heartbeats (and matching health records) older than the
    /// staleness threshold, measured against `now_ms`.
    ///
    /// Keys that vanish or fail to decode mid-scan are skipped.
    pub async fn sweep_stale(&self, now_ms: u64) -> Result<usize> {
        let threshold = self.config.health.stale_threshold_ms;
        let heartbeat_keys = self
            .store
            .keys(keys::HEARTBEAT_PREFIX)
            .await
            .context("Failed to list heartbeats")?;

        let mut removed = 0;
        for key in heartbeat_keys {
            let heartbeat = match get_json::<NodeHeartbeat>(self.store.as_ref(), &key).await {
                Ok(Some(hb)) => hb,
                Ok(None) => continue,
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping unreadable heartbeat");
                    continue;
                }
            };
            if now_ms.saturating_sub(heartbeat.last_heartbeat) <= threshold {
                continue;
            }
            if let Err(e) = self.store.delete(&key).await {
                warn!(key = %key, error = %e, "Failed to delete stale heartbeat");
                continue;
            }
            if let Err(e) = self.store.delete(&keys::health(&heartbeat.id)).await {
                warn!(node = %heartbeat.id, error = %e, "Failed to delete stale health record");
            }
            info!(node = %heartbeat.id, last_heartbeat = heartbeat.last_heartbeat, "Removed stale node");
            removed += 1;
        }
        Ok(removed)
    }

    /// Store an externally supplied node descriptor under `node:info:`.
    ///
    /// Missing fields default to this node's identity.
    pub async fn register_node(&self, registration: NodeRegistration) -> Result<NodeHeartbeat> {
        let node = &self.config.node;
        let record = NodeHeartbeat {
            id: registration.id.unwrap_or_else(|| node.id.clone()),
            region: registration.region.unwrap_or_else(|| node.region.clone()),
            ip: registration.ip.unwrap_or_else(|| node.public_ip.clone()),
            port: registration.port.unwrap_or(node.port),
            status: HealthState::Healthy,
            last_heartbeat: now_ms(),
        };
        if record.id.contains(':') || record.id.is_empty() {
            anyhow::bail!("Invalid node id '{}'", record.id);
        }
        put_json(
            self.store.as_ref(),
            &keys::info(&record.id),
            keys::INFO_TTL,
            &record,
        )
        .await
        .with_context(|| format!("Failed to register node {}", record.id))?;
        info!(node = %record.id, region = %record.region, "Node registered");
        Ok(record)
    }

    /// Every live heartbeat in the fleet, newest first.
    pub async fn get_all_nodes(&self) -> Result<Vec<NodeHeartbeat>> {
        let heartbeat_keys = self
            .store
            .keys(keys::HEARTBEAT_PREFIX)
            .await
            .context("Failed to list heartbeats")?;

        let mut nodes = Vec::with_capacity(heartbeat_keys.len());
        for key in heartbeat_keys {
            match get_json::<NodeHeartbeat>(self.store.as_ref(), &key).await {
                Ok(Some(hb)) => nodes.push(hb),
                Ok(None) => {}
                Err(e) => warn!(key = %key, error = %e, "Skipping unreadable heartbeat"),
            }
        }
        nodes.sort_by(|a, b| b.last_heartbeat.cmp(&a.last_heartbeat));
        Ok(nodes)
    }

    pub async fn get_nodes_by_region(&self, region: &str) -> Result<Vec<NodeHeartbeat>> {
        let mut nodes = self.get_all_nodes().await?;
        nodes.retain(|n| n.region == region);
        Ok(nodes)
    }

    /// Remove this node's own presence records.
    pub async fn shutdown(&self) -> Result<()> {
        let id = self.node_id();
        let mut failures = 0;
        for key in [keys::heartbeat(id), keys::health(id), keys::info(id)] {
            if let Err(e) = self.store.delete(&key).await {
                warn!(key = %key, error = %e, "Failed to delete node record");
                failures += 1;
            }
        }
        if failures > 0 {
            anyhow::bail!("{} node record(s) could not be deleted", failures);
        }
        info!("Node records removed from coordination store");
        Ok(())
    }
}

fn threshold_check(label: &str, ratio: f64, threshold: f64) -> CheckResult {
    let message = format!("{} usage: {}%", label, (ratio * 100.0).round());
    if ratio < threshold {
        CheckResult::pass().with_message(message)
    } else {
        CheckResult::fail(message)
    }
}

async fn check_backend(cp: &dyn ControlPlane) -> CheckResult {
    let start = Instant::now();
    // The HTTP client enforces its own timeout; this is a backstop.
    match tokio::time::timeout(Duration::from_secs(30), cp.probe()).await {
        Ok(Ok(())) => CheckResult::pass().with_duration(start.elapsed().as_millis() as u64),
        Ok(Err(e)) => {
            debug!(error = %e, "Control plane probe failed");
            CheckResult::fail(format!("Backend connectivity failed: {:#}", e))
        }
        Err(_) => CheckResult::fail("Backend probe timed out"),
    }
}
