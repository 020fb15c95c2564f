//! Coordination-store key schema.
//!
//! Per-node keys are owned exclusively by the node whose id they carry.
//! Fleet-wide readers scan by prefix and must tolerate keys appearing or
//! vanishing mid-scan.

use std::time::Duration;

pub const HEARTBEAT_PREFIX: &str = "node:heartbeat:";
pub const HEALTH_PREFIX: &str = "node:health:";
pub const INFO_PREFIX: &str = "node:info:";
pub const METRICS_PREFIX: &str = "node:metrics:";
pub const LATEST_PREFIX: &str = "node:latest:";

pub const HEARTBEAT_TTL: Duration = Duration::from_secs(120);
pub const HEALTH_TTL: Duration = Duration::from_secs(60);
pub const INFO_TTL: Duration = Duration::from_secs(3600);
pub const METRICS_TTL: Duration = Duration::from_secs(3600);
pub const LATEST_TTL: Duration = Duration::from_secs(300);

pub fn heartbeat(node_id: &str) -> String {
    format!("{HEARTBEAT_PREFIX}{node_id}")
}

pub fn health(node_id: &str) -> String {
    format!("{HEALTH_PREFIX}{node_id}")
}

pub fn info(node_id: &str) -> String {
    format!("{INFO_PREFIX}{node_id}")
}

pub fn latest_metrics(node_id: &str) -> String {
    format!("{LATEST_PREFIX}{node_id}")
}

/// History key for one metrics sample: `node:metrics:{id}:{ts_ms}`.
pub fn metrics_sample(node_id: &str, timestamp_ms: u64) -> String {
    format!("{METRICS_PREFIX}{node_id}:{timestamp_ms}")
}

/// Prefix matching every history sample of one node.
pub fn metrics_prefix(node_id: &str) -> String {
    format!("{METRICS_PREFIX}{node_id}:")
}

/// Extract the timestamp suffix from a history key.
pub fn metrics_sample_timestamp(key: &str) -> Option<u64> {
    key.rsplit(':').next()?.parse().ok()
}
