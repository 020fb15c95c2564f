use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Overall node health as advertised to the fleet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    #[default]
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthState {
    /// Aggregation rule: 0 failing checks is healthy, 1 is degraded, 2+ is unhealthy.
    pub fn from_failed_count(failed: usize) -> Self {
        match failed {
            0 => HealthState::Healthy,
            1 => HealthState::Degraded,
            _ => HealthState::Unhealthy,
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Degraded => write!(f, "degraded"),
            HealthState::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Outcome of a single self-check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckOutcome {
    Pass,
    Fail,
}

/// Result of one named check within a health tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub status: CheckOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Round-trip duration in milliseconds, for probes that measure one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
}

impl CheckResult {
    pub fn pass() -> Self {
        Self {
            status: CheckOutcome::Pass,
            message: None,
            duration: None,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            status: CheckOutcome::Fail,
            message: Some(message.into()),
            duration: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_duration(mut self, ms: u64) -> Self {
        self.duration = Some(ms);
        self
    }

    pub fn is_fail(&self) -> bool {
        self.status == CheckOutcome::Fail
    }
}

/// Health record recomputed on every health tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: HealthState,
    pub timestamp: u64,
    pub checks: BTreeMap<String, CheckResult>,
    /// Process uptime in milliseconds.
    pub uptime: u64,
    pub version: String,
}

impl HealthStatus {
    /// Build a status record from a battery of check results.
    pub fn from_checks(
        checks: BTreeMap<String, CheckResult>,
        timestamp: u64,
        uptime: u64,
        version: &str,
    ) -> Self {
        let failed = checks.values().filter(|c| c.is_fail()).count();
        Self {
            status: HealthState::from_failed_count(failed),
            timestamp,
            checks,
            uptime,
            version: version.to_string(),
        }
    }

    /// Names of the checks that failed, in sorted order.
    pub fn failed_checks(&self) -> Vec<&str> {
        self.checks
            .iter()
            .filter(|(_, c)| c.is_fail())
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// Compact liveness record a node republishes on every heartbeat tick.
///
/// The same shape is used for out-of-band registrations under the
/// `node:info:` namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeHeartbeat {
    pub id: String,
    pub region: String,
    pub ip: String,
    pub port: u16,
    pub status: HealthState,
    /// Unix epoch milliseconds.
    pub last_heartbeat: u64,
}

/// Partially specified node descriptor accepted by `POST /register`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRegistration {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

/// One metrics collection tick for one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetricsSample {
    pub node_id: String,
    pub region: String,
    pub timestamp: u64,
    pub connections: u64,
    pub packets_forwarded: u64,
    pub bytes_transferred: u64,
    /// Mean forwarding latency in milliseconds.
    pub avg_latency: f64,
    /// Host CPU utilisation, 0.0..=1.0.
    pub cpu_usage: f64,
    /// Host memory utilisation, 0.0..=1.0.
    pub memory_usage: f64,
    /// Network throughput relative to configured link capacity, 0.0..=1.0.
    pub network_load: f64,
    /// Process uptime in milliseconds.
    pub uptime: u64,
}

/// Cross-node reduction of every node's latest metrics sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetAggregate {
    pub total_nodes: u64,
    pub total_connections: u64,
    pub total_packets_forwarded: u64,
    pub total_bytes_transferred: u64,
    pub avg_latency: f64,
    pub avg_cpu_usage: f64,
    pub avg_memory_usage: f64,
    pub avg_network_load: f64,
    pub regions: Vec<String>,
    /// Newest sample timestamp seen; `None` when no nodes contributed.
    #[serde(default)]
    pub last_updated: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_state_from_failed_count() {
        assert_eq!(HealthState::from_failed_count(0), HealthState::Healthy);
        assert_eq!(HealthState::from_failed_count(1), HealthState::Degraded);
        assert_eq!(HealthState::from_failed_count(2), HealthState::Unhealthy);
        assert_eq!(HealthState::from_failed_count(4), HealthState::Unhealthy);
    }

    #[test]
    fn test_health_status_from_checks_counts_failures() {
        let mut checks = BTreeMap::new();
        checks.insert("store".to_string(), CheckResult::fail("down"));
        checks.insert("memory".to_string(), CheckResult::pass());
        let status = HealthStatus::from_checks(checks, 1, 2, "0.4.0");
        assert_eq!(status.status, HealthState::Degraded);
        assert_eq!(status.failed_checks(), vec!["store"]);
    }

    #[test]
    fn test_check_result_skips_empty_fields() {
        let json = serde_json::to_string(&CheckResult::pass()).unwrap();
        assert_eq!(json, r#"{"status":"pass"}"#);
    }

    #[test]
    fn test_heartbeat_wire_format() {
        let hb = NodeHeartbeat {
            id: "node-a".into(),
            region: "eu-west".into(),
            ip: "0.0.0.0".into(),
            port: 8080,
            status: HealthState::Degraded,
            last_heartbeat: 10,
        };
        let value = serde_json::to_value(&hb).unwrap();
        assert_eq!(value["lastHeartbeat"], 10);
        assert_eq!(value["status"], "degraded");
    }

    #[test]
    fn test_registration_accepts_partial_body() {
        let reg: NodeRegistration = serde_json::from_str(r#"{"region":"us-east"}"#).unwrap();
        assert_eq!(reg.region.as_deref(), Some("us-east"));
        assert!(reg.id.is_none());
        assert!(reg.port.is_none());
    }
}
