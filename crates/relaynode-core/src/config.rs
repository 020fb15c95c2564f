use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::keys;

/// Relay node configuration.
///
/// Built once at startup (TOML file, then environment overrides, then
/// validation) and passed immutably into every component.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node: NodeSection,
    pub store: StoreSection,
    pub backend: BackendSection,
    pub tunnel: TunnelSection,
    pub health: HealthSection,
    pub metrics: MetricsSection,
    /// Upper bound on the whole shutdown sequence (milliseconds).
    pub shutdown_grace_ms: u64,
    /// Log filter used when `RUST_LOG` is unset.
    pub log_level: String,
}

/// Identity and listen address.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    pub id: String,
    pub region: String,
    pub host: String,
    pub port: u16,
    /// Address advertised in heartbeats.
    pub public_ip: String,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            region: "unknown".to_string(),
            host: "0.0.0.0".to_string(),
            port: 8080,
            public_ip: "0.0.0.0".to_string(),
        }
    }
}

/// Coordination store connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// `memory://` or `etcd://host:port[,host:port]`.
    pub url: String,
    /// Bound on every store round trip (milliseconds).
    pub timeout_ms: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            url: "memory://".to_string(),
            timeout_ms: 2_000,
        }
    }
}

/// External control plane. An empty `url` disables probing and forwarding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSection {
    pub url: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub timeout_ms: u64,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            url: "http://localhost:3000".to_string(),
            api_key: String::new(),
            timeout_ms: 5_000,
        }
    }
}

/// Session registry and packet forwarder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelSection {
    /// Maximum concurrently attached sessions.
    pub max_connections: usize,
    /// Idle timeout before a session is reaped; also bounds upstream connects.
    pub idle_timeout_ms: u64,
    pub reap_interval_ms: u64,
    /// Largest accepted envelope payload in bytes.
    pub max_packet_size: usize,
    /// Upstream read buffer in bytes.
    pub buffer_size: usize,
    /// Outbound control messages queued per session before drops.
    pub channel_buffer: usize,
}

impl Default for TunnelSection {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            idle_timeout_ms: 30_000,
            reap_interval_ms: 30_000,
            max_packet_size: 1500,
            buffer_size: 65_536,
            channel_buffer: 256,
        }
    }
}

/// Health checks, heartbeats and the stale-record sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    pub check_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub stale_sweep_interval_ms: u64,
    /// Heartbeats older than this are deleted by the sweep.
    pub stale_threshold_ms: u64,
    /// Memory check fails at or above this used/total ratio.
    pub memory_threshold: f64,
    /// CPU check fails at or above this usage ratio.
    pub cpu_threshold: f64,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            check_interval_ms: 10_000,
            heartbeat_interval_ms: 30_000,
            stale_sweep_interval_ms: 300_000,
            stale_threshold_ms: 300_000,
            memory_threshold: 0.8,
            cpu_threshold: 0.9,
        }
    }
}

/// Metrics sampling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSection {
    pub interval_ms: u64,
    /// Link capacity used to turn throughput into a load ratio.
    pub network_capacity_mbps: u64,
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            network_capacity_mbps: 1000,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node: NodeSection::default(),
            store: StoreSection::default(),
            backend: BackendSection::default(),
            tunnel: TunnelSection::default(),
            health: HealthSection::default(),
            metrics: MetricsSection::default(),
            shutdown_grace_ms: default_shutdown_grace(),
            log_level: default_log_level(),
        }
    }
}

fn default_shutdown_grace() -> u64 {
    10_000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl NodeConfig {
    /// Load configuration: optional TOML file, then process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a TOML file (no env overrides, no validation).
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read node config: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse config from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        toml::from_str(s).with_context(|| "Failed to parse node config TOML")
    }

    /// Apply environment overrides. `lookup` returns the value of a variable.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |name: &str, target: &mut String| {
            if let Some(v) = lookup(name) {
                *target = v;
            }
        };
        text("NODE_ID", &mut self.node.id);
        text("REGION", &mut self.node.region);
        text("HOST", &mut self.node.host);
        text("PUBLIC_IP", &mut self.node.public_ip);
        text("STORE_URL", &mut self.store.url);
        text("BACKEND_URL", &mut self.backend.url);
        text("BACKEND_API_KEY", &mut self.backend.api_key);
        text("LOG_LEVEL", &mut self.log_level);

        env_parse(&lookup, "PORT", &mut self.node.port)?;
        env_parse(&lookup, "STORE_TIMEOUT", &mut self.store.timeout_ms)?;
        env_parse(&lookup, "BACKEND_TIMEOUT", &mut self.backend.timeout_ms)?;
        env_parse(&lookup, "MAX_CONNECTIONS", &mut self.tunnel.max_connections)?;
        env_parse(&lookup, "TUNNEL_TIMEOUT", &mut self.tunnel.idle_timeout_ms)?;
        env_parse(&lookup, "REAP_INTERVAL", &mut self.tunnel.reap_interval_ms)?;
        env_parse(&lookup, "MAX_PACKET_SIZE", &mut self.tunnel.max_packet_size)?;
        env_parse(&lookup, "BUFFER_SIZE", &mut self.tunnel.buffer_size)?;
        env_parse(&lookup, "CHANNEL_BUFFER", &mut self.tunnel.channel_buffer)?;
        env_parse(&lookup, "HEALTH_CHECK_INTERVAL", &mut self.health.check_interval_ms)?;
        env_parse(&lookup, "HEARTBEAT_INTERVAL", &mut self.health.heartbeat_interval_ms)?;
        env_parse(&lookup, "STALE_SWEEP_INTERVAL", &mut self.health.stale_sweep_interval_ms)?;
        env_parse(&lookup, "STALE_THRESHOLD", &mut self.health.stale_threshold_ms)?;
        env_parse(&lookup, "MEMORY_THRESHOLD", &mut self.health.memory_threshold)?;
        env_parse(&lookup, "CPU_THRESHOLD", &mut self.health.cpu_threshold)?;
        env_parse(&lookup, "METRICS_INTERVAL", &mut self.metrics.interval_ms)?;
        env_parse(&lookup, "NETWORK_CAPACITY_MBPS", &mut self.metrics.network_capacity_mbps)?;
        env_parse(&lookup, "SHUTDOWN_GRACE", &mut self.shutdown_grace_ms)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.node.id.trim().is_empty() {
            anyhow::bail!("Node id must not be empty");
        }
        if self.node.id.contains(':') {
            anyhow::bail!("Node id '{}' must not contain ':'", self.node.id);
        }

        let intervals = [
            ("tunnel.idle_timeout_ms", self.tunnel.idle_timeout_ms),
            ("tunnel.reap_interval_ms", self.tunnel.reap_interval_ms),
            ("health.check_interval_ms", self.health.check_interval_ms),
            ("health.heartbeat_interval_ms", self.health.heartbeat_interval_ms),
            ("health.stale_sweep_interval_ms", self.health.stale_sweep_interval_ms),
            ("metrics.interval_ms", self.metrics.interval_ms),
            ("store.timeout_ms", self.store.timeout_ms),
            ("backend.timeout_ms", self.backend.timeout_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                anyhow::bail!("{} must be greater than zero", name);
            }
        }

        for (name, value) in [
            ("health.memory_threshold", self.health.memory_threshold),
            ("health.cpu_threshold", self.health.cpu_threshold),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                anyhow::bail!("{} must be in (0, 1], got {}", name, value);
            }
        }

        if self.tunnel.max_packet_size == 0 {
            anyhow::bail!("tunnel.max_packet_size must be greater than zero");
        }
        if self.tunnel.max_connections == 0 {
            anyhow::bail!("tunnel.max_connections must be greater than zero");
        }
        if self.tunnel.channel_buffer == 0 {
            anyhow::bail!("tunnel.channel_buffer must be greater than zero");
        }

        let heartbeat = self.heartbeat_interval();
        if keys::HEARTBEAT_TTL <= heartbeat {
            anyhow::bail!(
                "health.heartbeat_interval_ms ({}) must be shorter than the heartbeat TTL ({}s)",
                self.health.heartbeat_interval_ms,
                keys::HEARTBEAT_TTL.as_secs()
            );
        }
        if self.stale_threshold() <= heartbeat {
            anyhow::bail!(
                "health.stale_threshold_ms ({}) must exceed health.heartbeat_interval_ms ({})",
                self.health.stale_threshold_ms,
                self.health.heartbeat_interval_ms
            );
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.node.host, self.node.port)
    }

    pub fn backend_enabled(&self) -> bool {
        !self.backend.url.trim().is_empty()
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.tunnel.idle_timeout_ms)
    }
    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.tunnel.reap_interval_ms)
    }
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store.timeout_ms)
    }
    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend.timeout_ms)
    }
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health.check_interval_ms)
    }
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.health.heartbeat_interval_ms)
    }
    pub fn stale_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.health.stale_sweep_interval_ms)
    }
    pub fn stale_threshold(&self) -> Duration {
        Duration::from_millis(self.health.stale_threshold_ms)
    }
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics.interval_ms)
    }
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

fn env_parse<T, F>(lookup: &F, name: &str, target: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(name) {
        *target = raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: '{}' ({})", name, raw, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.node.port, 8080);
        assert_eq!(config.node.region, "unknown");
        assert_eq!(config.store.url, "memory://");
        assert_eq!(config.tunnel.idle_timeout_ms, 30_000);
        assert_eq!(config.tunnel.max_packet_size, 1500);
        assert_eq!(config.health.check_interval_ms, 10_000);
        assert_eq!(config.health.heartbeat_interval_ms, 30_000);
        assert_eq!(config.metrics.interval_ms, 5_000);
        assert_eq!(config.shutdown_grace_ms, 10_000);
        assert_eq!(config.log_level, "info");
        assert!(!config.node.id.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_partial_toml() {
        let toml = r#"
[node]
id = "node-eu-1"
region = "eu-west"

[tunnel]
idle_timeout_ms = 60000
"#;
        let config = NodeConfig::parse(toml).unwrap();
        assert_eq!(config.node.id, "node-eu-1");
        assert_eq!(config.node.region, "eu-west");
        assert_eq!(config.node.port, 8080);
        assert_eq!(config.tunnel.idle_timeout_ms, 60_000);
        assert_eq!(config.tunnel.max_packet_size, 1500);
        assert_eq!(config.shutdown_grace_ms, 10_000);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[node]\nregion = \"ap-south\"").unwrap();
        let config = NodeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.node.region, "ap-south");
    }

    #[test]
    fn test_env_overrides() {
        let vars = env(&[
            ("NODE_ID", "n-7"),
            ("REGION", "us-east"),
            ("PORT", "9000"),
            ("TUNNEL_TIMEOUT", "45000"),
            ("MAX_PACKET_SIZE", "9000"),
            ("CPU_THRESHOLD", "0.75"),
            ("STORE_URL", "etcd://10.0.0.5:2379"),
        ]);
        let mut config = NodeConfig::default();
        config.apply_env(|k| vars.get(k).cloned()).unwrap();
        assert_eq!(config.node.id, "n-7");
        assert_eq!(config.node.region, "us-east");
        assert_eq!(config.node.port, 9000);
        assert_eq!(config.idle_timeout(), Duration::from_secs(45));
        assert_eq!(config.tunnel.max_packet_size, 9000);
        assert_eq!(config.health.cpu_threshold, 0.75);
        assert_eq!(config.store.url, "etcd://10.0.0.5:2379");
    }

    #[test]
    fn test_env_rejects_bad_number() {
        let vars = env(&[("PORT", "eighty")]);
        let mut config = NodeConfig::default();
        let err = config.apply_env(|k| vars.get(k).cloned()).unwrap_err();
        assert!(format!("{}", err).contains("PORT"));
    }

    #[test]
    fn test_reject_zero_interval() {
        let mut config = NodeConfig::default();
        config.metrics.interval_ms = 0;
        let err = format!("{}", config.validate().unwrap_err());
        assert!(err.contains("metrics.interval_ms"));
    }

    #[test]
    fn test_reject_threshold_out_of_range() {
        let mut config = NodeConfig::default();
        config.health.memory_threshold = 1.5;
        assert!(config.validate().is_err());
        config.health.memory_threshold = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reject_heartbeat_slower_than_ttl() {
        let mut config = NodeConfig::default();
        config.health.heartbeat_interval_ms = 600_000;
        config.health.stale_threshold_ms = 900_000;
        let err = format!("{}", config.validate().unwrap_err());
        assert!(err.contains("heartbeat TTL"));
    }

    #[test]
    fn test_reject_stale_threshold_below_heartbeat() {
        let mut config = NodeConfig::default();
        config.health.stale_threshold_ms = 10_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reject_node_id_with_separator() {
        let mut config = NodeConfig::default();
        config.node.id = "a:b".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backend_disabled_when_url_empty() {
        let mut config = NodeConfig::default();
        assert!(config.backend_enabled());
        config.backend.url = "  ".to_string();
        assert!(!config.backend_enabled());
    }

    #[test]
    fn test_api_key_not_serialized() {
        let mut config = NodeConfig::default();
        config.backend.api_key = "secret".to_string();
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret"));
    }
}
