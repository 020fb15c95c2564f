// relaynode-monitor: Health monitor, metrics collector, fleet registration
// Reads tunnel counters from relaynode-tunnel; never sits on the data path.

pub mod control_plane;
pub mod health;
pub mod host;
pub mod metrics;

pub use control_plane::{ControlPlane, HttpControlPlane};
pub use health::HealthMonitor;
pub use host::{HostProbe, HostSample, SysinfoProbe};
pub use metrics::MetricsCollector;
