use std::sync::Mutex;
use std::time::Instant;

use sysinfo::{Networks, System};

/// Point-in-time host utilisation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HostSample {
    /// Aggregate CPU busy ratio since the previous sample, 0.0..=1.0.
    pub cpu_usage: f64,
    /// Used over total physical memory, 0.0..=1.0.
    pub memory_usage: f64,
    /// Bytes received plus transmitted per second across all interfaces.
    pub network_bytes_per_sec: f64,
}

impl HostSample {
    /// Throughput as a fraction of a link of `capacity_mbps`, clamped to 1.
    pub fn network_load(&self, capacity_mbps: u64) -> f64 {
        if capacity_mbps == 0 {
            return 0.0;
        }
        let bits_per_sec = self.network_bytes_per_sec * 8.0;
        (bits_per_sec / (capacity_mbps as f64 * 1_000_000.0)).clamp(0.0, 1.0)
    }
}

/// Source of host utilisation figures.
pub trait HostProbe: Send + Sync {
    fn sample(&self) -> HostSample;
}

/// [`HostProbe`] backed by `sysinfo`.
///
/// CPU and network figures are deltas against the previous call, so the
/// first sample after construction reads close to zero.
pub struct SysinfoProbe {
    state: Mutex<ProbeState>,
}

struct ProbeState {
    system: System,
    networks: Networks,
    last_refresh: Instant,
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();
        Self {
            state: Mutex::new(ProbeState {
                system,
                networks: Networks::new_with_refreshed_list(),
                last_refresh: Instant::now(),
            }),
        }
    }
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HostProbe for SysinfoProbe {
    fn sample(&self) -> HostSample {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let ProbeState {
            system,
            networks,
            last_refresh,
        } = &mut *state;

        system.refresh_cpu();
        system.refresh_memory();
        networks.refresh();

        let elapsed = last_refresh.elapsed().as_secs_f64();
        *last_refresh = Instant::now();

        let cpu_usage = (f64::from(system.global_cpu_info().cpu_usage()) / 100.0).clamp(0.0, 1.0);
        let total = system.total_memory();
        let memory_usage = if total == 0 {
            0.0
        } else {
            system.used_memory() as f64 / total as f64
        };
        let bytes: u64 = networks
            .iter()
            .map(|(_, data)| data.received() + data.transmitted())
            .sum();
        let network_bytes_per_sec = if elapsed > 0.0 {
            bytes as f64 / elapsed
        } else {
            0.0
        };

        HostSample {
            cpu_usage,
            memory_usage,
            network_bytes_per_sec,
        }
    }
}
