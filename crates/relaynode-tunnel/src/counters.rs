use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic data-plane counters for one node.
#[derive(Debug, Default)]
pub struct RelayCounters {
    // ── Session lifecycle ───────────────────────────────────────────
    pub sessions_attached: AtomicU64,
    pub sessions_detached: AtomicU64,
    pub sessions_reaped: AtomicU64,
    pub sessions_rejected: AtomicU64,

    // ── Forwarding ──────────────────────────────────────────────────
    pub packets_forwarded: AtomicU64,
    pub bytes_forwarded: AtomicU64,
    pub packets_rejected: AtomicU64,

    // ── Upstream sockets ────────────────────────────────────────────
    pub upstreams_opened: AtomicU64,
    pub upstreams_closed: AtomicU64,
    pub upstream_failures: AtomicU64,

    // ── Return path ─────────────────────────────────────────────────
    pub responses_sent: AtomicU64,
    pub responses_dropped: AtomicU64,
    pub bytes_returned: AtomicU64,
}

impl RelayCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            sessions_attached: self.sessions_attached.load(Ordering::Relaxed),
            sessions_detached: self.sessions_detached.load(Ordering::Relaxed),
            sessions_reaped: self.sessions_reaped.load(Ordering::Relaxed),
            sessions_rejected: self.sessions_rejected.load(Ordering::Relaxed),
            packets_forwarded: self.packets_forwarded.load(Ordering::Relaxed),
            bytes_forwarded: self.bytes_forwarded.load(Ordering::Relaxed),
            packets_rejected: self.packets_rejected.load(Ordering::Relaxed),
            upstreams_opened: self.upstreams_opened.load(Ordering::Relaxed),
            upstreams_closed: self.upstreams_closed.load(Ordering::Relaxed),
            upstream_failures: self.upstream_failures.load(Ordering::Relaxed),
            responses_sent: self.responses_sent.load(Ordering::Relaxed),
            responses_dropped: self.responses_dropped.load(Ordering::Relaxed),
            bytes_returned: self.bytes_returned.load(Ordering::Relaxed),
        }
    }

    /// Format counters in Prometheus exposition format.
    ///
    /// `active_sessions` and `active_upstreams` are point-in-time gauges
    /// supplied by the registry.
    pub fn prometheus_exposition(&self, active_sessions: usize, active_upstreams: usize) -> String {
        let s = self.snapshot();
        let mut out = String::with_capacity(2048);

        write_metric(
            &mut out,
            "relaynode_sessions_attached_total",
            s.sessions_attached,
            "Sessions attached",
        );
        write_metric(
            &mut out,
            "relaynode_sessions_detached_total",
            s.sessions_detached,
            "Sessions detached for any reason",
        );
        write_metric(
            &mut out,
            "relaynode_sessions_reaped_total",
            s.sessions_reaped,
            "Sessions detached by the idle reaper",
        );
        write_metric(
            &mut out,
            "relaynode_sessions_rejected_total",
            s.sessions_rejected,
            "Attach attempts refused (capacity or shutdown)",
        );
        write_metric(
            &mut out,
            "relaynode_packets_forwarded_total",
            s.packets_forwarded,
            "Envelopes written to an upstream",
        );
        write_metric(
            &mut out,
            "relaynode_bytes_forwarded_total",
            s.bytes_forwarded,
            "Payload bytes written to upstreams",
        );
        write_metric(
            &mut out,
            "relaynode_packets_rejected_total",
            s.packets_rejected,
            "Envelopes refused before reaching an upstream",
        );
        write_metric(
            &mut out,
            "relaynode_upstreams_opened_total",
            s.upstreams_opened,
            "Upstream sockets opened",
        );
        write_metric(
            &mut out,
            "relaynode_upstreams_closed_total",
            s.upstreams_closed,
            "Upstream sockets closed",
        );
        write_metric(
            &mut out,
            "relaynode_upstream_failures_total",
            s.upstream_failures,
            "Upstream connect or write failures",
        );
        write_metric(
            &mut out,
            "relaynode_responses_sent_total",
            s.responses_sent,
            "Packet responses queued to client channels",
        );
        write_metric(
            &mut out,
            "relaynode_responses_dropped_total",
            s.responses_dropped,
            "Packet responses dropped on closed or full channels",
        );
        write_metric(
            &mut out,
            "relaynode_bytes_returned_total",
            s.bytes_returned,
            "Payload bytes received from upstreams",
        );
        write_gauge(
            &mut out,
            "relaynode_active_sessions",
            active_sessions as u64,
            "Currently attached sessions",
        );
        write_gauge(
            &mut out,
            "relaynode_active_upstreams",
            active_upstreams as u64,
            "Currently open upstream sockets",
        );

        out
    }
}

fn write_metric(out: &mut String, name: &str, value: u64, help: &str) {
    write_typed(out, name, "counter", value, help);
}

fn write_gauge(out: &mut String, name: &str, value: u64, help: &str) {
    write_typed(out, name, "gauge", value, help);
}

fn write_typed(out: &mut String, name: &str, kind: &str, value: u64, help: &str) {
    use std::fmt::Write;
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} {}", name, kind);
    let _ = writeln!(out, "{} {}", name, value);
}

/// Serializable snapshot of the relay counters.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CountersSnapshot {
    pub sessions_attached: u64,
    pub sessions_detached: u64,
    pub sessions_reaped: u64,
    pub sessions_rejected: u64,
    pub packets_forwarded: u64,
    pub bytes_forwarded: u64,
    pub packets_rejected: u64,
    pub upstreams_opened: u64,
    pub upstreams_closed: u64,
    pub upstream_failures: u64,
    pub responses_sent: u64,
    pub responses_dropped: u64,
    pub bytes_returned: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_snapshot() {
        let c = RelayCounters::new();
        RelayCounters::incr(&c.sessions_attached);
        RelayCounters::add(&c.bytes_forwarded, 512);
        RelayCounters::add(&c.bytes_forwarded, 8);

        let snap = c.snapshot();
        assert_eq!(snap.sessions_attached, 1);
        assert_eq!(snap.bytes_forwarded, 520);
        assert_eq!(snap.packets_forwarded, 0);
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let c = RelayCounters::new();
        RelayCounters::incr(&c.upstreams_opened);
        let json = serde_json::to_string(&c.snapshot()).unwrap();
        assert!(json.contains("\"upstreamsOpened\":1"));
    }

    #[test]
    fn test_prometheus_exposition_format() {
        let c = RelayCounters::new();
        RelayCounters::add(&c.packets_forwarded, 42);
        RelayCounters::incr(&c.responses_dropped);

        let prom = c.prometheus_exposition(3, 5);
        assert!(prom.contains("# HELP relaynode_packets_forwarded_total"));
        assert!(prom.contains("# TYPE relaynode_packets_forwarded_total counter"));
        assert!(prom.contains("relaynode_packets_forwarded_total 42"));
        assert!(prom.contains("relaynode_responses_dropped_total 1"));
        assert!(prom.contains("# TYPE relaynode_active_sessions gauge"));
        assert!(prom.contains("relaynode_active_sessions 3"));
        assert!(prom.contains("relaynode_active_upstreams 5"));
    }
}
