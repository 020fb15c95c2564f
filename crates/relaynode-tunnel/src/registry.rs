use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

use bytes::Bytes;
use relaynode_core::config::NodeConfig;
use relaynode_core::envelope::{ControlMessage, DestinationKey, PacketEnvelope};
use relaynode_core::events::{DetachReason, EventBus, NodeEvent};
use relaynode_core::time::now_ms;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::channel::ClientChannel;
use crate::counters::RelayCounters;
use crate::error::{Result, TunnelError};
use crate::upstream::{ReturnPath, Upstream, UpstreamWriter};

/// Latency samples retained per session.
pub const LATENCY_WINDOW: usize = 100;

/// Ids that collide with fixed `/tunnel/...` HTTP routes and so could
/// never be reached through `/tunnel/{session_id}`.
pub const RESERVED_SESSION_IDS: &[&str] = &["packet", "stats"];

pub fn is_reserved_session_id(session_id: &str) -> bool {
    session_id.is_empty() || RESERVED_SESSION_IDS.contains(&session_id)
}

/// Live sessions and their upstream sockets.
///
/// Cheap to clone; all clones share one registry. The lock is only held
/// for map bookkeeping, never across a socket operation.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<NodeConfig>,
    sessions: Mutex<HashMap<String, Session>>,
    counters: Arc<RelayCounters>,
    events: EventBus,
    admitting: AtomicBool,
    next_generation: AtomicU64,
}

struct Session {
    channel: ClientChannel,
    upstreams: HashMap<DestinationKey, UpstreamSlot>,
    attached_at: u64,
    last_activity: Instant,
    last_activity_ms: u64,
    packets_forwarded: u64,
    bytes_transferred: u64,
    latencies: VecDeque<u64>,
}

struct UpstreamSlot {
    generation: u64,
    upstream: Upstream,
}

/// Counters for one live session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetrics {
    pub session_id: String,
    pub packets_forwarded: u64,
    pub bytes_transferred: u64,
    /// Mean of the retained latency samples, milliseconds.
    pub avg_latency: f64,
    pub latency_samples: usize,
    /// Live upstream sockets.
    pub active_connections: usize,
    pub attached_at: u64,
    pub last_activity: u64,
}

/// Node-local totals across every live session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSummary {
    /// Live sessions.
    pub total_connections: usize,
    pub total_packets: u64,
    pub total_bytes: u64,
    /// Mean over every retained latency sample of every session.
    pub avg_latency: f64,
    /// Live upstream sockets across all sessions.
    pub active_connections: usize,
}

impl SessionRegistry {
    pub fn new(config: Arc<NodeConfig>, events: EventBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                sessions: Mutex::new(HashMap::new()),
                counters: Arc::new(RelayCounters::new()),
                events,
                admitting: AtomicBool::new(true),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn counters(&self) -> &Arc<RelayCounters> {
        &self.inner.counters
    }

    // ========================================================================
    // Attach / detach
    // ========================================================================

    /// Register `channel` as the session's client channel and greet it.
    ///
    /// An existing session with the same id is detached first (reason
    /// `Replaced`); the newest attach wins. Empty ids and
    /// [`RESERVED_SESSION_IDS`] are refused.
    pub fn attach(&self, session_id: &str, channel: ClientChannel) -> Result<()> {
        let inner = &self.inner;
        if is_reserved_session_id(session_id) {
            RelayCounters::incr(&inner.counters.sessions_rejected);
            return Err(TunnelError::InvalidSessionId(session_id.to_string()));
        }
        if !inner.admitting.load(Ordering::SeqCst) {
            RelayCounters::incr(&inner.counters.sessions_rejected);
            return Err(TunnelError::AdmissionClosed);
        }

        let now = now_ms();
        let replaced = {
            let mut sessions = inner.lock();
            let limit = inner.config.tunnel.max_connections;
            if !sessions.contains_key(session_id) && sessions.len() >= limit {
                drop(sessions);
                RelayCounters::incr(&inner.counters.sessions_rejected);
                warn!(session = %session_id, limit, "Session capacity exhausted");
                return Err(TunnelError::CapacityExhausted { limit });
            }
            sessions.insert(
                session_id.to_string(),
                Session {
                    channel: channel.clone(),
                    upstreams: HashMap::new(),
                    attached_at: now,
                    last_activity: Instant::now(),
                    last_activity_ms: now,
                    packets_forwarded: 0,
                    bytes_transferred: 0,
                    latencies: VecDeque::with_capacity(LATENCY_WINDOW),
                },
            )
        };

        if let Some(old) = replaced {
            info!(session = %session_id, "Session re-attached, replacing previous channel");
            inner.teardown(session_id, old, DetachReason::Replaced);
        }

        channel.send(ControlMessage::ConnectionEstablished {
            session_id: session_id.to_string(),
            node_id: inner.config.node.id.clone(),
            timestamp: now,
        });
        RelayCounters::incr(&inner.counters.sessions_attached);
        inner.events.emit(NodeEvent::SessionAttached {
            session_id: session_id.to_string(),
        });
        info!(session = %session_id, "Session attached");
        Ok(())
    }

    /// Detach a session, closing its upstreams and channel.
    ///
    /// Returns false if no such session was attached.
    pub fn detach(&self, session_id: &str, reason: DetachReason) -> bool {
        let removed = self.inner.lock().remove(session_id);
        match removed {
            Some(session) => {
                self.inner.teardown(session_id, session, reason);
                true
            }
            None => false,
        }
    }

    /// Detach only if `channel` is still the session's registered channel.
    ///
    /// Used by a channel's own close path so a replaced channel cannot
    /// tear down the session that replaced it.
    pub fn detach_channel(&self, session_id: &str, channel: &ClientChannel, reason: DetachReason) -> bool {
        let removed = {
            let mut sessions = self.inner.lock();
            let current = sessions
                .get(session_id)
                .is_some_and(|s| s.channel.same_channel(channel));
            if current { sessions.remove(session_id) } else { None }
        };
        match removed {
            Some(session) => {
                self.inner.teardown(session_id, session, reason);
                true
            }
            None => false,
        }
    }

    /// Detach every session idle for longer than the configured timeout.
    pub fn reap_idle(&self) -> usize {
        self.reap_idle_at(Instant::now())
    }

    /// Like [`reap_idle`](Self::reap_idle), measuring idleness against `now`.
    pub fn reap_idle_at(&self, now: Instant) -> usize {
        let timeout = self.inner.config.idle_timeout();
        let expired: Vec<(String, Session)> = {
            let mut sessions = self.inner.lock();
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| now.saturating_duration_since(s.last_activity) > timeout)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| sessions.remove(&id).map(|s| (id, s)))
                .collect()
        };

        let reaped = expired.len();
        for (id, session) in expired {
            RelayCounters::incr(&self.inner.counters.sessions_reaped);
            self.inner.teardown(&id, session, DetachReason::IdleTimeout);
        }
        if reaped > 0 {
            info!(reaped, "Reaped idle sessions");
        }
        reaped
    }

    /// Refuse further attaches. Existing sessions are untouched.
    pub fn close_admissions(&self) {
        self.inner.admitting.store(false, Ordering::SeqCst);
    }

    pub fn is_admitting(&self) -> bool {
        self.inner.admitting.load(Ordering::SeqCst)
    }

    /// Detach every live session.
    pub fn detach_all(&self, reason: DetachReason) -> usize {
        let drained: Vec<(String, Session)> = self.inner.lock().drain().collect();
        let count = drained.len();
        for (id, session) in drained {
            self.inner.teardown(&id, session, reason);
        }
        count
    }

    // ========================================================================
    // Forwarding
    // ========================================================================

    /// Write one envelope's payload to its upstream, opening the socket on
    /// first use of the destination.
    pub async fn forward(&self, session_id: &str, envelope: PacketEnvelope) -> Result<()> {
        let inner = &self.inner;
        let limit = inner.config.tunnel.max_packet_size;
        if envelope.data.len() > limit {
            RelayCounters::incr(&inner.counters.packets_rejected);
            return Err(TunnelError::PacketTooLarge {
                size: envelope.data.len(),
                limit,
            });
        }
        if envelope.dest_ip.is_empty() || envelope.dest_port == 0 {
            RelayCounters::incr(&inner.counters.packets_rejected);
            return Err(TunnelError::InvalidEnvelope(format!(
                "bad destination '{}:{}'",
                envelope.dest_ip, envelope.dest_port
            )));
        }

        let dest = envelope.destination();
        let existing = {
            let mut sessions = inner.lock();
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| TunnelError::SessionNotFound(session_id.to_string()))?;
            session.touch();
            match session.upstreams.get(&dest) {
                Some(slot) => Ok((slot.generation, slot.upstream.writer())),
                None => Err(session.channel.clone()),
            }
        };

        let (generation, writer) = match existing {
            Ok(found) => found,
            Err(channel) => self.open_upstream(session_id, &dest, channel).await?,
        };

        let size = envelope.data.len();
        if let Err(e) = writer.write(&dest, Bytes::from(envelope.data)).await {
            warn!(session = %session_id, dest = %dest, error = %e, "Upstream write failed");
            RelayCounters::incr(&inner.counters.upstream_failures);
            inner.release_upstream(session_id, &dest, generation);
            return Err(e);
        }

        let latency = now_ms().saturating_sub(envelope.timestamp);
        if let Some(session) = inner.lock().get_mut(session_id) {
            session.packets_forwarded += 1;
            session.bytes_transferred += size as u64;
            push_latency(&mut session.latencies, latency);
        }
        RelayCounters::incr(&inner.counters.packets_forwarded);
        RelayCounters::add(&inner.counters.bytes_forwarded, size as u64);
        Ok(())
    }

    async fn open_upstream(
        &self,
        session_id: &str,
        dest: &DestinationKey,
        channel: ClientChannel,
    ) -> Result<(u64, UpstreamWriter)> {
        let inner = &self.inner;
        let generation = inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let (sid, key) = (session_id.to_string(), dest.clone());
        let ret = ReturnPath {
            channel,
            counters: Arc::clone(&inner.counters),
            on_closed: Arc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.release_upstream(&sid, &key, generation);
                }
            }),
            buffer_size: inner.config.tunnel.buffer_size,
        };

        let upstream = match Upstream::connect(dest, inner.config.idle_timeout(), ret).await {
            Ok(u) => u,
            Err(e) => {
                warn!(session = %session_id, dest = %dest, error = %e, "Upstream connect failed");
                RelayCounters::incr(&inner.counters.upstream_failures);
                return Err(e);
            }
        };

        let mut sessions = inner.lock();
        let Some(session) = sessions.get_mut(session_id) else {
            // Detached while we were connecting.
            drop(sessions);
            upstream.close();
            return Err(TunnelError::SessionNotFound(session_id.to_string()));
        };
        if let Some(slot) = session.upstreams.get(dest) {
            // A concurrent forward won the race; keep its socket.
            let found = (slot.generation, slot.upstream.writer());
            drop(sessions);
            upstream.close();
            return Ok(found);
        }
        let writer = upstream.writer();
        session
            .upstreams
            .insert(dest.clone(), UpstreamSlot { generation, upstream });
        drop(sessions);

        RelayCounters::incr(&inner.counters.upstreams_opened);
        debug!(session = %session_id, dest = %dest, generation, "Upstream opened");
        Ok((generation, writer))
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn connection_metrics(&self, session_id: &str) -> Option<SessionMetrics> {
        let sessions = self.inner.lock();
        sessions.get(session_id).map(|s| SessionMetrics {
            session_id: session_id.to_string(),
            packets_forwarded: s.packets_forwarded,
            bytes_transferred: s.bytes_transferred,
            avg_latency: mean(s.latencies.iter().copied(), s.latencies.len()),
            latency_samples: s.latencies.len(),
            active_connections: s.upstreams.len(),
            attached_at: s.attached_at,
            last_activity: s.last_activity_ms,
        })
    }

    /// Totals across all live sessions. Zeroed when none are attached.
    pub fn connection_summary(&self) -> ConnectionSummary {
        let sessions = self.inner.lock();
        let samples: usize = sessions.values().map(|s| s.latencies.len()).sum();
        ConnectionSummary {
            total_connections: sessions.len(),
            total_packets: sessions.values().map(|s| s.packets_forwarded).sum(),
            total_bytes: sessions.values().map(|s| s.bytes_transferred).sum(),
            avg_latency: mean(
                sessions.values().flat_map(|s| s.latencies.iter().copied()),
                samples,
            ),
            active_connections: sessions.values().map(|s| s.upstreams.len()).sum(),
        }
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock().len()
    }

    /// Live upstream sockets for one session.
    pub fn upstream_count(&self, session_id: &str) -> Option<usize> {
        self.inner.lock().get(session_id).map(|s| s.upstreams.len())
    }

    pub fn prometheus_exposition(&self) -> String {
        let (sessions, upstreams) = {
            let map = self.inner.lock();
            (map.len(), map.values().map(|s| s.upstreams.len()).sum())
        };
        self.inner.counters.prometheus_exposition(sessions, upstreams)
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Close a removed session's sockets and channel and announce it.
    fn teardown(&self, session_id: &str, session: Session, reason: DetachReason) {
        let upstreams = session.upstreams.len();
        for (dest, slot) in session.upstreams {
            debug!(session = %session_id, dest = %dest, "Closing upstream");
            slot.upstream.close();
            RelayCounters::incr(&self.counters.upstreams_closed);
        }
        session.channel.close();
        RelayCounters::incr(&self.counters.sessions_detached);
        self.events.emit(NodeEvent::SessionDetached {
            session_id: session_id.to_string(),
            reason,
        });
        info!(
            session = %session_id,
            reason = %reason,
            upstreams,
            packets = session.packets_forwarded,
            bytes = session.bytes_transferred,
            "Session detached"
        );
    }

    /// Drop an upstream if it is still the one opened as `generation`.
    fn release_upstream(&self, session_id: &str, dest: &DestinationKey, generation: u64) {
        let slot = {
            let mut sessions = self.lock();
            let Some(session) = sessions.get_mut(session_id) else {
                return;
            };
            let current = session
                .upstreams
                .get(dest)
                .is_some_and(|slot| slot.generation == generation);
            if current { session.upstreams.remove(dest) } else { None }
        };
        if let Some(slot) = slot {
            debug!(session = %session_id, dest = %dest, generation, "Upstream released");
            slot.upstream.close();
            RelayCounters::incr(&self.counters.upstreams_closed);
        }
    }
}

impl Session {
    fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.last_activity_ms = now_ms();
    }
}

/// Append a latency sample, evicting the oldest beyond the window.
fn push_latency(ring: &mut VecDeque<u64>, sample: u64) {
    if ring.len() >= LATENCY_WINDOW {
        ring.pop_front();
    }
    ring.push_back(sample);
}

/// Arithmetic mean rounded to two decimals; 0 for no samples.
fn mean(values: impl Iterator<Item = u64>, count: usize) -> f64 {
    if count == 0 {
        return 0.0;
    }
    let total: u64 = values.sum();
    let avg = total as f64 / count as f64;
    (avg * 100.0).round() / 100.0
}
