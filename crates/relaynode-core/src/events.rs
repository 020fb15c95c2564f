use std::fmt;

use tokio::sync::broadcast;

use crate::node::{HealthState, NodeMetricsSample};

/// Why a session was detached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachReason {
    /// Explicit stop requested by the client or an operator.
    Requested,
    /// The client's tunnel channel closed or errored.
    ChannelClosed,
    /// No activity within the configured idle timeout.
    IdleTimeout,
    /// A newer attach for the same session id took over.
    Replaced,
    /// The node is shutting down.
    Shutdown,
}

impl fmt::Display for DetachReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DetachReason::Requested => "requested",
            DetachReason::ChannelClosed => "channel_closed",
            DetachReason::IdleTimeout => "idle_timeout",
            DetachReason::Replaced => "replaced",
            DetachReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Internal notifications published by node components.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    SessionAttached {
        session_id: String,
    },
    SessionDetached {
        session_id: String,
        reason: DetachReason,
    },
    HealthChanged {
        status: HealthState,
        failed_checks: Vec<String>,
    },
    MetricsCollected(Box<NodeMetricsSample>),
}

/// Fan-out channel for [`NodeEvent`]s.
///
/// Publishing never blocks and never fails: with no subscribers the
/// event is dropped, and slow subscribers observe `Lagged`.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<NodeEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, event: NodeEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_subscribers_is_noop() {
        let bus = EventBus::new(4);
        bus.emit(NodeEvent::SessionAttached {
            session_id: "s1".into(),
        });
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        bus.emit(NodeEvent::SessionDetached {
            session_id: "s1".into(),
            reason: DetachReason::IdleTimeout,
        });
        match rx.recv().await.unwrap() {
            NodeEvent::SessionDetached { session_id, reason } => {
                assert_eq!(session_id, "s1");
                assert_eq!(reason, DetachReason::IdleTimeout);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_detach_reason_display() {
        assert_eq!(DetachReason::ChannelClosed.to_string(), "channel_closed");
        assert_eq!(DetachReason::IdleTimeout.to_string(), "idle_timeout");
    }
}
