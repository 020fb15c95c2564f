use std::sync::Arc;

use relaynode_core::envelope::ControlMessage;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// A message queued for a client's tunnel channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Control(ControlMessage),
    /// Close the channel after flushing what was queued before it.
    Close,
}

/// Write side of one client's duplex tunnel channel.
///
/// The transport (a WebSocket writer task in the server) drains the paired
/// receiver. Sends never wait: a full or closed channel drops the message.
///
/// Closing is two-fold: an `Outbound::Close` is queued so the transport can
/// flush and send a close frame, and a cancellation flag is raised that
/// the transport must honour even when the queue is full or its writer is
/// stuck on a dead peer.
#[derive(Debug, Clone)]
pub struct ClientChannel {
    session_id: Arc<str>,
    tx: mpsc::Sender<Outbound>,
    cancel: Arc<watch::Sender<bool>>,
}

impl ClientChannel {
    pub fn new(session_id: &str, capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (cancel, _) = watch::channel(false);
        let channel = Self {
            session_id: Arc::from(session_id),
            tx,
            cancel: Arc::new(cancel),
        };
        (channel, rx)
    }

    /// Queue a control message. Returns false if it was dropped.
    pub fn send(&self, message: ControlMessage) -> bool {
        match self.tx.try_send(Outbound::Control(message)) {
            Ok(()) => true,
            Err(TrySendError::Closed(_)) => {
                debug!(session = %self.session_id, "Channel closed, dropping control message");
                false
            }
            Err(TrySendError::Full(_)) => {
                warn!(session = %self.session_id, "Channel backlog full, dropping control message");
                false
            }
        }
    }

    /// Close the channel. Idempotent.
    ///
    /// The cancellation flag is always raised; the graceful `Close` marker
    /// is best-effort.
    pub fn close(&self) {
        if self.cancel.send_replace(true) {
            return;
        }
        match self.tx.try_send(Outbound::Close) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(_)) => {
                debug!(session = %self.session_id, "Channel backlog full, closing without close marker");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.cancel.borrow() || self.tx.is_closed()
    }

    /// Resolves once [`close`](Self::close) has been called on any clone.
    pub async fn closed(&self) {
        let mut rx = self.cancel.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// True if both handles write to the same underlying channel.
    pub fn same_channel(&self, other: &ClientChannel) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn established() -> ControlMessage {
        ControlMessage::ConnectionEstablished {
            session_id: "s1".into(),
            node_id: "n1".into(),
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn test_send_then_close_preserves_order() {
        let (channel, mut rx) = ClientChannel::new("s1", 4);
        assert!(channel.send(established()));
        channel.close();
        assert_eq!(rx.recv().await, Some(Outbound::Control(established())));
        assert_eq!(rx.recv().await, Some(Outbound::Close));
    }

    #[test]
    fn test_send_after_receiver_dropped_is_dropped() {
        let (channel, rx) = ClientChannel::new("s1", 4);
        drop(rx);
        assert!(channel.is_closed());
        assert!(!channel.send(established()));
        channel.close();
    }

    #[test]
    fn test_full_backlog_drops() {
        let (channel, _rx) = ClientChannel::new("s1", 1);
        assert!(channel.send(established()));
        assert!(!channel.send(established()));
    }

    #[tokio::test]
    async fn test_close_with_full_backlog_still_cancels() {
        let (channel, mut rx) = ClientChannel::new("s1", 1);
        assert!(channel.send(established()));
        let waiter = channel.clone();
        channel.close();

        tokio::time::timeout(std::time::Duration::from_secs(1), waiter.closed())
            .await
            .unwrap();
        assert!(waiter.is_closed());
        assert_eq!(rx.recv().await, Some(Outbound::Control(established())));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (channel, mut rx) = ClientChannel::new("s1", 4);
        channel.close();
        channel.close();
        channel.closed().await;
        assert_eq!(rx.recv().await, Some(Outbound::Close));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_same_channel() {
        let (a, _rx_a) = ClientChannel::new("s1", 1);
        let (b, _rx_b) = ClientChannel::new("s1", 1);
        assert!(a.same_channel(&a.clone()));
        assert!(!a.same_channel(&b));
    }
}
