//! Observer connections and the broadcast hub that fans events out to them.

use std::{collections::HashMap, net::SocketAddr};

use sandbox_protocol::{Action, StatusEvent};
use tokio::sync::{Mutex, mpsc};

/// Push half of one observer connection.
#[derive(Clone, Debug)]
pub struct EventSink {
    sender: mpsc::UnboundedSender<StatusEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StatusEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Returns false once the observer is gone.
    pub fn send(&self, event: StatusEvent) -> bool {
        self.sender.send(event).is_ok()
    }

    pub fn emit(&self, action: Action, message: impl Into<String>) -> bool {
        self.send(StatusEvent::new(action, message))
    }

    pub fn status(&self, message: impl Into<String>) -> bool {
        self.emit(Action::Status, message)
    }

    pub fn progress(&self, message: impl Into<String>) -> bool {
        self.emit(Action::Progress, message)
    }

    pub fn log(&self, line: impl Into<String>) -> bool {
        self.emit(Action::Log, line)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Connected observers keyed by peer address.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SocketAddr, EventSink>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the sink for `peer`.
    pub async fn add(&self, peer: SocketAddr, sink: EventSink) {
        let mut sessions = self.sessions.lock().await;
        let _ = sessions.insert(peer, sink);
    }

    pub async fn remove(&self, peer: &SocketAddr) -> bool {
        let mut sessions = self.sessions.lock().await;
        sessions.remove(peer).is_some()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Best-effort fan-out over a snapshot of current members. Sinks whose
    /// observer has gone away are skipped and pruned. Returns the number of
    /// observers the event was handed to.
    pub async fn broadcast(&self, event: &StatusEvent) -> usize {
        let snapshot = {
            let sessions = self.sessions.lock().await;
            sessions
                .iter()
                .map(|(peer, sink)| (*peer, sink.clone()))
                .collect::<Vec<_>>()
        };

        let mut delivered = 0usize;
        let mut closed = Vec::new();
        for (peer, sink) in snapshot {
            if sink.send(event.clone()) {
                delivered = delivered.saturating_add(1);
            } else {
                closed.push((peer, sink));
            }
        }

        if !closed.is_empty() {
            let mut sessions = self.sessions.lock().await;
            for (peer, _) in closed {
                // A reconnect may have replaced the entry since the snapshot.
                if sessions.get(&peer).is_some_and(EventSink::is_closed) {
                    let _ = sessions.remove(&peer);
                    tracing::debug!(peer = %peer, "pruned closed observer session");
                }
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use sandbox_protocol::{Action, QuotaSnapshot, StatusEvent};

    use super::{EventSink, SessionRegistry};

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn broadcast_skips_broken_channel_and_reaches_the_rest() {
        let registry = SessionRegistry::new();
        let mut receivers = Vec::new();
        for port in 0..5u16 {
            let (sink, receiver) = EventSink::channel();
            registry.add(peer(10_000 + port), sink).await;
            receivers.push(receiver);
        }
        // Break the third observer's channel.
        drop(receivers.remove(2));

        let event = StatusEvent::quota(QuotaSnapshot::new(1, 4));
        let delivered = registry.broadcast(&event).await;
        assert_eq!(delivered, 4);
        for receiver in &mut receivers {
            let received = receiver.try_recv().expect("event delivered");
            assert_eq!(received.action, Action::Rquota);
        }
        assert_eq!(registry.len().await, 4);
    }

    #[tokio::test]
    async fn add_replaces_and_remove_deletes() {
        let registry = SessionRegistry::new();
        let (first, mut first_rx) = EventSink::channel();
        let (second, mut second_rx) = EventSink::channel();
        registry.add(peer(1), first).await;
        registry.add(peer(1), second).await;
        assert_eq!(registry.len().await, 1);

        let _ = registry
            .broadcast(&StatusEvent::new(Action::Status, "hello"))
            .await;
        assert!(first_rx.try_recv().is_err());
        assert_eq!(second_rx.try_recv().expect("replaced sink").message, "hello");

        assert!(registry.remove(&peer(1)).await);
        assert!(!registry.remove(&peer(1)).await);
        assert!(registry.is_empty().await);
    }
}
