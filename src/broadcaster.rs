//! Publishes tracker snapshots to a shared handle and fans them out to
//! in-process subscribers, dropping anyone who falls behind.
//!
//! Grounded on the original `broadcaster` module's Redis pub/sub contract
//! (`publish`/`subscribe`/`unsubscribe`/`get_current_state`), reimplemented
//! without a broker: the "shared key" is an in-process `RwLock` handle and
//! the fan-out is a [`tokio::sync::broadcast`] channel, the same primitive
//! the evolved WebSocket handler in this codebase's lineage builds its
//! live-updates stream on. A bounded channel already enforces the §5
//! memory bound (capacity 10) and a `Lagged` receiver is treated exactly
//! like a full queue: the subscriber is dropped rather than caught up.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{broadcast, RwLock};

const SUBSCRIBER_QUEUE_CAPACITY: usize = 10;

#[derive(Clone)]
pub struct Broadcaster {
    state: Arc<RwLock<Option<Bytes>>>,
    sender: broadcast::Sender<Bytes>,
}

/// A live subscription to snapshot updates. Dropping it deregisters the
/// subscriber; the receiver itself already enforces the bounded-queue
/// backpressure policy via `broadcast`'s ring buffer.
pub struct Subscription {
    receiver: broadcast::Receiver<Bytes>,
}

/// What happened on an attempt to receive the next update.
pub enum RecvOutcome {
    Update(Bytes),
    /// The subscriber fell behind the channel's capacity and must be
    /// dropped per the backpressure policy, not caught up.
    Lagged,
    Closed,
}

impl Subscription {
    pub async fn recv(&mut self) -> RecvOutcome {
        match self.receiver.recv().await {
            Ok(bytes) => RecvOutcome::Update(bytes),
            Err(broadcast::error::RecvError::Lagged(_)) => RecvOutcome::Lagged,
            Err(broadcast::error::RecvError::Closed) => RecvOutcome::Closed,
        }
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(SUBSCRIBER_QUEUE_CAPACITY);
        Self {
            state: Arc::new(RwLock::new(None)),
            sender,
        }
    }

    /// Serializes once, overwrites the shared state key, then fans the
    /// bytes out to every live subscriber. A subscriber with no room left
    /// in its queue is handled passively: it will observe `Lagged` on its
    /// next `recv` and be dropped there, matching the "mark for removal,
    /// then sweep" policy without needing an explicit sweep pass, since a
    /// broadcast channel has no per-subscriber queue to overflow eagerly.
    pub async fn publish(&self, bytes: Bytes) {
        *self.state.write().await = Some(bytes.clone());
        // No receivers is not an error here; it just means nobody is
        // currently connected to the live-updates channel.
        let _ = self.sender.send(bytes);
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }

    pub async fn latest_snapshot(&self) -> Option<Bytes> {
        self.state.read().await.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn latest_snapshot_is_none_before_any_publish() {
        let b = Broadcaster::new();
        assert!(b.latest_snapshot().await.is_none());
    }

    #[tokio::test]
    async fn publish_updates_latest_snapshot() {
        let b = Broadcaster::new();
        b.publish(Bytes::from_static(b"hello")).await;
        assert_eq!(b.latest_snapshot().await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn subscriber_receives_published_update() {
        let b = Broadcaster::new();
        let mut sub = b.subscribe();
        b.publish(Bytes::from_static(b"update-1")).await;
        match sub.recv().await {
            RecvOutcome::Update(bytes) => assert_eq!(bytes, Bytes::from_static(b"update-1")),
            _ => panic!("expected an update"),
        }
    }

    #[tokio::test]
    async fn slow_subscriber_observes_lagged_instead_of_blocking_publish() {
        let b = Broadcaster::new();
        let mut sub = b.subscribe();
        for i in 0..(SUBSCRIBER_QUEUE_CAPACITY + 5) {
            b.publish(Bytes::from(format!("update-{i}"))).await;
        }
        let outcome = sub.recv().await;
        assert!(matches!(outcome, RecvOutcome::Lagged));
    }

    #[tokio::test]
    async fn subscriber_count_reflects_live_subscriptions() {
        let b = Broadcaster::new();
        assert_eq!(b.subscriber_count(), 0);
        let sub = b.subscribe();
        assert_eq!(b.subscriber_count(), 1);
        drop(sub);
        assert_eq!(b.subscriber_count(), 0);
    }
}
