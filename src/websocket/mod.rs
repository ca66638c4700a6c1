use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{
    mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    RwLock,
};
use uuid::Uuid;

pub mod events;
pub mod handlers;
pub mod listener;
pub mod manager;

/// Prefix shared by every room's broker channel.
pub const ROOM_CHANNEL_PREFIX: &str = "room:";

/// Broker channel name for a room. One room, one channel.
pub fn room_channel(room_id: &str) -> String {
    format!("{ROOM_CHANNEL_PREFIX}{room_id}")
}

/// Unique identifier for one registered WebSocket connection.
///
/// Handed out when a connection registers; used for precise O(1) removal
/// when the connection closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-process table of live connections, keyed by room id.
///
/// The only shared mutable state in the process besides the listener task
/// handle. Invariant: a room id is present iff its subscriber map is
/// non-empty; the entry is dropped in the same write-lock section that
/// removes the last subscriber.
#[derive(Default, Clone)]
pub struct RoomRegistry {
    inner: Arc<RwLock<HashMap<String, HashMap<SubscriberId, UnboundedSender<String>>>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber under `room_id`.
    ///
    /// Returns `(subscriber_id, receiver, first)` where `first` is true when
    /// this subscriber created the room entry. The caller uses it to decide
    /// whether the bus channel needs a subscription.
    pub async fn add(&self, room_id: &str) -> (SubscriberId, UnboundedReceiver<String>, bool) {
        let (tx, rx) = unbounded_channel();
        let subscriber_id = SubscriberId::new();

        let mut guard = self.inner.write().await;
        let entry = guard.entry(room_id.to_string()).or_default();
        let first = entry.is_empty();
        entry.insert(subscriber_id, tx);

        tracing::debug!(
            %room_id,
            subscriber = ?subscriber_id,
            total = entry.len(),
            "subscriber added"
        );

        (subscriber_id, rx, first)
    }

    /// Remove a subscriber. Unknown `(room_id, subscriber_id)` pairs are a
    /// no-op. Returns true when the room entry was emptied and removed.
    pub async fn remove(&self, room_id: &str, subscriber_id: SubscriberId) -> bool {
        let mut guard = self.inner.write().await;

        let Some(subscribers) = guard.get_mut(room_id) else {
            return false;
        };

        subscribers.remove(&subscriber_id);
        if subscribers.is_empty() {
            guard.remove(room_id);
            tracing::debug!(%room_id, "room entry emptied and removed");
            return true;
        }
        false
    }

    /// Push `payload` to every local subscriber of `room_id`.
    ///
    /// Dead subscribers (send to a closed connection) are pruned after the
    /// iteration; this is the lazy cleanup path for connections whose close
    /// has not yet been observed by `remove`. Returns true when pruning
    /// emptied the room entry.
    pub async fn deliver_local(&self, room_id: &str, payload: &str) -> bool {
        let mut guard = self.inner.write().await;
        let Some(subscribers) = guard.get_mut(room_id) else {
            return false;
        };

        let before = subscribers.len();
        subscribers.retain(|_, sender| sender.send(payload.to_string()).is_ok());
        let after = subscribers.len();
        if before != after {
            tracing::debug!(
                %room_id,
                pruned = before - after,
                active = after,
                "pruned dead subscribers during delivery"
            );
        }

        if subscribers.is_empty() {
            guard.remove(room_id);
            return true;
        }
        false
    }

    pub async fn count(&self, room_id: &str) -> usize {
        let guard = self.inner.read().await;
        guard.get(room_id).map(|v| v.len()).unwrap_or(0)
    }

    /// Read-only view of `{room_id -> connection_count}`.
    pub async fn snapshot(&self) -> HashMap<String, usize> {
        let guard = self.inner.read().await;
        guard.iter().map(|(k, v)| (k.clone(), v.len())).collect()
    }
}
