//! Connection manager: the single entry point for registering connections
//! and broadcasting room events.
//!
//! Owns the room subscription table, the bus client, and the lifecycle of
//! the listener task. Nothing here propagates a hard failure to callers:
//! every failure mode degrades to "fewer recipients reached".

use super::{listener, room_channel, RoomRegistry, SubscriberId};
use crate::bus::BusClient;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Read-only health/debug view of the broadcast layer.
#[derive(Debug, Clone, Serialize)]
pub struct RoomSnapshot {
    pub bus_connected: bool,
    pub rooms: HashMap<String, usize>,
}

/// Tracks the listener task. `epoch` increments each time a task is
/// spawned; a task that ends only cleans up while its epoch is still
/// current. A stale task therefore cannot clear a newer task's handle or
/// mark a freshly reconnected bus as down.
pub(crate) struct ListenerSlot {
    pub(crate) epoch: u64,
    pub(crate) handle: Option<JoinHandle<()>>,
}

pub struct ConnectionManager {
    registry: RoomRegistry,
    bus: Arc<BusClient>,
    /// At most one live listener task per process. The task clears its own
    /// slot when its stream ends so a later `connect` can restart it.
    listener: Arc<Mutex<ListenerSlot>>,
    /// Serializes membership transitions together with their bus
    /// subscribe/unsubscribe side effects, so table state and bus
    /// subscription state cannot diverge under concurrent load. Never held
    /// during `broadcast`.
    topology: Mutex<()>,
}

impl ConnectionManager {
    pub fn new(bus: Arc<BusClient>) -> Arc<Self> {
        Arc::new(Self {
            registry: RoomRegistry::new(),
            bus,
            listener: Arc::new(Mutex::new(ListenerSlot {
                epoch: 0,
                handle: None,
            })),
            topology: Mutex::new(()),
        })
    }

    /// Register a connection under `room_id`.
    ///
    /// The caller must have completed the transport handshake and
    /// authentication already. Always succeeds; a bus subscription failure
    /// is logged and the room keeps working with local-only delivery.
    ///
    /// Returns the membership guard (which guarantees exactly one
    /// `disconnect` on every exit path) and the receiver the session loop
    /// drains for outbound payloads.
    pub async fn connect(
        self: &Arc<Self>,
        room_id: &str,
    ) -> (RoomMembership, UnboundedReceiver<String>) {
        let _topology = self.topology.lock().await;
        let (subscriber_id, rx, first) = self.registry.add(room_id).await;

        if self.bus.is_connected().await {
            if first {
                self.subscribe_room(room_id).await;
            }
            self.ensure_listener().await;
        } else {
            // The room is registered either way; a successful reconnect
            // resubscribes everything currently in the table.
            self.spawn_reconnect();
        }

        let membership = RoomMembership {
            manager: Arc::clone(self),
            room_id: room_id.to_string(),
            subscriber_id,
            released: false,
        };
        (membership, rx)
    }

    /// Remove a connection from a room. Idempotent: unknown pairs are a
    /// no-op. When the last local member leaves, the room entry is dropped
    /// and the bus channel is unsubscribed (failure-tolerant).
    pub async fn disconnect(&self, room_id: &str, subscriber_id: SubscriberId) {
        let _topology = self.topology.lock().await;
        let emptied = self.registry.remove(room_id, subscriber_id).await;
        if emptied {
            self.unsubscribe_room(room_id).await;
        }
    }

    /// Deliver `payload` to every connection registered under `room_id`,
    /// across all processes.
    ///
    /// Connected bus: publish and return. Local delivery then happens only
    /// via the listener receiving our own publish, so nobody gets a
    /// duplicate.
    /// Disconnected bus, or a failed publish: fall back to local-only
    /// delivery. The sender never sees an error either way.
    pub async fn broadcast(&self, room_id: &str, payload: &serde_json::Value) {
        let message = payload.to_string();

        if self.bus.is_connected().await {
            match self.bus.publish(&room_channel(room_id), &message).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(%room_id, error = %e, "bus publish failed; delivering locally only");
                }
            }
        }

        self.deliver_local(room_id, &message).await;
    }

    /// Local fan-out shared by the broadcast fallback path and the listener
    /// task. If pruning dead connections empties the room, the bus channel
    /// is unsubscribed as well.
    pub(crate) async fn deliver_local(&self, room_id: &str, payload: &str) {
        let emptied = self.registry.deliver_local(room_id, payload).await;
        if emptied {
            let _topology = self.topology.lock().await;
            // Re-check: a connect may have raced the prune.
            if self.registry.count(room_id).await == 0 {
                self.unsubscribe_room(room_id).await;
            }
        }
    }

    pub async fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            bus_connected: self.bus.is_connected().await,
            rooms: self.registry.snapshot().await,
        }
    }

    pub fn bus(&self) -> &Arc<BusClient> {
        &self.bus
    }

    pub(crate) fn listener_slot(&self) -> Arc<Mutex<ListenerSlot>> {
        Arc::clone(&self.listener)
    }

    async fn subscribe_room(&self, room_id: &str) {
        if let Err(e) = self.bus.subscribe(&room_channel(room_id)).await {
            warn!(%room_id, error = %e, "bus subscribe failed; room continues local-only");
        }
    }

    async fn unsubscribe_room(&self, room_id: &str) {
        if !self.bus.is_connected().await {
            return;
        }
        if let Err(e) = self.bus.unsubscribe(&room_channel(room_id)).await {
            warn!(%room_id, error = %e, "bus unsubscribe failed");
        }
    }

    /// Start the listener task when a fresh pub/sub stream is available.
    /// A fresh stream only exists right after the bus (re)connected, so any
    /// task still in the slot is draining a dead connection and is replaced.
    async fn ensure_listener(self: &Arc<Self>) {
        let Some(stream) = self.bus.take_stream().await else {
            return;
        };
        let mut slot = self.listener.lock().await;
        if let Some(stale) = slot.handle.take() {
            stale.abort();
        }
        slot.epoch += 1;
        debug!(epoch = slot.epoch, "starting bus listener task");
        let manager = Arc::clone(self);
        slot.handle = Some(tokio::spawn(listener::run(stream, manager, slot.epoch)));
    }

    /// One non-blocking reconnect attempt, triggered by a `connect` that
    /// finds the bus down. On success every room currently in the table is
    /// resubscribed and the listener restarts. No periodic background
    /// retry: a quiet process stays local-only until the next connect.
    fn spawn_reconnect(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.bus.initialize().await;
            if !manager.bus.is_connected().await {
                return;
            }
            let _topology = manager.topology.lock().await;
            for room_id in manager.registry.snapshot().await.keys() {
                manager.subscribe_room(room_id).await;
            }
            manager.ensure_listener().await;
        });
    }

    /// Cancel the listener task before releasing the bus connections, so
    /// the listener never observes a half-torn-down client.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.listener.lock().await.handle.take() {
            handle.abort();
        }
        self.bus.shutdown().await;
    }
}

/// Scoped room membership: registering a connection yields this guard, and
/// dropping it (normal return, error, or panic unwind in the session task)
/// runs `disconnect` exactly once.
pub struct RoomMembership {
    manager: Arc<ConnectionManager>,
    room_id: String,
    subscriber_id: SubscriberId,
    released: bool,
}

impl RoomMembership {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Preferred exit path: awaited disconnect, so membership and bus
    /// subscription state settle before the session task finishes.
    pub async fn leave(mut self) {
        self.released = true;
        self.manager
            .disconnect(&self.room_id, self.subscriber_id)
            .await;
    }
}

impl Drop for RoomMembership {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let manager = Arc::clone(&self.manager);
        let room_id = std::mem::take(&mut self.room_id);
        let subscriber_id = self.subscriber_id;
        tokio::spawn(async move {
            manager.disconnect(&room_id, subscriber_id).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn offline_manager() -> Arc<ConnectionManager> {
        // Bus never initialized: stays Disconnected, so every broadcast
        // takes the local-only path and no Redis server is needed.
        ConnectionManager::new(Arc::new(BusClient::new("redis://127.0.0.1:6379")))
    }

    #[tokio::test]
    async fn local_broadcast_reaches_only_that_room() {
        let manager = offline_manager();
        let (m1, mut rx1) = manager.connect("r1").await;
        let (m2, mut rx2) = manager.connect("r1").await;
        let (m3, mut rx3) = manager.connect("r2").await;

        let payload = json!({"type": "text", "content": "hi"});
        manager.broadcast("r1", &payload).await;

        let got1: serde_json::Value = serde_json::from_str(&rx1.recv().await.unwrap()).unwrap();
        let got2: serde_json::Value = serde_json::from_str(&rx2.recv().await.unwrap()).unwrap();
        assert_eq!(got1, payload);
        assert_eq!(got2, payload);
        assert!(rx3.try_recv().is_err());

        m1.leave().await;
        m2.leave().await;
        m3.leave().await;
    }

    #[tokio::test]
    async fn leave_then_broadcast_reaches_nobody() {
        let manager = offline_manager();
        let (membership, mut rx) = manager.connect("r1").await;
        membership.leave().await;

        manager.broadcast("r1", &json!({"type": "system", "content": "x"})).await;
        assert!(rx.try_recv().is_err());
        assert!(manager.snapshot().await.rooms.is_empty());
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let manager = offline_manager();
        let (membership, _rx) = manager.connect("r1").await;

        // Disconnecting a pair that was never registered is a no-op.
        manager.disconnect("r1", SubscriberId::new()).await;
        manager.disconnect("never-existed", SubscriberId::new()).await;
        assert_eq!(manager.snapshot().await.rooms.get("r1"), Some(&1));

        membership.leave().await;
        assert!(manager.snapshot().await.rooms.is_empty());
    }

    #[tokio::test]
    async fn dropped_membership_guard_still_disconnects() {
        let manager = offline_manager();
        {
            let (_membership, _rx) = manager.connect("r1").await;
            // Guard dropped here without an explicit leave().
        }
        // Drop schedules the disconnect on the runtime; give it a tick.
        tokio::task::yield_now().await;
        for _ in 0..50 {
            if manager.snapshot().await.rooms.is_empty() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("membership guard drop did not disconnect");
    }

    #[tokio::test]
    async fn broadcast_prunes_dead_connections() {
        let manager = offline_manager();
        let (m1, rx1) = manager.connect("r1").await;
        let (m2, mut rx2) = manager.connect("r1").await;
        drop(rx1); // dead socket, close not yet observed

        manager.broadcast("r1", &json!({"type": "text", "content": "ping"})).await;

        assert!(rx2.recv().await.is_some());
        assert_eq!(manager.snapshot().await.rooms.get("r1"), Some(&1));

        m1.leave().await; // now a no-op for the table
        m2.leave().await;
    }

    #[tokio::test]
    async fn snapshot_reports_bus_state_and_counts() {
        let manager = offline_manager();
        let (m1, _rx1) = manager.connect("r1").await;
        let (m2, _rx2) = manager.connect("r1").await;

        let snapshot = manager.snapshot().await;
        assert!(!snapshot.bus_connected);
        assert_eq!(snapshot.rooms.get("r1"), Some(&2));

        m1.leave().await;
        m2.leave().await;
    }
}
