//! Background task that drains the bus subscription stream and re-delivers
//! each message to the local connections of its room.
//!
//! Exactly one of these runs per process. It is the only consumer of the
//! pub/sub stream; the connection manager owns its handle.

use super::{manager::ConnectionManager, ROOM_CHANNEL_PREFIX};
use futures_util::StreamExt;
use redis::aio::PubSubStream;
use std::sync::Arc;
use tracing::{info, warn};

pub(crate) async fn run(mut stream: PubSubStream, manager: Arc<ConnectionManager>, epoch: u64) {
    info!(epoch, "bus listener started");

    while let Some(msg) = stream.next().await {
        let channel = msg.get_channel_name().to_string();
        let Some(room_id) = channel.strip_prefix(ROOM_CHANNEL_PREFIX) else {
            // Not a room channel; nothing of ours.
            continue;
        };

        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                warn!(%channel, error = %e, "dropping undecodable bus message");
                continue;
            }
        };

        // Validate without rewriting: the original text is delivered
        // untouched so the payload round-trips exactly.
        if let Err(e) = serde_json::from_str::<serde_json::Value>(&payload) {
            warn!(%room_id, error = %e, "dropping malformed bus payload");
            continue;
        }

        manager.deliver_local(room_id, &payload).await;
    }

    // Stream ended: the broker connection is gone. Clean up only while our
    // epoch is still current; if a newer listener replaced this one, the
    // slot and the bus state belong to it. Restarting from here would retry
    // without bound, so a future connect restarts the task instead.
    let slot = manager.listener_slot();
    let mut slot = slot.lock().await;
    if slot.epoch != epoch {
        return;
    }
    slot.handle.take();
    drop(slot);
    warn!("bus listener stream ended; switching to local-only delivery");
    manager.bus().mark_disconnected().await;
}
