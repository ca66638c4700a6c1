//! Thin wrapper around the shared Redis pub/sub broker.
//!
//! Owns one multiplexed connection for publishing and one pub/sub
//! connection split into a subscription sink (held here) and a message
//! stream (handed to the listener task). No retry or backoff policy lives
//! here. Callers decide how to degrade when a call fails.

use redis::aio::{ConnectionManager, PubSubSink, PubSubStream};
use redis::{AsyncCommands, Client};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

/// Connectivity of the process-wide bus connection.
///
/// Transitions are driven only by `BusClient` itself; everyone else just
/// reads the state to pick a delivery path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus is not connected")]
    NotConnected,

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

pub struct BusClient {
    url: String,
    state: RwLock<BusState>,
    publisher: RwLock<Option<ConnectionManager>>,
    sink: Mutex<Option<PubSubSink>>,
    stream: Mutex<Option<PubSubStream>>,
}

impl BusClient {
    /// Create a client in the `Disconnected` state. No I/O happens until
    /// `initialize` is called.
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            state: RwLock::new(BusState::Disconnected),
            publisher: RwLock::new(None),
            sink: Mutex::new(None),
            stream: Mutex::new(None),
        }
    }

    /// Attempt to connect and ping the broker.
    ///
    /// On failure the client stays `Disconnected` and the error is logged,
    /// never returned: the rest of the system must keep working without the
    /// bus (local-only delivery). Safe to call again after a connection
    /// loss; while an attempt is in flight, or once connected, further
    /// calls are no-ops.
    pub async fn initialize(&self) {
        {
            let mut state = self.state.write().await;
            if *state != BusState::Disconnected {
                return;
            }
            *state = BusState::Connecting;
        }

        match self.try_connect().await {
            Ok(()) => {
                *self.state.write().await = BusState::Connected;
                info!(url = %self.url, "bus connected");
            }
            Err(e) => {
                *self.state.write().await = BusState::Disconnected;
                warn!(url = %self.url, error = %e, "bus connection failed; continuing with local-only delivery");
            }
        }
    }

    async fn try_connect(&self) -> Result<(), BusError> {
        let client = Client::open(self.url.as_str())?;
        let mut manager = ConnectionManager::new(client.clone()).await?;
        let _: String = redis::cmd("PING").query_async(&mut manager).await?;

        let pubsub = client.get_async_pubsub().await?;
        let (sink, stream) = pubsub.split();

        *self.publisher.write().await = Some(manager);
        *self.sink.lock().await = Some(sink);
        *self.stream.lock().await = Some(stream);
        Ok(())
    }

    pub async fn state(&self) -> BusState {
        *self.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await == BusState::Connected
    }

    /// Record a connection loss observed by the listener task. Publishing
    /// and subscribing return `NotConnected` until the next `initialize`.
    pub async fn mark_disconnected(&self) {
        *self.state.write().await = BusState::Disconnected;
    }

    pub async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError> {
        let mut conn = {
            let guard = self.publisher.read().await;
            guard.as_ref().cloned().ok_or(BusError::NotConnected)?
        };
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    pub async fn subscribe(&self, channel: &str) -> Result<(), BusError> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(BusError::NotConnected)?;
        sink.subscribe(channel).await?;
        Ok(())
    }

    pub async fn unsubscribe(&self, channel: &str) -> Result<(), BusError> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(BusError::NotConnected)?;
        sink.unsubscribe(channel).await?;
        Ok(())
    }

    /// Hand the subscribed-message stream to the listener task. There is
    /// exactly one stream per successful `initialize`; a second call
    /// returns `None` until the bus reconnects.
    pub async fn take_stream(&self) -> Option<PubSubStream> {
        self.stream.lock().await.take()
    }

    /// Release the broker connections. Called after the listener task has
    /// been cancelled.
    pub async fn shutdown(&self) {
        *self.state.write().await = BusState::Disconnected;
        self.publisher.write().await.take();
        self.sink.lock().await.take();
        self.stream.lock().await.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_client_starts_disconnected() {
        let bus = BusClient::new("redis://127.0.0.1:6379");
        assert_eq!(bus.state().await, BusState::Disconnected);
        assert!(!bus.is_connected().await);
    }

    #[tokio::test]
    async fn publish_without_connection_fails_softly() {
        let bus = BusClient::new("redis://127.0.0.1:6379");
        let err = bus.publish("room:r1", "{}").await.unwrap_err();
        assert!(matches!(err, BusError::NotConnected));
    }

    #[tokio::test]
    async fn subscribe_without_connection_fails_softly() {
        let bus = BusClient::new("redis://127.0.0.1:6379");
        assert!(matches!(
            bus.subscribe("room:r1").await.unwrap_err(),
            BusError::NotConnected
        ));
        assert!(matches!(
            bus.unsubscribe("room:r1").await.unwrap_err(),
            BusError::NotConnected
        ));
        assert!(bus.take_stream().await.is_none());
    }
}
