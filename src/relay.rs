//! Redis Pub/Sub relay for running the hub on more than one instance.
//!
//! Every instance subscribes to one channel. A message published on any
//! instance reaches each instance's local hub, which delivers it to the
//! target user if that user is connected there, or to every local session for
//! a broadcast.
//!
//! Attach the handle from [`RedisRelay::spawn_publisher`] to a
//! [`Publisher`](crate::ws::publisher::Publisher) and run
//! [`RedisRelay::spawn_listener`] on every instance, this one included.

use crate::ws::hub::{DeliveryError, Hub};
use crate::ws::message::{Message, Target};
use futures_util::StreamExt;
use redis::AsyncCommands;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const DEFAULT_CHANNEL: &str = "storefront:realtime";
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Queues messages for the relay's publishing task.
#[derive(Debug, Clone)]
pub struct RelayHandle {
    tx: mpsc::UnboundedSender<Message>,
}

impl RelayHandle {
    /// Hands a message to the relay, or gives it back if the publishing task
    /// has stopped.
    pub fn send(&self, message: Message) -> Result<(), Message> {
        self.tx.send(message).map_err(|e| e.0)
    }

    #[cfg(test)]
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[derive(Debug, Clone)]
pub struct RedisRelay {
    client: redis::Client,
    channel: String,
}

impl RedisRelay {
    pub fn new(redis_url: &str) -> Result<Self, RelayError> {
        Self::with_channel(redis_url, DEFAULT_CHANNEL)
    }

    pub fn with_channel(redis_url: &str, channel: impl Into<String>) -> Result<Self, RelayError> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
            channel: channel.into(),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Publishes a message to every instance. Returns how many subscribers
    /// Redis delivered it to.
    pub async fn publish(&self, message: &Message) -> Result<usize, RelayError> {
        let payload = serde_json::to_string(message)?;
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let receivers: usize = conn.publish(&self.channel, payload).await?;
        debug!(channel = %self.channel, receivers, kind = %message.event.kind(), "Published message to relay.");
        Ok(receivers)
    }

    /// Spawns the task that publishes every message sent through the returned
    /// handle. The task stops when every handle is dropped.
    pub fn spawn_publisher(&self) -> RelayHandle {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let relay = self.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = relay.publish(&message).await {
                    error!(kind = %message.event.kind(), "Failed to publish message to relay: {}", e);
                }
            }
            info!("Relay publisher stopped.");
        });
        RelayHandle { tx }
    }

    /// Spawns the listener that forwards relayed messages into `hub`.
    ///
    /// The listener reconnects after connection loss and stops once the hub
    /// has shut down.
    pub fn spawn_listener(&self, hub: Hub) -> JoinHandle<()> {
        let client = self.client.clone();
        let channel = self.channel.clone();
        info!(%channel, "Spawning Redis relay listener...");
        tokio::spawn(async move { run_listener(client, channel, hub).await })
    }
}

async fn run_listener(client: redis::Client, channel: String, hub: Hub) {
    while !hub.is_closed() {
        let mut pubsub = match client.get_async_pubsub().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("Failed to connect to Redis for Pub/Sub: {}. Retrying in 5s.", e);
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };
        if let Err(e) = pubsub.subscribe(&channel).await {
            error!("Failed to subscribe to {}: {}. Retrying in 5s.", channel, e);
            tokio::time::sleep(RECONNECT_DELAY).await;
            continue;
        }
        info!(%channel, "Redis relay listener connected.");

        let mut messages = pubsub.on_message();
        while let Some(msg) = messages.next().await {
            if !forward(&hub, msg) {
                info!("Hub stopped; relay listener exiting.");
                return;
            }
        }
        warn!(%channel, "Redis relay stream ended. Reconnecting.");
    }
}

fn forward(hub: &Hub, msg: redis::Msg) -> bool {
    match msg.get_payload::<String>() {
        Ok(payload) => dispatch(hub, &payload),
        Err(e) => {
            error!("Failed to get payload from Redis message: {}", e);
            true
        }
    }
}

/// Delivers one relayed payload to the local hub. Returns `false` once the
/// hub is gone.
fn dispatch(hub: &Hub, payload: &str) -> bool {
    let message: Message = match serde_json::from_str(payload) {
        Ok(m) => m,
        Err(e) => {
            warn!("Dropping malformed relayed message: {}", e);
            return true;
        }
    };

    let result = match message.target() {
        Target::User(user_id) => hub.send_to_user(user_id, message),
        Target::Broadcast => hub.broadcast(message),
    };
    match result {
        Ok(()) | Err(DeliveryError::NotConnected(_)) => true,
        Err(DeliveryError::HubClosed) => false,
        Err(e) => {
            debug!("Relayed message not delivered: {}", e);
            true
        }
    }
}
