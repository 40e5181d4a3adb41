//! One live connection bridged to the `Hub`.
//!
//! A session runs two loops over a split transport. The read loop parses
//! client frames and answers `ping`/`echo` directly; the write loop drains the
//! session's outbound queue and sends heartbeat pings. The hub owns the only
//! strong sender for the queue, so when the hub drops the session (replacement,
//! eviction, unregister) the write loop observes a closed queue, sends a close
//! frame, and stops.

use crate::config::HubConfig;
use crate::ws::hub::Hub;
use crate::ws::message::{Envelope, Event, Message, now_unix};
use crate::ws::types::{ConnectionId, Outbound, SessionHandle, UserId};
use axum::body::Bytes;
use axum::extract::ws::{Message as WsMessage, Utf8Bytes};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use tracing::{Instrument, debug, error, info, instrument, warn};
use uuid::Uuid;

const WELCOME: &str = "Connected to the realtime notification service";

/// A connection session bound to an optional user identity.
#[derive(Debug)]
pub struct Session {
    id: ConnectionId,
    user_id: Option<UserId>,
    hub: Hub,
}

impl Session {
    pub fn new(hub: Hub, user_id: Option<UserId>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            hub,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Registers with the hub and drives the connection until either loop
    /// stops. Always unregisters before returning.
    ///
    /// `sink` and `stream` are the two halves of the transport, typically
    /// obtained from `WebSocket::split`.
    #[instrument(skip_all, fields(conn_id = %self.id, user_id = ?self.user_id))]
    pub async fn run<Si, St, E>(self, sink: Si, stream: St)
    where
        Si: Sink<WsMessage> + Unpin + Send + 'static,
        Si::Error: Display,
        St: Stream<Item = Result<WsMessage, E>> + Unpin + Send,
        E: Display,
    {
        let config = self.hub.config().clone();
        let (queue, queue_rx) = mpsc::channel(config.queue_capacity);
        // The read loop only ever holds a weak sender, so it cannot keep the
        // queue open after the hub lets go of it.
        let replies = queue.downgrade();

        if !self
            .hub
            .register(SessionHandle::new(self.id, self.user_id, queue))
            .await
        {
            warn!("Hub is not running; session will close immediately.");
        }
        enqueue(&replies, Message::new(Event::System(WELCOME.to_string())));

        let mut writer = tokio::spawn(
            write_loop(sink, queue_rx, config.clone()).instrument(tracing::Span::current()),
        );

        let writer_finished = tokio::select! {
            () = self.read_loop(stream, &replies, &config) => false,
            _ = &mut writer => true,
        };

        self.hub.unregister(self.id);
        drop(replies);

        if !writer_finished && timeout(config.write_wait, &mut writer).await.is_err() {
            warn!("Write loop did not stop in time; aborting it.");
            writer.abort();
        }
        info!("Session closed.");
    }

    async fn read_loop<St, E>(
        &self,
        mut stream: St,
        replies: &mpsc::WeakSender<Outbound>,
        config: &HubConfig,
    ) where
        St: Stream<Item = Result<WsMessage, E>> + Unpin,
        E: Display,
    {
        loop {
            // Any frame, pongs included, renews the read deadline.
            let frame = match timeout(config.pong_wait, stream.next()).await {
                Err(_) => {
                    info!("No frame received within {:?}; closing.", config.pong_wait);
                    return;
                }
                Ok(None) => {
                    debug!("Transport closed by client.");
                    return;
                }
                Ok(Some(Err(e))) => {
                    warn!("WebSocket read error: {}", e);
                    return;
                }
                Ok(Some(Ok(frame))) => frame,
            };

            match frame {
                WsMessage::Text(text) => {
                    if text.as_str().len() > config.max_message_size {
                        warn!(size = text.as_str().len(), "Inbound frame exceeds size limit.");
                        return;
                    }
                    self.handle_text(text.as_str(), replies);
                }
                WsMessage::Binary(bytes) => {
                    if bytes.len() > config.max_message_size {
                        warn!(size = bytes.len(), "Inbound frame exceeds size limit.");
                        return;
                    }
                    match std::str::from_utf8(&bytes) {
                        Ok(text) => self.handle_text(text, replies),
                        Err(_) => warn!("Ignoring non UTF-8 binary frame."),
                    }
                }
                WsMessage::Close(_) => {
                    debug!("Received close frame from client.");
                    return;
                }
                _ => {}
            }
        }
    }

    /// Dispatches one client message by kind. Unknown kinds are logged and
    /// ignored.
    fn handle_text(&self, raw: &str, replies: &mpsc::WeakSender<Outbound>) {
        let normalized = raw.replace('\n', " ");
        let envelope: Envelope = match serde_json::from_str(normalized.trim()) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Failed to parse message from client: {}", e);
                return;
            }
        };

        match envelope.kind.as_str() {
            "ping" => {
                enqueue(replies, Message::new(Event::Pong("ok".to_string())));
            }
            "echo" => {
                enqueue(
                    replies,
                    Message {
                        event: Event::Echo(envelope.content),
                        user_id: envelope.user_id,
                        time: now_unix(),
                    },
                );
            }
            other => debug!(kind = other, "Received client message."),
        }
    }
}

/// Puts a reply on the session's own queue without waiting.
fn enqueue(replies: &mpsc::WeakSender<Outbound>, message: Message) -> bool {
    let Some(queue) = replies.upgrade() else {
        debug!("Outbound queue already closed; reply dropped.");
        return false;
    };
    match queue.try_send(Arc::new(message)) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!("Outbound queue full; reply dropped.");
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

async fn write_loop<Si>(mut sink: Si, mut queue: mpsc::Receiver<Outbound>, config: HubConfig)
where
    Si: Sink<WsMessage> + Unpin,
    Si::Error: Display,
{
    let mut heartbeat = interval_at(Instant::now() + config.ping_period, config.ping_period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            next = queue.recv() => {
                let Some(message) = next else {
                    debug!("Outbound queue closed; sending close frame.");
                    let _ = within(config.write_wait, sink.send(WsMessage::Close(None))).await;
                    return;
                };
                if let Err(e) = write_pending(&mut sink, &mut queue, message, &config).await {
                    warn!("Failed to write to client: {}", e);
                    return;
                }
            }
            _ = heartbeat.tick() => {
                if let Err(e) = within(config.write_wait, sink.send(WsMessage::Ping(Bytes::new()))).await {
                    warn!("Failed to send heartbeat ping: {}", e);
                    return;
                }
            }
        }
    }
}

/// Writes `first` plus whatever is already queued behind it, then flushes once.
async fn write_pending<Si>(
    sink: &mut Si,
    queue: &mut mpsc::Receiver<Outbound>,
    first: Outbound,
    config: &HubConfig,
) -> Result<(), String>
where
    Si: Sink<WsMessage> + Unpin,
    Si::Error: Display,
{
    feed(sink, &first, config.write_wait).await?;
    for _ in 1..config.queue_capacity {
        match queue.try_recv() {
            Ok(next) => feed(sink, &next, config.write_wait).await?,
            Err(_) => break,
        }
    }
    within(config.write_wait, sink.flush()).await
}

async fn feed<Si>(sink: &mut Si, message: &Message, wait: Duration) -> Result<(), String>
where
    Si: Sink<WsMessage> + Unpin,
    Si::Error: Display,
{
    let json = match serde_json::to_string(message) {
        Ok(json) => json,
        Err(e) => {
            error!(kind = message.event.kind(), "Failed to serialize message for client: {}", e);
            return Ok(());
        }
    };
    within(wait, sink.feed(WsMessage::Text(Utf8Bytes::from(json)))).await
}

async fn within<F, E>(wait: Duration, write: F) -> Result<(), String>
where
    F: Future<Output = Result<(), E>>,
    E: Display,
{
    match timeout(wait, write).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("write timed out after {:?}", wait)),
    }
}
