//! The `Hub`: the connection registry and its coordination loop.

use crate::config::HubConfig;
use crate::ws::types::{ConnectionId, HubCommand, Outbound, Registry, SessionHandle, UserId};
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, warn};

/// Why a message was not handed to a session's outbound queue.
///
/// These are expected steady-state outcomes, not faults: users go offline and
/// slow consumers fall behind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("user {0} is not connected")]
    NotConnected(UserId),
    #[error("outbound queue for user {0} is full")]
    QueueFull(UserId),
    #[error("session for user {0} is closing")]
    SessionClosed(UserId),
    #[error("hub is not running")]
    HubClosed,
}

/// The single source of truth for who is connected.
///
/// All membership changes and broadcasts are funnelled through one
/// coordination task, which is the only writer of the registry. Targeted
/// delivery and counters read the registry directly under a read lock.
///
/// `Hub` is a cheap handle; clone it into the transport layer and into every
/// publisher that needs it.
#[derive(Clone)]
pub struct Hub {
    registry: Arc<RwLock<Registry>>,
    commands: mpsc::UnboundedSender<HubCommand>,
    config: Arc<HubConfig>,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("registry", &*self.registry.read())
            .field("closed", &self.commands.is_closed())
            .finish()
    }
}

impl Hub {
    /// Creates a hub and spawns its coordination loop on the current runtime.
    pub fn new(config: HubConfig) -> Self {
        let registry = Arc::new(RwLock::new(Registry::default()));
        let (commands, command_rx) = mpsc::unbounded_channel();

        info!("Spawning hub coordination loop...");
        tokio::spawn(run_coordination_loop(Arc::clone(&registry), command_rx));

        Self {
            registry,
            commands,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Adds a session to the registry. If the session carries a user id, it
    /// replaces any session already registered for that user; the replaced
    /// session's queue is closed.
    ///
    /// Resolves once the registration has been applied. Returns `false` if the
    /// hub is no longer running, in which case the handle (and its queue) is
    /// dropped.
    #[instrument(skip_all, fields(conn_id = %handle.id, user_id = ?handle.user_id))]
    pub async fn register(&self, handle: SessionHandle) -> bool {
        let (ack, applied) = oneshot::channel();
        if self
            .commands
            .send(HubCommand::Register { handle, ack })
            .is_err()
        {
            warn!("Hub is not running; registration dropped.");
            return false;
        }
        applied.await.is_ok()
    }

    /// Removes a session and closes its queue. Unregistering a session that is
    /// not (or no longer) registered is a no-op.
    pub fn unregister(&self, id: ConnectionId) {
        if self.commands.send(HubCommand::Unregister(id)).is_err() {
            debug!(conn_id = %id, "Hub is not running; nothing to unregister.");
        }
    }

    /// Delivers a message to one user's session without waiting.
    pub fn send_to_user(
        &self,
        user_id: UserId,
        message: impl Into<Outbound>,
    ) -> Result<(), DeliveryError> {
        let registry = self.registry.read();
        let handle = registry
            .session_for(user_id)
            .ok_or(DeliveryError::NotConnected(user_id))?;

        match handle.queue.try_send(message.into()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(DeliveryError::QueueFull(user_id)),
            Err(TrySendError::Closed(_)) => Err(DeliveryError::SessionClosed(user_id)),
        }
    }

    /// Queues a message for every live session. Sessions whose queue is full are
    /// treated as dead and unregistered as part of the broadcast.
    pub fn broadcast(&self, message: impl Into<Outbound>) -> Result<(), DeliveryError> {
        self.commands
            .send(HubCommand::Broadcast(message.into()))
            .map_err(|_| DeliveryError::HubClosed)
    }

    /// Number of users with a registered session.
    pub fn online_user_count(&self) -> usize {
        self.registry.read().users.len()
    }

    /// Number of registered sessions, anonymous ones included.
    pub fn total_connections(&self) -> usize {
        self.registry.read().connections.len()
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.registry.read().users.contains_key(&user_id)
    }

    /// Waits until every command sent before this call has been applied.
    /// Returns `false` if the hub stopped first.
    pub async fn flush(&self) -> bool {
        let (ack, done) = oneshot::channel();
        if self.commands.send(HubCommand::Flush(ack)).is_err() {
            return false;
        }
        done.await.is_ok()
    }

    /// Closes every session queue and stops the coordination loop.
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(HubCommand::Shutdown(ack)).is_ok() {
            let _ = done.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    #[cfg(test)]
    pub(crate) fn registry_is_consistent(&self) -> bool {
        self.registry.read().is_consistent()
    }
}

async fn run_coordination_loop(
    registry: Arc<RwLock<Registry>>,
    mut commands: mpsc::UnboundedReceiver<HubCommand>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            HubCommand::Register { handle, ack } => {
                apply_register(&registry, handle);
                let _ = ack.send(());
            }
            HubCommand::Unregister(id) => apply_unregister(&registry, id),
            HubCommand::Broadcast(message) => apply_broadcast(&registry, message),
            HubCommand::Flush(ack) => {
                let _ = ack.send(());
            }
            HubCommand::Shutdown(ack) => {
                close_all(&registry);
                let _ = ack.send(());
                info!("Hub coordination loop stopped.");
                return;
            }
        }
    }
    // Every `Hub` handle is gone.
    close_all(&registry);
    info!("Hub command channel closed. Coordination loop stopped.");
}

fn apply_register(registry: &RwLock<Registry>, handle: SessionHandle) {
    let (conn_id, user_id) = (handle.id, handle.user_id);
    let (replaced, total) = {
        let mut registry = registry.write();
        let replaced = registry.insert(handle);
        (replaced, registry.connections.len())
    };

    if let Some(old) = replaced {
        info!(
            user_id = ?user_id,
            replaced_conn_id = %old.id,
            "Replaced existing session for user."
        );
        // Dropping the displaced handle closes its queue.
        drop(old);
    }
    info!(%conn_id, user_id = ?user_id, total_clients = total, "WebSocket client connected.");
}

fn apply_unregister(registry: &RwLock<Registry>, id: ConnectionId) {
    let (removed, total) = {
        let mut registry = registry.write();
        let removed = registry.remove(&id);
        (removed, registry.connections.len())
    };

    match removed {
        Some(handle) => info!(
            conn_id = %id,
            user_id = ?handle.user_id,
            total_clients = total,
            "WebSocket client disconnected."
        ),
        None => debug!(conn_id = %id, "Session already unregistered."),
    }
}

fn apply_broadcast(registry: &RwLock<Registry>, message: Outbound) {
    let (delivered, dead) = {
        let registry = registry.read();
        let mut delivered = 0usize;
        let mut dead = Vec::new();
        for handle in registry.connections.values() {
            match handle.queue.try_send(Arc::clone(&message)) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        conn_id = %handle.id,
                        user_id = ?handle.user_id,
                        "Outbound queue full during broadcast; dropping session."
                    );
                    dead.push(handle.id);
                }
                Err(TrySendError::Closed(_)) => dead.push(handle.id),
            }
        }
        (delivered, dead)
    };

    // Only this loop mutates the registry, so the ids collected above are still
    // present when the write lock is taken.
    if !dead.is_empty() {
        let evicted: Vec<SessionHandle> = {
            let mut registry = registry.write();
            dead.iter().filter_map(|id| registry.remove(id)).collect()
        };
        drop(evicted);
    }

    debug!(
        kind = message.event.kind(),
        delivered,
        evicted = dead.len(),
        "Broadcast delivered."
    );
}

fn close_all(registry: &RwLock<Registry>) {
    let drained = std::mem::take(&mut *registry.write());
    if !drained.connections.is_empty() {
        info!(
            closed = drained.connections.len(),
            "Closing all session queues."
        );
    }
}
