//! Internal types shared by the `Hub` and the sessions it tracks.

use crate::ws::message::Message;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// A unique identifier for a single WebSocket connection.
pub type ConnectionId = Uuid;

/// The identity of an authenticated user.
pub type UserId = u64;

/// Items travelling through a session's outbound queue.
///
/// Messages are shared, so a broadcast costs one allocation regardless of the
/// number of recipients.
pub type Outbound = Arc<Message>;

/// The hub's side of a live session: its identity and the sending half of its
/// bounded outbound queue.
///
/// The hub holds the only strong `Sender` for the queue. Dropping the handle is
/// what closes the queue, so removing a handle from the registry closes it
/// exactly once.
pub struct SessionHandle {
    pub(crate) id: ConnectionId,
    pub(crate) user_id: Option<UserId>,
    pub(crate) queue: mpsc::Sender<Outbound>,
}

impl SessionHandle {
    pub fn new(id: ConnectionId, user_id: Option<UserId>, queue: mpsc::Sender<Outbound>) -> Self {
        Self {
            id,
            user_id,
            queue,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user_id
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("queued", &(self.queue.max_capacity() - self.queue.capacity()))
            .finish()
    }
}

/// Commands consumed by the hub's coordination loop.
pub(crate) enum HubCommand {
    Register {
        handle: SessionHandle,
        ack: oneshot::Sender<()>,
    },
    Unregister(ConnectionId),
    Broadcast(Outbound),
    /// Replies once every command sent before it has been applied.
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// The two membership indexes over the live connection set.
///
/// Only the coordination loop mutates a `Registry`. Invariant: `users` maps a
/// user to a connection id if and only if that connection is present in
/// `connections` and carries that user id.
#[derive(Default)]
pub(crate) struct Registry {
    pub(crate) connections: HashMap<ConnectionId, SessionHandle>,
    pub(crate) users: HashMap<UserId, ConnectionId>,
}

impl Registry {
    /// Inserts a session, returning any session it displaced for the same user.
    pub(crate) fn insert(&mut self, handle: SessionHandle) -> Option<SessionHandle> {
        let mut replaced = None;
        if let Some(user_id) = handle.user_id {
            if let Some(previous) = self.users.insert(user_id, handle.id) {
                if previous != handle.id {
                    replaced = self.connections.remove(&previous);
                }
            }
        }
        self.connections.insert(handle.id, handle);
        replaced
    }

    /// Removes a session from both indexes. Returns `None` if it was not present.
    pub(crate) fn remove(&mut self, id: &ConnectionId) -> Option<SessionHandle> {
        let handle = self.connections.remove(id)?;
        if let Some(user_id) = handle.user_id {
            // The user slot may already belong to a newer session.
            if self.users.get(&user_id) == Some(id) {
                self.users.remove(&user_id);
            }
        }
        Some(handle)
    }

    pub(crate) fn session_for(&self, user_id: UserId) -> Option<&SessionHandle> {
        self.users
            .get(&user_id)
            .and_then(|id| self.connections.get(id))
    }

    #[cfg(test)]
    pub(crate) fn is_consistent(&self) -> bool {
        let users_point_to_live_sessions = self.users.iter().all(|(user, id)| {
            self.connections
                .get(id)
                .is_some_and(|handle| handle.user_id == Some(*user))
        });
        let no_user_session_left_out = self.connections.values().all(|handle| match handle.user_id {
            // A session displaced by a newer one never stays in `connections`.
            Some(user) => self.users.get(&user) == Some(&handle.id),
            None => true,
        });
        users_point_to_live_sessions && no_user_session_left_out
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("connections_count", &self.connections.len())
            .field("users_count", &self.users.len())
            .finish()
    }
}
