use dashmap::DashMap;
use envelope::{Identity, UserId};
use log::*;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

/// Unique identifier for a connection (server-generated)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One live client socket as seen by the hub.
///
/// Frames are never written to the socket directly: they are queued on `outbound` and
/// a single writer task drains the queue, so the read loop and concurrent deliveries
/// cannot interleave partial frames.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    identity: Identity,
    outbound: mpsc::Sender<String>,
    closed: CancellationToken,
}

impl Connection {
    pub fn new(identity: Identity, outbound: mpsc::Sender<String>) -> Self {
        Self {
            id: ConnectionId::new(),
            identity,
            outbound,
            closed: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn user_id(&self) -> UserId {
        self.identity.user_id
    }

    /// Queues one serialized frame for the writer task.
    ///
    /// Returns `false` when the queue is full or the writer has gone away. The caller
    /// treats that as a failed write and disconnects this connection.
    pub fn send(&self, frame: String) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Outbound queue full for connection {}", self.id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Writer for connection {} already gone", self.id);
                false
            }
        }
    }

    /// Signals the read loop and the writer task to stop. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub(crate) fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

/// Live connections with a secondary index by user, for O(1) lookups on both the
/// connection and the identity path. Anonymous connections are not indexed by user.
pub struct ConnectionRegistry {
    /// Primary storage: lookup by connection id for registration and cleanup.
    connections: DashMap<ConnectionId, Arc<Connection>>,

    /// Secondary index: authenticated user id to that user's connections.
    user_index: DashMap<UserId, HashSet<ConnectionId>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            user_index: DashMap::new(),
        }
    }

    pub fn register(&self, connection: Arc<Connection>) {
        let id = connection.id().clone();
        let user_id = connection.user_id();
        let authenticated = connection.identity().is_authenticated();

        self.connections.insert(id.clone(), connection);

        if authenticated {
            self.user_index.entry(user_id).or_default().insert(id);
        }
    }

    /// Removes a connection from both indices and returns it. Returns `None` if it was
    /// already gone, so callers can run their one-time cleanup exactly once.
    pub fn unregister(&self, connection_id: &ConnectionId) -> Option<Arc<Connection>> {
        let (_, connection) = self.connections.remove(connection_id)?;
        let user_id = connection.user_id();

        if let Some(mut entry) = self.user_index.get_mut(&user_id) {
            entry.remove(connection_id);

            // Clean up empty user entries
            if entry.is_empty() {
                drop(entry); // Release lock before removal
                self.user_index.remove_if(&user_id, |_, ids| ids.is_empty());
            }
        }

        Some(connection)
    }

    pub fn get(&self, connection_id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections
            .get(connection_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Every live connection of `user_id`. Empty for anonymous or unknown users.
    pub fn user_connections(&self, user_id: UserId) -> Vec<Arc<Connection>> {
        let Some(ids) = self.user_index.get(&user_id).map(|ids| ids.value().clone()) else {
            return Vec::new();
        };
        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    /// Every live connection. Collected up front so callers never hold a map guard
    /// while writing or unregistering.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of distinct authenticated users with at least one connection.
    pub fn user_count(&self) -> usize {
        self.user_index.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
