//! Connection registry: user id → set of live connections.
//!
//! One user may hold several simultaneous connections (multiple tabs or
//! devices), so the registry maps each user id to a set of connection ids
//! rather than a single slot. Entries are created and removed only by the
//! connection bootstrap, never by message handlers, so the registry always
//! reflects live connections.

use std::collections::{HashMap, HashSet};

/// Identifier of one live connection, minted by the relay at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Process-local, in-memory table of live connections per user.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<String, HashSet<ConnectionId>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connection for a user. Idempotent: re-registering the same
    /// pair does not create a duplicate entry.
    pub fn register(&mut self, user_id: &str, connection: ConnectionId) {
        self.connections
            .entry(user_id.to_string())
            .or_default()
            .insert(connection);
    }

    /// Remove one connection. The user's entry disappears with its last
    /// connection; removing an unknown pair is a no-op.
    pub fn unregister(&mut self, user_id: &str, connection: ConnectionId) {
        if let Some(set) = self.connections.get_mut(user_id) {
            set.remove(&connection);
            if set.is_empty() {
                self.connections.remove(user_id);
            }
        }
    }

    /// All live connections for a user. Unknown users yield an empty list,
    /// never an error.
    pub fn connections_of(&self, user_id: &str) -> Vec<ConnectionId> {
        self.connections
            .get(user_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of users with at least one live connection.
    pub fn user_count(&self) -> usize {
        self.connections.len()
    }
}
