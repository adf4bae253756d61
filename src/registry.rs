use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use ahash::AHashSet;
use dashmap::DashMap;
use log::debug;

use crate::errors::{RealtimeError, Result};
use crate::mailbox::{mailbox, Inbox, Outbound};

/// Opaque identifier for a live client connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    #[cfg(test)]
    pub(crate) fn test(n: u64) -> Self {
        ConnectionId(n)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Per-connection bookkeeping.
pub(crate) struct ConnectionState {
    pub(crate) outbound: Outbound,
    /// Rooms this connection joined (presence subscriber set membership).
    pub(crate) rooms: AHashSet<String>,
    /// Broadcast channels this connection holds subscriptions on.
    pub(crate) channels: AHashSet<String>,
    /// Unix timestamp of the last heartbeat or liveness-refreshing call.
    pub(crate) last_seen: f64,
}

/// Tracks live connections and which rooms/channels each has joined.
///
/// Connections carry no transport here: the embedding layer owns the
/// socket and drives this registry. Liveness is heartbeat-based — the
/// sweep in the room manager force-disconnects anything whose heartbeat
/// age exceeds the timeout, because no transport-level close is
/// guaranteed to be observed.
pub(crate) struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionState>,
    next_id: AtomicU64,
    mailbox_capacity: usize,
}

impl ConnectionRegistry {
    pub(crate) fn new(mailbox_capacity: usize) -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
            mailbox_capacity,
        }
    }

    /// Allocate a new connection and its mailbox.
    pub(crate) fn connect(&self) -> (ConnectionId, Inbox) {
        let conn = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (outbound, inbox) = mailbox(conn, self.mailbox_capacity);
        self.connections.insert(
            conn,
            ConnectionState {
                outbound,
                rooms: AHashSet::new(),
                channels: AHashSet::new(),
                last_seen: now_secs(),
            },
        );
        debug!("registered {conn}");
        (conn, inbox)
    }

    /// Clone the mailbox sender for a live connection.
    pub(crate) fn outbound(&self, conn: ConnectionId) -> Result<Outbound> {
        self.connections
            .get(&conn)
            .map(|state| state.outbound.clone())
            .ok_or(RealtimeError::UnknownConnection(conn))
    }

    /// Refresh the last-seen timestamp.
    pub(crate) fn touch(&self, conn: ConnectionId) -> Result<()> {
        let mut state = self
            .connections
            .get_mut(&conn)
            .ok_or(RealtimeError::UnknownConnection(conn))?;
        state.last_seen = now_secs();
        Ok(())
    }

    /// Record that `conn` has a footprint in `room` — as a subscriber,
    /// a presence member, or both. Disconnect teardown visits every
    /// room recorded here, so the set is only ever grown; a room with
    /// no remaining footprint costs teardown a cheap no-op. Refreshes
    /// liveness.
    pub(crate) fn note_joined(&self, conn: ConnectionId, room: &str) -> Result<()> {
        let mut state = self
            .connections
            .get_mut(&conn)
            .ok_or(RealtimeError::UnknownConnection(conn))?;
        state.rooms.insert(room.to_string());
        state.last_seen = now_secs();
        Ok(())
    }

    /// Record a broadcast channel subscription. Refreshes liveness.
    pub(crate) fn note_subscribed(&self, conn: ConnectionId, channel: &str) -> Result<()> {
        let mut state = self
            .connections
            .get_mut(&conn)
            .ok_or(RealtimeError::UnknownConnection(conn))?;
        state.channels.insert(channel.to_string());
        state.last_seen = now_secs();
        Ok(())
    }

    /// Release the connection slot, returning its bookkeeping so the
    /// caller can tear down room and channel state. `None` if the
    /// connection was never created or is already gone.
    pub(crate) fn remove(&self, conn: ConnectionId) -> Option<ConnectionState> {
        let removed = self.connections.remove(&conn).map(|(_, state)| state);
        if removed.is_some() {
            debug!("released {conn}");
        }
        removed
    }

    pub(crate) fn contains(&self, conn: ConnectionId) -> bool {
        self.connections.contains_key(&conn)
    }

    pub(crate) fn len(&self) -> usize {
        self.connections.len()
    }

    /// Connections whose heartbeat age exceeds `timeout_secs`.
    /// The sweep force-disconnects each of them.
    pub(crate) fn timed_out(&self, timeout_secs: f64) -> Vec<ConnectionId> {
        let cutoff = now_secs() - timeout_secs;
        self.connections
            .iter()
            .filter(|entry| entry.last_seen < cutoff)
            .map(|entry| *entry.key())
            .collect()
    }
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_allocates_distinct_ids() {
        let registry = ConnectionRegistry::new(8);
        let (a, _inbox_a) = registry.connect();
        let (b, _inbox_b) = registry.connect();
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn unknown_connection_is_rejected() {
        let registry = ConnectionRegistry::new(8);
        let (conn, _inbox) = registry.connect();
        registry.remove(conn);
        assert_eq!(
            registry.touch(conn),
            Err(RealtimeError::UnknownConnection(conn))
        );
        assert_eq!(
            registry.note_joined(conn, "canvas:main"),
            Err(RealtimeError::UnknownConnection(conn))
        );
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = ConnectionRegistry::new(8);
        let (conn, _inbox) = registry.connect();
        assert!(registry.remove(conn).is_some());
        assert!(registry.remove(conn).is_none());
    }

    #[test]
    fn remove_returns_joined_rooms_and_channels() {
        let registry = ConnectionRegistry::new(8);
        let (conn, _inbox) = registry.connect();
        registry.note_joined(conn, "canvas:main").unwrap();
        registry.note_subscribed(conn, "garden-events").unwrap();
        let state = registry.remove(conn).unwrap();
        assert!(state.rooms.contains("canvas:main"));
        assert!(state.channels.contains("garden-events"));
    }

    #[test]
    fn timed_out_respects_heartbeat() {
        let registry = ConnectionRegistry::new(8);
        let (conn, _inbox) = registry.connect();
        assert!(registry.timed_out(60.0).is_empty());
        // A zero timeout makes every connection stale immediately.
        let stale = registry.timed_out(-1.0);
        assert_eq!(stale, vec![conn]);
        registry.touch(conn).unwrap();
        assert!(registry.timed_out(60.0).is_empty());
    }
}
