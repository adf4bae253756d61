use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::broadcast::{BroadcastRouter, SubscriptionHandle};
use crate::config::RealtimeConfig;
use crate::errors::{RealtimeError, Result};
use crate::event::BroadcastEvent;
use crate::mailbox::Inbox;
use crate::presence::{PresenceSnapshot, PresenceSync};
use crate::registry::{ConnectionId, ConnectionRegistry};

/// Aggregate counters across the whole core.
#[derive(Clone, Debug, Default)]
pub struct RealtimeStats {
    pub connections: usize,
    pub rooms: usize,
    pub channels: usize,
    pub snapshots_emitted: u64,
    pub events_published: u64,
    pub deliveries_dropped: u64,
    pub sweep_disconnects: u64,
}

/// Top-level façade over the registry, presence synchronizer, and
/// broadcast router.
///
/// Presence operations: [`join`](Self::join), [`leave`](Self::leave),
/// [`track`](Self::track), [`untrack`](Self::untrack),
/// [`snapshot`](Self::snapshot). Broadcast operations:
/// [`subscribe`](Self::subscribe), [`unsubscribe`](Self::unsubscribe),
/// [`publish`](Self::publish). Rooms and channels are created on first
/// reference and reclaimed on last, so idle names never accumulate.
///
/// Construction spawns the heartbeat sweep and therefore must happen
/// inside a tokio runtime. Connections that stop heartbeating are
/// force-disconnected by the sweep — the principal recovery path for
/// clients that vanish without a transport-level close.
pub struct RoomManager {
    config: RealtimeConfig,
    registry: Arc<ConnectionRegistry>,
    presence: Arc<PresenceSync>,
    router: Arc<BroadcastRouter>,
    sweep_running: Arc<AtomicBool>,
    sweep_disconnects: Arc<AtomicU64>,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
}

impl RoomManager {
    pub fn new(config: RealtimeConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(config.mailbox_capacity));
        let presence = Arc::new(PresenceSync::new(
            config.dedup.clone(),
            config.grace_window(),
        ));
        let router = Arc::new(BroadcastRouter::new());
        let sweep_running = Arc::new(AtomicBool::new(true));
        let sweep_disconnects = Arc::new(AtomicU64::new(0));

        let sweep_task = spawn_sweep(
            config.clone(),
            Arc::clone(&registry),
            Arc::clone(&presence),
            Arc::clone(&router),
            Arc::clone(&sweep_running),
            Arc::clone(&sweep_disconnects),
        );
        info!(
            "realtime core up (sweep every {}s, timeout {}s, grace {}ms)",
            config.heartbeat_interval_secs, config.heartbeat_timeout_secs, config.grace_window_ms
        );

        Self {
            config,
            registry,
            presence,
            router,
            sweep_running,
            sweep_disconnects,
            sweep_task: Mutex::new(Some(sweep_task)),
        }
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    // ── connection lifecycle ────────────────────────────────────────

    /// Allocate a connection and hand back its mailbox.
    pub fn connect(&self) -> (ConnectionId, Inbox) {
        self.registry.connect()
    }

    /// Refresh the connection's liveness timestamp.
    pub fn heartbeat(&self, conn: ConnectionId) -> Result<()> {
        self.registry.touch(conn)
    }

    /// Tear the connection down: drop its channel subscriptions, its
    /// room subscriptions, and (after the grace window) any presence it
    /// exclusively backed. Idempotent; returns whether it was live.
    pub fn disconnect(&self, conn: ConnectionId) -> bool {
        teardown(&self.registry, &self.presence, &self.router, conn)
    }

    // ── presence operations ─────────────────────────────────────────

    /// Subscribe `conn` to a room's presence. The current snapshot is
    /// pushed to its mailbox immediately; later changes follow as they
    /// happen.
    pub fn join(&self, conn: ConnectionId, room: &str) -> Result<()> {
        if room.is_empty() {
            return Err(RealtimeError::InvalidRoom);
        }
        let outbound = self.registry.outbound(conn)?;
        self.registry.note_joined(conn, room)?;
        self.presence.join(conn, room, outbound);
        Ok(())
    }

    /// Stop receiving presence snapshots for the room. Idempotent for a
    /// live connection; any presence the connection tracked stays until
    /// `untrack` or disconnect.
    pub fn leave(&self, conn: ConnectionId, room: &str) -> Result<()> {
        if !self.registry.contains(conn) {
            return Err(RealtimeError::UnknownConnection(conn));
        }
        self.presence.leave(conn, room);
        Ok(())
    }

    /// Upsert the member's presence record and push the updated
    /// snapshot to every room subscriber. Replaces, never appends: one
    /// record per member key per room.
    pub fn track(
        &self,
        conn: ConnectionId,
        room: &str,
        member_key: &str,
        payload: Value,
    ) -> Result<PresenceSnapshot> {
        if room.is_empty() {
            return Err(RealtimeError::InvalidRoom);
        }
        self.registry.note_joined(conn, room)?;
        Ok(self.presence.track(conn, room, member_key, payload))
    }

    /// Remove the member's record immediately (no grace window) and
    /// emit. Returns whether a record existed.
    pub fn untrack(&self, room: &str, member_key: &str) -> bool {
        self.presence.untrack(room, member_key)
    }

    /// Read the current snapshot. A room with no state reads as empty;
    /// that is not an error, rooms are created lazily.
    pub fn snapshot(&self, room: &str) -> PresenceSnapshot {
        self.presence.snapshot(room)
    }

    // ── broadcast operations ────────────────────────────────────────

    /// Register interest in a channel. No history is replayed.
    pub fn subscribe(&self, conn: ConnectionId, channel: &str) -> Result<SubscriptionHandle> {
        let outbound = self.registry.outbound(conn)?;
        let handle = self.router.subscribe(conn, channel, outbound)?;
        self.registry.note_subscribed(conn, channel)?;
        Ok(handle)
    }

    /// Idempotent removal of one subscription.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.router.unsubscribe(handle)
    }

    /// Fire-and-forget fan-out to the channel's current subscribers.
    /// Publishers need no subscription of their own, and nothing about
    /// a subscriber can make this fail — zero watchers is a no-op.
    pub fn publish(&self, channel: &str, event: BroadcastEvent) -> Result<usize> {
        self.router.publish(channel, event)
    }

    // ── introspection ───────────────────────────────────────────────

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn room_count(&self) -> usize {
        self.presence.room_count()
    }

    pub fn active_rooms(&self) -> Vec<String> {
        self.presence.active_rooms()
    }

    pub fn member_count(&self, room: &str) -> usize {
        self.presence.member_count(room)
    }

    pub fn channel_count(&self) -> usize {
        self.router.channel_count()
    }

    pub fn stats(&self) -> RealtimeStats {
        RealtimeStats {
            connections: self.registry.len(),
            rooms: self.presence.room_count(),
            channels: self.router.channel_count(),
            snapshots_emitted: self.presence.snapshots_emitted(),
            events_published: self.router.events_published(),
            deliveries_dropped: self.presence.deliveries_dropped()
                + self.router.deliveries_dropped(),
            sweep_disconnects: self.sweep_disconnects.load(Ordering::Relaxed),
        }
    }

    /// Member key for a visitor with no account of their own.
    pub fn anonymous_member_key() -> String {
        Uuid::new_v4().to_string()
    }

    /// Stop the sweep task. Connection and room state stays readable;
    /// call this when the embedding process shuts down.
    pub fn shutdown(&self) {
        self.sweep_running.store(false, Ordering::Relaxed);
        if let Some(task) = self.sweep_task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for RoomManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Full teardown for one connection. Shared by `disconnect` and the
/// sweep. Registry removal comes first so concurrent calls observe
/// `UnknownConnection` rather than a half-dismantled connection.
fn teardown(
    registry: &ConnectionRegistry,
    presence: &Arc<PresenceSync>,
    router: &BroadcastRouter,
    conn: ConnectionId,
) -> bool {
    let Some(state) = registry.remove(conn) else {
        return false;
    };
    router.drop_conn(conn, state.channels.iter().map(String::as_str));
    presence.disconnect(conn, state.rooms);
    true
}

fn spawn_sweep(
    config: RealtimeConfig,
    registry: Arc<ConnectionRegistry>,
    presence: Arc<PresenceSync>,
    router: Arc<BroadcastRouter>,
    running: Arc<AtomicBool>,
    disconnects: Arc<AtomicU64>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = config.heartbeat_interval();
        loop {
            tokio::time::sleep(interval).await;
            if !running.load(Ordering::Relaxed) {
                break;
            }
            for conn in registry.timed_out(config.heartbeat_timeout_secs) {
                debug!("{conn} heartbeat lapsed, force-disconnecting");
                if teardown(&registry, &presence, &router, conn) {
                    disconnects.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn join_track_snapshot_roundtrip() {
        let manager = RoomManager::new(RealtimeConfig::default());
        let (conn, _inbox) = manager.connect();
        manager.join(conn, "canvas:main").unwrap();
        let snap = manager
            .track(conn, "canvas:main", "u1", json!({"name": "Nair"}))
            .unwrap();
        assert_eq!(snap.display_names(), vec!["Nair"]);
        assert_eq!(manager.member_count("canvas:main"), 1);
    }

    #[tokio::test]
    async fn operations_on_dead_connections_fail_fast() {
        let manager = RoomManager::new(RealtimeConfig::default());
        let (conn, _inbox) = manager.connect();
        assert!(manager.disconnect(conn));
        assert!(!manager.disconnect(conn));
        assert_eq!(
            manager.join(conn, "canvas:main"),
            Err(RealtimeError::UnknownConnection(conn))
        );
        assert_eq!(
            manager.heartbeat(conn),
            Err(RealtimeError::UnknownConnection(conn))
        );
        assert!(manager
            .subscribe(conn, "garden-events")
            .is_err());
    }

    #[tokio::test]
    async fn empty_names_are_rejected() {
        let manager = RoomManager::new(RealtimeConfig::default());
        let (conn, _inbox) = manager.connect();
        assert_eq!(
            manager.join(conn, ""),
            Err(RealtimeError::InvalidRoom)
        );
        assert_eq!(
            manager
                .track(conn, "", "u1", json!({"name": "Nair"}))
                .unwrap_err(),
            RealtimeError::InvalidRoom
        );
        assert_eq!(
            manager.subscribe(conn, "").unwrap_err(),
            RealtimeError::InvalidChannel
        );
    }

    #[tokio::test]
    async fn stats_track_activity() {
        let manager = RoomManager::new(RealtimeConfig::default());
        let (conn, _inbox) = manager.connect();
        manager.join(conn, "canvas:main").unwrap();
        manager
            .track(conn, "canvas:main", "u1", json!({"name": "Nair"}))
            .unwrap();
        manager
            .publish("garden-events", BroadcastEvent::wish("Ann"))
            .unwrap();

        let stats = manager.stats();
        assert_eq!(stats.connections, 1);
        assert_eq!(stats.rooms, 1);
        assert_eq!(stats.events_published, 1);
        assert!(stats.snapshots_emitted >= 1);
    }

    #[tokio::test]
    async fn anonymous_keys_are_distinct() {
        assert_ne!(
            RoomManager::anonymous_member_key(),
            RoomManager::anonymous_member_key()
        );
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let manager = RoomManager::new(RealtimeConfig::default());
        manager.shutdown();
        manager.shutdown();
    }
}
