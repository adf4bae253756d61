use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use dashmap::DashMap;
use log::{debug, trace, warn};
use parking_lot::Mutex;
use serde_json::Value;
use smallvec::SmallVec;

use crate::config::DedupKey;
use crate::mailbox::{Envelope, Outbound};
use crate::presence::table::{PresenceSnapshot, PresenceTable};
use crate::registry::ConnectionId;

/// Per-room shared state, serialized through one mutex. Rooms never
/// block each other.
struct RoomState {
    name: String,
    table: PresenceTable,
    subscribers: AHashMap<ConnectionId, Outbound>,
    /// Emission sequence. Snapshots reach any single subscriber in
    /// increasing seq order; mailbox overflow may skip but never
    /// reorder.
    seq: u64,
    /// Grace epoch. Bumped per disconnect batch so a stale grace timer
    /// can never reap state that a newer track or disconnect superseded.
    epoch: u64,
}

/// Turns join/leave/track events into sync snapshots pushed to room
/// subscribers.
///
/// A room is created lazily on first join/track and reclaimed once its
/// member set and subscriber set are both empty. Pushes are the only
/// way presence changes become observable; `snapshot()` exists for
/// initial render, not polling.
pub(crate) struct PresenceSync {
    rooms: DashMap<String, Arc<Mutex<RoomState>>>,
    dedup: DedupKey,
    grace: Duration,
    snapshots_emitted: AtomicU64,
    deliveries_dropped: AtomicU64,
}

impl PresenceSync {
    pub(crate) fn new(dedup: DedupKey, grace: Duration) -> Self {
        Self {
            rooms: DashMap::new(),
            dedup,
            grace,
            snapshots_emitted: AtomicU64::new(0),
            deliveries_dropped: AtomicU64::new(0),
        }
    }

    fn room(&self, name: &str) -> Option<Arc<Mutex<RoomState>>> {
        self.rooms.get(name).map(|entry| Arc::clone(entry.value()))
    }

    fn room_or_create(&self, name: &str) -> Arc<Mutex<RoomState>> {
        Arc::clone(
            self.rooms
                .entry(name.to_string())
                .or_insert_with(|| {
                    debug!("room {name} created");
                    Arc::new(Mutex::new(RoomState {
                        name: name.to_string(),
                        table: PresenceTable::default(),
                        subscribers: AHashMap::new(),
                        seq: 0,
                        epoch: 0,
                    }))
                })
                .value(),
        )
    }

    /// Add `conn` to the room's subscriber set (idempotent) and push it
    /// the current snapshot at the room's current seq so it has an
    /// initial state to render.
    pub(crate) fn join(&self, conn: ConnectionId, room: &str, outbound: Outbound) {
        let slot = self.room_or_create(room);
        let mut state = slot.lock();
        let snapshot = Arc::new(state.table.snapshot(room, &self.dedup));
        let envelope = Envelope::Presence {
            seq: state.seq,
            snapshot,
        };
        if outbound.send(envelope).is_ok() {
            state.subscribers.insert(conn, outbound);
        } else {
            warn!("presence subscriber {conn} joined {room} with a closed mailbox");
        }
    }

    /// Remove `conn` from the subscriber set. Idempotent.
    pub(crate) fn leave(&self, conn: ConnectionId, room: &str) -> bool {
        let Some(slot) = self.room(room) else {
            return false;
        };
        let mut state = slot.lock();
        let removed = state.subscribers.remove(&conn).is_some();
        let reclaim = state.table.is_empty() && state.subscribers.is_empty();
        drop(state);
        drop(slot);
        if reclaim {
            self.gc_room(room);
        }
        removed
    }

    /// Upsert a presence record and emit the updated snapshot to every
    /// subscriber. Returns the snapshot to the caller as well.
    pub(crate) fn track(
        &self,
        conn: ConnectionId,
        room: &str,
        member_key: &str,
        payload: Value,
    ) -> PresenceSnapshot {
        let slot = self.room_or_create(room);
        let mut state = slot.lock();
        state.table.upsert(conn, member_key, payload);
        let snapshot = self.emit(&mut state);
        (*snapshot).clone()
    }

    /// Explicit removal: takes effect and is emitted immediately, with
    /// no grace window. Returns whether a record existed.
    pub(crate) fn untrack(&self, room: &str, member_key: &str) -> bool {
        let Some(slot) = self.room(room) else {
            return false;
        };
        let mut state = slot.lock();
        let removed = state.table.remove(member_key);
        if removed {
            self.emit(&mut state);
        }
        let reclaim = state.table.is_empty() && state.subscribers.is_empty();
        drop(state);
        drop(slot);
        if reclaim {
            self.gc_room(room);
        }
        removed
    }

    /// Tear down a connection across the given rooms: drop it from each
    /// subscriber set, and schedule grace-window removal for member
    /// keys it was the last backer of. Holds one room lock at a time.
    pub(crate) fn disconnect<I>(self: &Arc<Self>, conn: ConnectionId, rooms: I)
    where
        I: IntoIterator<Item = String>,
    {
        for room in rooms {
            let Some(slot) = self.room(&room) else {
                continue;
            };
            let mut state = slot.lock();
            state.subscribers.remove(&conn);
            let orphaned = state.table.detach(conn);
            if !orphaned.is_empty() {
                state.epoch += 1;
                let epoch = state.epoch;
                state.table.mark_lame(&orphaned, epoch);
                self.schedule_grace(room.clone(), epoch, orphaned);
            }
            let reclaim = state.table.is_empty() && state.subscribers.is_empty();
            drop(state);
            drop(slot);
            if reclaim {
                self.gc_room(&room);
            }
        }
    }

    fn schedule_grace(self: &Arc<Self>, room: String, epoch: u64, keys: SmallVec<[String; 4]>) {
        let sync = Arc::clone(self);
        let grace = self.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            sync.finish_grace(&room, epoch, &keys);
        });
    }

    /// Grace window expired: reap the keys still pending from `epoch`
    /// and, if anything actually went away, emit the shrunk snapshot.
    fn finish_grace(&self, room: &str, epoch: u64, keys: &[String]) {
        let Some(slot) = self.room(room) else {
            return;
        };
        let mut state = slot.lock();
        let mut reaped = 0usize;
        for key in keys {
            if state.table.reap_lame(key, epoch) {
                reaped += 1;
            }
        }
        if reaped > 0 {
            debug!("room {room}: {reaped} member(s) removed after grace window");
            self.emit(&mut state);
        }
        let reclaim = state.table.is_empty() && state.subscribers.is_empty();
        drop(state);
        drop(slot);
        if reclaim {
            self.gc_room(room);
        }
    }

    /// Pure read. A room with no state yields an empty snapshot.
    pub(crate) fn snapshot(&self, room: &str) -> PresenceSnapshot {
        match self.room(room) {
            Some(slot) => {
                let state = slot.lock();
                state.table.snapshot(room, &self.dedup)
            }
            None => PresenceSnapshot::empty(room),
        }
    }

    pub(crate) fn member_count(&self, room: &str) -> usize {
        self.room(room).map_or(0, |slot| slot.lock().table.len())
    }

    pub(crate) fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub(crate) fn active_rooms(&self) -> Vec<String> {
        self.rooms.iter().map(|entry| entry.key().clone()).collect()
    }

    pub(crate) fn snapshots_emitted(&self) -> u64 {
        self.snapshots_emitted.load(Ordering::Relaxed)
    }

    pub(crate) fn deliveries_dropped(&self) -> u64 {
        self.deliveries_dropped.load(Ordering::Relaxed)
    }

    /// Bump seq, recompute the snapshot, push it to every subscriber.
    /// Sends never block; a closed mailbox evicts its subscriber.
    fn emit(&self, state: &mut RoomState) -> Arc<PresenceSnapshot> {
        state.seq += 1;
        let seq = state.seq;
        let snapshot = Arc::new(state.table.snapshot(&state.name, &self.dedup));
        let mut failed: SmallVec<[ConnectionId; 2]> = SmallVec::new();
        for (&conn, outbound) in state.subscribers.iter() {
            let envelope = Envelope::Presence {
                seq,
                snapshot: Arc::clone(&snapshot),
            };
            if outbound.send(envelope).is_err() {
                failed.push(conn);
            }
        }
        for conn in failed {
            state.subscribers.remove(&conn);
            self.deliveries_dropped.fetch_add(1, Ordering::Relaxed);
            warn!(
                "dropping presence subscriber {conn} from {}: mailbox closed",
                state.name
            );
        }
        self.snapshots_emitted.fetch_add(1, Ordering::Relaxed);
        trace!(
            "room {} seq {seq}: {} member(s) to {} subscriber(s)",
            state.name,
            snapshot.len(),
            state.subscribers.len()
        );
        snapshot
    }

    /// Reclaim the room if nothing references it anymore. `try_lock`
    /// plus the strong-count check keep this from racing a concurrent
    /// operation that already pulled the room out of the map.
    fn gc_room(&self, name: &str) {
        let removed = self.rooms.remove_if(name, |_, slot| {
            Arc::strong_count(slot) == 1
                && slot
                    .try_lock()
                    .map_or(false, |state| {
                        state.table.is_empty() && state.subscribers.is_empty()
                    })
        });
        if removed.is_some() {
            debug!("room {name} reclaimed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::mailbox;
    use serde_json::json;

    fn sync() -> Arc<PresenceSync> {
        Arc::new(PresenceSync::new(
            DedupKey::default(),
            Duration::from_millis(40),
        ))
    }

    fn presence_seqs(envelopes: &[Envelope]) -> Vec<u64> {
        envelopes
            .iter()
            .filter_map(|envelope| match envelope {
                Envelope::Presence { seq, .. } => Some(*seq),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn join_pushes_initial_snapshot() {
        let sync = sync();
        let tracker = ConnectionId::test(1);
        let (tracker_tx, _tracker_inbox) = mailbox(tracker, 16);
        sync.join(tracker, "canvas:main", tracker_tx);
        sync.track(tracker, "canvas:main", "u1", json!({"name": "Nair"}));

        let viewer = ConnectionId::test(2);
        let (viewer_tx, mut viewer_inbox) = mailbox(viewer, 16);
        sync.join(viewer, "canvas:main", viewer_tx);

        let Some(Envelope::Presence { snapshot, .. }) = viewer_inbox.try_recv() else {
            panic!("expected an initial snapshot");
        };
        assert_eq!(snapshot.display_names(), vec!["Nair"]);
    }

    #[tokio::test]
    async fn seq_is_monotonic_per_subscriber() {
        let sync = sync();
        let viewer = ConnectionId::test(1);
        let (viewer_tx, mut viewer_inbox) = mailbox(viewer, 64);
        sync.join(viewer, "canvas:main", viewer_tx);

        let tracker = ConnectionId::test(2);
        for n in 0..10 {
            sync.track(
                tracker,
                "canvas:main",
                &format!("u{n}"),
                json!({"name": format!("guest-{n}")}),
            );
        }

        let seqs = presence_seqs(&viewer_inbox.drain());
        assert!(!seqs.is_empty());
        assert!(seqs.windows(2).all(|w| w[1] > w[0]), "seqs: {seqs:?}");
    }

    #[tokio::test]
    async fn untrack_is_emitted_immediately() {
        let sync = sync();
        let viewer = ConnectionId::test(1);
        let (viewer_tx, mut viewer_inbox) = mailbox(viewer, 16);
        sync.join(viewer, "canvas:main", viewer_tx);

        let tracker = ConnectionId::test(2);
        sync.track(tracker, "canvas:main", "u1", json!({"name": "Nair"}));
        assert!(sync.untrack("canvas:main", "u1"));

        let last = viewer_inbox
            .drain()
            .into_iter()
            .filter_map(|envelope| match envelope {
                Envelope::Presence { snapshot, .. } => Some(snapshot),
                _ => None,
            })
            .last()
            .unwrap();
        assert!(last.is_empty());
    }

    #[tokio::test]
    async fn disconnect_defers_removal_until_grace_expires() {
        let sync = sync();
        let viewer = ConnectionId::test(1);
        let (viewer_tx, mut viewer_inbox) = mailbox(viewer, 16);
        sync.join(viewer, "canvas:main", viewer_tx);

        let tracker = ConnectionId::test(2);
        sync.track(tracker, "canvas:main", "u1", json!({"name": "Nair"}));
        let _ = viewer_inbox.drain();

        sync.disconnect(tracker, vec!["canvas:main".to_string()]);
        // Inside the window nothing is emitted and the member is intact.
        assert!(viewer_inbox.try_recv().is_none());
        assert_eq!(sync.snapshot("canvas:main").display_names(), vec!["Nair"]);

        tokio::time::sleep(Duration::from_millis(120)).await;
        let envelopes = viewer_inbox.drain();
        let Some(Envelope::Presence { snapshot, .. }) = envelopes.last() else {
            panic!("expected the post-grace emission");
        };
        assert!(snapshot.is_empty());
    }

    #[tokio::test]
    async fn retrack_within_grace_suppresses_the_shrink() {
        let sync = sync();
        let old_conn = ConnectionId::test(2);
        sync.track(old_conn, "canvas:main", "u1", json!({"name": "Nair"}));

        // Joins once the member is visible; every snapshot it ever sees
        // must therefore include the member.
        let viewer = ConnectionId::test(1);
        let (viewer_tx, mut viewer_inbox) = mailbox(viewer, 32);
        sync.join(viewer, "canvas:main", viewer_tx);

        sync.disconnect(old_conn, vec!["canvas:main".to_string()]);

        // Same member key, fresh connection, inside the window.
        let new_conn = ConnectionId::test(3);
        sync.track(new_conn, "canvas:main", "u1", json!({"name": "Nair"}));

        tokio::time::sleep(Duration::from_millis(120)).await;
        for envelope in viewer_inbox.drain() {
            if let Envelope::Presence { snapshot, .. } = envelope {
                assert_eq!(
                    snapshot.display_names(),
                    vec!["Nair"],
                    "observed a snapshot excluding the re-tracked member"
                );
            }
        }
        assert_eq!(sync.snapshot("canvas:main").display_names(), vec!["Nair"]);
    }

    #[tokio::test]
    async fn room_is_reclaimed_when_fully_empty() {
        let sync = sync();
        let conn = ConnectionId::test(1);
        let (tx, _inbox) = mailbox(conn, 16);
        sync.join(conn, "canvas:main", tx);
        sync.track(conn, "canvas:main", "u1", json!({"name": "Nair"}));
        assert_eq!(sync.room_count(), 1);

        sync.untrack("canvas:main", "u1");
        assert_eq!(sync.room_count(), 1, "still subscribed");
        sync.leave(conn, "canvas:main");
        assert_eq!(sync.room_count(), 0);
        assert!(sync.snapshot("canvas:main").is_empty());
    }

    #[tokio::test]
    async fn closed_mailbox_evicts_subscriber() {
        let sync = sync();
        let viewer = ConnectionId::test(1);
        let (viewer_tx, viewer_inbox) = mailbox(viewer, 16);
        sync.join(viewer, "canvas:main", viewer_tx);
        drop(viewer_inbox);

        let tracker = ConnectionId::test(2);
        sync.track(tracker, "canvas:main", "u1", json!({"name": "Nair"}));
        assert_eq!(sync.deliveries_dropped(), 1);
        // Eviction means the next emission has no one to fail on.
        sync.track(tracker, "canvas:main", "u2", json!({"name": "Guest"}));
        assert_eq!(sync.deliveries_dropped(), 1);
    }
}
