use std::time::{SystemTime, UNIX_EPOCH};

use ahash::{AHashMap, AHashSet};
use serde::Serialize;
use serde_json::Value;
use smallvec::SmallVec;

use crate::config::DedupKey;
use crate::registry::ConnectionId;

/// Last-known presence of one member in one room.
///
/// The member key is stable per logical user — reconnects reuse it —
/// while any number of physical connections may back it at once.
#[derive(Clone, Debug, Serialize)]
pub struct PresenceRecord {
    pub member_key: String,
    /// Arbitrary small display payload, e.g. `{"name":"Nair"}`.
    pub payload: Value,
    /// Unix timestamp of the most recent track for this key.
    pub updated_at: f64,
}

/// Read-only view of a room's membership.
///
/// Entries are deduplicated by display identity and kept in first-seen
/// order, so repeated computations over unchanged state are identical.
/// Never persisted; recomputed on every membership change.
#[derive(Clone, Debug, Serialize)]
pub struct PresenceSnapshot {
    pub room: String,
    pub entries: Vec<PresenceRecord>,
}

impl PresenceSnapshot {
    pub(crate) fn empty(room: &str) -> Self {
        Self {
            room: room.to_string(),
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Display names in snapshot order. Entries without a `"name"`
    /// payload field fall back to their member key.
    pub fn display_names(&self) -> Vec<&str> {
        self.entries
            .iter()
            .map(|record| {
                record
                    .payload
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or(&record.member_key)
            })
            .collect()
    }
}

/// Per-room membership state. Not thread-safe on its own — the
/// synchronizer serializes access through the room lock.
#[derive(Default)]
pub(crate) struct PresenceTable {
    records: AHashMap<String, PresenceRecord>,
    /// Member keys in first-seen order.
    order: Vec<String>,
    /// Member key → connections currently backing it.
    backers: AHashMap<String, AHashSet<ConnectionId>>,
    /// Members pending disconnect-driven removal, tagged with the grace
    /// epoch that scheduled them. Still visible in snapshots until the
    /// epoch's timer reaps them.
    lame: AHashMap<String, u64>,
}

impl PresenceTable {
    /// Upsert a record: replaces any prior record for the key, never
    /// appends. Cancels a pending disconnect-driven removal.
    pub(crate) fn upsert(&mut self, conn: ConnectionId, member_key: &str, payload: Value) {
        self.lame.remove(member_key);
        if !self.records.contains_key(member_key) {
            self.order.push(member_key.to_string());
        }
        self.records.insert(
            member_key.to_string(),
            PresenceRecord {
                member_key: member_key.to_string(),
                payload,
                updated_at: now_secs(),
            },
        );
        self.backers
            .entry(member_key.to_string())
            .or_default()
            .insert(conn);
    }

    /// Explicit removal. Takes effect immediately, regardless of how
    /// many connections still back the key.
    pub(crate) fn remove(&mut self, member_key: &str) -> bool {
        let existed = self.records.remove(member_key).is_some();
        if existed {
            self.order.retain(|key| key != member_key);
            self.backers.remove(member_key);
            self.lame.remove(member_key);
        }
        existed
    }

    /// Drop `conn` from every backer set. Returns the member keys left
    /// with no backing connection — candidates for grace-window removal.
    pub(crate) fn detach(&mut self, conn: ConnectionId) -> SmallVec<[String; 4]> {
        let mut orphaned = SmallVec::new();
        for (key, conns) in self.backers.iter_mut() {
            if conns.remove(&conn) && conns.is_empty() {
                orphaned.push(key.clone());
            }
        }
        orphaned
    }

    /// Mark keys for removal once the grace window of `epoch` expires.
    pub(crate) fn mark_lame(&mut self, keys: &[String], epoch: u64) {
        for key in keys {
            if self.records.contains_key(key) {
                self.lame.insert(key.clone(), epoch);
            }
        }
    }

    /// Remove `key` if it is still pending from `epoch`. A newer track
    /// or a newer disconnect epoch both cancel the stale timer.
    pub(crate) fn reap_lame(&mut self, key: &str, epoch: u64) -> bool {
        if self.lame.get(key) == Some(&epoch) {
            self.remove(key)
        } else {
            false
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Compute the deduplicated snapshot. Members in their grace window
    /// are still included — that is the point of the window.
    pub(crate) fn snapshot(&self, room: &str, dedup: &DedupKey) -> PresenceSnapshot {
        let mut seen = AHashSet::with_capacity(self.order.len());
        let mut entries = Vec::with_capacity(self.order.len());
        for key in &self.order {
            let Some(record) = self.records.get(key) else {
                continue;
            };
            if seen.insert(dedup.identity(&record.member_key, &record.payload)) {
                entries.push(record.clone());
            }
        }
        PresenceSnapshot {
            room: room.to_string(),
            entries,
        }
    }
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
