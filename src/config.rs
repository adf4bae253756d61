use std::time::Duration;

/// Identity used to collapse duplicate presence entries in a snapshot.
///
/// Several physical connections (tabs, reconnects) may track the same
/// human; snapshots are deduplicated by display identity rather than by
/// connection so the member list stays stable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DedupKey {
    /// Dedup by the stable member key. One entry per logical user.
    MemberKey,
    /// Dedup by a string field of the display payload (e.g. `"name"`).
    /// Records whose payload lacks the field fall back to the member key.
    PayloadField(String),
}

impl DedupKey {
    /// Compute the dedup identity for a record.
    pub(crate) fn identity(&self, member_key: &str, payload: &serde_json::Value) -> String {
        match self {
            DedupKey::MemberKey => member_key.to_string(),
            DedupKey::PayloadField(field) => payload
                .get(field)
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| member_key.to_string()),
        }
    }
}

impl Default for DedupKey {
    fn default() -> Self {
        DedupKey::PayloadField("name".to_string())
    }
}

/// Configuration for the realtime core
#[derive(Clone, Debug)]
pub struct RealtimeConfig {
    /// Interval between heartbeat sweep passes (seconds)
    pub heartbeat_interval_secs: f64,
    /// Heartbeat age after which a connection is force-disconnected (seconds)
    pub heartbeat_timeout_secs: f64,
    /// Anti-flicker grace window for disconnect-driven presence removal
    /// (milliseconds). A member whose connection drops stays in snapshots
    /// for this long; re-tracking the same key within the window cancels
    /// the removal entirely.
    pub grace_window_ms: u64,
    /// Maximum number of envelopes buffered per connection mailbox.
    /// Overflow drops the oldest entries first.
    pub mailbox_capacity: usize,
    /// Snapshot dedup identity
    pub dedup: DedupKey,
}

impl RealtimeConfig {
    pub(crate) fn grace_window(&self) -> Duration {
        Duration::from_millis(self.grace_window_ms)
    }

    pub(crate) fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs_f64(self.heartbeat_interval_secs.max(0.001))
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30.0,
            heartbeat_timeout_secs: 60.0,
            grace_window_ms: 250,
            mailbox_capacity: 256,
            dedup: DedupKey::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dedup_by_payload_field() {
        let dedup = DedupKey::default();
        let id = dedup.identity("u1", &json!({"name": "Nair"}));
        assert_eq!(id, "Nair");
    }

    #[test]
    fn dedup_falls_back_to_member_key() {
        let dedup = DedupKey::default();
        let id = dedup.identity("u1", &json!({"avatar": "🌻"}));
        assert_eq!(id, "u1");
    }

    #[test]
    fn dedup_by_member_key_ignores_payload() {
        let dedup = DedupKey::MemberKey;
        let id = dedup.identity("u1", &json!({"name": "Nair"}));
        assert_eq!(id, "u1");
    }
}
