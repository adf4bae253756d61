//! Room-presence and ephemeral-broadcast messaging core.
//!
//! Tracks who is currently in each room (with join/leave
//! reconciliation and anti-flicker smoothing) and fans one-shot events
//! out to the current subscribers of named channels. Nothing is
//! persisted and nothing is replayed: offline subscribers miss events,
//! and rooms disappear once their last member and subscriber are gone.
//!
//! The embedding layer owns transport and auth; this crate owns the
//! state machine. A client maps to a [`ConnectionId`] plus an
//! [`Inbox`], joins rooms and tracks a presence payload under a stable
//! member key, and receives [`Envelope`]s: sequence-stamped
//! [`PresenceSnapshot`]s and broadcast [`BroadcastEvent`]s.

pub mod broadcast;
pub mod config;
pub mod errors;
pub mod event;
pub mod mailbox;
pub mod manager;
pub mod presence;
pub mod registry;

// Re-export main types for convenience
pub use broadcast::SubscriptionHandle;
pub use config::{DedupKey, RealtimeConfig};
pub use errors::{RealtimeError, Result};
pub use event::{BroadcastEvent, EventTag};
pub use mailbox::{Envelope, Inbox};
pub use manager::{RealtimeStats, RoomManager};
pub use presence::{PresenceRecord, PresenceSnapshot};
pub use registry::ConnectionId;
