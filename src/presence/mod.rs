//! Room presence: per-room membership state and the synchronizer that
//! pushes sync snapshots to subscribers.

pub mod sync;
pub mod table;

pub use table::{PresenceRecord, PresenceSnapshot};

pub(crate) use sync::PresenceSync;
