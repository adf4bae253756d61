use thiserror::Error;

use crate::registry::ConnectionId;

/// Errors surfaced synchronously to callers.
///
/// Subscriber-side problems are deliberately absent: a failed delivery
/// is logged and drops that subscriber, a publish to a channel nobody
/// watches is a no-op, and a read of a room with no state yields an
/// empty snapshot. Only invalid input and references to dead
/// connections are rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RealtimeError {
    /// The operation referenced a connection that was never created or
    /// has already been disconnected.
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    /// Broadcast channel names must be non-empty.
    #[error("channel name must not be empty")]
    InvalidChannel,

    /// Room names must be non-empty.
    #[error("room name must not be empty")]
    InvalidRoom,
}

pub type Result<T> = std::result::Result<T, RealtimeError>;
