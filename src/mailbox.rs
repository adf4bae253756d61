use std::sync::Arc;

use tokio::sync::broadcast;

use crate::event::BroadcastEvent;
use crate::presence::PresenceSnapshot;
use crate::registry::ConnectionId;

/// What a connection's mailbox carries.
#[derive(Clone, Debug)]
pub enum Envelope {
    /// A presence sync snapshot for a room the connection joined.
    /// `seq` increases by one per emission for that room; a consumer
    /// never sees seq N before N-1, though overflow may skip entries.
    Presence {
        seq: u64,
        snapshot: Arc<PresenceSnapshot>,
    },
    /// A one-shot event on a broadcast channel the connection
    /// subscribed to.
    Event {
        channel: Arc<str>,
        event: Arc<BroadcastEvent>,
    },
}

/// Handle used by the core to enqueue deliveries for one connection.
///
/// A tokio broadcast ring with a single receiver: sends never block,
/// and when the consumer lags past `capacity` the oldest entries are
/// dropped first. A send fails only once the [`Inbox`] is gone, which
/// the core treats as a delivery failure for that subscriber.
pub(crate) type Outbound = broadcast::Sender<Envelope>;

/// Create the mailbox pair for a new connection.
pub(crate) fn mailbox(conn: ConnectionId, capacity: usize) -> (Outbound, Inbox) {
    let (tx, rx) = broadcast::channel(capacity.max(1));
    (
        tx,
        Inbox {
            conn,
            receiver: rx,
            received: 0,
            dropped: 0,
        },
    )
}

/// Consumer side of a connection's mailbox.
///
/// Returned by `connect()`; dropping it is how a client goes away from
/// the core's point of view — every later delivery to the connection
/// fails and evicts it from whatever it was subscribed to.
pub struct Inbox {
    conn: ConnectionId,
    receiver: broadcast::Receiver<Envelope>,
    received: u64,
    dropped: u64,
}

impl Inbox {
    /// The connection this mailbox belongs to.
    pub fn connection_id(&self) -> ConnectionId {
        self.conn
    }

    /// Wait for the next delivery. Returns `None` once the connection
    /// has been torn down and the backlog is drained.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            match self.receiver.recv().await {
                Ok(envelope) => {
                    self.received += 1;
                    return Some(envelope);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped += n;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive. `None` means nothing is pending right now.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        loop {
            match self.receiver.try_recv() {
                Ok(envelope) => {
                    self.received += 1;
                    return Some(envelope);
                }
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.dropped += n;
                }
                Err(_) => return None,
            }
        }
    }

    /// Drain everything currently pending.
    pub fn drain(&mut self) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Some(envelope) = self.try_recv() {
            out.push(envelope);
        }
        out
    }

    /// Envelopes handed to the consumer so far.
    pub fn received_count(&self) -> u64 {
        self.received
    }

    /// Envelopes lost to mailbox overflow (oldest dropped first).
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }
}

impl std::fmt::Debug for Inbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inbox")
            .field("conn", &self.conn)
            .field("received", &self.received)
            .field("dropped", &self.dropped)
            .finish()
    }
}
