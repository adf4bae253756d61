use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use dashmap::DashMap;
use log::{debug, trace, warn};
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::errors::{RealtimeError, Result};
use crate::event::BroadcastEvent;
use crate::mailbox::{Envelope, Outbound};
use crate::registry::ConnectionId;

/// Proof of a subscription; passing it to `unsubscribe` removes exactly
/// that registration. Idempotent — a stale handle is a no-op.
#[derive(Clone, Debug)]
pub struct SubscriptionHandle {
    pub(crate) channel: String,
    pub(crate) conn: ConnectionId,
    pub(crate) id: u64,
}

impl SubscriptionHandle {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.conn
    }
}

struct ChannelState {
    subscribers: AHashMap<u64, (ConnectionId, Outbound)>,
}

/// Stateless fan-out of one-shot events to the current subscribers of a
/// named channel.
///
/// Nothing is buffered or replayed: `publish` snapshots the subscriber
/// set at the moment of the call, enqueues into each mailbox, and
/// returns. Channels are created lazily on first subscribe and
/// reclaimed when their last subscriber goes away.
pub(crate) struct BroadcastRouter {
    channels: DashMap<String, Arc<Mutex<ChannelState>>>,
    next_subscription: AtomicU64,
    events_published: AtomicU64,
    deliveries_dropped: AtomicU64,
}

impl BroadcastRouter {
    pub(crate) fn new() -> Self {
        Self {
            channels: DashMap::new(),
            next_subscription: AtomicU64::new(1),
            events_published: AtomicU64::new(0),
            deliveries_dropped: AtomicU64::new(0),
        }
    }

    pub(crate) fn subscribe(
        &self,
        conn: ConnectionId,
        channel: &str,
        outbound: Outbound,
    ) -> Result<SubscriptionHandle> {
        if channel.is_empty() {
            return Err(RealtimeError::InvalidChannel);
        }
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::clone(
            self.channels
                .entry(channel.to_string())
                .or_insert_with(|| {
                    debug!("channel {channel} created");
                    Arc::new(Mutex::new(ChannelState {
                        subscribers: AHashMap::new(),
                    }))
                })
                .value(),
        );
        slot.lock().subscribers.insert(id, (conn, outbound));
        Ok(SubscriptionHandle {
            channel: channel.to_string(),
            conn,
            id,
        })
    }

    /// Idempotent removal; returns whether the registration was live.
    pub(crate) fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let Some(slot) = self.channel(&handle.channel) else {
            return false;
        };
        let mut state = slot.lock();
        let removed = state.subscribers.remove(&handle.id).is_some();
        let reclaim = state.subscribers.is_empty();
        drop(state);
        drop(slot);
        if reclaim {
            self.gc_channel(&handle.channel);
        }
        removed
    }

    /// Deliver `event` to everyone subscribed right now. Returns how
    /// many mailboxes accepted it; zero subscribers is a silent no-op.
    /// Never blocks, never fails because of a subscriber.
    pub(crate) fn publish(&self, channel: &str, event: BroadcastEvent) -> Result<usize> {
        if channel.is_empty() {
            return Err(RealtimeError::InvalidChannel);
        }
        self.events_published.fetch_add(1, Ordering::Relaxed);
        let Some(slot) = self.channel(channel) else {
            trace!("publish to {channel}: no subscribers");
            return Ok(0);
        };

        let channel_name: Arc<str> = Arc::from(channel);
        let event = Arc::new(event);
        let mut state = slot.lock();
        let mut delivered = 0usize;
        let mut failed: SmallVec<[u64; 2]> = SmallVec::new();
        for (&id, (conn, outbound)) in state.subscribers.iter() {
            let envelope = Envelope::Event {
                channel: Arc::clone(&channel_name),
                event: Arc::clone(&event),
            };
            if outbound.send(envelope).is_ok() {
                delivered += 1;
            } else {
                warn!("dropping subscriber {conn} from {channel}: mailbox closed");
                failed.push(id);
            }
        }
        for id in failed {
            state.subscribers.remove(&id);
            self.deliveries_dropped.fetch_add(1, Ordering::Relaxed);
        }
        let reclaim = state.subscribers.is_empty();
        drop(state);
        drop(slot);
        if reclaim {
            self.gc_channel(channel);
        }
        trace!("publish to {channel}: delivered to {delivered}");
        Ok(delivered)
    }

    /// Drop every subscription `conn` holds on the given channels.
    /// Used by disconnect teardown; holds one channel lock at a time.
    pub(crate) fn drop_conn<'a, I>(&self, conn: ConnectionId, channels: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        for channel in channels {
            let Some(slot) = self.channel(channel) else {
                continue;
            };
            let mut state = slot.lock();
            state.subscribers.retain(|_, (owner, _)| *owner != conn);
            let reclaim = state.subscribers.is_empty();
            drop(state);
            drop(slot);
            if reclaim {
                self.gc_channel(channel);
            }
        }
    }

    pub(crate) fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub(crate) fn subscriber_count(&self, channel: &str) -> usize {
        self.channel(channel)
            .map_or(0, |slot| slot.lock().subscribers.len())
    }

    pub(crate) fn events_published(&self) -> u64 {
        self.events_published.load(Ordering::Relaxed)
    }

    pub(crate) fn deliveries_dropped(&self) -> u64 {
        self.deliveries_dropped.load(Ordering::Relaxed)
    }

    fn channel(&self, name: &str) -> Option<Arc<Mutex<ChannelState>>> {
        self.channels.get(name).map(|entry| Arc::clone(entry.value()))
    }

    fn gc_channel(&self, name: &str) {
        let removed = self.channels.remove_if(name, |_, slot| {
            Arc::strong_count(slot) == 1
                && slot
                    .try_lock()
                    .map_or(false, |state| state.subscribers.is_empty())
        });
        if removed.is_some() {
            debug!("channel {name} reclaimed");
        }
    }
}
