use std::collections::HashMap;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::oneshot;

/// A subscription waiting for the next code on its channel.
#[derive(Debug)]
pub struct PendingSubscription {
    pub registered_at: Instant,
    pub deliver: oneshot::Sender<String>,
}

/// A publisher waiting for a subscription to appear on its channel.
#[derive(Debug)]
pub struct PendingWaiter {
    pub registered_at: Instant,
    pub wake: oneshot::Sender<()>,
}

/// Per-channel registry. Ids are unique across the whole broker.
#[derive(Debug, Default)]
pub struct Channel {
    pub subscriptions: HashMap<u64, PendingSubscription>,
    pub waiters: HashMap<u64, PendingWaiter>,
}

impl Channel {
    /// An idle channel holds nothing and can be dropped from the table.
    pub fn is_idle(&self) -> bool {
        self.subscriptions.is_empty() && self.waiters.is_empty()
    }

    /// Wake every waiting publisher. Waiters are one-shot, so the set is
    /// emptied.
    pub fn wake_waiters(&mut self) -> usize {
        self.waiters
            .drain()
            .map(|(_, waiter)| waiter.wake.send(()).is_ok())
            .filter(|sent| *sent)
            .count()
    }
}

/// Channel key (location fingerprint) → channel state.
pub type ChannelTable = DashMap<String, Channel>;
