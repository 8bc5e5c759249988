//! Channel-keyed rendezvous between one publisher and any number of
//! subscribers.
//!
//! A code is handed over only when both sides are present at the same
//! time. `publish` reaches the subscriptions registered on the channel at
//! that instant and nothing else: with nobody listening the code is
//! dropped, never queued. Publishers bridge the gap with
//! `wait_for_subscriber`, which gives a subscriber a bounded window to
//! attach before the code goes out.
//!
//! Every pending registration is owned by the future that created it.
//! Dropping that future (client went away) removes the registration and
//! its timer at once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::debug;

use crate::state::channels::{ChannelTable, PendingSubscription, PendingWaiter};

/// Terminal state of a `subscribe_once` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Delivered(String),
    Expired,
}

/// How a `wait_for_subscriber` call ended. None of these is a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attachment {
    /// A subscription was already registered when the call was made.
    AlreadyPresent,
    /// A subscription registered while we were waiting.
    Attached,
    /// Nobody showed up in time; the caller proceeds anyway.
    TimedOut,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    pub channels: usize,
    pub subscriptions: usize,
    pub waiters: usize,
}

#[derive(Debug, Clone, Copy)]
enum Kind {
    Subscription,
    Waiter,
}

#[derive(Debug, Default)]
pub struct RendezvousBroker {
    channels: ChannelTable,
    next_id: AtomicU64,
}

impl RendezvousBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand `value` to every subscription currently registered on
    /// `channel` and return how many received it. Zero means the value was
    /// dropped.
    pub fn publish(&self, channel: &str, value: &str) -> usize {
        let delivered = match self.channels.get_mut(channel) {
            Some(mut entry) => entry
                .subscriptions
                .drain()
                .map(|(_, sub)| sub.deliver.send(value.to_owned()).is_ok())
                .filter(|sent| *sent)
                .count(),
            None => 0,
        };
        self.reclaim(channel);

        if delivered == 0 {
            debug!(channel, "no subscriber on channel, code dropped");
        } else {
            debug!(channel, delivered, "code delivered");
        }
        delivered
    }

    /// Wait up to `wait` for the next code published on `channel`.
    pub async fn subscribe_once(&self, channel: &str, wait: Duration) -> Delivery {
        let (mut registration, mut rx) = self.register_subscription(channel);

        match timeout(wait, &mut rx).await {
            Ok(Ok(code)) => Delivery::Delivered(code),
            Ok(Err(_)) => Delivery::Expired,
            Err(_) => registration.settle_delivery(&mut rx),
        }
    }

    /// Wait up to `wait` for a subscription to exist on `channel`.
    /// Returns at once if one already does. Never fails.
    pub async fn wait_for_subscriber(&self, channel: &str, wait: Duration) -> Attachment {
        let Some((mut registration, mut rx)) = self.register_waiter(channel) else {
            return Attachment::AlreadyPresent;
        };

        match timeout(wait, &mut rx).await {
            Ok(Ok(())) => Attachment::Attached,
            Ok(Err(_)) => Attachment::TimedOut,
            Err(_) => registration.settle_attachment(&mut rx),
        }
    }

    fn register_subscription<'a>(
        &'a self,
        channel: &'a str,
    ) -> (Registration<'a>, oneshot::Receiver<String>) {
        let id = self.next_id();
        let (deliver, rx) = oneshot::channel();

        let woken = {
            let mut entry = self.channels.entry(channel.to_owned()).or_default();
            entry.subscriptions.insert(
                id,
                PendingSubscription {
                    registered_at: Instant::now(),
                    deliver,
                },
            );
            entry.wake_waiters()
        };
        debug!(channel, id, woken, "subscription registered");

        (Registration::new(self, channel, id, Kind::Subscription), rx)
    }

    /// `None` when the channel already has a subscription.
    fn register_waiter<'a>(
        &'a self,
        channel: &'a str,
    ) -> Option<(Registration<'a>, oneshot::Receiver<()>)> {
        let id = self.next_id();
        let (wake, rx) = oneshot::channel();

        {
            let mut entry = self.channels.entry(channel.to_owned()).or_default();
            if !entry.subscriptions.is_empty() {
                return None;
            }
            entry.waiters.insert(
                id,
                PendingWaiter {
                    registered_at: Instant::now(),
                    wake,
                },
            );
        }
        debug!(channel, id, "waiting for subscriber");

        Some((Registration::new(self, channel, id, Kind::Waiter), rx))
    }

    pub fn has_subscriber(&self, channel: &str) -> bool {
        self.subscriber_count(channel) > 0
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map_or(0, |entry| entry.subscriptions.len())
    }

    pub fn stats(&self) -> BrokerStats {
        self.channels
            .iter()
            .fold(BrokerStats::default(), |mut stats, entry| {
                stats.channels += 1;
                stats.subscriptions += entry.subscriptions.len();
                stats.waiters += entry.waiters.len();
                stats
            })
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Remove one registration and report how long it was pending. `None`
    /// if it was already gone (delivered or woken by the other side).
    fn remove(&self, channel: &str, id: u64, kind: Kind) -> Option<Duration> {
        let removed = match self.channels.get_mut(channel) {
            Some(mut entry) => match kind {
                Kind::Subscription => entry
                    .subscriptions
                    .remove(&id)
                    .map(|sub| sub.registered_at.elapsed()),
                Kind::Waiter => entry
                    .waiters
                    .remove(&id)
                    .map(|waiter| waiter.registered_at.elapsed()),
            },
            None => None,
        };
        self.reclaim(channel);
        removed
    }

    fn reclaim(&self, channel: &str) {
        self.channels.remove_if(channel, |_, entry| entry.is_idle());
    }
}

/// Owns one pending registration for the lifetime of the waiting future.
struct Registration<'a> {
    broker: &'a RendezvousBroker,
    channel: &'a str,
    id: u64,
    kind: Kind,
    active: bool,
}

impl<'a> Registration<'a> {
    fn new(broker: &'a RendezvousBroker, channel: &'a str, id: u64, kind: Kind) -> Self {
        Self {
            broker,
            channel,
            id,
            kind,
            active: true,
        }
    }

    /// True if we removed the registration ourselves, false if the other
    /// side already consumed it.
    fn release(&mut self) -> bool {
        if !self.active {
            return false;
        }
        self.active = false;
        self.broker.remove(self.channel, self.id, self.kind).is_some()
    }

    /// Resolve a subscription whose timer fired. A publish that drained
    /// it before we took the lock has already sent the code; take it
    /// rather than expire.
    fn settle_delivery(&mut self, rx: &mut oneshot::Receiver<String>) -> Delivery {
        if self.release() {
            debug!(channel = self.channel, id = self.id, "subscription expired");
            return Delivery::Expired;
        }
        match rx.try_recv() {
            Ok(code) => Delivery::Delivered(code),
            Err(_) => Delivery::Expired,
        }
    }

    /// Same for a publisher waiter: woken counts as attached.
    fn settle_attachment(&mut self, rx: &mut oneshot::Receiver<()>) -> Attachment {
        if self.release() || rx.try_recv().is_err() {
            debug!(
                channel = self.channel,
                id = self.id,
                "no subscriber attached, proceeding"
            );
            Attachment::TimedOut
        } else {
            Attachment::Attached
        }
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(waited) = self.broker.remove(self.channel, self.id, self.kind) {
            debug!(
                channel = self.channel,
                id = self.id,
                kind = ?self.kind,
                ?waited,
                "registration cancelled"
            );
        }
    }
}
