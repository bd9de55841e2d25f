//! # Subscriptions
//!
//! A queue delivers to the subscriptions registered on it. Two kinds exist:
//!
//! - [`LocalSubscription`]: a consumer on one of this broker's channels. Its
//!   deliveries are pushed to the owning connection task through an
//!   unbounded channel.
//! - [`RemoteSubscription`](crate::cluster::RemoteSubscription): a peer broker
//!   that forwards entries to its own consumers.
//!
//! ## Selection
//!
//! [`SubscriptionList::next_subscriber`] picks, among subscriptions that are
//! neither suspended nor closed, the one with the smallest weight. Ties go to
//! the earliest registration and a weight of zero is taken immediately. The
//! weight of a subscription is its count of outstanding unacknowledged
//! deliveries.

mod local;

#[cfg(test)]
mod tests;

pub use local::{ChannelCredit, Delivery, LocalSubscription};

use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::cluster::{ClusterError, MemberHandle};
use crate::queue::{Queue, QueueEntry};

pub type SubscriptionId = u64;

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a broker-unique subscription id.
pub fn next_subscription_id() -> SubscriptionId {
    NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("subscription is suspended")]
    Suspended,

    #[error("subscription is closed")]
    Closed,

    #[error("prefetch window exhausted")]
    NoCredit,

    #[error("forwarding to peer failed: {0}")]
    Cluster(#[from] ClusterError),
}

/// Something a queue can hand entries to.
pub trait Subscription: Send + Sync + fmt::Debug {
    fn id(&self) -> SubscriptionId;

    /// Outstanding deliveries; lower weights are preferred.
    fn weight(&self) -> u64;

    fn is_suspended(&self) -> bool;

    fn set_suspended(&self, suspended: bool);

    fn is_closed(&self) -> bool;

    /// Takes ownership of an acquired entry. On error the queue releases it.
    fn send(&self, queue: &Arc<Queue>, entry: Arc<QueueEntry>) -> Result<(), DeliveryError>;

    /// Called when the queue the subscription is attached to is deleted.
    fn queue_deleted(&self, _queue: &Queue) {}

    /// The peer broker behind a remote subscription.
    fn peer(&self) -> Option<&MemberHandle> {
        None
    }

    /// A remote subscription whose peer no longer holds anything.
    fn is_orphaned(&self) -> bool {
        false
    }

    /// Registered with `basic.consume` exclusive.
    fn is_exclusive(&self) -> bool {
        false
    }
}

/// Subscriptions of one queue in registration order.
#[derive(Default)]
pub struct SubscriptionList {
    subscriptions: RwLock<Vec<Arc<dyn Subscription>>>,
}

impl SubscriptionList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, subscription: Arc<dyn Subscription>) {
        self.subscriptions.write().push(subscription);
    }

    pub fn remove(&self, id: SubscriptionId) -> Option<Arc<dyn Subscription>> {
        let mut subscriptions = self.subscriptions.write();
        let index = subscriptions.iter().position(|s| s.id() == id)?;
        Some(subscriptions.remove(index))
    }

    pub fn remove_where<F>(&self, predicate: F) -> Vec<Arc<dyn Subscription>>
    where
        F: Fn(&dyn Subscription) -> bool,
    {
        let mut subscriptions = self.subscriptions.write();
        let (removed, kept): (Vec<_>, Vec<_>) = subscriptions
            .drain(..)
            .partition(|s| predicate(s.as_ref()));
        *subscriptions = kept;
        removed
    }

    pub fn get(&self, id: SubscriptionId) -> Option<Arc<dyn Subscription>> {
        self.subscriptions
            .read()
            .iter()
            .find(|s| s.id() == id)
            .cloned()
    }

    pub fn snapshot(&self) -> Vec<Arc<dyn Subscription>> {
        self.subscriptions.read().clone()
    }

    pub fn clear(&self) {
        self.subscriptions.write().clear();
    }

    pub fn len(&self) -> usize {
        self.subscriptions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.read().is_empty()
    }

    pub fn next_subscriber(&self) -> Option<Arc<dyn Subscription>> {
        self.next_subscriber_excluding(&[])
    }

    /// Like [`next_subscriber`](Self::next_subscriber), skipping `excluded`.
    pub fn next_subscriber_excluding(
        &self,
        excluded: &[SubscriptionId],
    ) -> Option<Arc<dyn Subscription>> {
        let subscriptions = self.subscriptions.read();
        let mut best: Option<(&Arc<dyn Subscription>, u64)> = None;
        for subscription in subscriptions.iter() {
            if subscription.is_suspended()
                || subscription.is_closed()
                || excluded.contains(&subscription.id())
            {
                continue;
            }
            let weight = subscription.weight();
            if weight == 0 {
                return Some(Arc::clone(subscription));
            }
            match best {
                Some((_, lowest)) if lowest <= weight => {}
                _ => best = Some((subscription, weight)),
            }
        }
        best.map(|(subscription, _)| Arc::clone(subscription))
    }
}

impl fmt::Debug for SubscriptionList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.subscriptions.read().iter().map(|s| s.id()))
            .finish()
    }
}
