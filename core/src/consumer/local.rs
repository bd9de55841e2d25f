use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{next_subscription_id, DeliveryError, Subscription, SubscriptionId};
use crate::queue::{Queue, QueueEntry};

/// An entry on its way to a consumer, handed to the connection task.
#[derive(Debug)]
pub struct Delivery {
    pub subscription_id: SubscriptionId,
    pub channel_id: u16,
    pub consumer_tag: String,
    pub queue: Arc<Queue>,
    pub entry: Arc<QueueEntry>,
    pub ack_required: bool,
}

/// Per-channel delivery window shared by the channel's consumers.
#[derive(Debug)]
pub struct ChannelCredit {
    /// Zero means unlimited.
    prefetch_count: AtomicU32,
    unacked: AtomicU32,
    flow_active: AtomicBool,
}

impl Default for ChannelCredit {
    fn default() -> Self {
        Self {
            prefetch_count: AtomicU32::new(0),
            unacked: AtomicU32::new(0),
            flow_active: AtomicBool::new(true),
        }
    }
}

impl ChannelCredit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_prefetch_count(&self, count: u32) {
        self.prefetch_count.store(count, Ordering::SeqCst);
    }

    pub fn prefetch_count(&self) -> u32 {
        self.prefetch_count.load(Ordering::SeqCst)
    }

    pub fn unacked(&self) -> u32 {
        self.unacked.load(Ordering::SeqCst)
    }

    pub fn set_flow_active(&self, active: bool) {
        self.flow_active.store(active, Ordering::SeqCst);
    }

    pub fn is_flow_active(&self) -> bool {
        self.flow_active.load(Ordering::SeqCst)
    }

    pub fn has_capacity(&self) -> bool {
        let prefetch = self.prefetch_count();
        prefetch == 0 || self.unacked() < prefetch
    }

    /// Claims one slot of the window.
    pub fn try_reserve(&self) -> bool {
        self.unacked
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |unacked| {
                let prefetch = self.prefetch_count();
                (prefetch == 0 || unacked < prefetch).then_some(unacked + 1)
            })
            .is_ok()
    }

    pub fn release(&self) {
        let _ = self
            .unacked
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_sub(1));
    }
}

/// A consumer registered through `basic.consume` on one of our channels.
pub struct LocalSubscription {
    id: SubscriptionId,
    consumer_tag: String,
    channel_id: u16,
    queue_name: String,
    no_ack: bool,
    exclusive: bool,
    outstanding: AtomicU64,
    credit: Arc<ChannelCredit>,
    suspended: AtomicBool,
    closed: AtomicBool,
    sender: mpsc::UnboundedSender<Delivery>,
}

impl LocalSubscription {
    pub fn new(
        consumer_tag: impl Into<String>,
        channel_id: u16,
        queue_name: impl Into<String>,
        no_ack: bool,
        exclusive: bool,
        credit: Arc<ChannelCredit>,
        sender: mpsc::UnboundedSender<Delivery>,
    ) -> Self {
        Self {
            id: next_subscription_id(),
            consumer_tag: consumer_tag.into(),
            channel_id,
            queue_name: queue_name.into(),
            no_ack,
            exclusive,
            outstanding: AtomicU64::new(0),
            credit,
            suspended: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            sender,
        }
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn channel_id(&self) -> u16 {
        self.channel_id
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn no_ack(&self) -> bool {
        self.no_ack
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// One delivery finished: acknowledged, rejected, recovered, or written
    /// to a no-ack consumer.
    pub fn settle(&self) {
        let _ = self
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_sub(1));
        if !self.no_ack {
            self.credit.release();
        }
    }
}

impl Subscription for LocalSubscription {
    fn id(&self) -> SubscriptionId {
        self.id
    }

    fn weight(&self) -> u64 {
        self.outstanding.load(Ordering::SeqCst)
    }

    fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
            || !self.credit.is_flow_active()
            || (!self.no_ack && !self.credit.has_capacity())
    }

    fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.sender.is_closed()
    }

    fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    fn send(&self, queue: &Arc<Queue>, entry: Arc<QueueEntry>) -> Result<(), DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::Closed);
        }
        if self.suspended.load(Ordering::SeqCst) || !self.credit.is_flow_active() {
            return Err(DeliveryError::Suspended);
        }
        if !self.no_ack && !self.credit.try_reserve() {
            return Err(DeliveryError::NoCredit);
        }
        self.outstanding.fetch_add(1, Ordering::SeqCst);

        let delivery = Delivery {
            subscription_id: self.id,
            channel_id: self.channel_id,
            consumer_tag: self.consumer_tag.clone(),
            queue: Arc::clone(queue),
            entry,
            ack_required: !self.no_ack,
        };
        if self.sender.send(delivery).is_err() {
            self.settle();
            self.close();
            return Err(DeliveryError::Closed);
        }
        Ok(())
    }
}

impl fmt::Debug for LocalSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalSubscription")
            .field("id", &self.id)
            .field("consumer_tag", &self.consumer_tag)
            .field("channel_id", &self.channel_id)
            .field("queue", &self.queue_name)
            .field("outstanding", &self.weight())
            .finish()
    }
}
