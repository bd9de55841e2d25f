//! Subscription selection and local delivery tests

use super::*;
use crate::message::{MessageMetaData, ServerMessage};
use crate::protocol::BasicProperties;
use crate::queue::QueueConfig;
use crate::storage::{MemoryMessageStore, StoredMessage};
use bytes::Bytes;
use std::sync::atomic::AtomicBool;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug)]
struct FixedWeight {
    id: SubscriptionId,
    weight: AtomicU64,
    suspended: AtomicBool,
}

impl FixedWeight {
    fn new(weight: u64) -> Arc<Self> {
        Arc::new(Self {
            id: next_subscription_id(),
            weight: AtomicU64::new(weight),
            suspended: AtomicBool::new(false),
        })
    }

    fn set_weight(&self, weight: u64) {
        self.weight.store(weight, Ordering::SeqCst);
    }
}

impl Subscription for FixedWeight {
    fn id(&self) -> SubscriptionId {
        self.id
    }

    fn weight(&self) -> u64 {
        self.weight.load(Ordering::SeqCst)
    }

    fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        false
    }

    fn send(&self, _queue: &Arc<Queue>, _entry: Arc<QueueEntry>) -> Result<(), DeliveryError> {
        Ok(())
    }
}

fn message(number: u64) -> ServerMessage {
    ServerMessage::transient(StoredMessage {
        message_number: number,
        metadata: Arc::new(MessageMetaData::new("", "q", BasicProperties::default(), 1)),
        content: Bytes::from_static(b"m"),
    })
}

fn queue() -> Arc<Queue> {
    Queue::new(
        Uuid::new_v4(),
        QueueConfig::new("q"),
        None,
        Arc::new(MemoryMessageStore::new()),
    )
}

fn local(
    tag: &str,
    no_ack: bool,
    credit: &Arc<ChannelCredit>,
) -> (Arc<LocalSubscription>, mpsc::UnboundedReceiver<Delivery>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sub = Arc::new(LocalSubscription::new(tag, 1, "q", no_ack, false, Arc::clone(credit), tx));
    (sub, rx)
}

#[test]
fn test_weighted_selection() {
    let list = SubscriptionList::new();
    let c1 = FixedWeight::new(0);
    let c2 = FixedWeight::new(3);
    list.add(c1.clone());
    list.add(c2.clone());

    assert_eq!(list.next_subscriber().unwrap().id(), c1.id());

    c1.set_weight(4);
    assert_eq!(list.next_subscriber().unwrap().id(), c2.id());
}

#[test]
fn test_ties_go_to_registration_order() {
    let list = SubscriptionList::new();
    let first = FixedWeight::new(2);
    let second = FixedWeight::new(2);
    list.add(first.clone());
    list.add(second.clone());
    assert_eq!(list.next_subscriber().unwrap().id(), first.id());
}

#[test]
fn test_suspended_subscription_skipped() {
    let list = SubscriptionList::new();
    let idle = FixedWeight::new(0);
    let busy = FixedWeight::new(7);
    list.add(idle.clone());
    list.add(busy.clone());

    idle.set_suspended(true);
    assert_eq!(list.next_subscriber().unwrap().id(), busy.id());

    busy.set_suspended(true);
    assert!(list.next_subscriber().is_none());
    assert_eq!(
        list.next_subscriber_excluding(&[busy.id()]).map(|s| s.id()),
        None
    );
}

#[test]
fn test_remove_stops_selection_only() {
    let list = SubscriptionList::new();
    let sub = FixedWeight::new(0);
    list.add(sub.clone());
    assert!(list.remove(sub.id()).is_some());
    assert!(list.remove(sub.id()).is_none());
    assert!(list.is_empty());
}

#[test]
fn test_credit_window() {
    let credit = ChannelCredit::new();
    assert!(credit.try_reserve());
    credit.set_prefetch_count(2);
    assert!(credit.try_reserve());
    assert!(!credit.try_reserve());
    assert!(!credit.has_capacity());

    credit.release();
    assert!(credit.has_capacity());
    credit.release();
    credit.release();
    credit.release();
    assert_eq!(credit.unacked(), 0);
}

#[tokio::test]
async fn test_prefetch_suspends_consumer() {
    let credit = Arc::new(ChannelCredit::new());
    credit.set_prefetch_count(1);
    let (sub, mut rx) = local("ctag", false, &credit);
    let q = queue();
    q.add_subscription(sub.clone());

    q.enqueue(&message(1));
    q.enqueue(&message(2));

    let first = rx.recv().await.unwrap();
    assert_eq!(first.entry.message().message_number(), 1);
    assert!(first.ack_required);
    assert!(rx.try_recv().is_err());
    assert!(sub.is_suspended());
    assert_eq!(q.message_count(), 1);

    q.acknowledge(&first.entry).unwrap();
    sub.settle();
    q.deliver();
    let second = rx.recv().await.unwrap();
    assert_eq!(second.entry.message().message_number(), 2);
}

#[tokio::test]
async fn test_flow_pauses_delivery() {
    let credit = Arc::new(ChannelCredit::new());
    let (sub, mut rx) = local("ctag", true, &credit);
    let q = queue();
    credit.set_flow_active(false);
    q.add_subscription(sub.clone());
    q.enqueue(&message(1));
    assert!(rx.try_recv().is_err());

    credit.set_flow_active(true);
    q.deliver();
    let delivery = rx.recv().await.unwrap();
    assert!(!delivery.ack_required);
}

#[test]
fn test_dropped_receiver_closes_subscription() {
    let credit = Arc::new(ChannelCredit::new());
    let (sub, rx) = local("ctag", false, &credit);
    drop(rx);
    let q = queue();
    q.add_subscription(sub.clone());

    let entry = q.enqueue(&message(1));
    assert!(sub.is_closed());
    assert!(entry.is_available());
    assert_eq!(credit.unacked(), 0);
    assert_eq!(sub.weight(), 0);
}

#[tokio::test]
async fn test_competing_consumers_balance() {
    let credit = Arc::new(ChannelCredit::new());
    let (a, mut rx_a) = local("a", false, &credit);
    let (b, mut rx_b) = local("b", false, &credit);
    let q = queue();
    q.add_subscription(a.clone());
    q.add_subscription(b.clone());

    for n in 1..=4 {
        q.enqueue(&message(n));
    }
    let mut got_a = 0;
    while rx_a.try_recv().is_ok() {
        got_a += 1;
    }
    let mut got_b = 0;
    while rx_b.try_recv().is_ok() {
        got_b += 1;
    }
    assert_eq!((got_a, got_b), (2, 2));
    assert_eq!(a.weight(), 2);
    assert_eq!(b.weight(), 2);
}
