//! Queues and their entries.
//!
//! A [`Queue`] keeps its entries in an ordered map guarded by one
//! `parking_lot::Mutex`. Entry state changes are CAS operations on the entry
//! itself, so consumers racing for the same entry never need the queue lock to
//! decide a winner. Store writes for durable instances go through
//! [`Transaction`]s enlisted by the caller, or through the auto-committing
//! helpers here.

mod config;
mod entry;
mod ordering;


pub use config::{
    QueueConfig, ARG_ALTERNATE_EXCHANGE, ARG_LAST_VALUE_KEY, ARG_LEGACY_LAST_VALUE_KEY,
    ARG_MAX_DELIVERY_COUNT, ARG_PRIORITIES, ARG_SORT_KEY,
};
pub use entry::{EntryState, QueueEntry, BROKER_ACQUIRER};
pub use ordering::{priority_band, OrderingPolicy, DEFAULT_LVQ_KEY, MAX_PRIORITY_LEVELS};

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::cluster::MemberHandle;
use crate::consumer::{Subscription, SubscriptionId, SubscriptionList};
use crate::exchange::Exchange;
use crate::message::ServerMessage;
use crate::model::Deletable;
use crate::storage::{MessageStore, StoreResult, Transaction};
use ordering::EntryKey;

#[derive(Default)]
struct QueueEntries {
    ordered: BTreeMap<EntryKey, Arc<QueueEntry>>,
    /// Ordering key and last-value key of every entry in `ordered`.
    keys: HashMap<u64, (EntryKey, Option<String>)>,
    last_values: HashMap<String, Arc<QueueEntry>>,
}

impl QueueEntries {
    /// Returns the entry that previously held `last_value`, if any.
    fn insert(
        &mut self,
        key: EntryKey,
        last_value: Option<String>,
        entry: Arc<QueueEntry>,
    ) -> Option<Arc<QueueEntry>> {
        let previous = last_value
            .as_ref()
            .and_then(|lv| self.last_values.insert(lv.clone(), Arc::clone(&entry)));
        self.keys.insert(entry.entry_id(), (key.clone(), last_value));
        self.ordered.insert(key, entry);
        previous
    }

    fn remove(&mut self, entry_id: u64) -> Option<Arc<QueueEntry>> {
        let (key, last_value) = self.keys.remove(&entry_id)?;
        if let Some(lv) = last_value {
            // A newer entry may already hold the key.
            if self
                .last_values
                .get(&lv)
                .is_some_and(|current| current.entry_id() == entry_id)
            {
                self.last_values.remove(&lv);
            }
        }
        self.ordered.remove(&key)
    }

    #[cfg(test)]
    fn last_value_count(&self) -> usize {
        self.last_values.len()
    }

    fn first_available(&self) -> Option<Arc<QueueEntry>> {
        self.ordered.values().find(|e| e.is_available()).cloned()
    }
}

/// Counters kept by every queue.
#[derive(Debug, Default)]
pub struct QueueStatistics {
    pub enqueued: AtomicU64,
    pub dequeued: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub discarded: AtomicU64,
}

/// What happened to an entry that exhausted its delivery attempts or was
/// rejected without requeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterOutcome {
    /// Routed to this many queues through the alternate exchange.
    Routed(usize),
    /// No alternate route; the entry was dropped.
    Discarded,
    /// The entry was no longer acquired.
    Skipped,
}

pub struct Queue {
    id: Uuid,
    config: QueueConfig,
    /// Connection that owns an exclusive queue.
    owner: Option<u64>,
    entries: Mutex<QueueEntries>,
    subscriptions: SubscriptionList,
    next_entry_id: AtomicU64,
    store: Arc<dyn MessageStore>,
    alternate_exchange: RwLock<Option<Weak<Exchange>>>,
    had_consumers: AtomicBool,
    deleted: AtomicBool,
    stats: QueueStatistics,
}

impl Queue {
    pub fn new(
        id: Uuid,
        config: QueueConfig,
        owner: Option<u64>,
        store: Arc<dyn MessageStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            config,
            owner,
            entries: Mutex::new(QueueEntries::default()),
            subscriptions: SubscriptionList::new(),
            next_entry_id: AtomicU64::new(1),
            store,
            alternate_exchange: RwLock::new(None),
            had_consumers: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
            stats: QueueStatistics::default(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn is_durable(&self) -> bool {
        self.config.durable
    }

    pub fn is_exclusive(&self) -> bool {
        self.config.exclusive
    }

    pub fn owner(&self) -> Option<u64> {
        self.owner
    }

    /// Whether `connection_id` may use this queue.
    pub fn is_accessible_by(&self, connection_id: u64) -> bool {
        match self.owner {
            Some(owner) if self.config.exclusive => owner == connection_id,
            _ => true,
        }
    }

    pub fn statistics(&self) -> &QueueStatistics {
        &self.stats
    }

    pub fn set_alternate_exchange(&self, exchange: Option<&Arc<Exchange>>) {
        *self.alternate_exchange.write() = exchange.map(Arc::downgrade);
    }

    pub fn alternate_exchange(&self) -> Option<Arc<Exchange>> {
        self.alternate_exchange.read().as_ref().and_then(Weak::upgrade)
    }

    /// Whether instances of `message` on this queue are written to the store.
    pub fn is_durable_instance(&self, message: &ServerMessage) -> bool {
        self.config.durable && message.is_persistent() && message.is_stored()
    }

    pub fn enlist_enqueue(&self, txn: &mut dyn Transaction, message: &ServerMessage) {
        if self.is_durable_instance(message) {
            txn.enqueue_message(self.id, message.message_number());
        }
    }

    pub fn enlist_dequeue(&self, txn: &mut dyn Transaction, entry: &QueueEntry) {
        if self.is_durable_instance(entry.message()) {
            txn.dequeue_message(self.id, entry.message().message_number());
        }
    }

    /// Adds `message` to the queue in memory and tries to deliver it. The
    /// enqueue record, if any, is the caller's to write.
    pub fn enqueue(self: &Arc<Self>, message: &ServerMessage) -> Arc<QueueEntry> {
        let entry_id = self.next_entry_id.fetch_add(1, Ordering::SeqCst);
        let entry = Arc::new(QueueEntry::new(entry_id, message.new_reference()));
        let key = self.config.ordering.key_for(message, entry_id);
        let last_value = self.config.ordering.last_value_key(message);
        let replaced = {
            let mut entries = self.entries.lock();
            let replaced = entries
                .insert(key, last_value, Arc::clone(&entry))
                .and_then(|old| old.dequeue_available().map(|r| (old, r)));
            if let Some((old, _)) = &replaced {
                entries.remove(old.entry_id());
            }
            replaced
        };
        self.stats.enqueued.fetch_add(1, Ordering::Relaxed);

        if let Some((old, reference)) = replaced {
            debug!(
                queue = %self.name(),
                message_id = old.message().message_number(),
                "Replaced last-value entry"
            );
            self.commit_dequeues(std::slice::from_ref(&old));
            self.stats.dequeued.fetch_add(1, Ordering::Relaxed);
            drop(reference);
        }

        self.deliver();
        entry
    }

    /// Hands available entries to subscribers until either runs out.
    pub fn deliver(self: &Arc<Self>) {
        let mut failed: Vec<SubscriptionId> = Vec::new();
        loop {
            if self.is_deleted() {
                return;
            }
            let Some(subscription) = self.subscriptions.next_subscriber_excluding(&failed) else {
                return;
            };
            let Some(entry) = self.entries.lock().first_available() else {
                return;
            };
            if !entry.acquire(subscription.id()) {
                continue;
            }
            entry.mark_delivered();
            if let Err(e) = subscription.send(self, Arc::clone(&entry)) {
                debug!(
                    queue = %self.name(),
                    subscription = subscription.id(),
                    error = %e,
                    "Delivery failed, releasing entry"
                );
                entry.release_undelivered();
                failed.push(subscription.id());
                if subscription.is_closed() {
                    self.subscriptions.remove(subscription.id());
                }
            }
        }
    }

    /// Acquires the head entry for a pull (basic.get).
    pub fn acquire_next(&self, acquirer: SubscriptionId) -> Option<Arc<QueueEntry>> {
        loop {
            let entry = self.entries.lock().first_available()?;
            if entry.acquire(acquirer) {
                entry.mark_delivered();
                return Some(entry);
            }
        }
    }

    /// Acquired → Dequeued with an auto-committed store dequeue.
    pub fn acknowledge(&self, entry: &Arc<QueueEntry>) -> StoreResult<bool> {
        if !entry.is_acquired() {
            return Ok(false);
        }
        let mut txn = self.store.new_transaction();
        self.enlist_dequeue(txn.as_mut(), entry);
        txn.commit_tran()?;
        Ok(self.complete_dequeue(entry))
    }

    /// In-memory half of a dequeue whose store record is already committed.
    pub fn complete_dequeue(&self, entry: &Arc<QueueEntry>) -> bool {
        let Some(reference) = entry.dequeue_acquired() else {
            return false;
        };
        self.entries.lock().remove(entry.entry_id());
        self.stats.dequeued.fetch_add(1, Ordering::Relaxed);
        drop(reference);
        true
    }

    /// Gives an acquired entry back. Once the entry has used up the queue's
    /// delivery attempts it is dead-lettered instead.
    pub fn release(self: &Arc<Self>, entry: &Arc<QueueEntry>) -> bool {
        let max = self.config.max_delivery_count;
        if max > 0 && entry.delivery_count() >= max {
            return self.dead_letter(entry) != DeadLetterOutcome::Skipped;
        }
        let released = entry.release();
        if released {
            self.deliver();
        }
        released
    }

    pub fn reject(self: &Arc<Self>, entry: &Arc<QueueEntry>, requeue: bool) -> bool {
        if requeue {
            self.release(entry)
        } else {
            self.dead_letter(entry) != DeadLetterOutcome::Skipped
        }
    }

    /// Routes an acquired entry through the alternate exchange, or drops it
    /// when there is no route.
    pub fn dead_letter(self: &Arc<Self>, entry: &Arc<QueueEntry>) -> DeadLetterOutcome {
        if !entry.is_acquired() {
            return DeadLetterOutcome::Skipped;
        }
        let message = entry.message().clone();
        let mut targets = self
            .alternate_exchange()
            .map(|exchange| exchange.route_with_alternates(message.metadata()))
            .unwrap_or_default();
        targets.retain(|q| !Arc::ptr_eq(q, self) && !q.is_deleted());

        let mut txn = self.store.new_transaction();
        for queue in &targets {
            queue.enlist_enqueue(txn.as_mut(), &message);
        }
        self.enlist_dequeue(txn.as_mut(), entry);
        if let Err(e) = txn.commit_tran() {
            error!(
                queue = %self.name(),
                message_id = message.message_number(),
                error = %e,
                "Failed to commit dead-letter transfer"
            );
            entry.release();
            return DeadLetterOutcome::Skipped;
        }

        for queue in &targets {
            queue.enqueue(&message);
        }
        self.complete_dequeue(entry);

        if targets.is_empty() {
            warn!(
                queue = %self.name(),
                message_id = message.message_number(),
                delivery_count = entry.delivery_count(),
                "Discarding message with no alternate route"
            );
            self.stats.discarded.fetch_add(1, Ordering::Relaxed);
            DeadLetterOutcome::Discarded
        } else {
            debug!(
                queue = %self.name(),
                message_id = message.message_number(),
                targets = targets.len(),
                "Dead-lettered message"
            );
            self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
            DeadLetterOutcome::Routed(targets.len())
        }
    }

    /// Removes every available entry and returns how many were removed.
    pub fn purge(&self) -> StoreResult<u32> {
        let (removed, references) = {
            let mut entries = self.entries.lock();
            let mut removed = Vec::new();
            let mut references = Vec::new();
            let candidates: Vec<Arc<QueueEntry>> = entries.ordered.values().cloned().collect();
            for entry in candidates {
                if let Some(reference) = entry.dequeue_available() {
                    entries.remove(entry.entry_id());
                    removed.push(entry);
                    references.push(reference);
                }
            }
            (removed, references)
        };
        self.store_dequeues(&removed)?;
        self.stats
            .dequeued
            .fetch_add(removed.len() as u64, Ordering::Relaxed);
        drop(references);
        debug!(queue = %self.name(), count = removed.len(), "Purged queue");
        Ok(removed.len() as u32)
    }

    /// Marks the queue deleted, drops every entry and detaches subscribers.
    /// Returns the number of messages that were on the queue.
    pub fn delete(&self) -> StoreResult<u32> {
        if !self.mark_deleted() {
            return Ok(0);
        }
        let (removed, references) = {
            let mut entries = self.entries.lock();
            let taken = std::mem::take(&mut *entries);
            let mut removed = Vec::new();
            let mut references = Vec::new();
            for entry in taken.ordered.into_values() {
                if let Some(reference) = entry.force_dequeue() {
                    removed.push(entry);
                    references.push(reference);
                }
            }
            (removed, references)
        };
        let stored = self.store_dequeues(&removed);

        for subscription in self.subscriptions.snapshot() {
            subscription.queue_deleted(self);
        }
        self.subscriptions.clear();
        drop(references);
        stored?;
        debug!(queue = %self.name(), messages = removed.len(), "Deleted queue");
        Ok(removed.len() as u32)
    }

    fn store_dequeues(&self, entries: &[Arc<QueueEntry>]) -> StoreResult<()> {
        if !entries.iter().any(|e| self.is_durable_instance(e.message())) {
            return Ok(());
        }
        let mut txn = self.store.new_transaction();
        for entry in entries {
            self.enlist_dequeue(txn.as_mut(), entry);
        }
        txn.commit_tran()
    }

    fn commit_dequeues(&self, entries: &[Arc<QueueEntry>]) {
        if let Err(e) = self.store_dequeues(entries) {
            error!(queue = %self.name(), error = %e, "Failed to record dequeue");
        }
    }

    /// Finds the live entry carrying `message_number`.
    pub fn get_message_on_the_queue(&self, message_number: u64) -> Option<Arc<QueueEntry>> {
        self.entries
            .lock()
            .ordered
            .values()
            .find(|e| e.message().message_number() == message_number && !e.is_dequeued())
            .cloned()
    }

    /// Live entries in delivery order.
    pub fn entries(&self) -> Vec<Arc<QueueEntry>> {
        self.entries
            .lock()
            .ordered
            .values()
            .filter(|e| !e.is_dequeued())
            .cloned()
            .collect()
    }

    /// Messages waiting for a consumer.
    pub fn message_count(&self) -> u32 {
        self.entries
            .lock()
            .ordered
            .values()
            .filter(|e| e.is_available())
            .count() as u32
    }

    /// Available plus acquired-unacknowledged entries.
    pub fn entry_count(&self) -> u32 {
        self.entries.lock().ordered.len() as u32
    }

    pub fn consumer_count(&self) -> u32 {
        self.subscriptions.len() as u32
    }

    pub fn subscriptions(&self) -> &SubscriptionList {
        &self.subscriptions
    }

    pub fn add_subscription(self: &Arc<Self>, subscription: Arc<dyn Subscription>) {
        debug!(
            queue = %self.name(),
            subscription = subscription.id(),
            "Subscription added"
        );
        self.subscriptions.add(subscription);
        self.had_consumers.store(true, Ordering::SeqCst);
        self.deliver();
    }

    /// Stops future selection of the subscription. Entries it holds stay
    /// acquired until settled.
    pub fn remove_subscription(&self, id: SubscriptionId) -> Option<Arc<dyn Subscription>> {
        self.subscriptions.remove(id)
    }

    /// Detaches every subscription forwarding to `peer`.
    pub fn remove_remote_subscriptions(&self, peer: &MemberHandle) -> usize {
        self.subscriptions
            .remove_where(|s| s.peer() == Some(peer))
            .len()
    }

    /// Detaches remote subscriptions whose peer holds nothing outstanding.
    pub fn prune_orphaned_subscriptions(&self) -> usize {
        self.subscriptions.remove_where(|s| s.is_orphaned()).len()
    }

    pub fn has_ready_consumer(&self) -> bool {
        self.subscriptions.next_subscriber().is_some()
    }

    /// An auto-delete queue goes once the last consumer leaves.
    pub fn should_auto_delete(&self) -> bool {
        self.config.auto_delete
            && self.had_consumers.load(Ordering::SeqCst)
            && self.subscriptions.is_empty()
    }
}

impl Deletable for Queue {
    fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    fn mark_deleted(&self) -> bool {
        !self.deleted.swap(true, Ordering::SeqCst)
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("id", &self.id)
            .field("name", &self.config.name)
            .field("durable", &self.config.durable)
            .field("ordering", &self.config.ordering)
            .finish()
    }
}
