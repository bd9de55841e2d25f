use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::consumer::SubscriptionId;
use crate::message::{MessageReference, ServerMessage};

/// Acquirer id used for broker-initiated acquisitions (basic.get, recovery).
pub const BROKER_ACQUIRER: SubscriptionId = u64::MAX;

const NO_ACQUIRER: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryState {
    Available = 0,
    Acquired = 1,
    Dequeued = 2,
}

impl EntryState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Available,
            1 => Self::Acquired,
            _ => Self::Dequeued,
        }
    }
}

/// One instance of a message on one queue.
pub struct QueueEntry {
    entry_id: u64,
    message: ServerMessage,
    reference: Mutex<Option<MessageReference>>,
    state: AtomicU8,
    acquired_by: AtomicU64,
    delivery_count: AtomicU32,
    redelivered: AtomicBool,
}

impl QueueEntry {
    pub(crate) fn new(entry_id: u64, reference: MessageReference) -> Self {
        Self {
            entry_id,
            message: reference.message().clone(),
            reference: Mutex::new(Some(reference)),
            state: AtomicU8::new(EntryState::Available as u8),
            acquired_by: AtomicU64::new(NO_ACQUIRER),
            delivery_count: AtomicU32::new(0),
            redelivered: AtomicBool::new(false),
        }
    }

    pub fn entry_id(&self) -> u64 {
        self.entry_id
    }

    pub fn message(&self) -> &ServerMessage {
        &self.message
    }

    pub fn state(&self) -> EntryState {
        EntryState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_available(&self) -> bool {
        self.state() == EntryState::Available
    }

    pub fn is_acquired(&self) -> bool {
        self.state() == EntryState::Acquired
    }

    pub fn is_dequeued(&self) -> bool {
        self.state() == EntryState::Dequeued
    }

    /// Available → Acquired. Exactly one concurrent caller succeeds.
    pub fn acquire(&self, subscriber: SubscriptionId) -> bool {
        let won = self
            .state
            .compare_exchange(
                EntryState::Available as u8,
                EntryState::Acquired as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if won {
            self.acquired_by.store(subscriber, Ordering::SeqCst);
        }
        won
    }

    pub fn acquired_by(&self) -> Option<SubscriptionId> {
        match self.acquired_by.load(Ordering::SeqCst) {
            NO_ACQUIRER => None,
            id if self.is_acquired() => Some(id),
            _ => None,
        }
    }

    pub fn is_acquired_by(&self, subscriber: SubscriptionId) -> bool {
        self.acquired_by() == Some(subscriber)
    }

    /// Acquired → Available after a delivery; the entry is flagged redelivered.
    pub(crate) fn release(&self) -> bool {
        self.acquired_by.store(NO_ACQUIRER, Ordering::SeqCst);
        let released = self.transition(EntryState::Acquired, EntryState::Available);
        if released {
            self.redelivered.store(true, Ordering::SeqCst);
        }
        released
    }

    /// Acquired → Available for an entry that never reached its consumer.
    pub(crate) fn release_undelivered(&self) -> bool {
        self.acquired_by.store(NO_ACQUIRER, Ordering::SeqCst);
        let released = self.transition(EntryState::Acquired, EntryState::Available);
        if released {
            let _ = self
                .delivery_count
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_sub(1));
        }
        released
    }

    /// Acquired → Dequeued. The returned reference is dropped by the caller
    /// once the store no longer records the instance.
    pub(crate) fn dequeue_acquired(&self) -> Option<MessageReference> {
        self.transition(EntryState::Acquired, EntryState::Dequeued)
            .then(|| self.take_reference())
            .flatten()
    }

    /// Available → Dequeued, used when a last-value entry is replaced.
    pub(crate) fn dequeue_available(&self) -> Option<MessageReference> {
        self.transition(EntryState::Available, EntryState::Dequeued)
            .then(|| self.take_reference())
            .flatten()
    }

    /// Any state → Dequeued, used by queue deletion.
    pub(crate) fn force_dequeue(&self) -> Option<MessageReference> {
        let previous = self.state.swap(EntryState::Dequeued as u8, Ordering::SeqCst);
        (previous != EntryState::Dequeued as u8)
            .then(|| self.take_reference())
            .flatten()
    }

    /// Records a delivery attempt and returns the new count.
    pub(crate) fn mark_delivered(&self) -> u32 {
        self.delivery_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn delivery_count(&self) -> u32 {
        self.delivery_count.load(Ordering::SeqCst)
    }

    pub fn is_redelivered(&self) -> bool {
        self.redelivered.load(Ordering::SeqCst)
    }

    fn transition(&self, from: EntryState, to: EntryState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn take_reference(&self) -> Option<MessageReference> {
        self.reference.lock().take()
    }
}

impl fmt::Debug for QueueEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueEntry")
            .field("entry_id", &self.entry_id)
            .field("message_number", &self.message.message_number())
            .field("state", &self.state())
            .field("delivery_count", &self.delivery_count())
            .finish()
    }
}
