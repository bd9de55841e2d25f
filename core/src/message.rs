//! Messages and message references.
//!
//! A [`ServerMessage`] is immutable once published. Every queue entry and
//! every in-flight transaction action holds a [`MessageReference`]; when the
//! last reference drops, a message that reached the store is removed from it.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

use crate::protocol::{BasicProperties, FieldValue};
use crate::storage::{MessageStore, StoredMessage};

/// Priority assumed for messages published without one.
pub const DEFAULT_PRIORITY: u8 = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageMetaData {
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    /// Milliseconds since the Unix epoch.
    pub arrival_time: i64,
    pub content_size: u64,
}

impl MessageMetaData {
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        properties: BasicProperties,
        content_size: u64,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            properties,
            arrival_time: chrono::Utc::now().timestamp_millis(),
            content_size,
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.properties.is_persistent()
    }

    pub fn priority(&self) -> u8 {
        self.properties.priority.unwrap_or(DEFAULT_PRIORITY)
    }

    pub fn header(&self, name: &str) -> Option<&FieldValue> {
        self.properties.headers.as_ref()?.get(name)
    }
}

struct MessageInner {
    stored: StoredMessage,
    /// Present only when the message was written to a store.
    store: Option<Arc<dyn MessageStore>>,
    references: AtomicUsize,
    removed: AtomicBool,
}

/// Shared handle to a published message.
#[derive(Clone)]
pub struct ServerMessage {
    inner: Arc<MessageInner>,
}

impl ServerMessage {
    /// A message backed by a store entry that is removed once unreferenced.
    pub fn stored(stored: StoredMessage, store: Arc<dyn MessageStore>) -> Self {
        Self::build(stored, Some(store))
    }

    /// A message that lives in memory only.
    pub fn transient(stored: StoredMessage) -> Self {
        Self::build(stored, None)
    }

    fn build(stored: StoredMessage, store: Option<Arc<dyn MessageStore>>) -> Self {
        Self {
            inner: Arc::new(MessageInner {
                stored,
                store,
                references: AtomicUsize::new(0),
                removed: AtomicBool::new(false),
            }),
        }
    }

    pub fn message_number(&self) -> u64 {
        self.inner.stored.message_number
    }

    pub fn metadata(&self) -> &MessageMetaData {
        &self.inner.stored.metadata
    }

    pub fn content(&self) -> &Bytes {
        &self.inner.stored.content
    }

    pub fn routing_key(&self) -> &str {
        &self.metadata().routing_key
    }

    pub fn exchange(&self) -> &str {
        &self.metadata().exchange
    }

    pub fn is_persistent(&self) -> bool {
        self.metadata().is_persistent()
    }

    /// Whether the message was written to a store and can be recovered.
    pub fn is_stored(&self) -> bool {
        self.inner.store.is_some()
    }

    pub fn size(&self) -> u64 {
        self.inner.stored.content.len() as u64
    }

    pub fn stored_message(&self) -> &StoredMessage {
        &self.inner.stored
    }

    pub fn reference_count(&self) -> usize {
        self.inner.references.load(Ordering::SeqCst)
    }

    pub fn is_removed(&self) -> bool {
        self.inner.removed.load(Ordering::SeqCst)
    }

    pub fn new_reference(&self) -> MessageReference {
        self.inner.references.fetch_add(1, Ordering::SeqCst);
        MessageReference {
            message: self.clone(),
        }
    }

    /// Removes the message if routing left it with no holders.
    pub fn remove_if_unreferenced(&self) -> bool {
        if self.reference_count() == 0 {
            self.remove();
            true
        } else {
            false
        }
    }

    fn release_reference(&self) {
        if self.inner.references.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.remove();
        }
    }

    fn remove(&self) {
        if self.inner.removed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(store) = &self.inner.store {
            let message_number = self.message_number();
            match store.remove_message(message_number) {
                Ok(()) => debug!(message_id = message_number, "Removed message from store"),
                Err(e) => error!(
                    message_id = message_number,
                    error = %e,
                    "Failed to remove message from store"
                ),
            }
        }
    }
}

impl fmt::Debug for ServerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerMessage")
            .field("message_number", &self.message_number())
            .field("routing_key", &self.routing_key())
            .field("references", &self.reference_count())
            .finish()
    }
}

/// Keeps a message alive; dropping it gives the reference back.
#[derive(Debug)]
pub struct MessageReference {
    message: ServerMessage,
}

impl MessageReference {
    pub fn message(&self) -> &ServerMessage {
        &self.message
    }
}

impl Clone for MessageReference {
    fn clone(&self) -> Self {
        self.message.new_reference()
    }
}

impl Drop for MessageReference {
    fn drop(&mut self) {
        self.message.release_reference();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryMessageStore;

    fn stored_message(store: &Arc<MemoryMessageStore>) -> ServerMessage {
        let metadata = MessageMetaData::new("", "q", BasicProperties::persistent(), 3);
        let stored = store
            .add_message(metadata, Bytes::from_static(b"abc"))
            .unwrap();
        ServerMessage::stored(stored, store.clone())
    }

    #[test]
    fn last_reference_removes_from_store() {
        let store = Arc::new(MemoryMessageStore::new());
        let message = stored_message(&store);
        let number = message.message_number();

        let first = message.new_reference();
        let second = first.clone();
        assert_eq!(message.reference_count(), 2);

        drop(first);
        assert!(store.contains_message(number));
        drop(second);
        assert!(!store.contains_message(number));
        assert!(message.is_removed());
    }

    #[test]
    fn unrouted_message_is_removed() {
        let store = Arc::new(MemoryMessageStore::new());
        let message = stored_message(&store);
        assert!(message.remove_if_unreferenced());
        assert_eq!(store.message_count(), 0);

        let held = stored_message(&store);
        let _reference = held.new_reference();
        assert!(!held.remove_if_unreferenced());
    }

    #[test]
    fn priority_defaults_when_absent() {
        let metadata = MessageMetaData::new("", "q", BasicProperties::default(), 0);
        assert_eq!(metadata.priority(), DEFAULT_PRIORITY);
        let metadata = MessageMetaData::new("", "q", BasicProperties::default().with_priority(9), 0);
        assert_eq!(metadata.priority(), 9);
    }
}
