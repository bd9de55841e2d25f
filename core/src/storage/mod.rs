//! # FluxQ Storage Module
//!
//! Persistence contracts for messages, queue entries, distributed-transaction
//! branches and durable configuration, plus two implementations:
//!
//! - [`memory::MemoryMessageStore`]: keeps everything in process memory
//! - [`journal::JournalMessageStore`]: a JSON-lines append log replayed on open
//!
//! Stores only hold what callers hand them. Deciding which messages are
//! persistent and which queues are durable is the broker's job.

pub mod journal;
pub mod memory;

#[cfg(test)]
mod tests;

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use uuid::Uuid;

use crate::exchange::ExchangeConfig;
use crate::message::MessageMetaData;
use crate::model::EntityCategory;
use crate::protocol::{FieldTable, Xid};
use crate::queue::QueueConfig;

pub use journal::JournalMessageStore;
pub use memory::MemoryMessageStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store is not open")]
    NotOpen,

    #[error("configured object {0} already exists")]
    DuplicateId(Uuid),

    #[error("configured object {id} is a {actual}, not a {expected}")]
    TypeMismatch {
        id: Uuid,
        expected: EntityCategory,
        actual: EntityCategory,
    },

    #[error("configured object {0} does not exist")]
    UnknownObject(Uuid),

    #[error("background commit failed: {0}")]
    Commit(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A message as the store sees it: number, metadata and content.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message_number: u64,
    pub metadata: Arc<MessageMetaData>,
    pub content: Bytes,
}

/// A queue entry reference: which message sits on which queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Record {
    pub queue_id: Uuid,
    pub message_number: u64,
}

impl Record {
    pub fn new(queue_id: Uuid, message_number: u64) -> Self {
        Self {
            queue_id,
            message_number,
        }
    }
}

/// A prepared distributed-transaction branch with its buffered work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DtxRecord {
    pub xid: Xid,
    pub enqueues: Vec<Record>,
    pub dequeues: Vec<Record>,
}

/// One mutation inside a store transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoreOp {
    Enqueue(Record),
    Dequeue(Record),
    RecordXid(DtxRecord),
    RemoveXid(Xid),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Directory for file-backed stores.
    pub path: Option<PathBuf>,
    /// Sync the journal to disk on every commit.
    pub fsync_on_commit: bool,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: None,
            fsync_on_commit: true,
        }
    }
}

/// Completion of an asynchronous store commit.
///
/// Stores that finish synchronously hand back an already-resolved future.
pub struct StoreFuture {
    inner: BoxFuture<'static, StoreResult<()>>,
}

impl StoreFuture {
    pub fn ready(result: StoreResult<()>) -> Self {
        Self {
            inner: Box::pin(futures::future::ready(result)),
        }
    }

    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = StoreResult<()>> + Send + 'static,
    {
        Self {
            inner: Box::pin(future),
        }
    }
}

impl Future for StoreFuture {
    type Output = StoreResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

impl fmt::Debug for StoreFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreFuture").finish_non_exhaustive()
    }
}

/// A batch of store mutations applied atomically on commit.
pub trait Transaction: Send {
    fn enqueue_message(&mut self, queue_id: Uuid, message_number: u64);

    fn dequeue_message(&mut self, queue_id: Uuid, message_number: u64);

    fn record_xid(&mut self, xid: &Xid, enqueues: &[Record], dequeues: &[Record]);

    fn remove_xid(&mut self, xid: &Xid);

    /// Applies every buffered operation and returns once it is durable.
    fn commit_tran(self: Box<Self>) -> StoreResult<()>;

    /// Applies every buffered operation; the future resolves once durable.
    fn commit_tran_async(self: Box<Self>) -> StoreFuture;

    fn abort_tran(self: Box<Self>);
}

pub trait MessageStore: Send + Sync + fmt::Debug {
    fn open_store(&self, parent: &str, settings: &StoreSettings) -> StoreResult<()>;

    /// Persists a new message and assigns its number.
    fn add_message(&self, metadata: MessageMetaData, content: Bytes)
        -> StoreResult<StoredMessage>;

    /// Allocates a number for a message that is never written to the store.
    fn next_message_number(&self) -> u64;

    fn remove_message(&self, message_number: u64) -> StoreResult<()>;

    fn new_transaction(&self) -> Box<dyn Transaction>;

    /// Visits stored messages in number order until the handler returns `false`.
    fn visit_messages(&self, handler: &mut dyn FnMut(StoredMessage) -> bool) -> StoreResult<()>;

    fn visit_message_instances(&self, handler: &mut dyn FnMut(Record) -> bool) -> StoreResult<()>;

    fn visit_distributed_transactions(
        &self,
        handler: &mut dyn FnMut(DtxRecord) -> bool,
    ) -> StoreResult<()>;

    fn close_store(&self) -> StoreResult<()>;

    /// Discards all persisted state, e.g. when the owning virtual host is deleted.
    fn on_delete(&self) -> StoreResult<()>;
}

/// A durable exchange, queue or binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConfiguredObjectRecord {
    Exchange {
        id: Uuid,
        config: ExchangeConfig,
    },
    Queue {
        id: Uuid,
        config: QueueConfig,
    },
    Binding {
        id: Uuid,
        exchange: String,
        queue: String,
        binding_key: String,
        arguments: FieldTable,
    },
}

impl ConfiguredObjectRecord {
    pub fn id(&self) -> Uuid {
        match self {
            Self::Exchange { id, .. } | Self::Queue { id, .. } | Self::Binding { id, .. } => *id,
        }
    }

    pub fn category(&self) -> EntityCategory {
        match self {
            Self::Exchange { .. } => EntityCategory::Exchange,
            Self::Queue { .. } => EntityCategory::Queue,
            Self::Binding { .. } => EntityCategory::Binding,
        }
    }
}

pub trait DurableConfigurationStore: Send + Sync + fmt::Debug {
    fn create(&self, record: ConfiguredObjectRecord) -> StoreResult<()>;

    /// Replaces an existing record of the same category.
    fn update(&self, record: ConfiguredObjectRecord) -> StoreResult<()>;

    fn remove(&self, id: Uuid) -> StoreResult<()>;

    /// Visits records in creation order until the handler returns `false`.
    fn visit_configured_objects(
        &self,
        handler: &mut dyn FnMut(ConfiguredObjectRecord) -> bool,
    ) -> StoreResult<()>;
}

/// Both halves of persistence behind one object.
pub trait BrokerStore: MessageStore + DurableConfigurationStore {}

impl<T: MessageStore + DurableConfigurationStore> BrokerStore for T {}
