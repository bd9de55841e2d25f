//! In-process store. Contents live as long as the store object does, which lets
//! a virtual host be torn down and rebuilt over the same store.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::{
    ConfiguredObjectRecord, DtxRecord, DurableConfigurationStore, MessageStore, Record,
    StoreError, StoreFuture, StoreOp, StoreResult, StoreSettings, StoredMessage, Transaction,
};
use crate::message::MessageMetaData;
use crate::protocol::Xid;

/// Materialized store contents, shared by the memory and journal stores.
#[derive(Debug, Default)]
pub(crate) struct StoreState {
    pub messages: BTreeMap<u64, StoredMessage>,
    pub instances: BTreeSet<Record>,
    pub xids: Vec<DtxRecord>,
    pub configured: Vec<ConfiguredObjectRecord>,
}

impl StoreState {
    pub fn apply(&mut self, op: StoreOp) {
        match op {
            StoreOp::Enqueue(record) => {
                self.instances.insert(record);
            }
            StoreOp::Dequeue(record) => {
                self.instances.remove(&record);
            }
            StoreOp::RecordXid(record) => {
                self.xids.retain(|r| r.xid != record.xid);
                self.xids.push(record);
            }
            StoreOp::RemoveXid(xid) => self.xids.retain(|r| r.xid != xid),
        }
    }

    pub fn check_create(&self, record: &ConfiguredObjectRecord) -> StoreResult<()> {
        if self.configured.iter().any(|r| r.id() == record.id()) {
            return Err(StoreError::DuplicateId(record.id()));
        }
        Ok(())
    }

    pub fn check_update(&self, record: &ConfiguredObjectRecord) -> StoreResult<()> {
        let existing = self
            .configured
            .iter()
            .find(|r| r.id() == record.id())
            .ok_or(StoreError::UnknownObject(record.id()))?;
        if existing.category() != record.category() {
            return Err(StoreError::TypeMismatch {
                id: record.id(),
                expected: existing.category(),
                actual: record.category(),
            });
        }
        Ok(())
    }

    pub fn put_configured(&mut self, record: ConfiguredObjectRecord) {
        match self.configured.iter_mut().find(|r| r.id() == record.id()) {
            Some(slot) => *slot = record,
            None => self.configured.push(record),
        }
    }

    pub fn remove_configured(&mut self, id: Uuid) -> bool {
        let before = self.configured.len();
        self.configured.retain(|r| r.id() != id);
        self.configured.len() != before
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Buffers operations until commit; shared by both store implementations.
pub(crate) fn push_xid(ops: &mut Vec<StoreOp>, xid: &Xid, enqueues: &[Record], dequeues: &[Record]) {
    ops.push(StoreOp::RecordXid(DtxRecord {
        xid: xid.clone(),
        enqueues: enqueues.to_vec(),
        dequeues: dequeues.to_vec(),
    }));
}

#[derive(Debug)]
pub struct MemoryMessageStore {
    state: Arc<RwLock<StoreState>>,
    next_message_number: AtomicU64,
    open: AtomicBool,
}

impl Default for MemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(StoreState::default())),
            next_message_number: AtomicU64::new(1),
            open: AtomicBool::new(false),
        }
    }

    /// Places a message under a caller-chosen number, e.g. when importing
    /// the contents of another store.
    pub fn restore_message(&self, message: StoredMessage) {
        self.next_message_number
            .fetch_max(message.message_number + 1, Ordering::SeqCst);
        self.state
            .write()
            .messages
            .insert(message.message_number, message);
    }

    pub fn message_count(&self) -> usize {
        self.state.read().messages.len()
    }

    pub fn contains_message(&self, message_number: u64) -> bool {
        self.state.read().messages.contains_key(&message_number)
    }

    pub fn instance_count(&self) -> usize {
        self.state.read().instances.len()
    }
}

impl MessageStore for MemoryMessageStore {
    fn open_store(&self, parent: &str, _settings: &StoreSettings) -> StoreResult<()> {
        self.open.store(true, Ordering::SeqCst);
        debug!(virtual_host = parent, "Memory store opened");
        Ok(())
    }

    fn add_message(
        &self,
        metadata: MessageMetaData,
        content: Bytes,
    ) -> StoreResult<StoredMessage> {
        let message = StoredMessage {
            message_number: self.next_message_number(),
            metadata: Arc::new(metadata),
            content,
        };
        self.state
            .write()
            .messages
            .insert(message.message_number, message.clone());
        Ok(message)
    }

    fn next_message_number(&self) -> u64 {
        self.next_message_number.fetch_add(1, Ordering::SeqCst)
    }

    fn remove_message(&self, message_number: u64) -> StoreResult<()> {
        self.state.write().messages.remove(&message_number);
        Ok(())
    }

    fn new_transaction(&self) -> Box<dyn Transaction> {
        Box::new(MemoryTransaction {
            state: Arc::clone(&self.state),
            ops: Vec::new(),
        })
    }

    fn visit_messages(&self, handler: &mut dyn FnMut(StoredMessage) -> bool) -> StoreResult<()> {
        let messages: Vec<StoredMessage> = self.state.read().messages.values().cloned().collect();
        for message in messages {
            if !handler(message) {
                break;
            }
        }
        Ok(())
    }

    fn visit_message_instances(&self, handler: &mut dyn FnMut(Record) -> bool) -> StoreResult<()> {
        let instances: Vec<Record> = self.state.read().instances.iter().copied().collect();
        for record in instances {
            if !handler(record) {
                break;
            }
        }
        Ok(())
    }

    fn visit_distributed_transactions(
        &self,
        handler: &mut dyn FnMut(DtxRecord) -> bool,
    ) -> StoreResult<()> {
        let xids = self.state.read().xids.clone();
        for record in xids {
            if !handler(record) {
                break;
            }
        }
        Ok(())
    }

    fn close_store(&self) -> StoreResult<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn on_delete(&self) -> StoreResult<()> {
        self.state.write().clear();
        Ok(())
    }
}

impl DurableConfigurationStore for MemoryMessageStore {
    fn create(&self, record: ConfiguredObjectRecord) -> StoreResult<()> {
        let mut state = self.state.write();
        state.check_create(&record)?;
        state.put_configured(record);
        Ok(())
    }

    fn update(&self, record: ConfiguredObjectRecord) -> StoreResult<()> {
        let mut state = self.state.write();
        state.check_update(&record)?;
        state.put_configured(record);
        Ok(())
    }

    fn remove(&self, id: Uuid) -> StoreResult<()> {
        self.state.write().remove_configured(id);
        Ok(())
    }

    fn visit_configured_objects(
        &self,
        handler: &mut dyn FnMut(ConfiguredObjectRecord) -> bool,
    ) -> StoreResult<()> {
        let records = self.state.read().configured.clone();
        for record in records {
            if !handler(record) {
                break;
            }
        }
        Ok(())
    }
}

struct MemoryTransaction {
    state: Arc<RwLock<StoreState>>,
    ops: Vec<StoreOp>,
}

impl Transaction for MemoryTransaction {
    fn enqueue_message(&mut self, queue_id: Uuid, message_number: u64) {
        self.ops
            .push(StoreOp::Enqueue(Record::new(queue_id, message_number)));
    }

    fn dequeue_message(&mut self, queue_id: Uuid, message_number: u64) {
        self.ops
            .push(StoreOp::Dequeue(Record::new(queue_id, message_number)));
    }

    fn record_xid(&mut self, xid: &Xid, enqueues: &[Record], dequeues: &[Record]) {
        push_xid(&mut self.ops, xid, enqueues, dequeues);
    }

    fn remove_xid(&mut self, xid: &Xid) {
        self.ops.push(StoreOp::RemoveXid(xid.clone()));
    }

    fn commit_tran(self: Box<Self>) -> StoreResult<()> {
        let MemoryTransaction { state, ops } = *self;
        let mut state = state.write();
        for op in ops {
            state.apply(op);
        }
        Ok(())
    }

    fn commit_tran_async(self: Box<Self>) -> StoreFuture {
        StoreFuture::ready(self.commit_tran())
    }

    fn abort_tran(self: Box<Self>) {}
}
