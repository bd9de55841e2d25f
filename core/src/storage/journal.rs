//! Journal store: an append-only JSON-lines log.
//!
//! Every mutation is one line holding a sequence number and an entry. A store
//! transaction is written as a single `Commit` line, so a torn write at the
//! tail loses the whole transaction rather than part of it. Opening the store
//! replays the log into memory; unparseable lines are logged and skipped.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::memory::{push_xid, StoreState};
use super::{
    ConfiguredObjectRecord, DtxRecord, DurableConfigurationStore, MessageStore, Record,
    StoreError, StoreFuture, StoreOp, StoreResult, StoreSettings, StoredMessage, Transaction,
};
use crate::message::MessageMetaData;
use crate::protocol::Xid;

const JOURNAL_FILE: &str = "store.journal";

#[derive(Debug, Clone, Serialize, Deserialize)]
enum JournalEntry {
    AddMessage {
        message_number: u64,
        metadata: MessageMetaData,
        content: Bytes,
    },
    RemoveMessage {
        message_number: u64,
    },
    Commit {
        ops: Vec<StoreOp>,
    },
    CreateObject {
        record: ConfiguredObjectRecord,
    },
    UpdateObject {
        record: ConfiguredObjectRecord,
    },
    RemoveObject {
        id: Uuid,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct LogRecord {
    sequence_number: u64,
    timestamp: i64,
    entry: JournalEntry,
}

#[derive(Debug)]
struct JournalInner {
    state: RwLock<StoreState>,
    file: Mutex<Option<File>>,
    path: Mutex<Option<PathBuf>>,
    next_sequence_number: AtomicU64,
    next_message_number: AtomicU64,
    fsync_on_commit: AtomicBool,
}

impl JournalInner {
    /// Appends entries with a single write; syncing is left to the caller.
    fn append(&self, entries: Vec<JournalEntry>) -> StoreResult<()> {
        let mut buf = Vec::new();
        for entry in entries {
            let record = LogRecord {
                sequence_number: self.next_sequence_number.fetch_add(1, Ordering::SeqCst),
                timestamp: chrono::Utc::now().timestamp_millis(),
                entry,
            };
            serde_json::to_writer(&mut buf, &record)?;
            buf.push(b'\n');
        }
        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or(StoreError::NotOpen)?;
        file.write_all(&buf)?;
        Ok(())
    }

    fn sync(&self) -> StoreResult<()> {
        let guard = self.file.lock();
        let file = guard.as_ref().ok_or(StoreError::NotOpen)?;
        file.sync_data()?;
        Ok(())
    }

    fn sync_handle(&self) -> StoreResult<File> {
        let guard = self.file.lock();
        let file = guard.as_ref().ok_or(StoreError::NotOpen)?;
        Ok(file.try_clone()?)
    }

    fn commit(&self, ops: Vec<StoreOp>) -> StoreResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        self.append(vec![JournalEntry::Commit { ops: ops.clone() }])?;
        let mut state = self.state.write();
        for op in ops {
            state.apply(op);
        }
        Ok(())
    }

    fn replay(&self, path: &Path) -> StoreResult<usize> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut state = self.state.write();
        let mut replayed = 0;
        let mut last_sequence = None;
        let mut max_message_number = 0;

        for (line_number, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: LogRecord = match serde_json::from_str(&line) {
                Ok(record) => record,
                Err(e) => {
                    warn!(
                        line = line_number + 1,
                        error = %e,
                        "Skipping unreadable journal record"
                    );
                    continue;
                }
            };
            last_sequence = Some(record.sequence_number);
            match record.entry {
                JournalEntry::AddMessage {
                    message_number,
                    metadata,
                    content,
                } => {
                    max_message_number = max_message_number.max(message_number);
                    state.messages.insert(
                        message_number,
                        StoredMessage {
                            message_number,
                            metadata: Arc::new(metadata),
                            content,
                        },
                    );
                }
                JournalEntry::RemoveMessage { message_number } => {
                    max_message_number = max_message_number.max(message_number);
                    state.messages.remove(&message_number);
                }
                JournalEntry::Commit { ops } => {
                    for op in ops {
                        state.apply(op);
                    }
                }
                JournalEntry::CreateObject { record } | JournalEntry::UpdateObject { record } => {
                    state.put_configured(record);
                }
                JournalEntry::RemoveObject { id } => {
                    state.remove_configured(id);
                }
            }
            replayed += 1;
        }

        if let Some(sequence) = last_sequence {
            self.next_sequence_number
                .fetch_max(sequence + 1, Ordering::SeqCst);
        }
        self.next_message_number
            .fetch_max(max_message_number + 1, Ordering::SeqCst);
        Ok(replayed)
    }
}

/// File-backed store; see the module docs for the on-disk format.
#[derive(Debug, Clone)]
pub struct JournalMessageStore {
    inner: Arc<JournalInner>,
}

impl Default for JournalMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl JournalMessageStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(JournalInner {
                state: RwLock::new(StoreState::default()),
                file: Mutex::new(None),
                path: Mutex::new(None),
                next_sequence_number: AtomicU64::new(0),
                next_message_number: AtomicU64::new(1),
                fsync_on_commit: AtomicBool::new(true),
            }),
        }
    }

    pub fn journal_path(&self) -> Option<PathBuf> {
        self.inner.path.lock().clone()
    }

    pub fn message_count(&self) -> usize {
        self.inner.state.read().messages.len()
    }
}

impl MessageStore for JournalMessageStore {
    fn open_store(&self, parent: &str, settings: &StoreSettings) -> StoreResult<()> {
        let base = settings.path.as_ref().ok_or_else(|| {
            StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "journal store requires a storage path",
            ))
        })?;
        let dir = base.join(parent.trim_start_matches('/'));
        fs::create_dir_all(&dir)?;
        let path = dir.join(JOURNAL_FILE);

        self.inner.state.write().clear();
        let replayed = self.inner.replay(&path)?;

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        *self.inner.file.lock() = Some(file);
        *self.inner.path.lock() = Some(path.clone());
        self.inner
            .fsync_on_commit
            .store(settings.fsync_on_commit, Ordering::SeqCst);

        info!(
            journal = ?path,
            records = replayed,
            "Journal store opened"
        );
        Ok(())
    }

    fn add_message(
        &self,
        metadata: MessageMetaData,
        content: Bytes,
    ) -> StoreResult<StoredMessage> {
        let message_number = self.next_message_number();
        self.inner.append(vec![JournalEntry::AddMessage {
            message_number,
            metadata: metadata.clone(),
            content: content.clone(),
        }])?;
        let message = StoredMessage {
            message_number,
            metadata: Arc::new(metadata),
            content,
        };
        self.inner
            .state
            .write()
            .messages
            .insert(message_number, message.clone());
        Ok(message)
    }

    fn next_message_number(&self) -> u64 {
        self.inner.next_message_number.fetch_add(1, Ordering::SeqCst)
    }

    fn remove_message(&self, message_number: u64) -> StoreResult<()> {
        let known = self
            .inner
            .state
            .write()
            .messages
            .remove(&message_number)
            .is_some();
        if known {
            self.inner
                .append(vec![JournalEntry::RemoveMessage { message_number }])?;
        }
        Ok(())
    }

    fn new_transaction(&self) -> Box<dyn Transaction> {
        Box::new(JournalTransaction {
            inner: Arc::clone(&self.inner),
            ops: Vec::new(),
        })
    }

    fn visit_messages(&self, handler: &mut dyn FnMut(StoredMessage) -> bool) -> StoreResult<()> {
        let messages: Vec<StoredMessage> = self
            .inner
            .state
            .read()
            .messages
            .values()
            .cloned()
            .collect();
        for message in messages {
            if !handler(message) {
                break;
            }
        }
        Ok(())
    }

    fn visit_message_instances(&self, handler: &mut dyn FnMut(Record) -> bool) -> StoreResult<()> {
        let instances: Vec<Record> = self.inner.state.read().instances.iter().copied().collect();
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
        let xids = self.inner.state.read().xids.clone();
        for record in xids {
            if !handler(record) {
                break;
            }
        }
        Ok(())
    }

    fn close_store(&self) -> StoreResult<()> {
        if let Some(file) = self.inner.file.lock().take() {
            file.sync_all()?;
            debug!("Journal store closed");
        }
        Ok(())
    }

    fn on_delete(&self) -> StoreResult<()> {
        self.close_store()?;
        if let Some(path) = self.inner.path.lock().take() {
            match fs::remove_file(&path) {
                Ok(()) => info!(journal = ?path, "Journal deleted"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.inner.state.write().clear();
        Ok(())
    }
}

impl DurableConfigurationStore for JournalMessageStore {
    fn create(&self, record: ConfiguredObjectRecord) -> StoreResult<()> {
        self.inner.state.read().check_create(&record)?;
        self.inner.append(vec![JournalEntry::CreateObject {
            record: record.clone(),
        }])?;
        self.inner.sync()?;
        self.inner.state.write().put_configured(record);
        Ok(())
    }

    fn update(&self, record: ConfiguredObjectRecord) -> StoreResult<()> {
        self.inner.state.read().check_update(&record)?;
        self.inner.append(vec![JournalEntry::UpdateObject {
            record: record.clone(),
        }])?;
        self.inner.sync()?;
        self.inner.state.write().put_configured(record);
        Ok(())
    }

    fn remove(&self, id: Uuid) -> StoreResult<()> {
        if self.inner.state.write().remove_configured(id) {
            self.inner.append(vec![JournalEntry::RemoveObject { id }])?;
            self.inner.sync()?;
        }
        Ok(())
    }

    fn visit_configured_objects(
        &self,
        handler: &mut dyn FnMut(ConfiguredObjectRecord) -> bool,
    ) -> StoreResult<()> {
        let records = self.inner.state.read().configured.clone();
        for record in records {
            if !handler(record) {
                break;
            }
        }
        Ok(())
    }
}

struct JournalTransaction {
    inner: Arc<JournalInner>,
    ops: Vec<StoreOp>,
}

impl Transaction for JournalTransaction {
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
        let JournalTransaction { inner, ops } = *self;
        let needs_sync = !ops.is_empty() && inner.fsync_on_commit.load(Ordering::SeqCst);
        inner.commit(ops)?;
        if needs_sync {
            inner.sync()?;
        }
        Ok(())
    }

    /// Writes immediately; only the disk sync is deferred to a blocking task
    /// when a tokio runtime is available.
    fn commit_tran_async(self: Box<Self>) -> StoreFuture {
        let JournalTransaction { inner, ops } = *self;
        let needs_sync = !ops.is_empty() && inner.fsync_on_commit.load(Ordering::SeqCst);
        if let Err(e) = inner.commit(ops) {
            return StoreFuture::ready(Err(e));
        }
        if !needs_sync {
            return StoreFuture::ready(Ok(()));
        }
        let handle = match inner.sync_handle() {
            Ok(handle) => handle,
            Err(e) => return StoreFuture::ready(Err(e)),
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let task = runtime.spawn_blocking(move || handle.sync_data());
                StoreFuture::new(async move {
                    task.await
                        .map_err(|e| StoreError::Commit(e.to_string()))?
                        .map_err(StoreError::from)
                })
            }
            Err(_) => StoreFuture::ready(handle.sync_data().map_err(StoreError::from)),
        }
    }

    fn abort_tran(self: Box<Self>) {}
}
