//! Startup replay of the message store.
//!
//! Recovery runs once, before the listener accepts, in four strictly ordered
//! steps:
//!
//! 1. every stored message is loaded and marked unused
//! 2. enqueue records are replayed onto their queues; a record naming an
//!    unknown queue or message is dequeued from the store
//! 3. prepared XA branches are rebuilt; unresolvable actions are logged and
//!    the branch is still marked prepared
//! 4. messages no queue or branch used are removed from the store

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{DtxBranch, DtxRegistry, TxnAction};
use crate::message::ServerMessage;
use crate::protocol::Xid;
use crate::queue::{Queue, BROKER_ACQUIRER};
use crate::storage::{DtxRecord, MessageStore, Record, StoreFuture, StoreResult};

/// What recovery found.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub messages: usize,
    /// Recovered entries per queue name.
    pub queue_entries: BTreeMap<String, usize>,
    pub discarded_records: usize,
    pub prepared_branches: usize,
    pub incomplete_branches: usize,
    pub removed_messages: usize,
}

impl RecoveryReport {
    pub fn recovered_entries(&self) -> usize {
        self.queue_entries.values().sum()
    }
}

pub struct MessageStoreRecoverer<'a> {
    store: Arc<dyn MessageStore>,
    queues: HashMap<Uuid, Arc<Queue>>,
    dtx_registry: &'a DtxRegistry,
}

impl<'a> MessageStoreRecoverer<'a> {
    pub fn new(
        store: Arc<dyn MessageStore>,
        queues: impl IntoIterator<Item = Arc<Queue>>,
        dtx_registry: &'a DtxRegistry,
    ) -> Self {
        Self {
            store,
            queues: queues.into_iter().map(|q| (q.id(), q)).collect(),
            dtx_registry,
        }
    }

    pub async fn recover(&self) -> StoreResult<RecoveryReport> {
        info!(queues = self.queues.len(), "Starting message store recovery");
        let mut report = RecoveryReport::default();

        let messages = self.load_messages()?;
        report.messages = messages.len();
        let mut used: HashSet<u64> = HashSet::new();

        let pending = self.replay_instances(&messages, &mut used, &mut report)?;
        report.discarded_records = pending.len();
        for result in futures::future::join_all(pending).await {
            result?;
        }
        for (queue, count) in &report.queue_entries {
            info!(queue = %queue, count, "Recovered queue entries");
        }

        self.replay_branches(&messages, &mut used, &mut report)?;

        for (number, message) in &messages {
            if !used.contains(number) && message.remove_if_unreferenced() {
                warn!(message_id = number, "Removed message with no queue entry");
                report.removed_messages += 1;
            }
        }

        info!(
            messages = report.messages,
            entries = report.recovered_entries(),
            prepared = report.prepared_branches,
            removed = report.removed_messages,
            "Message store recovery complete"
        );
        Ok(report)
    }

    fn load_messages(&self) -> StoreResult<BTreeMap<u64, ServerMessage>> {
        let mut messages = BTreeMap::new();
        self.store.visit_messages(&mut |stored| {
            let number = stored.message_number;
            messages.insert(number, ServerMessage::stored(stored, Arc::clone(&self.store)));
            true
        })?;
        debug!(count = messages.len(), "Loaded stored messages");
        Ok(messages)
    }

    fn replay_instances(
        &self,
        messages: &BTreeMap<u64, ServerMessage>,
        used: &mut HashSet<u64>,
        report: &mut RecoveryReport,
    ) -> StoreResult<Vec<StoreFuture>> {
        let mut records = Vec::new();
        self.store.visit_message_instances(&mut |record| {
            records.push(record);
            true
        })?;
        // arrival order on every queue follows message numbers
        records.sort_by_key(|r| (r.message_number, r.queue_id));

        let mut pending = Vec::new();
        for record in records {
            match (self.queues.get(&record.queue_id), messages.get(&record.message_number)) {
                (Some(queue), Some(message)) => {
                    queue.enqueue(message);
                    used.insert(record.message_number);
                    *report.queue_entries.entry(queue.name().to_string()).or_default() += 1;
                }
                (queue, _) => {
                    warn!(
                        queue_id = %record.queue_id,
                        message_id = record.message_number,
                        queue_known = queue.is_some(),
                        "Discarding enqueue record for unknown queue or message"
                    );
                    let mut txn = self.store.new_transaction();
                    txn.dequeue_message(record.queue_id, record.message_number);
                    pending.push(txn.commit_tran_async());
                }
            }
        }
        Ok(pending)
    }

    fn replay_branches(
        &self,
        messages: &BTreeMap<u64, ServerMessage>,
        used: &mut HashSet<u64>,
        report: &mut RecoveryReport,
    ) -> StoreResult<()> {
        let mut records: Vec<DtxRecord> = Vec::new();
        self.store.visit_distributed_transactions(&mut |record| {
            records.push(record);
            true
        })?;

        for record in records {
            let branch = match self.dtx_registry.get(&record.xid) {
                Some(branch) => branch,
                None => {
                    let branch = Arc::new(DtxBranch::new(record.xid.clone(), Arc::clone(&self.store)));
                    self.dtx_registry.register(Arc::clone(&branch));
                    branch
                }
            };

            let mut complete = true;
            for enqueue in &record.enqueues {
                match self.resolve(enqueue, messages) {
                    Some((queue, message)) => {
                        used.insert(enqueue.message_number);
                        branch.add_recovered(TxnAction::Enqueue {
                            queue,
                            message: message.new_reference(),
                        });
                    }
                    None => {
                        complete = false;
                        warn_incomplete(&record.xid, "enqueue", enqueue);
                    }
                }
            }
            for dequeue in &record.dequeues {
                let entry = self.resolve(dequeue, messages).and_then(|(queue, _)| {
                    let entry = queue.get_message_on_the_queue(dequeue.message_number)?;
                    entry.acquire(BROKER_ACQUIRER).then_some((queue, entry))
                });
                match entry {
                    Some((queue, entry)) => {
                        branch.add_recovered(TxnAction::Dequeue { queue, entry });
                    }
                    None => {
                        complete = false;
                        warn_incomplete(&record.xid, "dequeue", dequeue);
                    }
                }
            }

            branch.mark_prepared();
            report.prepared_branches += 1;
            if !complete {
                report.incomplete_branches += 1;
            }
            info!(
                xid = %record.xid,
                actions = branch.action_count(),
                complete,
                "Recovered prepared dtx branch"
            );
        }
        Ok(())
    }

    fn resolve<'m>(
        &self,
        record: &Record,
        messages: &'m BTreeMap<u64, ServerMessage>,
    ) -> Option<(Arc<Queue>, &'m ServerMessage)> {
        let queue = self.queues.get(&record.queue_id)?;
        let message = messages.get(&record.message_number)?;
        Some((Arc::clone(queue), message))
    }
}

fn warn_incomplete(xid: &Xid, action: &str, record: &Record) {
    warn!(
        xid = %xid,
        action,
        queue_id = %record.queue_id,
        message_id = record.message_number,
        "Dtx branch is incomplete: {} of message {} on queue {} cannot be resolved",
        action,
        record.message_number,
        record.queue_id
    );
}
