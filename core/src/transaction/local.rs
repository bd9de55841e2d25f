use std::sync::Arc;
use tracing::debug;

use super::{apply_committed, ServerTransaction, TransactionResult, TxnAction};
use crate::storage::MessageStore;

/// Writes and applies each action as it arrives.
#[derive(Debug)]
pub struct AutoCommitTransaction {
    store: Arc<dyn MessageStore>,
}

impl AutoCommitTransaction {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }
}

impl ServerTransaction for AutoCommitTransaction {
    fn add(&mut self, action: TxnAction) -> TransactionResult<()> {
        let mut txn = self.store.new_transaction();
        action.enlist(txn.as_mut());
        if let Err(e) = txn.commit_tran() {
            action.rollback();
            return Err(e.into());
        }
        action.post_commit();
        Ok(())
    }

    fn is_transactional(&self) -> bool {
        false
    }
}

/// Buffers actions for `tx.commit` / `tx.rollback`.
#[derive(Debug)]
pub struct LocalTransaction {
    store: Arc<dyn MessageStore>,
    actions: Vec<TxnAction>,
}

impl LocalTransaction {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self {
            store,
            actions: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// One store transaction for every buffered action, then the in-memory
    /// effects in insertion order. On a store failure nothing is applied and
    /// the actions are rolled back.
    pub fn commit(&mut self) -> TransactionResult<()> {
        let actions = std::mem::take(&mut self.actions);
        let mut txn = self.store.new_transaction();
        for action in &actions {
            action.enlist(txn.as_mut());
        }
        if let Err(e) = txn.commit_tran() {
            actions.into_iter().for_each(TxnAction::rollback);
            return Err(e.into());
        }
        debug!(actions = actions.len(), "Committed local transaction");
        apply_committed(actions);
        Ok(())
    }

    /// Same as [`commit`](Self::commit) with the store write awaited.
    pub async fn commit_async(&mut self) -> TransactionResult<()> {
        let actions = std::mem::take(&mut self.actions);
        let mut txn = self.store.new_transaction();
        for action in &actions {
            action.enlist(txn.as_mut());
        }
        if let Err(e) = txn.commit_tran_async().await {
            actions.into_iter().for_each(TxnAction::rollback);
            return Err(e.into());
        }
        debug!(actions = actions.len(), "Committed local transaction");
        apply_committed(actions);
        Ok(())
    }

    pub fn rollback(&mut self) {
        let actions = std::mem::take(&mut self.actions);
        debug!(actions = actions.len(), "Rolled back local transaction");
        for action in actions {
            action.rollback();
        }
    }
}

impl ServerTransaction for LocalTransaction {
    fn add(&mut self, action: TxnAction) -> TransactionResult<()> {
        self.actions.push(action);
        Ok(())
    }

    fn is_transactional(&self) -> bool {
        true
    }
}

impl Drop for LocalTransaction {
    fn drop(&mut self) {
        if !self.actions.is_empty() {
            self.rollback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageMetaData, ServerMessage};
    use crate::protocol::BasicProperties;
    use crate::queue::{Queue, QueueConfig, BROKER_ACQUIRER};
    use crate::storage::MemoryMessageStore;
    use bytes::Bytes;
    use uuid::Uuid;

    fn setup() -> (Arc<MemoryMessageStore>, Arc<Queue>) {
        let store = Arc::new(MemoryMessageStore::new());
        let queue = Queue::new(
            Uuid::new_v4(),
            QueueConfig::new("q").with_durable(true),
            None,
            store.clone(),
        );
        (store, queue)
    }

    fn persistent(store: &Arc<MemoryMessageStore>) -> ServerMessage {
        let stored = store
            .add_message(
                MessageMetaData::new("", "q", BasicProperties::persistent(), 1),
                Bytes::from_static(b"x"),
            )
            .unwrap();
        ServerMessage::stored(stored, store.clone())
    }

    #[test]
    fn test_commit_applies_in_order() {
        let (store, queue) = setup();
        let mut txn = LocalTransaction::new(store.clone());
        let first = persistent(&store);
        let second = persistent(&store);
        for message in [&first, &second] {
            txn.add(TxnAction::Enqueue {
                queue: queue.clone(),
                message: message.new_reference(),
            })
            .unwrap();
        }
        assert_eq!(queue.entry_count(), 0);
        assert_eq!(store.instance_count(), 0);

        txn.commit().unwrap();
        assert!(txn.is_empty());
        assert_eq!(store.instance_count(), 2);
        let numbers: Vec<u64> = queue
            .entries()
            .iter()
            .map(|e| e.message().message_number())
            .collect();
        assert_eq!(numbers, vec![first.message_number(), second.message_number()]);
    }

    #[test]
    fn test_rollback_releases_and_drops() {
        let (store, queue) = setup();
        let held = persistent(&store);
        queue.enqueue(&held);
        let entry = queue.acquire_next(BROKER_ACQUIRER).unwrap();

        let mut txn = LocalTransaction::new(store.clone());
        txn.add(TxnAction::Dequeue {
            queue: queue.clone(),
            entry: entry.clone(),
        })
        .unwrap();
        let unpublished = persistent(&store);
        txn.add(TxnAction::Enqueue {
            queue: queue.clone(),
            message: unpublished.new_reference(),
        })
        .unwrap();

        txn.rollback();
        assert!(entry.is_available());
        assert!(unpublished.is_removed());
        assert!(!store.contains_message(unpublished.message_number()));
        assert_eq!(queue.entry_count(), 1);
    }

    #[tokio::test]
    async fn test_commit_async() {
        let (store, queue) = setup();
        let message = persistent(&store);
        queue.enqueue(&message);
        let entry = queue.acquire_next(BROKER_ACQUIRER).unwrap();

        let mut txn = LocalTransaction::new(store.clone());
        txn.add(TxnAction::Dequeue {
            queue: queue.clone(),
            entry: entry.clone(),
        })
        .unwrap();
        txn.commit_async().await.unwrap();
        assert!(entry.is_dequeued());
        assert!(message.is_removed());
    }

    #[test]
    fn test_auto_commit_applies_immediately() {
        let (store, queue) = setup();
        let mut txn = AutoCommitTransaction::new(store.clone());
        let message = persistent(&store);
        txn.add(TxnAction::Enqueue {
            queue: queue.clone(),
            message: message.new_reference(),
        })
        .unwrap();
        assert!(!txn.is_transactional());
        assert_eq!(queue.message_count(), 1);
        assert_eq!(store.instance_count(), 1);
    }
}
