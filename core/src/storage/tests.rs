#[cfg(test)]
mod tests {
    use crate::exchange::{ExchangeConfig, ExchangeType};
    use crate::message::MessageMetaData;
    use crate::model::EntityCategory;
    use crate::protocol::{BasicProperties, FieldTable, Xid};
    use crate::queue::QueueConfig;
    use crate::storage::{
        ConfiguredObjectRecord, DurableConfigurationStore, JournalMessageStore,
        MemoryMessageStore, MessageStore, Record, StoreError, StoreSettings,
    };
    use bytes::Bytes;
    use std::io::Write;
    use uuid::Uuid;

    fn metadata(routing_key: &str, size: u64) -> MessageMetaData {
        MessageMetaData::new("amq.direct", routing_key, BasicProperties::default(), size)
    }

    fn journal_settings(dir: &tempfile::TempDir) -> StoreSettings {
        StoreSettings {
            path: Some(dir.path().to_path_buf()),
            fsync_on_commit: false,
        }
    }

    fn instances(store: &dyn MessageStore) -> Vec<Record> {
        let mut records = Vec::new();
        store
            .visit_message_instances(&mut |record| {
                records.push(record);
                true
            })
            .expect("visit instances");
        records
    }

    fn message_numbers(store: &dyn MessageStore) -> Vec<u64> {
        let mut numbers = Vec::new();
        store
            .visit_messages(&mut |message| {
                numbers.push(message.message_number);
                true
            })
            .expect("visit messages");
        numbers
    }

    #[test]
    fn test_memory_store_assigns_increasing_numbers() {
        let store = MemoryMessageStore::new();
        store.open_store("default", &StoreSettings::default()).unwrap();

        let first = store
            .add_message(metadata("a", 1), Bytes::from_static(b"1"))
            .unwrap();
        let second = store
            .add_message(metadata("b", 1), Bytes::from_static(b"2"))
            .unwrap();

        assert!(second.message_number > first.message_number);
        assert_eq!(store.message_count(), 2);

        store.remove_message(first.message_number).unwrap();
        assert!(!store.contains_message(first.message_number));
        assert_eq!(message_numbers(&store), vec![second.message_number]);
    }

    #[test]
    fn test_memory_transaction_applies_only_on_commit() {
        let store = MemoryMessageStore::new();
        store.open_store("default", &StoreSettings::default()).unwrap();
        let queue = Uuid::new_v4();
        let message = store
            .add_message(metadata("q", 3), Bytes::from_static(b"abc"))
            .unwrap();

        let mut aborted = store.new_transaction();
        aborted.enqueue_message(queue, message.message_number);
        aborted.abort_tran();
        assert_eq!(store.instance_count(), 0);

        let mut txn = store.new_transaction();
        txn.enqueue_message(queue, message.message_number);
        assert_eq!(store.instance_count(), 0);
        txn.commit_tran().unwrap();

        assert_eq!(
            instances(&store),
            vec![Record::new(queue, message.message_number)]
        );

        let mut txn = store.new_transaction();
        txn.dequeue_message(queue, message.message_number);
        txn.commit_tran().unwrap();
        assert!(instances(&store).is_empty());
    }

    #[test]
    fn test_visit_stops_when_handler_returns_false() {
        let store = MemoryMessageStore::new();
        for key in ["a", "b", "c"] {
            store.add_message(metadata(key, 0), Bytes::new()).unwrap();
        }

        let mut seen = 0;
        store
            .visit_messages(&mut |_| {
                seen += 1;
                false
            })
            .unwrap();
        assert_eq!(seen, 1);
    }

    #[test]
    fn test_restore_message_advances_numbering() {
        let store = MemoryMessageStore::new();
        let imported = crate::storage::StoredMessage {
            message_number: 41,
            metadata: std::sync::Arc::new(metadata("x", 0)),
            content: Bytes::new(),
        };
        store.restore_message(imported);

        assert!(store.contains_message(41));
        assert_eq!(store.next_message_number(), 42);
    }

    #[test]
    fn test_distributed_records_are_replaced_and_removed() {
        let store = MemoryMessageStore::new();
        let queue = Uuid::new_v4();
        let xid = Xid::new(1, Bytes::from_static(b"gtrid"), Bytes::from_static(b"bq"));

        let mut txn = store.new_transaction();
        txn.record_xid(&xid, &[Record::new(queue, 1)], &[]);
        txn.commit_tran().unwrap();

        let mut txn = store.new_transaction();
        txn.record_xid(&xid, &[Record::new(queue, 1), Record::new(queue, 2)], &[]);
        txn.commit_tran().unwrap();

        let mut recorded = Vec::new();
        store
            .visit_distributed_transactions(&mut |record| {
                recorded.push(record);
                true
            })
            .unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].xid, xid);
        assert_eq!(recorded[0].enqueues.len(), 2);

        let mut txn = store.new_transaction();
        txn.remove_xid(&xid);
        txn.commit_tran().unwrap();

        let mut count = 0;
        store
            .visit_distributed_transactions(&mut |_| {
                count += 1;
                true
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_configured_object_duplicate_and_type_mismatch() {
        let store = MemoryMessageStore::new();
        let id = Uuid::new_v4();
        let exchange = ConfiguredObjectRecord::Exchange {
            id,
            config: ExchangeConfig::new("orders", ExchangeType::Topic),
        };

        store.create(exchange.clone()).unwrap();
        assert!(matches!(
            store.create(exchange),
            Err(StoreError::DuplicateId(dup)) if dup == id
        ));

        let queue = ConfiguredObjectRecord::Queue {
            id,
            config: QueueConfig::new("orders"),
        };
        match store.update(queue) {
            Err(StoreError::TypeMismatch {
                expected, actual, ..
            }) => {
                assert_eq!(expected, EntityCategory::Exchange);
                assert_eq!(actual, EntityCategory::Queue);
            }
            other => panic!("expected type mismatch, got {:?}", other),
        }

        let unknown = ConfiguredObjectRecord::Queue {
            id: Uuid::new_v4(),
            config: QueueConfig::new("ghost"),
        };
        assert!(matches!(
            store.update(unknown),
            Err(StoreError::UnknownObject(_))
        ));
    }

    #[test]
    fn test_on_delete_discards_everything() {
        let store = MemoryMessageStore::new();
        let message = store.add_message(metadata("a", 0), Bytes::new()).unwrap();
        let mut txn = store.new_transaction();
        txn.enqueue_message(Uuid::new_v4(), message.message_number);
        txn.commit_tran().unwrap();
        store
            .create(ConfiguredObjectRecord::Queue {
                id: Uuid::new_v4(),
                config: QueueConfig::new("q"),
            })
            .unwrap();

        store.on_delete().unwrap();

        assert_eq!(store.message_count(), 0);
        assert_eq!(store.instance_count(), 0);
        let mut configured = 0;
        store
            .visit_configured_objects(&mut |_| {
                configured += 1;
                true
            })
            .unwrap();
        assert_eq!(configured, 0);
    }

    #[test]
    fn test_journal_requires_path() {
        let store = JournalMessageStore::new();
        let settings = StoreSettings {
            path: None,
            fsync_on_commit: false,
        };
        assert!(matches!(
            store.open_store("default", &settings),
            Err(StoreError::Io(_))
        ));
    }

    #[test]
    fn test_journal_replays_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let settings = journal_settings(&dir);
        let queue = Uuid::new_v4();
        let binding_id = Uuid::new_v4();

        let (kept, removed) = {
            let store = JournalMessageStore::new();
            store.open_store("/default", &settings).unwrap();

            let kept = store
                .add_message(metadata("kept", 4), Bytes::from_static(b"keep"))
                .unwrap();
            let removed = store
                .add_message(metadata("gone", 4), Bytes::from_static(b"gone"))
                .unwrap();

            let mut txn = store.new_transaction();
            txn.enqueue_message(queue, kept.message_number);
            txn.enqueue_message(queue, removed.message_number);
            txn.commit_tran().unwrap();

            let mut txn = store.new_transaction();
            txn.dequeue_message(queue, removed.message_number);
            txn.commit_tran().unwrap();
            store.remove_message(removed.message_number).unwrap();

            store
                .create(ConfiguredObjectRecord::Binding {
                    id: binding_id,
                    exchange: "amq.direct".to_string(),
                    queue: "q".to_string(),
                    binding_key: "kept".to_string(),
                    arguments: FieldTable::new(),
                })
                .unwrap();

            store.close_store().unwrap();
            (kept, removed)
        };

        let store = JournalMessageStore::new();
        store.open_store("/default", &settings).unwrap();

        assert_eq!(message_numbers(&store), vec![kept.message_number]);
        assert_eq!(
            instances(&store),
            vec![Record::new(queue, kept.message_number)]
        );

        let mut content = None;
        store
            .visit_messages(&mut |message| {
                content = Some(message.content.clone());
                assert_eq!(message.metadata.routing_key, "kept");
                true
            })
            .unwrap();
        assert_eq!(content, Some(Bytes::from_static(b"keep")));

        let mut configured = Vec::new();
        store
            .visit_configured_objects(&mut |record| {
                configured.push(record.id());
                true
            })
            .unwrap();
        assert_eq!(configured, vec![binding_id]);

        // Numbers are never reused after a restart.
        let next = store.next_message_number();
        assert!(next > removed.message_number);
    }

    #[test]
    fn test_journal_skips_torn_trailing_record() {
        let dir = tempfile::tempdir().unwrap();
        let settings = journal_settings(&dir);

        let path = {
            let store = JournalMessageStore::new();
            store.open_store("default", &settings).unwrap();
            store
                .add_message(metadata("a", 1), Bytes::from_static(b"a"))
                .unwrap();
            store.close_store().unwrap();
            store.journal_path().expect("journal path")
        };

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap();
        file.write_all(b"{\"sequence_number\": 9, \"entry\": {\"AddMes")
            .unwrap();
        drop(file);

        let store = JournalMessageStore::new();
        store.open_store("default", &settings).unwrap();
        assert_eq!(store.message_count(), 1);
    }

    #[test]
    fn test_journal_stores_are_isolated_per_parent() {
        let dir = tempfile::tempdir().unwrap();
        let settings = journal_settings(&dir);

        let first = JournalMessageStore::new();
        first.open_store("one", &settings).unwrap();
        first.add_message(metadata("a", 0), Bytes::new()).unwrap();

        let second = JournalMessageStore::new();
        second.open_store("two", &settings).unwrap();
        assert_eq!(second.message_count(), 0);
        assert_ne!(first.journal_path(), second.journal_path());
    }

    #[tokio::test]
    async fn test_journal_async_commit() {
        let dir = tempfile::tempdir().unwrap();
        let store = JournalMessageStore::new();
        store.open_store("default", &journal_settings(&dir)).unwrap();
        let queue = Uuid::new_v4();
        let message = store.add_message(metadata("a", 0), Bytes::new()).unwrap();

        let mut txn = store.new_transaction();
        txn.enqueue_message(queue, message.message_number);
        txn.commit_tran_async().await.unwrap();

        assert_eq!(
            instances(&store),
            vec![Record::new(queue, message.message_number)]
        );
    }
}
