use super::*;
use crate::acl::Principal;
use crate::consumer::{ChannelCredit, LocalSubscription};
use crate::storage::MemoryMessageStore;
use crate::transaction::{AutoCommitTransaction, LocalTransaction};
use tokio::sync::mpsc;

fn memory_host() -> Arc<VirtualHost> {
    VirtualHost::new(
        VirtualHostConfig::new("test"),
        Arc::new(MemoryMessageStore::new()),
        Arc::new(AclManager::new(true)),
        Arc::new(MetricsRegistry::new()),
    )
}

fn ctx(connection_id: u64) -> RequestContext {
    RequestContext::new(Principal::user("guest"), connection_id)
}

fn request(exchange: &str, routing_key: &str) -> PublishRequest {
    PublishRequest {
        exchange: exchange.to_string(),
        routing_key: routing_key.to_string(),
        mandatory: false,
        immediate: false,
        properties: BasicProperties::default(),
        body: Bytes::from_static(b"hello"),
    }
}

fn publish(vhost: &VirtualHost, request: PublishRequest) -> PublishOutcome {
    let mut txn = AutoCommitTransaction::new(Arc::clone(vhost.message_store()));
    vhost.publish(&ctx(1), request, &mut txn).unwrap()
}

#[test]
fn test_config_name_and_validation() {
    let config = VirtualHostConfig::new("/prod");
    assert_eq!(config.name, "prod");
    assert!(config.validate().is_ok());

    assert!(VirtualHostConfig::new("/").validate().is_err());
    let journal = VirtualHostConfig::new("prod").with_store(StoreType::Journal, StoreSettings::default());
    assert!(journal.validate().is_err());
}

#[tokio::test]
async fn test_start_activates_with_standard_exchanges() {
    let vhost = memory_host();
    assert_eq!(vhost.state(), VirtualHostState::Initialising);
    vhost.start().await.unwrap();
    assert!(vhost.is_active());

    for name in [DEFAULT_EXCHANGE, AMQ_DIRECT, AMQ_FANOUT, AMQ_TOPIC, AMQ_MATCH] {
        assert!(vhost.get_exchange(name).is_some(), "missing {name:?}");
    }
    assert_eq!(
        vhost.get_exchange(AMQ_MATCH).unwrap().exchange_type(),
        ExchangeType::Headers
    );

    vhost.stop().unwrap();
    assert_eq!(vhost.state(), VirtualHostState::Stopped);
}

#[test]
fn test_declare_queue_routes_through_default_exchange() {
    let vhost = memory_host();
    let (queue, created) = vhost
        .declare_queue(&ctx(1), QueueConfig::new("orders"), false)
        .unwrap();
    assert!(created);

    let outcome = publish(&vhost, request(DEFAULT_EXCHANGE, "orders"));
    assert_eq!(outcome, PublishOutcome::Routed(1));
    assert_eq!(queue.message_count(), 1);

    let (again, created) = vhost
        .declare_queue(&ctx(1), QueueConfig::new("orders"), false)
        .unwrap();
    assert!(!created);
    assert!(Arc::ptr_eq(&queue, &again));
}

#[test]
fn test_declare_queue_generates_name() {
    let vhost = memory_host();
    let (queue, _) = vhost
        .declare_queue(&ctx(1), QueueConfig::new(""), false)
        .unwrap();
    assert!(queue.name().starts_with("amq.gen-"));
    assert!(vhost.get_queue(queue.name()).is_some());
}

#[test]
fn test_redeclare_with_different_attributes_conflicts() {
    let vhost = memory_host();
    vhost
        .declare_queue(&ctx(1), QueueConfig::new("q").with_durable(true), false)
        .unwrap();
    let err = vhost
        .declare_queue(&ctx(1), QueueConfig::new("q"), false)
        .unwrap_err();
    assert_eq!(err.reply_code(), ReplyCode::PreconditionFailed);

    let config = ExchangeConfig::new(AMQ_DIRECT, ExchangeType::Fanout);
    let err = vhost.declare_exchange(&ctx(1), config, false).unwrap_err();
    assert_eq!(err.reply_code(), ReplyCode::PreconditionFailed);
}

#[test]
fn test_passive_declare_of_missing_entities() {
    let vhost = memory_host();
    let err = vhost
        .declare_queue(&ctx(1), QueueConfig::new("missing"), true)
        .unwrap_err();
    assert_eq!(err.reply_code(), ReplyCode::NotFound);

    let config = ExchangeConfig::new("missing", ExchangeType::Direct);
    let err = vhost.declare_exchange(&ctx(1), config, true).unwrap_err();
    assert_eq!(err.reply_code(), ReplyCode::NotFound);
}

#[test]
fn test_exclusive_queue_is_locked_and_dropped_with_owner() {
    let vhost = memory_host();
    vhost
        .declare_queue(&ctx(1), QueueConfig::new("mine").with_exclusive(true), false)
        .unwrap();

    let err = vhost
        .declare_queue(&ctx(2), QueueConfig::new("mine").with_exclusive(true), false)
        .unwrap_err();
    assert_eq!(err.reply_code(), ReplyCode::ResourceLocked);
    assert!(vhost.purge_queue(&ctx(2), "mine").is_err());

    assert_eq!(vhost.connection_closed(2), 0);
    assert_eq!(vhost.connection_closed(1), 1);
    assert!(vhost.get_queue("mine").is_none());
}

#[test]
fn test_mandatory_unroutable_message_is_returned() {
    let vhost = memory_host();
    let mut mandatory = request(AMQ_DIRECT, "nowhere");
    mandatory.mandatory = true;
    assert_eq!(
        publish(&vhost, mandatory),
        PublishOutcome::Returned {
            reply_code: ReplyCode::NoRoute,
            reply_text: "NO_ROUTE".to_string(),
        }
    );
    assert_eq!(publish(&vhost, request(AMQ_DIRECT, "nowhere")), PublishOutcome::Dropped);

    let snapshot = vhost.metrics().snapshot();
    assert_eq!(snapshot.messages_returned, 1);
    assert_eq!(snapshot.messages_unroutable, 1);
}

#[test]
fn test_immediate_requires_ready_consumer() {
    let vhost = memory_host();
    let (queue, _) = vhost
        .declare_queue(&ctx(1), QueueConfig::new("work"), false)
        .unwrap();

    let mut immediate = request(DEFAULT_EXCHANGE, "work");
    immediate.immediate = true;
    assert!(matches!(
        publish(&vhost, immediate.clone()),
        PublishOutcome::Returned {
            reply_code: ReplyCode::NoConsumers,
            ..
        }
    ));
    assert_eq!(queue.message_count(), 0);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = LocalSubscription::new(
        "ctag",
        1,
        "work",
        true,
        false,
        Arc::new(ChannelCredit::new()),
        tx,
    );
    queue.add_subscription(Arc::new(subscription));
    assert_eq!(publish(&vhost, immediate), PublishOutcome::Routed(1));
    assert!(rx.try_recv().is_ok());
}

#[test]
fn test_publish_to_unknown_or_internal_exchange() {
    let vhost = memory_host();
    let err = vhost
        .publish(
            &ctx(1),
            request("nosuch", "key"),
            &mut AutoCommitTransaction::new(Arc::clone(vhost.message_store())),
        )
        .unwrap_err();
    assert_eq!(err.reply_code(), ReplyCode::NotFound);

    let config = ExchangeConfig::new("hidden", ExchangeType::Fanout).with_internal(true);
    vhost.declare_exchange(&ctx(1), config, false).unwrap();
    let err = vhost
        .publish(
            &ctx(1),
            request("hidden", "key"),
            &mut AutoCommitTransaction::new(Arc::clone(vhost.message_store())),
        )
        .unwrap_err();
    assert_eq!(err.reply_code(), ReplyCode::AccessRefused);
}

#[test]
fn test_transactional_publish_waits_for_commit() {
    let vhost = memory_host();
    let (queue, _) = vhost
        .declare_queue(&ctx(1), QueueConfig::new("tx"), false)
        .unwrap();

    let mut txn = LocalTransaction::new(Arc::clone(vhost.message_store()));
    let outcome = vhost
        .publish(&ctx(1), request(DEFAULT_EXCHANGE, "tx"), &mut txn)
        .unwrap();
    assert_eq!(outcome, PublishOutcome::Routed(1));
    assert_eq!(queue.message_count(), 0);

    txn.commit().unwrap();
    assert_eq!(queue.message_count(), 1);
}

#[test]
fn test_bind_and_unbind() {
    let vhost = memory_host();
    let (queue, _) = vhost
        .declare_queue(&ctx(1), QueueConfig::new("logs"), false)
        .unwrap();
    vhost
        .bind_queue(&ctx(1), AMQ_TOPIC, "logs", "app.*", FieldTable::new())
        .unwrap();

    assert_eq!(publish(&vhost, request(AMQ_TOPIC, "app.error")), PublishOutcome::Routed(1));
    assert_eq!(queue.message_count(), 1);

    vhost.unbind_queue(&ctx(1), AMQ_TOPIC, "logs", "app.*").unwrap();
    vhost.unbind_queue(&ctx(1), AMQ_TOPIC, "logs", "app.*").unwrap();
    assert_eq!(publish(&vhost, request(AMQ_TOPIC, "app.error")), PublishOutcome::Dropped);

    let err = vhost
        .bind_queue(&ctx(1), DEFAULT_EXCHANGE, "logs", "other", FieldTable::new())
        .unwrap_err();
    assert_eq!(err.reply_code(), ReplyCode::AccessRefused);
}

#[test]
fn test_delete_queue_conditions() {
    let vhost = memory_host();
    vhost
        .declare_queue(&ctx(1), QueueConfig::new("full"), false)
        .unwrap();
    publish(&vhost, request(DEFAULT_EXCHANGE, "full"));

    let err = vhost.delete_queue(&ctx(1), "full", false, true).unwrap_err();
    assert_eq!(err.reply_code(), ReplyCode::PreconditionFailed);

    assert_eq!(vhost.delete_queue(&ctx(1), "full", true, false).unwrap(), 1);
    assert!(vhost.get_queue("full").is_none());
    assert_eq!(publish(&vhost, request(DEFAULT_EXCHANGE, "full")), PublishOutcome::Dropped);
}

#[test]
fn test_exchange_in_use_as_alternate_cannot_be_deleted() {
    let vhost = memory_host();
    vhost
        .declare_exchange(&ctx(1), ExchangeConfig::new("dlx", ExchangeType::Fanout), false)
        .unwrap();
    vhost
        .declare_queue(
            &ctx(1),
            QueueConfig::new("work").with_alternate_exchange("dlx"),
            false,
        )
        .unwrap();

    let err = vhost.delete_exchange(&ctx(1), "dlx", false).unwrap_err();
    assert_eq!(err.reply_code(), ReplyCode::PreconditionFailed);

    vhost.delete_queue(&ctx(1), "work", false, false).unwrap();
    vhost.delete_exchange(&ctx(1), "dlx", false).unwrap();
    assert!(vhost.get_exchange("dlx").is_none());

    let err = vhost.delete_exchange(&ctx(1), AMQ_FANOUT, false).unwrap_err();
    assert_eq!(err.reply_code(), ReplyCode::AccessRefused);
}

#[test]
fn test_default_max_delivery_count_applied() {
    let vhost = VirtualHost::new(
        VirtualHostConfig::new("test").with_default_max_delivery_count(5),
        Arc::new(MemoryMessageStore::new()),
        Arc::new(AclManager::new(true)),
        Arc::new(MetricsRegistry::new()),
    );
    let (queue, _) = vhost
        .declare_queue(&ctx(1), QueueConfig::new("q"), false)
        .unwrap();
    assert_eq!(queue.config().max_delivery_count, 5);

    let (queue, _) = vhost
        .declare_queue(&ctx(1), QueueConfig::new("q2").with_max_delivery_count(2), false)
        .unwrap();
    assert_eq!(queue.config().max_delivery_count, 2);
}

#[test]
fn test_acl_denies_unlisted_user() {
    let vhost = VirtualHost::new(
        VirtualHostConfig::new("test"),
        Arc::new(MemoryMessageStore::new()),
        Arc::new(AclManager::new(false)),
        Arc::new(MetricsRegistry::new()),
    );
    let err = vhost.authorize_access(&ctx(1)).unwrap_err();
    assert_eq!(err.reply_code(), ReplyCode::AccessRefused);

    let err = vhost
        .declare_queue(&ctx(1), QueueConfig::new("q"), false)
        .unwrap_err();
    assert_eq!(err.reply_code(), ReplyCode::AccessRefused);

    assert!(vhost
        .declare_queue(&RequestContext::system(), QueueConfig::new("q"), false)
        .is_ok());
}

#[tokio::test]
async fn test_durable_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let settings = StoreSettings {
        path: Some(dir.path().to_path_buf()),
        fsync_on_commit: false,
    };
    let config = VirtualHostConfig::new("durable").with_store(StoreType::Journal, settings);

    {
        let vhost = VirtualHost::create(
            config.clone(),
            Arc::new(AclManager::new(true)),
            Arc::new(MetricsRegistry::new()),
        );
        vhost.start().await.unwrap();
        let exchange = ExchangeConfig::new("events", ExchangeType::Topic).with_durable(true);
        vhost.declare_exchange(&ctx(1), exchange, false).unwrap();
        vhost
            .declare_queue(&ctx(1), QueueConfig::new("audit").with_durable(true), false)
            .unwrap();
        vhost
            .bind_queue(&ctx(1), "events", "audit", "#", FieldTable::new())
            .unwrap();

        let mut persistent = request("events", "user.created");
        persistent.properties = BasicProperties::persistent();
        assert_eq!(publish(&vhost, persistent), PublishOutcome::Routed(1));
        publish(&vhost, request("events", "user.deleted"));
        vhost.stop().unwrap();
    }

    let vhost = VirtualHost::create(
        config,
        Arc::new(AclManager::new(true)),
        Arc::new(MetricsRegistry::new()),
    );
    let report = vhost.start().await.unwrap();
    assert_eq!(report.recovered_entries(), 1);

    let queue = vhost.get_queue("audit").unwrap();
    assert_eq!(queue.message_count(), 1);
    let exchange = vhost.get_exchange("events").unwrap();
    assert!(exchange.is_bound_to(&queue));
    assert_eq!(publish(&vhost, request("events", "x.y")), PublishOutcome::Routed(1));
}

/// Auto-commits each action, then settles whatever the first enqueue made
/// available before the next queue receives its copy.
struct SettleAfterFirst {
    inner: AutoCommitTransaction,
    queues: Vec<Arc<Queue>>,
    added: usize,
}

impl ServerTransaction for SettleAfterFirst {
    fn add(&mut self, action: TxnAction) -> crate::transaction::TransactionResult<()> {
        self.inner.add(action)?;
        self.added += 1;
        if self.added == 1 {
            for queue in &self.queues {
                if let Some(entry) = queue.acquire_next(99) {
                    assert!(queue.acknowledge(&entry).unwrap());
                }
            }
        }
        Ok(())
    }

    fn is_transactional(&self) -> bool {
        false
    }
}

#[test]
fn test_message_outlives_settlement_during_fanout() {
    let vhost = memory_host();
    let mut queues = Vec::new();
    for name in ["left", "right"] {
        let (queue, _) = vhost
            .declare_queue(&ctx(1), QueueConfig::new(name).with_durable(true), false)
            .unwrap();
        vhost
            .bind_queue(&ctx(1), AMQ_FANOUT, name, "", FieldTable::new())
            .unwrap();
        queues.push(queue);
    }

    let mut persistent = request(AMQ_FANOUT, "");
    persistent.properties = BasicProperties::persistent();
    let mut txn = SettleAfterFirst {
        inner: AutoCommitTransaction::new(Arc::clone(vhost.message_store())),
        queues: queues.clone(),
        added: 0,
    };
    let outcome = vhost.publish(&ctx(1), persistent, &mut txn).unwrap();
    assert_eq!(outcome, PublishOutcome::Routed(2));

    let remaining: u32 = queues.iter().map(|q| q.message_count()).sum();
    assert_eq!(remaining, 1);
    let mut stored = 0;
    vhost
        .message_store()
        .visit_messages(&mut |_| {
            stored += 1;
            true
        })
        .unwrap();
    assert_eq!(stored, 1);

    for queue in &queues {
        if let Some(entry) = queue.acquire_next(99) {
            assert!(!entry.message().is_removed());
            assert!(queue.acknowledge(&entry).unwrap());
        }
    }
    stored = 0;
    vhost
        .message_store()
        .visit_messages(&mut |_| {
            stored += 1;
            true
        })
        .unwrap();
    assert_eq!(stored, 0);
}
