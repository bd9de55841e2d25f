//! Channel state machine.
//!
//! `Unopened → Open → AwaitingCloseOk → Closed`. The state lives in an atomic
//! so that a close requested by the broker and one received from the peer
//! race to a single transition. While `Open`, methods are dispatched by
//! `(class, method)`; a handler returns the replies to write, or nothing for
//! `no-wait` variants.

use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::AmqpError;
use crate::acl::{Operation, ResourceType};
use crate::consumer::{
    next_subscription_id, ChannelCredit, Delivery, LocalSubscription, Subscription,
    SubscriptionId,
};
use crate::exchange::{ExchangeConfig, ExchangeType};
use crate::model::RequestContext;
use crate::protocol::{BasicProperties, ContentHeader, Method, ReplyCode, XaStatus, Xid};
use crate::queue::{DeadLetterOutcome, Queue, QueueConfig, QueueEntry};
use crate::transaction::{
    AutoCommitTransaction, BranchTransaction, DtxError, LocalTransaction, ServerTransaction,
    TxnAction,
};
use crate::virtualhost::{PublishOutcome, PublishRequest, VirtualHost};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    Unopened = 0,
    Open = 1,
    AwaitingCloseOk = 2,
    Closed = 3,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Unopened,
            1 => Self::Open,
            2 => Self::AwaitingCloseOk,
            _ => Self::Closed,
        }
    }
}

/// Atomic channel state; every transition is a compare-and-swap so exactly
/// one caller wins it.
#[derive(Debug)]
pub struct ChannelLifecycle {
    state: AtomicU8,
}

impl Default for ChannelLifecycle {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(ChannelState::Unopened as u8),
        }
    }
}

impl ChannelLifecycle {
    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn transition_to(&self, from: ChannelState, to: ChannelState) -> bool {
        if !Self::is_valid_transition(from, to) {
            return false;
        }
        let won = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if won {
            debug!(old_state = ?from, new_state = ?to, "Channel state transition");
        }
        won
    }

    fn is_valid_transition(from: ChannelState, to: ChannelState) -> bool {
        use ChannelState::*;
        matches!(
            (from, to),
            (Unopened, Open)
                | (Open, AwaitingCloseOk)
                | (Open, Closed)
                | (AwaitingCloseOk, Closed)
                | (Closed, Open)
        )
    }

    /// Open → AwaitingCloseOk, for a close the broker sends.
    pub fn begin_close(&self) -> bool {
        self.transition_to(ChannelState::Open, ChannelState::AwaitingCloseOk)
    }

    /// Open or AwaitingCloseOk → Closed.
    pub fn complete_close(&self) -> bool {
        self.transition_to(ChannelState::Open, ChannelState::Closed)
            || self.transition_to(ChannelState::AwaitingCloseOk, ChannelState::Closed)
    }
}

/// Something the connection writes back for a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Method(Method),
    /// A method followed by a content header and body frames.
    Content {
        method: Method,
        properties: BasicProperties,
        body: Bytes,
    },
}

/// What a channel needs from its connection to handle a method.
pub struct ChannelContext<'a> {
    pub vhost: &'a Arc<VirtualHost>,
    pub request: &'a RequestContext,
    pub deliveries: &'a mpsc::UnboundedSender<Delivery>,
}

struct PendingPublish {
    exchange: String,
    routing_key: String,
    mandatory: bool,
    immediate: bool,
    header: Option<ContentHeader>,
    body: BytesMut,
}

struct Consumer {
    subscription: Arc<LocalSubscription>,
    queue: Arc<Queue>,
}

struct Unacked {
    queue: Arc<Queue>,
    entry: Arc<QueueEntry>,
    subscription: Option<Arc<LocalSubscription>>,
}

enum TxnMode {
    AutoCommit,
    Local(LocalTransaction),
    /// The branch the channel is currently associated with, if any.
    Distributed(Option<BranchTransaction>),
}

pub struct Channel {
    id: u16,
    /// Identifies this channel to dtx branches.
    session: u64,
    lifecycle: ChannelLifecycle,
    credit: Arc<ChannelCredit>,
    consumers: HashMap<String, Consumer>,
    unacked: BTreeMap<u64, Unacked>,
    next_delivery_tag: u64,
    /// Acquirer id for `basic.get`.
    get_acquirer: SubscriptionId,
    pending: Option<PendingPublish>,
    txn: TxnMode,
    last_queue: Option<String>,
}

impl Channel {
    pub fn new(id: u16, connection_id: u64) -> Self {
        Self {
            id,
            session: (connection_id << 16) | u64::from(id),
            lifecycle: ChannelLifecycle::default(),
            credit: Arc::new(ChannelCredit::new()),
            consumers: HashMap::new(),
            unacked: BTreeMap::new(),
            next_delivery_tag: 1,
            get_acquirer: next_subscription_id(),
            pending: None,
            txn: TxnMode::AutoCommit,
            last_queue: None,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn state(&self) -> ChannelState {
        self.lifecycle.state()
    }

    pub fn lifecycle(&self) -> &ChannelLifecycle {
        &self.lifecycle
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    pub fn unacked_count(&self) -> usize {
        self.unacked.len()
    }

    pub fn is_transactional(&self) -> bool {
        !matches!(self.txn, TxnMode::AutoCommit)
    }

    /// Handles one method addressed to this channel.
    pub async fn handle_method(
        &mut self,
        ctx: &ChannelContext<'_>,
        method: Method,
    ) -> Result<Vec<Outbound>, AmqpError> {
        match self.state() {
            ChannelState::Unopened | ChannelState::Closed => match method {
                Method::ChannelOpen { .. } => self.open(),
                Method::ChannelClose { .. } | Method::ChannelCloseOk
                    if self.state() == ChannelState::Closed =>
                {
                    Ok(Vec::new())
                }
                other => Err(AmqpError::connection(
                    ReplyCode::CommandInvalid,
                    format!("channel {} is not open", self.id),
                )
                .caused_by(&other)),
            },
            ChannelState::AwaitingCloseOk => match method {
                Method::ChannelClose { .. } => {
                    self.close(ctx.vhost);
                    Ok(vec![Outbound::Method(Method::ChannelCloseOk)])
                }
                Method::ChannelCloseOk => {
                    self.close(ctx.vhost);
                    Ok(Vec::new())
                }
                _ => Ok(Vec::new()),
            },
            ChannelState::Open => {
                let cause = method.clone();
                self.dispatch(ctx, method)
                    .await
                    .map_err(|e| e.caused_by(&cause))
            }
        }
    }

    fn open(&mut self) -> Result<Vec<Outbound>, AmqpError> {
        let reopened = self.state() == ChannelState::Closed;
        if !self
            .lifecycle
            .transition_to(self.state(), ChannelState::Open)
        {
            return Err(AmqpError::connection(
                ReplyCode::ChannelError,
                format!("channel {} is already open", self.id),
            ));
        }
        if reopened {
            self.reset();
        }
        Ok(vec![Outbound::Method(Method::ChannelOpenOk {
            channel_id: Bytes::new(),
        })])
    }

    fn reset(&mut self) {
        self.credit = Arc::new(ChannelCredit::new());
        self.next_delivery_tag = 1;
        self.txn = TxnMode::AutoCommit;
        self.last_queue = None;
    }

    async fn dispatch(
        &mut self,
        ctx: &ChannelContext<'_>,
        method: Method,
    ) -> Result<Vec<Outbound>, AmqpError> {
        if self.pending.is_some() {
            return Err(AmqpError::connection(
                ReplyCode::UnexpectedFrame,
                "method frame received while content was expected",
            ));
        }
        match method {
            Method::ChannelOpen { .. } => Err(AmqpError::connection(
                ReplyCode::ChannelError,
                format!("channel {} is already open", self.id),
            )),
            Method::ChannelFlow { active } => {
                self.credit.set_flow_active(active);
                if active {
                    self.resume_deliveries();
                }
                Ok(reply(Method::ChannelFlowOk { active }))
            }
            Method::ChannelClose { .. } => {
                self.close(ctx.vhost);
                Ok(reply(Method::ChannelCloseOk))
            }
            Method::ChannelCloseOk => Ok(Vec::new()),

            Method::ExchangeDeclare {
                exchange,
                kind,
                passive,
                durable,
                auto_delete,
                internal,
                no_wait,
                arguments,
                ..
            } => {
                let exchange_type = if passive && kind.is_empty() {
                    ExchangeType::Direct
                } else {
                    kind.parse::<ExchangeType>().map_err(|e| {
                        AmqpError::connection(ReplyCode::CommandInvalid, e.to_string())
                    })?
                };
                let config = ExchangeConfig::new(exchange, exchange_type)
                    .with_durable(durable)
                    .with_auto_delete(auto_delete)
                    .with_internal(internal)
                    .with_arguments(arguments);
                ctx.vhost.declare_exchange(ctx.request, config, passive)?;
                Ok(reply_unless(no_wait, Method::ExchangeDeclareOk))
            }
            Method::ExchangeDelete {
                exchange,
                if_unused,
                no_wait,
                ..
            } => {
                ctx.vhost.delete_exchange(ctx.request, &exchange, if_unused)?;
                Ok(reply_unless(no_wait, Method::ExchangeDeleteOk))
            }

            Method::QueueDeclare {
                queue,
                passive,
                durable,
                exclusive,
                auto_delete,
                no_wait,
                arguments,
                ..
            } => {
                let config = QueueConfig::new(queue)
                    .with_durable(durable)
                    .with_exclusive(exclusive)
                    .with_auto_delete(auto_delete)
                    .with_arguments(arguments)?;
                let (queue, _) = ctx.vhost.declare_queue(ctx.request, config, passive)?;
                self.last_queue = Some(queue.name().to_string());
                Ok(reply_unless(
                    no_wait,
                    Method::QueueDeclareOk {
                        queue: queue.name().to_string(),
                        message_count: queue.message_count(),
                        consumer_count: queue.consumer_count(),
                    },
                ))
            }
            Method::QueueBind {
                queue,
                exchange,
                routing_key,
                no_wait,
                arguments,
                ..
            } => {
                let queue = self.resolve_queue_name(queue)?;
                let routing_key = if routing_key.is_empty() {
                    queue.clone()
                } else {
                    routing_key
                };
                ctx.vhost
                    .bind_queue(ctx.request, &exchange, &queue, &routing_key, arguments)?;
                Ok(reply_unless(no_wait, Method::QueueBindOk))
            }
            Method::QueueUnbind {
                queue,
                exchange,
                routing_key,
                ..
            } => {
                let queue = self.resolve_queue_name(queue)?;
                ctx.vhost
                    .unbind_queue(ctx.request, &exchange, &queue, &routing_key)?;
                Ok(reply(Method::QueueUnbindOk))
            }
            Method::QueuePurge { queue, no_wait, .. } => {
                let queue = self.resolve_queue_name(queue)?;
                let message_count = ctx.vhost.purge_queue(ctx.request, &queue)?;
                Ok(reply_unless(no_wait, Method::QueuePurgeOk { message_count }))
            }
            Method::QueueDelete {
                queue,
                if_unused,
                if_empty,
                no_wait,
                ..
            } => {
                let queue = self.resolve_queue_name(queue)?;
                let message_count =
                    ctx.vhost
                        .delete_queue(ctx.request, &queue, if_unused, if_empty)?;
                self.consumers.retain(|_, c| c.queue.name() != queue);
                Ok(reply_unless(no_wait, Method::QueueDeleteOk { message_count }))
            }

            Method::BasicQos { prefetch_count, .. } => {
                self.credit.set_prefetch_count(u32::from(prefetch_count));
                self.resume_deliveries();
                Ok(reply(Method::BasicQosOk))
            }
            Method::BasicConsume {
                queue,
                consumer_tag,
                no_ack,
                exclusive,
                no_wait,
                ..
            } => {
                let consumer_tag = self.consume(ctx, queue, consumer_tag, no_ack, exclusive)?;
                Ok(reply_unless(
                    no_wait,
                    Method::BasicConsumeOk { consumer_tag },
                ))
            }
            Method::BasicCancel {
                consumer_tag,
                no_wait,
            } => {
                self.cancel(ctx.vhost, &consumer_tag)?;
                Ok(reply_unless(no_wait, Method::BasicCancelOk { consumer_tag }))
            }
            Method::BasicPublish {
                exchange,
                routing_key,
                mandatory,
                immediate,
                ..
            } => {
                self.pending = Some(PendingPublish {
                    exchange,
                    routing_key,
                    mandatory,
                    immediate,
                    header: None,
                    body: BytesMut::new(),
                });
                Ok(Vec::new())
            }
            Method::BasicGet { queue, no_ack, .. } => self.get(ctx, queue, no_ack),
            Method::BasicAck {
                delivery_tag,
                multiple,
            } => {
                self.acknowledge(ctx, delivery_tag, multiple)?;
                Ok(Vec::new())
            }
            Method::BasicReject {
                delivery_tag,
                requeue,
            } => {
                self.reject(ctx, delivery_tag, false, requeue)?;
                Ok(Vec::new())
            }
            Method::BasicNack {
                delivery_tag,
                multiple,
                requeue,
            } => {
                self.reject(ctx, delivery_tag, multiple, requeue)?;
                Ok(Vec::new())
            }
            Method::BasicRecover { .. } => {
                self.requeue_unacked();
                Ok(reply(Method::BasicRecoverOk))
            }

            Method::TxSelect => {
                if matches!(self.txn, TxnMode::Distributed(_)) {
                    return Err(AmqpError::channel(
                        ReplyCode::PreconditionFailed,
                        "channel is already dtx-selected",
                    ));
                }
                if !matches!(self.txn, TxnMode::Local(_)) {
                    self.txn =
                        TxnMode::Local(LocalTransaction::new(Arc::clone(ctx.vhost.message_store())));
                }
                Ok(reply(Method::TxSelectOk))
            }
            Method::TxCommit => {
                let TxnMode::Local(txn) = &mut self.txn else {
                    return Err(not_transactional());
                };
                txn.commit_async().await?;
                self.resume_deliveries();
                Ok(reply(Method::TxCommitOk))
            }
            Method::TxRollback => {
                let TxnMode::Local(txn) = &mut self.txn else {
                    return Err(not_transactional());
                };
                txn.rollback();
                Ok(reply(Method::TxRollbackOk))
            }

            Method::DtxSelect => {
                if matches!(self.txn, TxnMode::Local(_)) {
                    return Err(AmqpError::channel(
                        ReplyCode::PreconditionFailed,
                        "channel is already tx-selected",
                    ));
                }
                if !matches!(self.txn, TxnMode::Distributed(_)) {
                    self.txn = TxnMode::Distributed(None);
                }
                Ok(reply(Method::DtxSelectOk))
            }
            Method::DtxStart { xid, join, resume } => {
                let TxnMode::Distributed(current) = &mut self.txn else {
                    return Err(not_dtx_selected());
                };
                if current.is_some() {
                    return Err(AmqpError::channel(
                        ReplyCode::PreconditionFailed,
                        "channel is already associated with a dtx branch",
                    ));
                }
                let branch = ctx.vhost.dtx_registry().start(
                    &xid,
                    ctx.vhost.message_store(),
                    self.session,
                    join,
                    resume,
                )?;
                *current = Some(BranchTransaction::new(branch));
                Ok(reply(Method::DtxStartOk {
                    status: XaStatus::XaOk,
                }))
            }
            Method::DtxEnd { xid, fail, suspend } => {
                let TxnMode::Distributed(current) = &mut self.txn else {
                    return Err(not_dtx_selected());
                };
                ctx.vhost
                    .dtx_registry()
                    .end(&xid, self.session, fail, suspend)?;
                if current.as_ref().is_some_and(|t| t.branch().xid() == &xid) {
                    *current = None;
                }
                let status = if fail {
                    XaStatus::XaRbRollback
                } else {
                    XaStatus::XaOk
                };
                Ok(reply(Method::DtxEndOk { status }))
            }
            Method::DtxPrepare { xid } => {
                self.require_dtx()?;
                let status = xa_outcome(ctx.vhost.dtx_registry().prepare(&xid))?;
                Ok(reply(Method::DtxPrepareOk { status }))
            }
            Method::DtxCommit { xid, one_phase } => {
                self.require_dtx()?;
                let registry = ctx.vhost.dtx_registry();
                let result = registry.commit(&xid, one_phase);
                if matches!(result, Err(DtxError::RollbackOnly(_))) {
                    registry.rollback(&xid)?;
                }
                let status = xa_outcome(result)?;
                self.resume_deliveries();
                Ok(reply(Method::DtxCommitOk { status }))
            }
            Method::DtxRollback { xid } => {
                self.require_dtx()?;
                ctx.vhost.dtx_registry().rollback(&xid)?;
                Ok(reply(Method::DtxRollbackOk {
                    status: XaStatus::XaOk,
                }))
            }
            Method::DtxForget { xid } => {
                self.require_dtx()?;
                ctx.vhost.dtx_registry().forget(&xid)?;
                Ok(reply(Method::DtxForgetOk))
            }
            Method::DtxRecover => {
                self.require_dtx()?;
                let xids: Vec<Xid> = ctx.vhost.dtx_registry().prepared_xids();
                Ok(reply(Method::DtxRecoverOk { xids }))
            }

            other => Err(AmqpError::connection(
                ReplyCode::CommandInvalid,
                format!("unexpected method {:?} on channel {}", other.ids(), self.id),
            )),
        }
    }

    fn require_dtx(&self) -> Result<(), AmqpError> {
        match self.txn {
            TxnMode::Distributed(_) => Ok(()),
            _ => Err(not_dtx_selected()),
        }
    }

    /// An empty queue name means the queue last declared on this channel.
    fn resolve_queue_name(&self, name: String) -> Result<String, AmqpError> {
        if !name.is_empty() {
            return Ok(name);
        }
        self.last_queue.clone().ok_or_else(|| {
            AmqpError::channel(ReplyCode::NotFound, "no queue declared on this channel")
        })
    }

    fn consume(
        &mut self,
        ctx: &ChannelContext<'_>,
        queue_name: String,
        consumer_tag: String,
        no_ack: bool,
        exclusive: bool,
    ) -> Result<String, AmqpError> {
        let queue_name = self.resolve_queue_name(queue_name)?;
        let queue = ctx.vhost.lookup_queue(ctx.request, &queue_name)?;
        ctx.vhost
            .authorize(ctx.request, ResourceType::Queue, &queue_name, Operation::Consume)?;

        let consumer_tag = if consumer_tag.is_empty() {
            format!("amq.ctag-{}", Uuid::new_v4())
        } else {
            consumer_tag
        };
        if self.consumers.contains_key(&consumer_tag) {
            return Err(AmqpError::connection(
                ReplyCode::NotAllowed,
                format!("consumer tag '{consumer_tag}' is already in use"),
            ));
        }
        let subscriptions = queue.subscriptions().snapshot();
        if subscriptions.iter().any(|s| s.is_exclusive()) {
            return Err(AmqpError::channel(
                ReplyCode::AccessRefused,
                format!("queue '{queue_name}' has an exclusive consumer"),
            ));
        }
        if exclusive && !subscriptions.is_empty() {
            return Err(AmqpError::channel(
                ReplyCode::AccessRefused,
                format!("queue '{queue_name}' already has consumers"),
            ));
        }

        let subscription = Arc::new(LocalSubscription::new(
            consumer_tag.clone(),
            self.id,
            queue_name.as_str(),
            no_ack,
            exclusive,
            Arc::clone(&self.credit),
            ctx.deliveries.clone(),
        ));
        queue.add_subscription(Arc::clone(&subscription) as Arc<dyn Subscription>);
        info!(
            channel = self.id,
            queue = %queue_name,
            consumer_tag = %consumer_tag,
            no_ack,
            exclusive,
            "Consumer registered"
        );
        self.consumers.insert(
            consumer_tag.clone(),
            Consumer {
                subscription,
                queue,
            },
        );
        Ok(consumer_tag)
    }

    fn cancel(&mut self, vhost: &VirtualHost, consumer_tag: &str) -> Result<(), AmqpError> {
        let consumer = self.consumers.remove(consumer_tag).ok_or_else(|| {
            AmqpError::channel(
                ReplyCode::NotFound,
                format!("unknown consumer tag '{consumer_tag}'"),
            )
        })?;
        detach(vhost, &consumer);
        debug!(channel = self.id, consumer_tag = %consumer_tag, "Consumer cancelled");
        Ok(())
    }

    fn get(
        &mut self,
        ctx: &ChannelContext<'_>,
        queue_name: String,
        no_ack: bool,
    ) -> Result<Vec<Outbound>, AmqpError> {
        let queue_name = self.resolve_queue_name(queue_name)?;
        let queue = ctx.vhost.lookup_queue(ctx.request, &queue_name)?;
        ctx.vhost
            .authorize(ctx.request, ResourceType::Queue, &queue_name, Operation::Consume)?;

        let Some(entry) = queue.acquire_next(self.get_acquirer) else {
            return Ok(reply(Method::BasicGetEmpty {
                cluster_id: String::new(),
            }));
        };
        if no_ack {
            if let Err(e) = queue.acknowledge(&entry) {
                queue.release(&entry);
                return Err(e.into());
            }
        }
        let delivery_tag = self.next_tag();
        let message_count = queue.message_count();
        let outbound = content(
            Method::BasicGetOk {
                delivery_tag,
                redelivered: entry.is_redelivered(),
                exchange: entry.message().exchange().to_string(),
                routing_key: entry.message().routing_key().to_string(),
                message_count,
            },
            &entry,
        );
        if !no_ack {
            self.unacked.insert(
                delivery_tag,
                Unacked {
                    queue,
                    entry,
                    subscription: None,
                },
            );
        }
        ctx.vhost.metrics().throughput.record_delivered();
        Ok(vec![outbound])
    }

    /// Turns a delivery from one of this channel's consumers into a
    /// `basic.deliver`. Returns `None` if the channel can no longer take it,
    /// in which case the entry goes back on its queue.
    pub fn deliver(&mut self, vhost: &VirtualHost, delivery: Delivery) -> Option<Outbound> {
        let subscription = self
            .consumers
            .get(&delivery.consumer_tag)
            .filter(|c| c.subscription.id() == delivery.subscription_id)
            .map(|c| Arc::clone(&c.subscription));
        let subscription = match subscription {
            Some(subscription) if self.state() == ChannelState::Open => subscription,
            other => {
                match other {
                    Some(subscription) => subscription.settle(),
                    None if delivery.ack_required => self.credit.release(),
                    None => {}
                }
                delivery.queue.release(&delivery.entry);
                return None;
            }
        };

        if !delivery.ack_required {
            if let Err(e) = delivery.queue.acknowledge(&delivery.entry) {
                warn!(
                    queue = %delivery.queue.name(),
                    error = %e,
                    "Failed to settle no-ack delivery, returning it to the queue"
                );
                subscription.settle();
                delivery.queue.release(&delivery.entry);
                return None;
            }
        }

        let delivery_tag = self.next_tag();
        let outbound = content(
            Method::BasicDeliver {
                consumer_tag: delivery.consumer_tag.clone(),
                delivery_tag,
                redelivered: delivery.entry.is_redelivered(),
                exchange: delivery.entry.message().exchange().to_string(),
                routing_key: delivery.entry.message().routing_key().to_string(),
            },
            &delivery.entry,
        );
        if delivery.ack_required {
            self.unacked.insert(
                delivery_tag,
                Unacked {
                    queue: delivery.queue,
                    entry: delivery.entry,
                    subscription: Some(subscription),
                },
            );
        } else {
            subscription.settle();
        }
        vhost.metrics().throughput.record_delivered();
        Some(outbound)
    }

    fn next_tag(&mut self) -> u64 {
        let tag = self.next_delivery_tag;
        self.next_delivery_tag += 1;
        tag
    }

    /// Removes the deliveries named by an ack/nack/reject.
    fn take_unacked(&mut self, delivery_tag: u64, multiple: bool) -> Result<Vec<Unacked>, AmqpError> {
        if multiple {
            let upper = if delivery_tag == 0 {
                u64::MAX
            } else {
                delivery_tag
            };
            let tags: Vec<u64> = self.unacked.range(..=upper).map(|(t, _)| *t).collect();
            return Ok(tags
                .into_iter()
                .filter_map(|t| self.unacked.remove(&t))
                .collect());
        }
        self.unacked
            .remove(&delivery_tag)
            .map(|u| vec![u])
            .ok_or_else(|| {
                AmqpError::channel(
                    ReplyCode::PreconditionFailed,
                    format!("unknown delivery tag {delivery_tag}"),
                )
            })
    }

    fn acknowledge(
        &mut self,
        ctx: &ChannelContext<'_>,
        delivery_tag: u64,
        multiple: bool,
    ) -> Result<(), AmqpError> {
        let mut settled = self.take_unacked(delivery_tag, multiple)?.into_iter();
        let mut count = 0;
        while let Some(unacked) = settled.next() {
            if let Some(subscription) = &unacked.subscription {
                subscription.settle();
            }
            let (queue, entry) = (Arc::clone(&unacked.queue), Arc::clone(&unacked.entry));
            let failure = match self.with_transaction(ctx.vhost, |txn| {
                txn.add(TxnAction::Dequeue {
                    queue: unacked.queue,
                    entry: unacked.entry,
                })
            }) {
                Ok(Ok(())) => None,
                // The failed action released its own entry.
                Ok(Err(e)) => Some(AmqpError::from(e)),
                Err(e) => {
                    queue.release(&entry);
                    Some(e)
                }
            };
            if let Some(e) = failure {
                for rest in settled.by_ref() {
                    if let Some(subscription) = &rest.subscription {
                        subscription.settle();
                    }
                    rest.queue.release(&rest.entry);
                }
                ctx.vhost.metrics().throughput.record_acknowledged(count);
                self.resume_deliveries();
                return Err(e);
            }
            count += 1;
        }
        ctx.vhost.metrics().throughput.record_acknowledged(count);
        self.resume_deliveries();
        Ok(())
    }

    fn reject(
        &mut self,
        ctx: &ChannelContext<'_>,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        let rejected = self.take_unacked(delivery_tag, multiple)?;
        for unacked in rejected {
            if let Some(subscription) = &unacked.subscription {
                subscription.settle();
            }
            if requeue {
                unacked.queue.release(&unacked.entry);
            } else if let DeadLetterOutcome::Routed(_) = unacked.queue.dead_letter(&unacked.entry)
            {
                ctx.vhost.metrics().routing.record_dead_lettered();
            }
        }
        self.resume_deliveries();
        Ok(())
    }

    /// Puts every unacknowledged delivery back on its queue, oldest first.
    fn requeue_unacked(&mut self) -> usize {
        let unacked = std::mem::take(&mut self.unacked);
        let count = unacked.len();
        for (_, unacked) in unacked {
            if let Some(subscription) = &unacked.subscription {
                subscription.settle();
            }
            unacked.queue.release(&unacked.entry);
        }
        count
    }

    fn with_transaction<R>(
        &mut self,
        vhost: &VirtualHost,
        f: impl FnOnce(&mut dyn ServerTransaction) -> R,
    ) -> Result<R, AmqpError> {
        match &mut self.txn {
            TxnMode::AutoCommit => {
                let mut txn = AutoCommitTransaction::new(Arc::clone(vhost.message_store()));
                Ok(f(&mut txn))
            }
            TxnMode::Local(txn) => Ok(f(txn)),
            TxnMode::Distributed(Some(txn)) => Ok(f(txn)),
            TxnMode::Distributed(None) => Err(AmqpError::channel(
                ReplyCode::PreconditionFailed,
                "no dtx branch is associated with the channel",
            )),
        }
    }

    /// Wakes the queues this channel consumes from, e.g. after credit was
    /// returned.
    fn resume_deliveries(&self) {
        for consumer in self.consumers.values() {
            consumer.queue.deliver();
        }
    }

    /// Accepts a content header for the publish in progress.
    pub fn handle_header(&mut self, header: ContentHeader) -> Result<(), AmqpError> {
        if self.state() != ChannelState::Open {
            return Ok(());
        }
        let pending = self
            .pending
            .as_mut()
            .filter(|p| p.header.is_none())
            .ok_or_else(|| {
                AmqpError::connection(ReplyCode::UnexpectedFrame, "unexpected content header")
            })?;
        pending.body.reserve(header.body_size.min(1 << 20) as usize);
        pending.header = Some(header);
        Ok(())
    }

    /// Accepts a body frame; returns `true` once the message is complete.
    pub fn handle_body(&mut self, chunk: Bytes) -> Result<bool, AmqpError> {
        if self.state() != ChannelState::Open {
            return Ok(false);
        }
        let pending = self.pending.as_mut().ok_or_else(|| {
            AmqpError::connection(ReplyCode::UnexpectedFrame, "unexpected content body")
        })?;
        let expected = match &pending.header {
            Some(header) => header.body_size,
            None => {
                return Err(AmqpError::connection(
                    ReplyCode::UnexpectedFrame,
                    "content body received before its header",
                ))
            }
        };
        pending.body.extend_from_slice(&chunk);
        let received = pending.body.len() as u64;
        if received > expected {
            return Err(AmqpError::connection(
                ReplyCode::FrameError,
                format!("content body of {received} bytes exceeds declared size {expected}"),
            ));
        }
        Ok(received == expected)
    }

    /// Whether the publish in progress has its header and full body.
    pub fn has_complete_message(&self) -> bool {
        self.pending.as_ref().is_some_and(|p| {
            p.header
                .as_ref()
                .is_some_and(|h| h.body_size == p.body.len() as u64)
        })
    }

    /// Routes the assembled message. A mandatory or immediate message that
    /// cannot be delivered comes back as a `basic.return`.
    pub fn complete_publish(&mut self, ctx: &ChannelContext<'_>) -> Result<Vec<Outbound>, AmqpError> {
        let Some(pending) = self.pending.take() else {
            return Ok(Vec::new());
        };
        let properties = pending
            .header
            .map(|h| h.properties)
            .unwrap_or_default();
        let body = pending.body.freeze();
        let request = PublishRequest {
            exchange: pending.exchange.clone(),
            routing_key: pending.routing_key.clone(),
            mandatory: pending.mandatory,
            immediate: pending.immediate,
            properties: properties.clone(),
            body: body.clone(),
        };

        let outcome = self.with_transaction(ctx.vhost, |txn| {
            ctx.vhost.publish(ctx.request, request, txn)
        })??;
        match outcome {
            PublishOutcome::Returned {
                reply_code,
                reply_text,
            } => Ok(vec![Outbound::Content {
                method: Method::BasicReturn {
                    reply_code: reply_code.as_u16(),
                    reply_text,
                    exchange: pending.exchange,
                    routing_key: pending.routing_key,
                },
                properties,
                body,
            }]),
            PublishOutcome::Routed(_) | PublishOutcome::Dropped => Ok(Vec::new()),
        }
    }

    /// Sends `channel.close` from the broker side: Open → AwaitingCloseOk and
    /// releases everything the channel holds. Returns `false` if the channel
    /// was no longer open.
    pub fn begin_close(&mut self, vhost: &VirtualHost) -> bool {
        if !self.lifecycle.begin_close() {
            return false;
        }
        self.release_resources(vhost);
        true
    }

    /// Completes a close, releasing everything not already released.
    pub fn close(&mut self, vhost: &VirtualHost) -> bool {
        let was_open = self.state() == ChannelState::Open;
        if !self.lifecycle.complete_close() {
            return false;
        }
        if was_open {
            self.release_resources(vhost);
        }
        true
    }

    /// Cancels consumers, requeues unacknowledged deliveries and abandons
    /// open transactions.
    pub fn release_resources(&mut self, vhost: &VirtualHost) {
        self.pending = None;
        for (_, consumer) in self.consumers.drain() {
            detach(vhost, &consumer);
        }
        match std::mem::replace(&mut self.txn, TxnMode::AutoCommit) {
            TxnMode::Local(mut txn) => txn.rollback(),
            TxnMode::Distributed(_) => {
                vhost.dtx_registry().end_associations(self.session);
            }
            TxnMode::AutoCommit => {}
        }
        let requeued = self.requeue_unacked();
        debug!(channel = self.id, requeued, "Released channel resources");
    }
}

fn detach(vhost: &VirtualHost, consumer: &Consumer) {
    consumer.subscription.close();
    consumer
        .queue
        .remove_subscription(consumer.subscription.id());
    vhost.check_auto_delete(&consumer.queue);
}

fn content(method: Method, entry: &QueueEntry) -> Outbound {
    Outbound::Content {
        method,
        properties: entry.message().metadata().properties.clone(),
        body: entry.message().content().clone(),
    }
}

fn reply(method: Method) -> Vec<Outbound> {
    vec![Outbound::Method(method)]
}

fn reply_unless(no_wait: bool, method: Method) -> Vec<Outbound> {
    if no_wait {
        Vec::new()
    } else {
        reply(method)
    }
}

fn not_transactional() -> AmqpError {
    AmqpError::channel(ReplyCode::PreconditionFailed, "channel is not transactional")
}

fn not_dtx_selected() -> AmqpError {
    AmqpError::channel(ReplyCode::PreconditionFailed, "channel is not dtx-selected")
}

/// An XA outcome reported in the `-ok` reply, or a protocol error.
fn xa_outcome(result: Result<(), DtxError>) -> Result<XaStatus, AmqpError> {
    match result {
        Ok(()) => Ok(XaStatus::XaOk),
        Err(e) => e.xa_status().ok_or_else(|| e.into()),
    }
}
