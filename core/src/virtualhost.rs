//! # Virtual Hosts
//!
//! A virtual host owns one message store, the exchanges and queues declared
//! in it, and the distributed-transaction branches opened against it.
//!
//! ## Lifecycle
//!
//! `Initialising → Active → Stopped`. [`VirtualHost::start`] opens the store,
//! rebuilds durable exchanges, queues and bindings from the configuration
//! store, and then replays messages and prepared branches through
//! [`MessageStoreRecoverer`]. Connections are only admitted while `Active`.
//!
//! ## Authorization
//!
//! Every administrative operation and every publish takes a
//! [`RequestContext`] and is checked against the shared [`AclManager`]. A
//! denial surfaces as [`AdminError::Forbidden`] (`ACCESS_REFUSED`).

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::acl::{AclManager, Operation, ResourceType};
use crate::cluster::MemberHandle;
use crate::config::StoreType;
use crate::exchange::{
    Binding, Exchange, ExchangeConfig, ExchangeType, AMQ_DIRECT, AMQ_FANOUT, AMQ_MATCH, AMQ_TOPIC,
    DEFAULT_EXCHANGE,
};
use crate::message::{MessageMetaData, ServerMessage};
use crate::metrics::MetricsRegistry;
use crate::model::{AdminError, Deletable, EntityCategory, RequestContext, StatefulEntity};
use crate::protocol::{BasicProperties, FieldTable, ReplyCode};
use crate::queue::{Queue, QueueConfig, ARG_MAX_DELIVERY_COUNT};
use crate::storage::{
    ConfiguredObjectRecord, DurableConfigurationStore, JournalMessageStore, MemoryMessageStore,
    MessageStore, StoreResult, StoreSettings, StoredMessage,
};
use crate::transaction::{DtxRegistry, MessageStoreRecoverer, RecoveryReport, ServerTransaction, TxnAction};

#[derive(Debug, Clone)]
pub struct VirtualHostConfig {
    pub name: String,
    pub store_type: StoreType,
    pub store_settings: StoreSettings,
    /// Used for queues declared without a maximum delivery count.
    pub default_max_delivery_count: u32,
}

impl VirtualHostConfig {
    /// The leading `/` of `name` is dropped.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.trim_start_matches('/').to_string(),
            store_type: StoreType::Memory,
            store_settings: StoreSettings::default(),
            default_max_delivery_count: 0,
        }
    }

    pub fn with_store(mut self, store_type: StoreType, settings: StoreSettings) -> Self {
        self.store_type = store_type;
        self.store_settings = settings;
        self
    }

    pub fn with_default_max_delivery_count(mut self, count: u32) -> Self {
        self.default_max_delivery_count = count;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("virtual host name must not be empty".to_string());
        }
        if self.store_type == StoreType::Journal && self.store_settings.path.is_none() {
            return Err(format!(
                "virtual host '{}' uses a journal store without a path",
                self.name
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualHostState {
    Initialising,
    Active,
    Stopped,
}

/// A message as assembled from `basic.publish` and its content frames.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub immediate: bool,
    pub properties: BasicProperties,
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Enqueued (or buffered in the transaction) on this many queues.
    Routed(usize),
    /// To be sent back with `basic.return`.
    Returned { reply_code: ReplyCode, reply_text: String },
    /// Matched nothing and was not mandatory.
    Dropped,
}

pub struct VirtualHost {
    config: VirtualHostConfig,
    state: RwLock<VirtualHostState>,
    message_store: Arc<dyn MessageStore>,
    config_store: Arc<dyn DurableConfigurationStore>,
    exchanges: DashMap<String, Arc<Exchange>>,
    queues: DashMap<String, Arc<Queue>>,
    dtx_registry: DtxRegistry,
    acl: Arc<AclManager>,
    metrics: Arc<MetricsRegistry>,
}

impl VirtualHost {
    pub fn new<S>(
        config: VirtualHostConfig,
        store: Arc<S>,
        acl: Arc<AclManager>,
        metrics: Arc<MetricsRegistry>,
    ) -> Arc<Self>
    where
        S: MessageStore + DurableConfigurationStore + 'static,
    {
        let message_store: Arc<dyn MessageStore> = store.clone();
        let config_store: Arc<dyn DurableConfigurationStore> = store;
        let vhost = Arc::new(Self {
            config,
            state: RwLock::new(VirtualHostState::Initialising),
            message_store,
            config_store,
            exchanges: DashMap::new(),
            queues: DashMap::new(),
            dtx_registry: DtxRegistry::new(),
            acl,
            metrics,
        });
        vhost.predeclare_exchanges();
        vhost
    }

    /// Builds the store named by `config.store_type`.
    pub fn create(
        config: VirtualHostConfig,
        acl: Arc<AclManager>,
        metrics: Arc<MetricsRegistry>,
    ) -> Arc<Self> {
        match config.store_type {
            StoreType::Memory => Self::new(config, Arc::new(MemoryMessageStore::new()), acl, metrics),
            StoreType::Journal => {
                Self::new(config, Arc::new(JournalMessageStore::new()), acl, metrics)
            }
        }
    }

    fn predeclare_exchanges(&self) {
        let standard = [
            (DEFAULT_EXCHANGE, ExchangeType::Direct),
            (AMQ_DIRECT, ExchangeType::Direct),
            (AMQ_FANOUT, ExchangeType::Fanout),
            (AMQ_TOPIC, ExchangeType::Topic),
            (AMQ_MATCH, ExchangeType::Headers),
        ];
        for (name, exchange_type) in standard {
            let config = ExchangeConfig::new(name, exchange_type).with_durable(true);
            self.exchanges
                .insert(name.to_string(), Exchange::new(Uuid::new_v4(), config));
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &VirtualHostConfig {
        &self.config
    }

    pub fn is_active(&self) -> bool {
        self.state() == VirtualHostState::Active
    }

    pub fn message_store(&self) -> &Arc<dyn MessageStore> {
        &self.message_store
    }

    pub fn dtx_registry(&self) -> &DtxRegistry {
        &self.dtx_registry
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Opens the store and recovers configuration, then messages.
    pub async fn start(&self) -> StoreResult<RecoveryReport> {
        info!(virtual_host = %self.name(), "Starting virtual host");
        self.message_store
            .open_store(self.name(), &self.config.store_settings)?;
        self.recover_configuration()?;

        let queues: Vec<Arc<Queue>> = self.queues.iter().map(|q| Arc::clone(q.value())).collect();
        let report = MessageStoreRecoverer::new(
            Arc::clone(&self.message_store),
            queues,
            &self.dtx_registry,
        )
        .recover()
        .await?;

        self.set_state(VirtualHostState::Active);
        info!(
            virtual_host = %self.name(),
            exchanges = self.exchanges.len(),
            queues = self.queues.len(),
            "Virtual host active"
        );
        Ok(report)
    }

    pub fn stop(&self) -> StoreResult<()> {
        if self.state() == VirtualHostState::Stopped {
            return Ok(());
        }
        self.set_state(VirtualHostState::Stopped);
        for queue in self.queues.iter() {
            queue.subscriptions().clear();
        }
        self.message_store.close_store()?;
        info!(virtual_host = %self.name(), "Virtual host stopped");
        Ok(())
    }

    fn set_state(&self, new_state: VirtualHostState) {
        let mut state = self.state.write();
        debug!(
            virtual_host = %self.name(),
            old_state = ?*state,
            new_state = ?new_state,
            "Virtual host state transition"
        );
        *state = new_state;
    }

    fn recover_configuration(&self) -> StoreResult<()> {
        let mut records = Vec::new();
        self.config_store.visit_configured_objects(&mut |record| {
            records.push(record);
            true
        })?;

        let mut exchanges = Vec::new();
        let mut queues = Vec::new();
        let mut bindings = Vec::new();
        for record in records {
            match record {
                ConfiguredObjectRecord::Exchange { id, config } => exchanges.push((id, config)),
                ConfiguredObjectRecord::Queue { id, config } => queues.push((id, config)),
                binding @ ConfiguredObjectRecord::Binding { .. } => bindings.push(binding),
            }
        }

        for (id, config) in &exchanges {
            if self.exchanges.contains_key(&config.name) {
                warn!(exchange = %config.name, "Ignoring stored record for predeclared exchange");
                continue;
            }
            self.exchanges
                .insert(config.name.clone(), Exchange::new(*id, config.clone()));
        }
        for (_, config) in &exchanges {
            if let (Some(exchange), Some(alternate)) =
                (self.get_exchange(&config.name), &config.alternate_exchange)
            {
                exchange.set_alternate_exchange(self.get_exchange(alternate).as_ref());
            }
        }

        for (id, config) in queues {
            let alternate = config
                .alternate_exchange
                .as_deref()
                .and_then(|name| self.get_exchange(name));
            let queue = Queue::new(id, config, None, Arc::clone(&self.message_store));
            queue.set_alternate_exchange(alternate.as_ref());
            self.bind_default(&queue);
            debug!(queue = %queue.name(), id = %id, "Recovered queue");
            self.queues.insert(queue.name().to_string(), queue);
        }

        let mut recovered_bindings = 0;
        for record in bindings {
            let ConfiguredObjectRecord::Binding {
                id,
                exchange,
                queue,
                binding_key,
                arguments,
            } = record
            else {
                continue;
            };
            match (self.get_exchange(&exchange), self.get_queue(&queue)) {
                (Some(exchange), Some(queue)) => {
                    exchange.add_binding(Binding {
                        id,
                        binding_key,
                        queue,
                        arguments,
                    });
                    recovered_bindings += 1;
                }
                _ => {
                    warn!(
                        exchange = %exchange,
                        queue = %queue,
                        "Removing stored binding that references a missing exchange or queue"
                    );
                    self.config_store.remove(id)?;
                }
            }
        }

        info!(
            virtual_host = %self.name(),
            exchanges = exchanges.len(),
            queues = self.queues.len(),
            bindings = recovered_bindings,
            "Recovered durable configuration"
        );
        Ok(())
    }

    pub fn get_exchange(&self, name: &str) -> Option<Arc<Exchange>> {
        self.exchanges.get(name).map(|e| Arc::clone(e.value()))
    }

    pub fn get_queue(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.get(name).map(|q| Arc::clone(q.value()))
    }

    pub fn exchanges(&self) -> Vec<Arc<Exchange>> {
        self.exchanges.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn queues(&self) -> Vec<Arc<Queue>> {
        self.queues.iter().map(|q| Arc::clone(q.value())).collect()
    }

    pub fn authorize(
        &self,
        ctx: &RequestContext,
        resource_type: ResourceType,
        name: &str,
        operation: Operation,
    ) -> Result<(), AdminError> {
        let result = self.acl.authorize(
            &ctx.principal,
            resource_type,
            name,
            operation,
            ctx.remote_host.as_deref(),
        );
        if result.is_allowed() {
            Ok(())
        } else {
            Err(AdminError::Forbidden(format!(
                "{} may not {:?} {:?} '{}'",
                ctx.principal, operation, resource_type, name
            )))
        }
    }

    /// Checks that `ctx` may open a connection to this host.
    pub fn authorize_access(&self, ctx: &RequestContext) -> Result<(), AdminError> {
        self.authorize(ctx, ResourceType::VirtualHost, self.name(), Operation::Access)
    }

    /// Looks a queue up on behalf of `ctx`, honouring exclusive ownership.
    pub fn lookup_queue(&self, ctx: &RequestContext, name: &str) -> Result<Arc<Queue>, AdminError> {
        let queue = self
            .get_queue(name)
            .ok_or_else(|| AdminError::not_found(EntityCategory::Queue, name))?;
        if !queue.is_accessible_by(ctx.connection_id) {
            return Err(AdminError::Locked(format!(
                "queue '{name}' is exclusive to another connection"
            )));
        }
        Ok(queue)
    }

    pub fn declare_exchange(
        &self,
        ctx: &RequestContext,
        config: ExchangeConfig,
        passive: bool,
    ) -> Result<Arc<Exchange>, AdminError> {
        if passive {
            return self
                .get_exchange(&config.name)
                .ok_or_else(|| AdminError::not_found(EntityCategory::Exchange, &config.name));
        }
        config.validate()?;
        self.authorize(ctx, ResourceType::Exchange, &config.name, Operation::Create)?;

        if let Some(existing) = self.get_exchange(&config.name) {
            if existing.is_default() || !existing.config().is_equivalent(&config) {
                return Err(AdminError::Conflict(format!(
                    "exchange '{}' exists with different attributes",
                    config.name
                )));
            }
            return Ok(existing);
        }
        if config.name.starts_with("amq.") {
            return Err(AdminError::Forbidden(format!(
                "exchange names starting with 'amq.' are reserved: '{}'",
                config.name
            )));
        }

        let alternate = match &config.alternate_exchange {
            Some(name) => Some(
                self.get_exchange(name)
                    .ok_or_else(|| AdminError::not_found(EntityCategory::Exchange, name))?,
            ),
            None => None,
        };

        let exchange = Exchange::new(Uuid::new_v4(), config);
        exchange.set_alternate_exchange(alternate.as_ref());
        let winner = match self.exchanges.entry(exchange.name().to_string()) {
            dashmap::mapref::entry::Entry::Occupied(slot) => return Ok(Arc::clone(slot.get())),
            dashmap::mapref::entry::Entry::Vacant(slot) => Arc::clone(&slot.insert(exchange)),
        };
        if winner.is_durable() {
            if let Err(e) = self.config_store.create(ConfiguredObjectRecord::Exchange {
                id: winner.id(),
                config: winner.config().clone(),
            }) {
                self.exchanges.remove(winner.name());
                return Err(e.into());
            }
        }
        info!(
            virtual_host = %self.name(),
            exchange = %winner.name(),
            kind = %winner.exchange_type(),
            durable = winner.is_durable(),
            "Exchange declared"
        );
        Ok(winner)
    }

    pub fn delete_exchange(
        &self,
        ctx: &RequestContext,
        name: &str,
        if_unused: bool,
    ) -> Result<(), AdminError> {
        let exchange = self
            .get_exchange(name)
            .ok_or_else(|| AdminError::not_found(EntityCategory::Exchange, name))?;
        if exchange.is_reserved() {
            return Err(AdminError::Forbidden(format!(
                "exchange '{name}' cannot be deleted"
            )));
        }
        self.authorize(ctx, ResourceType::Exchange, name, Operation::Delete)?;
        if if_unused && exchange.has_bindings() {
            return Err(AdminError::Conflict(format!("exchange '{name}' has bindings")));
        }
        if self.is_alternate_in_use(&exchange) {
            return Err(AdminError::Conflict(format!(
                "exchange '{name}' is in use as an alternate exchange"
            )));
        }
        self.remove_exchange(&exchange)
    }

    fn is_alternate_in_use(&self, exchange: &Arc<Exchange>) -> bool {
        let refers = |alternate: Option<Arc<Exchange>>| {
            alternate.is_some_and(|a| Arc::ptr_eq(&a, exchange))
        };
        self.exchanges
            .iter()
            .any(|e| !Arc::ptr_eq(e.value(), exchange) && refers(e.alternate_exchange()))
            || self.queues.iter().any(|q| refers(q.alternate_exchange()))
    }

    fn remove_exchange(&self, exchange: &Arc<Exchange>) -> Result<(), AdminError> {
        if !exchange.mark_deleted() {
            return Ok(());
        }
        self.exchanges.remove(exchange.name());
        for binding in exchange.bindings() {
            if exchange.is_durable() && binding.queue.is_durable() {
                self.config_store.remove(binding.id)?;
            }
        }
        if exchange.is_durable() {
            self.config_store.remove(exchange.id())?;
        }
        info!(virtual_host = %self.name(), exchange = %exchange.name(), "Exchange deleted");
        Ok(())
    }

    /// Declares a queue; an empty name gets a generated one. Returns the queue
    /// and whether this call created it.
    pub fn declare_queue(
        &self,
        ctx: &RequestContext,
        mut config: QueueConfig,
        passive: bool,
    ) -> Result<(Arc<Queue>, bool), AdminError> {
        if passive {
            return self.lookup_queue(ctx, &config.name).map(|q| (q, false));
        }
        if config.name.is_empty() {
            config.name = format!("amq.gen-{}", Uuid::new_v4());
        }
        if config.max_delivery_count == 0 && !config.arguments.contains_key(ARG_MAX_DELIVERY_COUNT) {
            config.max_delivery_count = self.config.default_max_delivery_count;
        }
        config.validate()?;
        self.authorize(ctx, ResourceType::Queue, &config.name, Operation::Create)?;

        if let Some(existing) = self.get_queue(&config.name) {
            if !existing.is_accessible_by(ctx.connection_id) {
                return Err(AdminError::Locked(format!(
                    "queue '{}' is exclusive to another connection",
                    config.name
                )));
            }
            if !existing.config().is_equivalent(&config) {
                return Err(AdminError::Conflict(format!(
                    "queue '{}' exists with different attributes",
                    config.name
                )));
            }
            return Ok((existing, false));
        }

        let alternate = match &config.alternate_exchange {
            Some(name) => Some(
                self.get_exchange(name)
                    .ok_or_else(|| AdminError::not_found(EntityCategory::Exchange, name))?,
            ),
            None => None,
        };
        let owner = config.exclusive.then_some(ctx.connection_id);
        let queue = Queue::new(
            Uuid::new_v4(),
            config,
            owner,
            Arc::clone(&self.message_store),
        );
        queue.set_alternate_exchange(alternate.as_ref());

        let queue = match self.queues.entry(queue.name().to_string()) {
            dashmap::mapref::entry::Entry::Occupied(slot) => {
                return Ok((Arc::clone(slot.get()), false))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => Arc::clone(&slot.insert(queue)),
        };
        if queue.is_durable() {
            if let Err(e) = self.config_store.create(ConfiguredObjectRecord::Queue {
                id: queue.id(),
                config: queue.config().clone(),
            }) {
                self.queues.remove(queue.name());
                return Err(e.into());
            }
        }
        self.bind_default(&queue);
        info!(
            virtual_host = %self.name(),
            queue = %queue.name(),
            durable = queue.is_durable(),
            exclusive = queue.is_exclusive(),
            ordering = ?queue.config().ordering,
            "Queue declared"
        );
        Ok((queue, true))
    }

    fn bind_default(&self, queue: &Arc<Queue>) {
        if let Some(default) = self.get_exchange(DEFAULT_EXCHANGE) {
            default.add_binding(Binding {
                id: Uuid::new_v4(),
                binding_key: queue.name().to_string(),
                queue: Arc::clone(queue),
                arguments: FieldTable::new(),
            });
        }
    }

    /// Deletes a queue and returns the number of messages it held.
    pub fn delete_queue(
        &self,
        ctx: &RequestContext,
        name: &str,
        if_unused: bool,
        if_empty: bool,
    ) -> Result<u32, AdminError> {
        let queue = self.lookup_queue(ctx, name)?;
        self.authorize(ctx, ResourceType::Queue, name, Operation::Delete)?;
        if if_unused && queue.consumer_count() > 0 {
            return Err(AdminError::Conflict(format!("queue '{name}' has consumers")));
        }
        if if_empty && queue.message_count() > 0 {
            return Err(AdminError::Conflict(format!("queue '{name}' is not empty")));
        }
        self.remove_queue(&queue)
    }

    fn remove_queue(&self, queue: &Arc<Queue>) -> Result<u32, AdminError> {
        if self
            .queues
            .remove_if(queue.name(), |_, q| Arc::ptr_eq(q, queue))
            .is_none()
        {
            return Ok(0);
        }
        let mut emptied = Vec::new();
        for exchange in self.exchanges() {
            let removed = exchange.remove_bindings_for_queue(queue);
            if removed.is_empty() {
                continue;
            }
            if exchange.is_durable() && queue.is_durable() && !exchange.is_default() {
                for binding in &removed {
                    self.config_store.remove(binding.id)?;
                }
            }
            if exchange.config().auto_delete && !exchange.has_bindings() {
                emptied.push(exchange);
            }
        }
        if queue.is_durable() {
            self.config_store.remove(queue.id())?;
        }
        let messages = queue.delete()?;
        for exchange in emptied {
            if !self.is_alternate_in_use(&exchange) {
                self.remove_exchange(&exchange)?;
            }
        }
        info!(
            virtual_host = %self.name(),
            queue = %queue.name(),
            messages,
            "Queue deleted"
        );
        Ok(messages)
    }

    pub fn purge_queue(&self, ctx: &RequestContext, name: &str) -> Result<u32, AdminError> {
        let queue = self.lookup_queue(ctx, name)?;
        self.authorize(ctx, ResourceType::Queue, name, Operation::Purge)?;
        Ok(queue.purge()?)
    }

    pub fn bind_queue(
        &self,
        ctx: &RequestContext,
        exchange_name: &str,
        queue_name: &str,
        binding_key: &str,
        arguments: FieldTable,
    ) -> Result<(), AdminError> {
        let exchange = self.bindable_exchange(exchange_name)?;
        let queue = self.lookup_queue(ctx, queue_name)?;
        self.authorize(ctx, ResourceType::Exchange, exchange_name, Operation::Bind)?;

        let binding = Binding {
            id: Uuid::new_v4(),
            binding_key: binding_key.to_string(),
            queue: Arc::clone(&queue),
            arguments: arguments.clone(),
        };
        let id = binding.id;
        if !exchange.add_binding(binding) {
            return Ok(());
        }
        if exchange.is_durable() && queue.is_durable() {
            if let Err(e) = self.config_store.create(ConfiguredObjectRecord::Binding {
                id,
                exchange: exchange_name.to_string(),
                queue: queue_name.to_string(),
                binding_key: binding_key.to_string(),
                arguments,
            }) {
                exchange.remove_binding(binding_key, &queue);
                return Err(e.into());
            }
        }
        debug!(
            exchange = %exchange_name,
            queue = %queue_name,
            binding_key = %binding_key,
            "Queue bound"
        );
        Ok(())
    }

    /// Removing a binding that does not exist succeeds.
    pub fn unbind_queue(
        &self,
        ctx: &RequestContext,
        exchange_name: &str,
        queue_name: &str,
        binding_key: &str,
    ) -> Result<(), AdminError> {
        let exchange = self.bindable_exchange(exchange_name)?;
        let queue = self.lookup_queue(ctx, queue_name)?;
        self.authorize(ctx, ResourceType::Exchange, exchange_name, Operation::Unbind)?;

        if let Some(binding) = exchange.remove_binding(binding_key, &queue) {
            if exchange.is_durable() && queue.is_durable() {
                self.config_store.remove(binding.id)?;
            }
            if exchange.config().auto_delete
                && !exchange.has_bindings()
                && !self.is_alternate_in_use(&exchange)
            {
                self.remove_exchange(&exchange)?;
            }
        }
        Ok(())
    }

    fn bindable_exchange(&self, name: &str) -> Result<Arc<Exchange>, AdminError> {
        let exchange = self
            .get_exchange(name)
            .ok_or_else(|| AdminError::not_found(EntityCategory::Exchange, name))?;
        if exchange.is_default() {
            return Err(AdminError::Forbidden(
                "bindings on the default exchange cannot be changed".to_string(),
            ));
        }
        Ok(exchange)
    }

    /// Routes a published message and hands one enqueue per matched queue to
    /// `txn`.
    pub fn publish(
        &self,
        ctx: &RequestContext,
        request: PublishRequest,
        txn: &mut dyn ServerTransaction,
    ) -> Result<PublishOutcome, AdminError> {
        let exchange = self
            .get_exchange(&request.exchange)
            .ok_or_else(|| AdminError::not_found(EntityCategory::Exchange, &request.exchange))?;
        if exchange.config().internal {
            return Err(AdminError::Forbidden(format!(
                "cannot publish to internal exchange '{}'",
                request.exchange
            )));
        }
        self.authorize(ctx, ResourceType::Exchange, &request.exchange, Operation::Publish)?;

        let metadata = MessageMetaData::new(
            request.exchange.as_str(),
            request.routing_key.as_str(),
            request.properties,
            request.body.len() as u64,
        );
        self.metrics.throughput.record_published(request.body.len() as u64);

        let queues = exchange.route_with_alternates(&metadata);
        if queues.is_empty() {
            if request.mandatory {
                self.metrics.routing.record_returned();
                return Ok(PublishOutcome::Returned {
                    reply_code: ReplyCode::NoRoute,
                    reply_text: "NO_ROUTE".to_string(),
                });
            }
            self.metrics.routing.record_unroutable();
            debug!(
                exchange = %request.exchange,
                routing_key = %request.routing_key,
                "Dropping unroutable message"
            );
            return Ok(PublishOutcome::Dropped);
        }
        if request.immediate && !queues.iter().any(|q| q.has_ready_consumer()) {
            self.metrics.routing.record_returned();
            return Ok(PublishOutcome::Returned {
                reply_code: ReplyCode::NoConsumers,
                reply_text: "NO_CONSUMERS".to_string(),
            });
        }

        let message = self.create_message(metadata, request.body, &queues)?;
        // Held until every queue has its reference; the last drop removes an
        // unrouted message.
        let guard = message.new_reference();
        let mut routed = 0;
        let mut failure = None;
        for queue in &queues {
            let action = TxnAction::Enqueue {
                queue: Arc::clone(queue),
                message: message.new_reference(),
            };
            match txn.add(action) {
                Ok(()) => routed += 1,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        drop(guard);
        if let Some(e) = failure {
            warn!(
                message_id = message.message_number(),
                error = %e,
                "Failed to enqueue published message"
            );
            return Err(AdminError::Invalid(e.to_string()));
        }
        Ok(PublishOutcome::Routed(routed))
    }

    fn create_message(
        &self,
        metadata: MessageMetaData,
        body: Bytes,
        queues: &[Arc<Queue>],
    ) -> Result<ServerMessage, AdminError> {
        if metadata.is_persistent() && queues.iter().any(|q| q.is_durable()) {
            let stored = self.message_store.add_message(metadata, body)?;
            return Ok(ServerMessage::stored(stored, Arc::clone(&self.message_store)));
        }
        Ok(ServerMessage::transient(StoredMessage {
            message_number: self.message_store.next_message_number(),
            metadata: Arc::new(metadata),
            content: body,
        }))
    }

    /// Deletes the queue once its auto-delete condition holds.
    pub fn check_auto_delete(&self, queue: &Arc<Queue>) {
        if queue.should_auto_delete() {
            match self.remove_queue(queue) {
                Ok(messages) => debug!(queue = %queue.name(), messages, "Auto-deleted queue"),
                Err(e) => warn!(queue = %queue.name(), error = %e, "Auto-delete failed"),
            }
        }
    }

    /// Drops the exclusive queues owned by a closing connection.
    pub fn connection_closed(&self, connection_id: u64) -> usize {
        let owned: Vec<Arc<Queue>> = self
            .queues
            .iter()
            .filter(|q| q.owner() == Some(connection_id))
            .map(|q| Arc::clone(q.value()))
            .collect();
        for queue in &owned {
            if let Err(e) = self.remove_queue(queue) {
                warn!(queue = %queue.name(), error = %e, "Failed to delete exclusive queue");
            }
        }
        owned.len()
    }

    /// Detaches every remote subscription of a peer that left the cluster.
    pub fn remove_member(&self, peer: &MemberHandle) -> usize {
        let removed: usize = self
            .queues
            .iter()
            .map(|q| q.remove_remote_subscriptions(peer))
            .sum();
        if removed > 0 {
            info!(peer = %peer, subscriptions = removed, "Removed subscriptions of departed peer");
        }
        removed
    }

    pub fn prune_orphaned_subscriptions(&self) -> usize {
        self.queues
            .iter()
            .map(|q| q.prune_orphaned_subscriptions())
            .sum()
    }

    /// Queue name to message count, for diagnostics.
    pub fn queue_depths(&self) -> HashMap<String, u32> {
        self.queues
            .iter()
            .map(|q| (q.key().clone(), q.message_count()))
            .collect()
    }
}

impl StatefulEntity for VirtualHost {
    type State = VirtualHostState;

    fn state(&self) -> VirtualHostState {
        *self.state.read()
    }
}

impl fmt::Debug for VirtualHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualHost")
            .field("name", &self.config.name)
            .field("state", &self.state())
            .field("exchanges", &self.exchanges.len())
            .field("queues", &self.queues.len())
            .finish()
    }
}

#[cfg(test)]
mod tests;
