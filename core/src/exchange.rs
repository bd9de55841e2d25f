//! Exchanges and bindings.
//!
//! An exchange maps a message's routing key and headers onto the set of
//! queues bound to it. Four matching rules are supported:
//!
//! - `direct`: binding key equals routing key
//! - `fanout`: every binding matches
//! - `topic`: dot-separated words, `*` matches one word and `#` zero or more
//! - `headers`: binding arguments compared with message headers under
//!   `x-match` = `all` (default) or `any`
//!
//! When nothing matches, [`Exchange::route_with_alternates`] follows the
//! alternate exchange chain, visiting each exchange at most once.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::trace;
use uuid::Uuid;

use crate::message::MessageMetaData;
use crate::model::{AdminError, Deletable, Routable};
use crate::protocol::{FieldTable, FieldValue};
use crate::queue::Queue;

pub const DEFAULT_EXCHANGE: &str = "";
pub const AMQ_DIRECT: &str = "amq.direct";
pub const AMQ_FANOUT: &str = "amq.fanout";
pub const AMQ_TOPIC: &str = "amq.topic";
pub const AMQ_MATCH: &str = "amq.match";

const X_MATCH: &str = "x-match";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExchangeType {
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl ExchangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Fanout => "fanout",
            Self::Topic => "topic",
            Self::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeType {
    type Err = AdminError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(Self::Direct),
            "fanout" => Ok(Self::Fanout),
            "topic" => Ok(Self::Topic),
            "headers" | "match" => Ok(Self::Headers),
            other => Err(AdminError::Invalid(format!("unknown exchange type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeConfig {
    pub name: String,
    pub exchange_type: ExchangeType,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub alternate_exchange: Option<String>,
    pub arguments: FieldTable,
}

impl ExchangeConfig {
    pub fn new(name: impl Into<String>, exchange_type: ExchangeType) -> Self {
        Self {
            name: name.into(),
            exchange_type,
            durable: false,
            auto_delete: false,
            internal: false,
            alternate_exchange: None,
            arguments: FieldTable::new(),
        }
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn with_auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn with_internal(mut self, internal: bool) -> Self {
        self.internal = internal;
        self
    }

    pub fn with_alternate_exchange(mut self, name: impl Into<String>) -> Self {
        self.alternate_exchange = Some(name.into());
        self
    }

    pub fn with_arguments(mut self, arguments: FieldTable) -> Self {
        if let Some(alternate) = arguments
            .get("alternate-exchange")
            .and_then(FieldValue::as_text)
        {
            self.alternate_exchange = Some(alternate);
        }
        self.arguments = arguments;
        self
    }

    pub fn validate(&self) -> Result<(), AdminError> {
        if self.name.len() > 255 {
            return Err(AdminError::Invalid("exchange name exceeds 255 bytes".to_string()));
        }
        if self.alternate_exchange.as_deref() == Some(self.name.as_str()) {
            return Err(AdminError::Invalid(format!(
                "exchange '{}' cannot be its own alternate",
                self.name
            )));
        }
        Ok(())
    }

    /// Whether a redeclare with `other` may proceed.
    pub fn is_equivalent(&self, other: &ExchangeConfig) -> bool {
        self.exchange_type == other.exchange_type
            && self.durable == other.durable
            && self.auto_delete == other.auto_delete
            && self.internal == other.internal
    }
}

/// A binding from an exchange to a queue.
#[derive(Clone)]
pub struct Binding {
    pub id: Uuid,
    pub binding_key: String,
    pub queue: Arc<Queue>,
    pub arguments: FieldTable,
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("id", &self.id)
            .field("binding_key", &self.binding_key)
            .field("queue", &self.queue.name())
            .finish()
    }
}

pub struct Exchange {
    id: Uuid,
    config: ExchangeConfig,
    bindings: RwLock<Vec<Binding>>,
    alternate: RwLock<Option<Weak<Exchange>>>,
    deleted: AtomicBool,
    routed: AtomicU64,
    unrouted: AtomicU64,
}

impl Exchange {
    pub fn new(id: Uuid, config: ExchangeConfig) -> Arc<Self> {
        Arc::new(Self {
            id,
            config,
            bindings: RwLock::new(Vec::new()),
            alternate: RwLock::new(None),
            deleted: AtomicBool::new(false),
            routed: AtomicU64::new(0),
            unrouted: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn exchange_type(&self) -> ExchangeType {
        self.config.exchange_type
    }

    pub fn config(&self) -> &ExchangeConfig {
        &self.config
    }

    pub fn is_durable(&self) -> bool {
        self.config.durable
    }

    pub fn is_default(&self) -> bool {
        self.config.name == DEFAULT_EXCHANGE
    }

    /// Predeclared exchanges cannot be deleted or redeclared differently.
    pub fn is_reserved(&self) -> bool {
        self.is_default() || self.config.name.starts_with("amq.")
    }

    pub fn set_alternate_exchange(&self, exchange: Option<&Arc<Exchange>>) {
        *self.alternate.write() = exchange.map(Arc::downgrade);
    }

    pub fn alternate_exchange(&self) -> Option<Arc<Exchange>> {
        self.alternate.read().as_ref().and_then(Weak::upgrade)
    }

    /// Adds a binding; returns `false` when an identical one already exists.
    pub fn add_binding(&self, binding: Binding) -> bool {
        let mut bindings = self.bindings.write();
        if bindings.iter().any(|b| {
            b.binding_key == binding.binding_key
                && Arc::ptr_eq(&b.queue, &binding.queue)
                && b.arguments == binding.arguments
        }) {
            return false;
        }
        trace!(
            exchange = %self.name(),
            queue = %binding.queue.name(),
            binding_key = %binding.binding_key,
            "Binding added"
        );
        bindings.push(binding);
        true
    }

    pub fn remove_binding(&self, binding_key: &str, queue: &Queue) -> Option<Binding> {
        let mut bindings = self.bindings.write();
        let index = bindings
            .iter()
            .position(|b| b.binding_key == binding_key && b.queue.id() == queue.id())?;
        Some(bindings.remove(index))
    }

    pub fn remove_bindings_for_queue(&self, queue: &Queue) -> Vec<Binding> {
        let mut bindings = self.bindings.write();
        let (removed, kept): (Vec<_>, Vec<_>) = bindings
            .drain(..)
            .partition(|b| b.queue.id() == queue.id());
        *bindings = kept;
        removed
    }

    pub fn find_binding(&self, binding_key: &str, queue: &Queue) -> Option<Binding> {
        self.bindings
            .read()
            .iter()
            .find(|b| b.binding_key == binding_key && b.queue.id() == queue.id())
            .cloned()
    }

    pub fn bindings(&self) -> Vec<Binding> {
        self.bindings.read().clone()
    }

    pub fn has_bindings(&self) -> bool {
        !self.bindings.read().is_empty()
    }

    pub fn is_bound_to(&self, queue: &Queue) -> bool {
        self.bindings.read().iter().any(|b| b.queue.id() == queue.id())
    }

    /// Routes through this exchange, then through the alternate chain while
    /// no queue matched.
    pub fn route_with_alternates(self: &Arc<Self>, metadata: &MessageMetaData) -> Vec<Arc<Queue>> {
        let mut visited = HashSet::new();
        let mut current = Some(Arc::clone(self));
        while let Some(exchange) = current {
            if !visited.insert(exchange.id()) {
                break;
            }
            let queues = exchange.route(metadata);
            if !queues.is_empty() {
                return queues;
            }
            current = exchange.alternate_exchange();
        }
        Vec::new()
    }

    pub fn routed_count(&self) -> u64 {
        self.routed.load(Ordering::Relaxed)
    }

    pub fn unrouted_count(&self) -> u64 {
        self.unrouted.load(Ordering::Relaxed)
    }

    fn matches(&self, binding: &Binding, metadata: &MessageMetaData) -> bool {
        match self.config.exchange_type {
            ExchangeType::Direct => binding.binding_key == metadata.routing_key,
            ExchangeType::Fanout => true,
            ExchangeType::Topic => topic_matches(&binding.binding_key, &metadata.routing_key),
            ExchangeType::Headers => headers_match(&binding.arguments, metadata),
        }
    }
}

impl Routable for Exchange {
    fn route(&self, metadata: &MessageMetaData) -> Vec<Arc<Queue>> {
        let bindings = self.bindings.read();
        let mut seen = HashSet::new();
        let queues: Vec<Arc<Queue>> = bindings
            .iter()
            .filter(|b| !b.queue.is_deleted() && self.matches(b, metadata))
            .filter(|b| seen.insert(b.queue.id()))
            .map(|b| Arc::clone(&b.queue))
            .collect();
        if queues.is_empty() {
            self.unrouted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.routed.fetch_add(1, Ordering::Relaxed);
        }
        queues
    }
}

impl Deletable for Exchange {
    fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    fn mark_deleted(&self) -> bool {
        !self.deleted.swap(true, Ordering::SeqCst)
    }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("id", &self.id)
            .field("name", &self.config.name)
            .field("type", &self.config.exchange_type)
            .finish()
    }
}

/// `*` matches exactly one word, `#` zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let words: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &words)
}

fn match_words(pattern: &[&str], words: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((&"#", rest)) => (0..=words.len()).any(|skip| match_words(rest, &words[skip..])),
        Some((&"*", rest)) => !words.is_empty() && match_words(rest, &words[1..]),
        Some((word, rest)) => words.first() == Some(word) && match_words(rest, &words[1..]),
    }
}

fn headers_match(arguments: &FieldTable, metadata: &MessageMetaData) -> bool {
    let match_any = arguments
        .get(X_MATCH)
        .and_then(FieldValue::as_text)
        .map(|mode| mode.eq_ignore_ascii_case("any"))
        .unwrap_or(false);

    let mut criteria = arguments.iter().filter(|(name, _)| !name.starts_with("x-")).peekable();
    if criteria.peek().is_none() {
        return !match_any;
    }
    let satisfied = |(name, expected): (&str, &FieldValue)| match metadata.header(name) {
        None => false,
        Some(_) if *expected == FieldValue::Void => true,
        Some(actual) => {
            actual == expected
                || matches!((actual.as_text(), expected.as_text()), (Some(a), Some(b)) if a == b)
        }
    };
    if match_any {
        criteria.any(satisfied)
    } else {
        criteria.all(satisfied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::BasicProperties;
    use crate::queue::QueueConfig;
    use crate::storage::MemoryMessageStore;

    fn queue(name: &str) -> Arc<Queue> {
        Queue::new(
            Uuid::new_v4(),
            QueueConfig::new(name),
            None,
            Arc::new(MemoryMessageStore::new()),
        )
    }

    fn bind(exchange: &Exchange, key: &str, queue: &Arc<Queue>, arguments: FieldTable) {
        exchange.add_binding(Binding {
            id: Uuid::new_v4(),
            binding_key: key.to_string(),
            queue: Arc::clone(queue),
            arguments,
        });
    }

    fn metadata(routing_key: &str) -> MessageMetaData {
        MessageMetaData::new("ex", routing_key, BasicProperties::default(), 0)
    }

    fn names(queues: &[Arc<Queue>]) -> Vec<String> {
        queues.iter().map(|q| q.name().to_string()).collect()
    }

    #[test]
    fn test_topic_wildcards() {
        assert!(topic_matches("stock.*.nyse", "stock.ibm.nyse"));
        assert!(!topic_matches("stock.*.nyse", "stock.nyse"));
        assert!(topic_matches("stock.#", "stock"));
        assert!(topic_matches("stock.#", "stock.ibm.nyse"));
        assert!(topic_matches("#", ""));
        assert!(topic_matches("#.nyse", "nyse"));
        assert!(topic_matches("", ""));
        assert!(!topic_matches("*", ""));
        assert!(!topic_matches("a.b", "a.b.c"));
    }

    #[test]
    fn test_direct_routing_deduplicates() {
        let exchange = Exchange::new(Uuid::new_v4(), ExchangeConfig::new("ex", ExchangeType::Direct));
        let q = queue("q");
        bind(&exchange, "k", &q, FieldTable::new());
        bind(&exchange, "k", &q, FieldTable::new().with("x", FieldValue::Boolean(true)));

        assert_eq!(names(&exchange.route(&metadata("k"))), vec!["q"]);
        assert!(exchange.route(&metadata("other")).is_empty());
        assert_eq!(exchange.unrouted_count(), 1);
    }

    #[test]
    fn test_duplicate_binding_ignored() {
        let exchange = Exchange::new(Uuid::new_v4(), ExchangeConfig::new("ex", ExchangeType::Fanout));
        let q = queue("q");
        let binding = Binding {
            id: Uuid::new_v4(),
            binding_key: "k".to_string(),
            queue: Arc::clone(&q),
            arguments: FieldTable::new(),
        };
        assert!(exchange.add_binding(binding.clone()));
        assert!(!exchange.add_binding(binding));
        assert_eq!(exchange.bindings().len(), 1);
        assert!(exchange.remove_binding("k", &q).is_some());
        assert!(!exchange.has_bindings());
    }

    #[test]
    fn test_headers_all_and_any() {
        let exchange = Exchange::new(Uuid::new_v4(), ExchangeConfig::new("h", ExchangeType::Headers));
        let all = queue("all");
        let any = queue("any");
        bind(
            &exchange,
            "",
            &all,
            FieldTable::new()
                .with("format", FieldValue::string("pdf"))
                .with("type", FieldValue::Void),
        );
        bind(
            &exchange,
            "",
            &any,
            FieldTable::new()
                .with(X_MATCH, FieldValue::string("any"))
                .with("format", FieldValue::string("pdf"))
                .with("lang", FieldValue::string("en")),
        );

        let mut message = metadata("");
        message.properties = BasicProperties::default()
            .with_header("format", FieldValue::string("pdf"))
            .with_header("type", FieldValue::LongInt(1));
        assert_eq!(names(&exchange.route(&message)), vec!["all", "any"]);

        message.properties = BasicProperties::default().with_header("lang", FieldValue::string("en"));
        assert_eq!(names(&exchange.route(&message)), vec!["any"]);
    }

    #[test]
    fn test_alternate_chain_stops_on_cycle() {
        let a = Exchange::new(Uuid::new_v4(), ExchangeConfig::new("a", ExchangeType::Direct));
        let b = Exchange::new(Uuid::new_v4(), ExchangeConfig::new("b", ExchangeType::Direct));
        a.set_alternate_exchange(Some(&b));
        b.set_alternate_exchange(Some(&a));
        assert!(a.route_with_alternates(&metadata("k")).is_empty());

        let fallback = Exchange::new(Uuid::new_v4(), ExchangeConfig::new("c", ExchangeType::Fanout));
        let q = queue("dlq");
        bind(&fallback, "", &q, FieldTable::new());
        b.set_alternate_exchange(Some(&fallback));
        assert_eq!(names(&a.route_with_alternates(&metadata("k"))), vec!["dlq"]);
    }

    #[test]
    fn test_exchange_type_parse() {
        assert_eq!("topic".parse::<ExchangeType>().unwrap(), ExchangeType::Topic);
        assert!("x-custom".parse::<ExchangeType>().is_err());
    }
}
