use serde::{Deserialize, Serialize};

use super::ordering::{OrderingPolicy, DEFAULT_LVQ_KEY, MAX_PRIORITY_LEVELS};
use crate::model::AdminError;
use crate::protocol::FieldTable;

pub const ARG_PRIORITIES: &str = "x-qpid-priorities";
pub const ARG_SORT_KEY: &str = "x-qpid-sort-key";
pub const ARG_LAST_VALUE_KEY: &str = "x-qpid-last-value-key";
pub const ARG_LEGACY_LAST_VALUE_KEY: &str = "qpid.last_value_queue_key";
pub const ARG_ALTERNATE_EXCHANGE: &str = "x-alternate-exchange";
pub const ARG_MAX_DELIVERY_COUNT: &str = "x-qpid-maximum-delivery-count";

/// Declared shape of a queue, persisted for durable queues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub ordering: OrderingPolicy,
    pub alternate_exchange: Option<String>,
    /// Delivery attempts before dead-lettering; zero means unlimited.
    pub max_delivery_count: u32,
    pub arguments: FieldTable,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: false,
            exclusive: false,
            auto_delete: false,
            ordering: OrderingPolicy::Fifo,
            alternate_exchange: None,
            max_delivery_count: 0,
            arguments: FieldTable::new(),
        }
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn with_auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn with_ordering(mut self, ordering: OrderingPolicy) -> Self {
        self.ordering = ordering;
        self
    }

    pub fn with_alternate_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.alternate_exchange = Some(exchange.into());
        self
    }

    pub fn with_max_delivery_count(mut self, count: u32) -> Self {
        self.max_delivery_count = count;
        self
    }

    /// Interprets the declare arguments of a `queue.declare`.
    pub fn with_arguments(mut self, arguments: FieldTable) -> Result<Self, AdminError> {
        let priorities = arguments.get(ARG_PRIORITIES).map(|v| {
            v.as_i64()
                .ok_or_else(|| AdminError::Invalid(format!("{ARG_PRIORITIES} must be an integer")))
        });
        let sort_key = arguments.get(ARG_SORT_KEY).map(|v| text_argument(ARG_SORT_KEY, v.as_text()));
        let last_value = arguments
            .get(ARG_LAST_VALUE_KEY)
            .or_else(|| arguments.get(ARG_LEGACY_LAST_VALUE_KEY))
            .map(|v| v.as_text().unwrap_or_default());

        self.ordering = match (priorities, sort_key, last_value) {
            (None, None, None) => self.ordering,
            (Some(levels), None, None) => {
                let levels = levels?;
                if !(1..=i64::from(MAX_PRIORITY_LEVELS)).contains(&levels) {
                    return Err(AdminError::Invalid(format!(
                        "{ARG_PRIORITIES} must be between 1 and {MAX_PRIORITY_LEVELS}, got {levels}"
                    )));
                }
                OrderingPolicy::Priority { levels: levels as u8 }
            }
            (None, Some(key), None) => OrderingPolicy::Sorted { key: key? },
            (None, None, Some(key)) if key.is_empty() => OrderingPolicy::LastValue {
                key: DEFAULT_LVQ_KEY.to_string(),
            },
            (None, None, Some(key)) => OrderingPolicy::LastValue { key },
            _ => {
                return Err(AdminError::Invalid(
                    "a queue takes at most one ordering argument".to_string(),
                ))
            }
        };

        if let Some(value) = arguments.get(ARG_ALTERNATE_EXCHANGE) {
            self.alternate_exchange = Some(text_argument(ARG_ALTERNATE_EXCHANGE, value.as_text())?);
        }
        if let Some(value) = arguments.get(ARG_MAX_DELIVERY_COUNT) {
            let count = value
                .as_i64()
                .filter(|c| (0..=i64::from(u32::MAX)).contains(c))
                .ok_or_else(|| {
                    AdminError::Invalid(format!("{ARG_MAX_DELIVERY_COUNT} must be a non-negative integer"))
                })?;
            self.max_delivery_count = count as u32;
        }
        self.arguments = arguments;
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), AdminError> {
        if self.name.len() > 255 {
            return Err(AdminError::Invalid("queue name exceeds 255 bytes".to_string()));
        }
        match &self.ordering {
            OrderingPolicy::Sorted { key } if key.is_empty() => Err(AdminError::Invalid(
                "sorted queue requires a sort key".to_string(),
            )),
            OrderingPolicy::Priority { levels } if *levels == 0 || *levels > MAX_PRIORITY_LEVELS => {
                Err(AdminError::Invalid(format!("invalid priority levels {levels}")))
            }
            _ => Ok(()),
        }
    }

    /// Two declarations are equivalent when a redeclare may proceed.
    pub fn is_equivalent(&self, other: &QueueConfig) -> bool {
        self.durable == other.durable
            && self.exclusive == other.exclusive
            && self.auto_delete == other.auto_delete
            && self.ordering == other.ordering
    }
}

fn text_argument(name: &str, value: Option<String>) -> Result<String, AdminError> {
    value.ok_or_else(|| AdminError::Invalid(format!("{name} must be a string")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FieldValue;

    #[test]
    fn test_priority_argument() {
        let args = FieldTable::new().with(ARG_PRIORITIES, FieldValue::LongInt(5));
        let config = QueueConfig::new("q").with_arguments(args).unwrap();
        assert_eq!(config.ordering, OrderingPolicy::Priority { levels: 5 });

        let args = FieldTable::new().with(ARG_PRIORITIES, FieldValue::LongInt(0));
        assert!(matches!(
            QueueConfig::new("q").with_arguments(args),
            Err(AdminError::Invalid(_))
        ));
    }

    #[test]
    fn test_last_value_key_defaults() {
        let args = FieldTable::new().with(ARG_LAST_VALUE_KEY, FieldValue::string(""));
        let config = QueueConfig::new("q").with_arguments(args).unwrap();
        assert_eq!(
            config.ordering,
            OrderingPolicy::LastValue {
                key: DEFAULT_LVQ_KEY.to_string()
            }
        );

        let args = FieldTable::new().with(ARG_LEGACY_LAST_VALUE_KEY, FieldValue::string("symbol"));
        let config = QueueConfig::new("q").with_arguments(args).unwrap();
        assert_eq!(
            config.ordering,
            OrderingPolicy::LastValue {
                key: "symbol".to_string()
            }
        );
    }

    #[test]
    fn test_conflicting_ordering_rejected() {
        let args = FieldTable::new()
            .with(ARG_PRIORITIES, FieldValue::LongInt(3))
            .with(ARG_SORT_KEY, FieldValue::string("k"));
        assert!(QueueConfig::new("q").with_arguments(args).is_err());
    }

    #[test]
    fn test_sorted_queue_needs_key() {
        let config = QueueConfig::new("q").with_ordering(OrderingPolicy::Sorted { key: String::new() });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_dead_letter_arguments() {
        let args = FieldTable::new()
            .with(ARG_ALTERNATE_EXCHANGE, FieldValue::string("dlx"))
            .with(ARG_MAX_DELIVERY_COUNT, FieldValue::LongInt(3));
        let config = QueueConfig::new("q").with_arguments(args).unwrap();
        assert_eq!(config.alternate_exchange.as_deref(), Some("dlx"));
        assert_eq!(config.max_delivery_count, 3);
    }
}
