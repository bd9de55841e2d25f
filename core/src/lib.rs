//! # FluxQ Core Library
//!
//! FluxQ is an AMQP 0-9-1 message broker. This crate holds the broker core:
//! virtual hosts with their exchanges and queues, the subscription and
//! delivery machinery, local and distributed transactions, pluggable message
//! stores with crash recovery, and the connection/channel state machines that
//! drive them from the wire.
//!
//! ## Architecture Overview
//!
//! - [`broker`] - TCP listener, connection handshake and channel handling
//! - [`protocol`] - AMQP 0-9-1 frame codec, methods and field tables
//! - [`virtualhost`] - per-namespace registry of exchanges and queues
//! - [`exchange`] - direct, fanout, topic and headers routing
//! - [`queue`] - FIFO, priority, sorted and last-value queues
//! - [`consumer`] - local subscriptions and consumer selection
//! - [`cluster`] - subscriptions held on behalf of peer brokers
//! - [`transaction`] - auto-commit, `tx` and `dtx` transactions, recovery
//! - [`storage`] - in-memory and journal message/configuration stores
//! - [`acl`] / [`auth`] - authorization and SASL authentication
//! - [`metrics`] - lock-free counters and periodic reporting
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fluxq::{BrokerConfig, BrokerServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BrokerConfig::default().with_listener("127.0.0.1", 5672);
//!     let server = BrokerServer::new(config).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod acl;
pub mod auth;
pub mod broker;
pub mod cluster;
pub mod config;
pub mod consumer;
pub mod exchange;
pub mod message;
pub mod metrics;
pub mod model;
pub mod protocol;
pub mod queue;
pub mod storage;
pub mod transaction;
pub mod virtualhost;

pub use broker::BrokerServer;
pub use config::{BrokerConfig, StoreType};
pub use exchange::{Exchange, ExchangeConfig, ExchangeType};
pub use metrics::{MetricsRegistry, MetricsSnapshot};
pub use model::{AdminError, RequestContext};
pub use queue::{OrderingPolicy, Queue, QueueConfig};
pub use storage::{JournalMessageStore, MemoryMessageStore, StoreError};
pub use transaction::{DtxError, TransactionError, TransactionResult};
pub use virtualhost::{PublishOutcome, PublishRequest, VirtualHost, VirtualHostConfig};

use thiserror::Error;

/// FluxQ error types
///
/// Errors that abort broker startup or a whole connection. Failures scoped to
/// a single channel or operation use the narrower types ([`AdminError`],
/// [`DtxError`], ...) and are turned into `channel.close` replies instead.
///
/// # Example
///
/// ```rust,no_run
/// use fluxq::{FluxqError, Result};
///
/// fn handle_error(result: Result<()>) {
///     match result {
///         Ok(()) => println!("Success"),
///         Err(FluxqError::Storage(e)) => println!("Storage error: {}", e),
///         Err(FluxqError::Config(msg)) => println!("Bad configuration: {}", msg),
///         Err(e) => println!("Other error: {}", e),
///     }
/// }
/// ```
#[derive(Debug, Error)]
pub enum FluxqError {
    /// File and socket I/O
    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// Message or configuration store failures
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration validation and parsing errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("ACL error: {0}")]
    Acl(#[from] acl::AclError),

    /// AMQP frame codec errors
    #[error("AMQP codec error: {0}")]
    Codec(#[from] protocol::AmqpCodecError),
}

/// Result type alias for FluxQ operations
pub type Result<T> = std::result::Result<T, FluxqError>;
