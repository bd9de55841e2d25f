//! # FluxQ Broker Module
//!
//! The network-facing half of the broker: the TCP listener, one task per
//! client connection, and the channel state machine that turns AMQP methods
//! into virtual-host operations.
//!
//! ## Architecture
//!
//! - [`server`] - accept loop with graceful shutdown; virtual hosts are
//!   recovered before the first connection is accepted
//! - [`connection`] - handshake (`start`/`tune`/`open`), heartbeats, channel
//!   demultiplexing and delivery dispatch for one peer
//! - [`channel`] - per-channel lifecycle, content assembly, consumers,
//!   unacknowledged deliveries and `tx`/`dtx` transactions
//!
//! A protocol failure is scoped by its reply code: hard errors close the
//! connection, soft errors close only the channel that caused them (see
//! [`AmqpError`]).

pub mod channel;
pub mod connection;
pub mod server;

pub use channel::{Channel, ChannelState, Outbound};
pub use connection::{Connection, ConnectionState, Tuning};
pub use server::BrokerServer;

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::acl::{AclManager, Principal};
use crate::auth::{Authenticator, UserDirectoryAuthenticator};
use crate::config::BrokerConfig;
use crate::metrics::MetricsRegistry;
use crate::model::AdminError;
use crate::protocol::amqp::types::clip_shortstr;
use crate::protocol::{Method, ReplyCode};
use crate::storage::StoreError;
use crate::transaction::{DtxError, TransactionError};
use crate::virtualhost::VirtualHost;
use crate::{FluxqError, Result};

/// A protocol-level failure, scoped to the connection or to one channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AmqpError {
    #[error("connection error {code}: {text}")]
    Connection {
        code: ReplyCode,
        text: String,
        class_id: u16,
        method_id: u16,
    },

    #[error("channel error {code}: {text}")]
    Channel {
        code: ReplyCode,
        text: String,
        class_id: u16,
        method_id: u16,
    },
}

/// Reply texts travel as short strings.
fn reply_text(text: impl Into<String>) -> String {
    let mut text = text.into();
    let end = clip_shortstr(&text).len();
    text.truncate(end);
    text
}

impl AmqpError {
    pub fn connection(code: ReplyCode, text: impl Into<String>) -> Self {
        Self::Connection {
            code,
            text: reply_text(text),
            class_id: 0,
            method_id: 0,
        }
    }

    pub fn channel(code: ReplyCode, text: impl Into<String>) -> Self {
        Self::Channel {
            code,
            text: reply_text(text),
            class_id: 0,
            method_id: 0,
        }
    }

    /// Scopes the error by its reply code.
    pub fn from_code(code: ReplyCode, text: impl Into<String>) -> Self {
        if code.is_connection_error() {
            Self::connection(code, text)
        } else {
            Self::channel(code, text)
        }
    }

    /// Records the method that failed, reported back in the close.
    pub fn caused_by(mut self, method: &Method) -> Self {
        let (class, method) = method.ids();
        match &mut self {
            Self::Connection {
                class_id,
                method_id,
                ..
            }
            | Self::Channel {
                class_id,
                method_id,
                ..
            } => {
                *class_id = class;
                *method_id = method;
            }
        }
        self
    }

    pub fn code(&self) -> ReplyCode {
        match self {
            Self::Connection { code, .. } | Self::Channel { code, .. } => *code,
        }
    }

    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    /// The `connection.close` or `channel.close` that reports this error.
    pub fn to_close_method(&self) -> Method {
        match self {
            Self::Connection {
                code,
                text,
                class_id,
                method_id,
            } => Method::ConnectionClose {
                reply_code: code.as_u16(),
                reply_text: text.clone(),
                class_id: *class_id,
                method_id: *method_id,
            },
            Self::Channel {
                code,
                text,
                class_id,
                method_id,
            } => Method::ChannelClose {
                reply_code: code.as_u16(),
                reply_text: text.clone(),
                class_id: *class_id,
                method_id: *method_id,
            },
        }
    }
}

impl From<AdminError> for AmqpError {
    fn from(e: AdminError) -> Self {
        Self::from_code(e.reply_code(), e.to_string())
    }
}

impl From<DtxError> for AmqpError {
    fn from(e: DtxError) -> Self {
        Self::from_code(e.reply_code(), e.to_string())
    }
}

impl From<TransactionError> for AmqpError {
    fn from(e: TransactionError) -> Self {
        match e {
            TransactionError::InvalidState(text) => {
                Self::channel(ReplyCode::PreconditionFailed, text)
            }
            TransactionError::Store(e) => e.into(),
        }
    }
}

impl From<StoreError> for AmqpError {
    fn from(e: StoreError) -> Self {
        Self::connection(ReplyCode::InternalError, e.to_string())
    }
}

/// State shared by the listener and every connection.
#[derive(Debug)]
pub struct Broker {
    config: BrokerConfig,
    virtual_hosts: DashMap<String, Arc<VirtualHost>>,
    authenticator: Arc<dyn Authenticator>,
    metrics: Arc<MetricsRegistry>,
    next_connection_id: AtomicU64,
}

impl Broker {
    /// Builds the virtual hosts named in `config`; nothing is opened yet.
    pub fn new(config: BrokerConfig) -> Result<Arc<Self>> {
        config.validate().map_err(FluxqError::Config)?;

        let acl = Arc::new(Self::create_acl_manager(&config));
        let authenticator: Arc<dyn Authenticator> = Arc::new(UserDirectoryAuthenticator::new(
            config.users.clone(),
            config.allow_anonymous,
        ));
        let metrics = Arc::new(MetricsRegistry::new());

        let virtual_hosts = DashMap::new();
        for vhost_config in config.virtual_host_configs() {
            let vhost = VirtualHost::create(vhost_config, Arc::clone(&acl), Arc::clone(&metrics));
            virtual_hosts.insert(vhost.name().to_string(), vhost);
        }

        Ok(Arc::new(Self {
            config,
            virtual_hosts,
            authenticator,
            metrics,
            next_connection_id: AtomicU64::new(1),
        }))
    }

    fn create_acl_manager(config: &BrokerConfig) -> AclManager {
        if !config.enable_acl {
            info!("ACL authorization disabled");
            return AclManager::new(true);
        }

        let mut acl_manager = AclManager::new(config.allow_everyone);
        for super_user in &config.super_users {
            acl_manager.add_super_user(Principal::user(super_user));
        }

        if let Some(ref acl_file) = config.acl_config_file {
            if std::path::Path::new(acl_file).exists() {
                match acl_manager.load_from_file(acl_file) {
                    Ok(()) => info!("Loaded ACL configuration from {}", acl_file),
                    Err(e) => {
                        warn!("Failed to load ACL configuration from {}: {}", acl_file, e);
                        warn!("Continuing with empty ACL configuration");
                    }
                }
            } else {
                info!(
                    "ACL configuration file {} does not exist, starting with empty ACL",
                    acl_file
                );
            }
        }
        info!(allow_everyone = config.allow_everyone, "ACL authorization enabled");
        acl_manager
    }

    /// Recovers every virtual host. Must finish before connections are
    /// accepted.
    pub async fn start(&self) -> Result<()> {
        let vhosts: Vec<Arc<VirtualHost>> =
            self.virtual_hosts.iter().map(|v| Arc::clone(v.value())).collect();
        for vhost in vhosts {
            let report = vhost.start().await?;
            info!(
                virtual_host = %vhost.name(),
                messages = report.messages,
                entries = report.recovered_entries(),
                prepared_branches = report.prepared_branches,
                "Recovery complete"
            );
        }
        Ok(())
    }

    pub fn stop(&self) {
        for vhost in self.virtual_hosts.iter() {
            if let Err(e) = vhost.stop() {
                warn!(virtual_host = %vhost.name(), error = %e, "Failed to stop virtual host");
            }
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Looks a virtual host up by name; a leading `/` is ignored.
    pub fn virtual_host(&self, name: &str) -> Option<Arc<VirtualHost>> {
        self.virtual_hosts
            .get(name.trim_start_matches('/'))
            .map(|v| Arc::clone(v.value()))
    }

    pub fn virtual_hosts(&self) -> Vec<Arc<VirtualHost>> {
        self.virtual_hosts.iter().map(|v| Arc::clone(v.value())).collect()
    }

    pub fn authenticator(&self) -> &Arc<dyn Authenticator> {
        &self.authenticator
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_scope_follows_reply_code() {
        assert!(AmqpError::from_code(ReplyCode::CommandInvalid, "x").is_connection_error());
        assert!(!AmqpError::from_code(ReplyCode::NotFound, "x").is_connection_error());

        let err: AmqpError = AdminError::Forbidden("denied".to_string()).into();
        assert_eq!(err.code(), ReplyCode::AccessRefused);
        assert!(!err.is_connection_error());
    }

    #[test]
    fn test_close_method_carries_cause() {
        let method = Method::BasicCancel {
            consumer_tag: "nope".to_string(),
            no_wait: false,
        };
        let close = AmqpError::channel(ReplyCode::NotFound, "unknown consumer")
            .caused_by(&method)
            .to_close_method();
        assert_eq!(
            close,
            Method::ChannelClose {
                reply_code: 404,
                reply_text: "unknown consumer".to_string(),
                class_id: 60,
                method_id: 30,
            }
        );
    }

    #[test]
    fn test_long_error_text_is_bounded_for_close() {
        let name = "q".repeat(255);
        let err: AmqpError = AdminError::not_found(crate::model::EntityCategory::Queue, &name).into();
        let close = err.to_close_method();
        let Method::ChannelClose { reply_text, .. } = &close else {
            panic!("expected channel.close, got {close:?}");
        };
        assert_eq!(reply_text.len(), 255);

        let mut encoded = bytes::BytesMut::new();
        close.encode(&mut encoded);
        assert_eq!(Method::decode(&encoded).unwrap(), close);
    }

    #[test]
    fn test_virtual_host_lookup_ignores_leading_slash() {
        let broker = Broker::new(BrokerConfig::default().with_virtual_host("test")).unwrap();
        assert!(broker.virtual_host("/test").is_some());
        assert!(broker.virtual_host("test").is_some());
        assert!(broker.virtual_host("nosuch").is_none());
        assert_ne!(broker.next_connection_id(), broker.next_connection_id());
    }
}
