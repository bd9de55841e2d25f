//! Entity categories, capability traits and administrative outcomes shared by
//! exchanges, queues and virtual hosts.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::acl::Principal;
use crate::message::MessageMetaData;
use crate::protocol::ReplyCode;
use crate::queue::Queue;
use crate::storage::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityCategory {
    VirtualHost,
    Exchange,
    Queue,
    Binding,
    Consumer,
}

impl fmt::Display for EntityCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::VirtualHost => "virtual host",
            Self::Exchange => "exchange",
            Self::Queue => "queue",
            Self::Binding => "binding",
            Self::Consumer => "consumer",
        })
    }
}

/// Something a message can be routed through.
pub trait Routable {
    fn route(&self, metadata: &MessageMetaData) -> Vec<Arc<Queue>>;
}

/// Something that can be removed from its virtual host.
pub trait Deletable {
    fn is_deleted(&self) -> bool;

    /// Marks the entity deleted; returns `false` if it already was.
    fn mark_deleted(&self) -> bool;
}

/// Something with an observable lifecycle state.
pub trait StatefulEntity {
    type State: Copy + fmt::Debug + PartialEq;

    fn state(&self) -> Self::State;
}

/// Outcome of a failed administrative operation (declare, bind, delete, ...).
#[derive(Debug, Error)]
pub enum AdminError {
    #[error("{category} '{name}' not found")]
    NotFound {
        category: EntityCategory,
        name: String,
    },

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Invalid(String),

    #[error("{0}")]
    Locked(String),

    #[error("store failure: {0}")]
    Store(#[from] StoreError),
}

impl AdminError {
    pub fn not_found(category: EntityCategory, name: impl Into<String>) -> Self {
        Self::NotFound {
            category,
            name: name.into(),
        }
    }

    pub fn reply_code(&self) -> ReplyCode {
        match self {
            Self::NotFound { .. } => ReplyCode::NotFound,
            Self::Conflict(_) | Self::Invalid(_) => ReplyCode::PreconditionFailed,
            Self::Forbidden(_) => ReplyCode::AccessRefused,
            Self::Locked(_) => ReplyCode::ResourceLocked,
            Self::Store(_) => ReplyCode::InternalError,
        }
    }
}

/// Who is asking, passed explicitly to every authorized operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub principal: Principal,
    pub remote_host: Option<String>,
    pub connection_id: u64,
}

impl RequestContext {
    pub fn new(principal: Principal, connection_id: u64) -> Self {
        Self {
            principal,
            remote_host: None,
            connection_id,
        }
    }

    pub fn with_remote_host(mut self, host: impl Into<String>) -> Self {
        self.remote_host = Some(host.into());
        self
    }

    /// Context for broker-internal work such as recovery.
    pub fn system() -> Self {
        Self::new(Principal::system(), 0)
    }
}
