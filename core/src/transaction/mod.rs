//! Transactions
//!
//! Every change a channel makes to queue contents is expressed as a
//! [`TxnAction`] and run through a [`ServerTransaction`]:
//!
//! - [`AutoCommitTransaction`]: each action is written and applied at once
//! - [`LocalTransaction`]: actions are buffered until `tx.commit`, then
//!   written in one store transaction and applied in insertion order
//! - [`DtxBranch`]: an XA branch; actions are buffered until the branch is
//!   prepared and applied on second-phase (or one-phase) commit
//!
//! The [`recovery`] module rebuilds queue contents and prepared branches from
//! the store at startup.

mod dtx;
mod local;
pub mod recovery;
mod registry;

pub use dtx::{BranchTransaction, DtxBranch, DtxState};
pub use local::{AutoCommitTransaction, LocalTransaction};
pub use recovery::{MessageStoreRecoverer, RecoveryReport};
pub use registry::DtxRegistry;

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::message::MessageReference;
use crate::protocol::{ReplyCode, XaStatus, Xid};
use crate::queue::{Queue, QueueEntry};
use crate::storage::{Record, StoreError, Transaction};

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Invalid transaction state: {0}")]
    InvalidState(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

pub type TransactionResult<T> = std::result::Result<T, TransactionError>;

#[derive(Debug, Error)]
pub enum DtxError {
    #[error("Unknown xid {0}")]
    UnknownXid(Xid),

    #[error("Xid {0} is already known")]
    AlreadyKnown(Xid),

    #[error("Xid {xid} cannot {operation} in state {state:?}")]
    InvalidState {
        xid: Xid,
        state: DtxState,
        operation: &'static str,
    },

    #[error("Xid {0} is not associated with this session")]
    NotAssociated(Xid),

    #[error("Xid {0} was marked rollback-only")]
    RollbackOnly(Xid),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl DtxError {
    pub fn reply_code(&self) -> ReplyCode {
        match self {
            Self::UnknownXid(_) => ReplyCode::NotFound,
            Self::AlreadyKnown(_) | Self::NotAssociated(_) => ReplyCode::NotAllowed,
            Self::InvalidState { .. } => ReplyCode::PreconditionFailed,
            Self::RollbackOnly(_) => ReplyCode::PreconditionFailed,
            Self::Store(_) => ReplyCode::InternalError,
        }
    }

    /// Outcome reported in the `-ok` reply when the error is an XA result
    /// rather than a protocol violation.
    pub fn xa_status(&self) -> Option<XaStatus> {
        match self {
            Self::RollbackOnly(_) => Some(XaStatus::XaRbRollback),
            _ => None,
        }
    }
}

/// One buffered change to queue contents.
pub enum TxnAction {
    Enqueue {
        queue: Arc<Queue>,
        message: MessageReference,
    },
    Dequeue {
        queue: Arc<Queue>,
        entry: Arc<QueueEntry>,
    },
}

impl TxnAction {
    /// Writes the store half of the action.
    pub fn enlist(&self, txn: &mut dyn Transaction) {
        match self {
            Self::Enqueue { queue, message } => queue.enlist_enqueue(txn, message.message()),
            Self::Dequeue { queue, entry } => queue.enlist_dequeue(txn, entry),
        }
    }

    /// The store record this action touches, if the instance is durable.
    pub fn record(&self) -> Option<Record> {
        let (queue, message) = match self {
            Self::Enqueue { queue, message } => (queue, message.message()),
            Self::Dequeue { queue, entry } => (queue, entry.message()),
        };
        queue
            .is_durable_instance(message)
            .then(|| Record::new(queue.id(), message.message_number()))
    }

    pub fn is_enqueue(&self) -> bool {
        matches!(self, Self::Enqueue { .. })
    }

    /// Applies the in-memory half once the store transaction committed.
    pub fn post_commit(self) {
        match self {
            Self::Enqueue { queue, message } => {
                queue.enqueue(message.message());
            }
            Self::Dequeue { queue, entry } => {
                queue.complete_dequeue(&entry);
            }
        }
    }

    /// Undoes the action: buffered messages lose their reference and
    /// acquired entries go back on their queue.
    pub fn rollback(self) {
        match self {
            Self::Enqueue { message, .. } => drop(message),
            Self::Dequeue { queue, entry } => {
                queue.release(&entry);
            }
        }
    }
}

impl fmt::Debug for TxnAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enqueue { queue, message } => f
                .debug_struct("Enqueue")
                .field("queue", &queue.name())
                .field("message_id", &message.message().message_number())
                .finish(),
            Self::Dequeue { queue, entry } => f
                .debug_struct("Dequeue")
                .field("queue", &queue.name())
                .field("entry_id", &entry.entry_id())
                .finish(),
        }
    }
}

/// Applies the actions of one committed store transaction in order.
pub(crate) fn apply_committed(actions: Vec<TxnAction>) {
    for action in actions {
        action.post_commit();
    }
}

/// A sink for queue changes made by a channel.
pub trait ServerTransaction: Send {
    /// An action that fails here has already been rolled back.
    fn add(&mut self, action: TxnAction) -> TransactionResult<()>;

    /// Whether actions are held until an explicit commit.
    fn is_transactional(&self) -> bool;
}
