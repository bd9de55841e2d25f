//! XA transaction branches.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use super::{
    apply_committed, DtxError, ServerTransaction, TransactionError, TransactionResult, TxnAction,
};
use crate::protocol::Xid;
use crate::storage::{MessageStore, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DtxState {
    /// Associated with a session and accepting work.
    Active,
    /// Association suspended; may be resumed.
    Suspended,
    /// Association ended; awaiting prepare or one-phase commit.
    Ended,
    Prepared,
    Committed,
    RolledBack,
}

impl DtxState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DtxState::Committed | DtxState::RolledBack)
    }
}

struct BranchInner {
    state: DtxState,
    session: Option<u64>,
    rollback_only: bool,
    actions: Vec<TxnAction>,
    /// Store records captured by the pre-prepare step.
    enqueue_records: Vec<Record>,
    dequeue_records: Vec<Record>,
}

/// One branch of a distributed transaction.
pub struct DtxBranch {
    xid: Xid,
    store: Arc<dyn MessageStore>,
    inner: Mutex<BranchInner>,
}

impl DtxBranch {
    pub fn new(xid: Xid, store: Arc<dyn MessageStore>) -> Self {
        Self {
            xid,
            store,
            inner: Mutex::new(BranchInner {
                state: DtxState::Ended,
                session: None,
                rollback_only: false,
                actions: Vec::new(),
                enqueue_records: Vec::new(),
                dequeue_records: Vec::new(),
            }),
        }
    }

    pub fn xid(&self) -> &Xid {
        &self.xid
    }

    pub fn state(&self) -> DtxState {
        self.inner.lock().state
    }

    pub fn session(&self) -> Option<u64> {
        self.inner.lock().session
    }

    pub fn is_rollback_only(&self) -> bool {
        self.inner.lock().rollback_only
    }

    pub fn action_count(&self) -> usize {
        self.inner.lock().actions.len()
    }

    /// Associates the branch with `session` (start or join).
    pub fn associate(&self, session: u64) -> Result<(), DtxError> {
        let mut inner = self.inner.lock();
        self.transition_to(&mut inner, DtxState::Active, "start")?;
        inner.session = Some(session);
        Ok(())
    }

    pub fn resume(&self, session: u64) -> Result<(), DtxError> {
        let mut inner = self.inner.lock();
        if inner.state != DtxState::Suspended {
            return Err(self.invalid(inner.state, "resume"));
        }
        if inner.session != Some(session) {
            return Err(DtxError::NotAssociated(self.xid.clone()));
        }
        self.transition_to(&mut inner, DtxState::Active, "resume")
    }

    pub fn suspend(&self, session: u64) -> Result<(), DtxError> {
        let mut inner = self.inner.lock();
        self.check_session(&inner, session)?;
        self.transition_to(&mut inner, DtxState::Suspended, "suspend")
    }

    /// Ends the association; with `fail` the branch can only roll back.
    pub fn end(&self, session: u64, fail: bool) -> Result<(), DtxError> {
        let mut inner = self.inner.lock();
        self.check_session(&inner, session)?;
        self.transition_to(&mut inner, DtxState::Ended, "end")?;
        inner.session = None;
        if fail {
            inner.rollback_only = true;
        }
        Ok(())
    }

    /// Buffers work done while the branch is active.
    /// Buffers an action; a branch that is not Active rolls it back.
    pub fn add(&self, action: TxnAction) -> Result<(), DtxError> {
        let mut inner = self.inner.lock();
        if inner.state != DtxState::Active {
            let err = self.invalid(inner.state, "accept work");
            drop(inner);
            action.rollback();
            return Err(err);
        }
        inner.actions.push(action);
        Ok(())
    }

    /// Buffers an action rebuilt from a stored branch.
    pub(crate) fn add_recovered(&self, action: TxnAction) {
        self.inner.lock().actions.push(action);
    }

    /// Captures the durable records of the buffered work.
    pub fn pre_prepare(&self) {
        let mut inner = self.inner.lock();
        let records = |enqueue: bool| -> Vec<Record> {
            inner
                .actions
                .iter()
                .filter(|a| a.is_enqueue() == enqueue)
                .filter_map(TxnAction::record)
                .collect()
        };
        let (enqueues, dequeues) = (records(true), records(false));
        inner.enqueue_records = enqueues;
        inner.dequeue_records = dequeues;
    }

    /// Ended → Prepared, recording the branch in the store.
    pub fn prepare(&self) -> Result<(), DtxError> {
        self.check_prepare()?;
        self.pre_prepare();
        let mut inner = self.inner.lock();
        let mut txn = self.store.new_transaction();
        txn.record_xid(&self.xid, &inner.enqueue_records, &inner.dequeue_records);
        txn.commit_tran()?;
        self.transition_to(&mut inner, DtxState::Prepared, "prepare")?;
        info!(xid = %self.xid, actions = inner.actions.len(), "Prepared dtx branch");
        Ok(())
    }

    /// Marks a branch rebuilt from the store as prepared.
    pub(crate) fn mark_prepared(&self) {
        self.pre_prepare();
        self.inner.lock().state = DtxState::Prepared;
    }

    fn check_prepare(&self) -> Result<(), DtxError> {
        let inner = self.inner.lock();
        if inner.rollback_only {
            return Err(DtxError::RollbackOnly(self.xid.clone()));
        }
        if inner.state != DtxState::Ended {
            return Err(self.invalid(inner.state, "prepare"));
        }
        Ok(())
    }

    /// Second-phase commit from Prepared, or one-phase commit from Ended.
    pub fn commit(&self, one_phase: bool) -> Result<(), DtxError> {
        let actions = {
            let mut inner = self.inner.lock();
            let expected = if one_phase {
                DtxState::Ended
            } else {
                DtxState::Prepared
            };
            if inner.state != expected {
                return Err(self.invalid(inner.state, "commit"));
            }
            if inner.rollback_only {
                return Err(DtxError::RollbackOnly(self.xid.clone()));
            }

            let mut txn = self.store.new_transaction();
            for action in &inner.actions {
                action.enlist(txn.as_mut());
            }
            if inner.state == DtxState::Prepared {
                txn.remove_xid(&self.xid);
            }
            txn.commit_tran()?;
            self.transition_to(&mut inner, DtxState::Committed, "commit")?;
            std::mem::take(&mut inner.actions)
        };
        info!(xid = %self.xid, actions = actions.len(), one_phase, "Committed dtx branch");
        apply_committed(actions);
        Ok(())
    }

    pub fn rollback(&self) -> Result<(), DtxError> {
        let actions = {
            let mut inner = self.inner.lock();
            if !matches!(
                inner.state,
                DtxState::Ended | DtxState::Prepared | DtxState::Suspended
            ) {
                return Err(self.invalid(inner.state, "roll back"));
            }
            if inner.state == DtxState::Prepared {
                let mut txn = self.store.new_transaction();
                txn.remove_xid(&self.xid);
                txn.commit_tran()?;
            }
            self.transition_to(&mut inner, DtxState::RolledBack, "roll back")?;
            inner.session = None;
            std::mem::take(&mut inner.actions)
        };
        info!(xid = %self.xid, actions = actions.len(), "Rolled back dtx branch");
        for action in actions {
            action.rollback();
        }
        Ok(())
    }

    fn check_session(&self, inner: &BranchInner, session: u64) -> Result<(), DtxError> {
        if inner.session != Some(session) {
            return Err(DtxError::NotAssociated(self.xid.clone()));
        }
        Ok(())
    }

    fn invalid(&self, state: DtxState, operation: &'static str) -> DtxError {
        DtxError::InvalidState {
            xid: self.xid.clone(),
            state,
            operation,
        }
    }

    fn transition_to(
        &self,
        inner: &mut BranchInner,
        new_state: DtxState,
        operation: &'static str,
    ) -> Result<(), DtxError> {
        if !Self::is_valid_transition(inner.state, new_state) {
            return Err(self.invalid(inner.state, operation));
        }
        debug!(
            xid = %self.xid,
            old_state = ?inner.state,
            new_state = ?new_state,
            "Dtx branch state transition"
        );
        inner.state = new_state;
        Ok(())
    }

    fn is_valid_transition(from: DtxState, to: DtxState) -> bool {
        use DtxState::*;
        match (from, to) {
            (Ended, Active) => true,
            (Active, Suspended) | (Active, Ended) => true,
            (Suspended, Active) | (Suspended, Ended) | (Suspended, RolledBack) => true,
            (Ended, Prepared) | (Ended, Committed) | (Ended, RolledBack) => true,
            (Prepared, Committed) | (Prepared, RolledBack) => true,
            _ => false,
        }
    }
}

/// Routes a channel's work into the branch it is currently associated with.
#[derive(Debug, Clone)]
pub struct BranchTransaction {
    branch: Arc<DtxBranch>,
}

impl BranchTransaction {
    pub fn new(branch: Arc<DtxBranch>) -> Self {
        Self { branch }
    }

    pub fn branch(&self) -> &Arc<DtxBranch> {
        &self.branch
    }
}

impl ServerTransaction for BranchTransaction {
    fn add(&mut self, action: TxnAction) -> TransactionResult<()> {
        self.branch
            .add(action)
            .map_err(|e| TransactionError::InvalidState(e.to_string()))
    }

    fn is_transactional(&self) -> bool {
        true
    }
}

impl Drop for DtxBranch {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if !inner.state.is_terminal() && inner.state != DtxState::Prepared {
            for action in std::mem::take(&mut inner.actions) {
                action.rollback();
            }
        }
    }
}

impl fmt::Debug for DtxBranch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("DtxBranch")
            .field("xid", &self.xid)
            .field("state", &inner.state)
            .field("actions", &inner.actions.len())
            .finish()
    }
}
