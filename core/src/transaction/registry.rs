use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

use super::{DtxBranch, DtxError, DtxState};
use crate::protocol::Xid;
use crate::storage::MessageStore;

/// Branches of one virtual host keyed by Xid.
#[derive(Debug, Default)]
pub struct DtxRegistry {
    branches: DashMap<Xid, Arc<DtxBranch>>,
}

impl DtxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if a branch with the same Xid is already registered.
    pub fn register(&self, branch: Arc<DtxBranch>) -> bool {
        match self.branches.entry(branch.xid().clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(branch);
                true
            }
        }
    }

    pub fn get(&self, xid: &Xid) -> Option<Arc<DtxBranch>> {
        self.branches.get(xid).map(|b| Arc::clone(b.value()))
    }

    pub fn unregister(&self, xid: &Xid) -> Option<Arc<DtxBranch>> {
        self.branches.remove(xid).map(|(_, branch)| branch)
    }

    pub fn len(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    /// Starts work on `xid` for `session`: a new branch, or an existing one
    /// when joining or resuming.
    pub fn start(
        &self,
        xid: &Xid,
        store: &Arc<dyn MessageStore>,
        session: u64,
        join: bool,
        resume: bool,
    ) -> Result<Arc<DtxBranch>, DtxError> {
        if join && resume {
            return Err(DtxError::InvalidState {
                xid: xid.clone(),
                state: DtxState::Active,
                operation: "join and resume at once",
            });
        }
        if resume {
            let branch = self.lookup(xid)?;
            branch.resume(session)?;
            return Ok(branch);
        }
        if join {
            let branch = self.lookup(xid)?;
            branch.associate(session)?;
            return Ok(branch);
        }
        let branch = Arc::new(DtxBranch::new(xid.clone(), Arc::clone(store)));
        if !self.register(Arc::clone(&branch)) {
            return Err(DtxError::AlreadyKnown(xid.clone()));
        }
        branch.associate(session)?;
        debug!(xid = %xid, session, "Started dtx branch");
        Ok(branch)
    }

    pub fn end(&self, xid: &Xid, session: u64, fail: bool, suspend: bool) -> Result<(), DtxError> {
        let branch = self.lookup(xid)?;
        if suspend {
            branch.suspend(session)
        } else {
            branch.end(session, fail)
        }
    }

    pub fn prepare(&self, xid: &Xid) -> Result<(), DtxError> {
        self.lookup(xid)?.prepare()
    }

    pub fn commit(&self, xid: &Xid, one_phase: bool) -> Result<(), DtxError> {
        let branch = self.lookup(xid)?;
        branch.commit(one_phase)?;
        self.unregister(xid);
        Ok(())
    }

    pub fn rollback(&self, xid: &Xid) -> Result<(), DtxError> {
        let branch = self.lookup(xid)?;
        branch.rollback()?;
        self.unregister(xid);
        Ok(())
    }

    /// Drops a branch that reached an outcome but is still registered.
    pub fn forget(&self, xid: &Xid) -> Result<(), DtxError> {
        let branch = self.lookup(xid)?;
        let state = branch.state();
        if !state.is_terminal() {
            return Err(DtxError::InvalidState {
                xid: xid.clone(),
                state,
                operation: "forget",
            });
        }
        self.unregister(xid);
        Ok(())
    }

    /// Xids of prepared branches, for `dtx.recover`.
    pub fn prepared_xids(&self) -> Vec<Xid> {
        let mut xids: Vec<Xid> = self
            .branches
            .iter()
            .filter(|b| b.value().state() == DtxState::Prepared)
            .map(|b| b.key().clone())
            .collect();
        xids.sort_by(|a, b| {
            (a.format, &a.global_id, &a.branch_id).cmp(&(b.format, &b.global_id, &b.branch_id))
        });
        xids
    }

    /// Ends every association `session` still holds, e.g. on channel close.
    /// Branches that never reached an outcome are rolled back.
    pub fn end_associations(&self, session: u64) -> usize {
        let branches: Vec<Arc<DtxBranch>> = self
            .branches
            .iter()
            .filter(|b| b.value().session() == Some(session))
            .map(|b| Arc::clone(b.value()))
            .collect();
        for branch in &branches {
            if branch.end(session, true).is_ok() && branch.rollback().is_ok() {
                self.unregister(branch.xid());
            }
        }
        branches.len()
    }

    fn lookup(&self, xid: &Xid) -> Result<Arc<DtxBranch>, DtxError> {
        self.get(xid).ok_or_else(|| DtxError::UnknownXid(xid.clone()))
    }
}
