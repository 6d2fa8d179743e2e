//! Transactions: lazy id assignment, relation locks held to the end and
//! commit or abort callbacks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gtm::Gtm;
use crate::lock::{LockError, LockManager, LockMode, LockTag};
use crate::{LocalTransactionId, TransactionId};

/// Transaction status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnStatus {
    /// Active running.
    Active,
    /// Committed.
    Committed,
    /// Aborted.
    Aborted,
}

/// Errors raised by transaction state checks.
#[derive(Debug, Error)]
pub enum TxnError {
    /// Lock acquisition failed.
    #[error(transparent)]
    Lock(#[from] LockError),
    /// Write attempted in a read-only transaction.
    #[error("cannot execute {0} in a read-only transaction")]
    ReadOnly(String),
    /// Write attempted while parallel workers may be running.
    #[error("cannot execute {0} during a parallel operation")]
    ParallelMode(String),
}

/// Options for a new transaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct TxnOptions {
    /// Reject commands that modify non-temporary data.
    pub read_only: bool,
}

type EndAction = Box<dyn FnOnce() + Send>;

/// Allocates transactions and owns the shared lock table.
pub struct TxnManager {
    gtm: Gtm,
    lock_mgr: LockManager,
    statuses: Mutex<HashMap<TransactionId, TxnStatus>>,
}

impl Default for TxnManager {
    fn default() -> Self {
        Self::new(Gtm::default())
    }
}

impl TxnManager {
    /// Manager handing out ids from `gtm`.
    pub fn new(gtm: Gtm) -> Self {
        Self {
            gtm,
            lock_mgr: LockManager::default(),
            statuses: Mutex::new(HashMap::new()),
        }
    }

    /// Begin a new transaction.
    pub fn begin(self: &Arc<Self>, opts: TxnOptions) -> Transaction {
        let lxid = self.gtm.alloc_lxid();
        tracing::trace!(?lxid, read_only = opts.read_only, "transaction started");
        Transaction {
            manager: Arc::clone(self),
            lxid,
            xid: Mutex::new(None),
            read_only: opts.read_only,
            parallel: AtomicBool::new(false),
            on_commit: Mutex::new(Vec::new()),
            on_abort: Mutex::new(Vec::new()),
            finished: false,
        }
    }

    /// Shared lock table.
    pub fn lock_manager(&self) -> &LockManager {
        &self.lock_mgr
    }

    /// Id allocator.
    pub fn gtm(&self) -> &Gtm {
        &self.gtm
    }

    /// Final status of a transaction that was assigned an xid.
    pub fn status(&self, xid: TransactionId) -> Option<TxnStatus> {
        self.statuses.lock().get(&xid).copied()
    }
}

/// A running transaction. Dropping it without committing aborts it.
pub struct Transaction {
    manager: Arc<TxnManager>,
    lxid: LocalTransactionId,
    xid: Mutex<Option<TransactionId>>,
    read_only: bool,
    parallel: AtomicBool,
    on_commit: Mutex<Vec<EndAction>>,
    on_abort: Mutex<Vec<EndAction>>,
    finished: bool,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("lxid", &self.lxid)
            .field("xid", &*self.xid.lock())
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

impl Transaction {
    /// Local id, always assigned.
    pub fn lxid(&self) -> LocalTransactionId {
        self.lxid
    }

    /// Permanent id, assigning one on first use.
    pub fn top_xid(&self) -> TransactionId {
        let mut xid = self.xid.lock();
        *xid.get_or_insert_with(|| {
            let assigned = self.manager.gtm.alloc_xid();
            self.manager
                .statuses
                .lock()
                .insert(assigned, TxnStatus::Active);
            assigned
        })
    }

    /// Permanent id if one has been assigned.
    pub fn xid_if_assigned(&self) -> Option<TransactionId> {
        *self.xid.lock()
    }

    /// Whether the transaction was started read-only.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Enter parallel mode; writes are refused until it is left.
    pub fn enter_parallel_mode(&self) {
        self.parallel.store(true, Ordering::Release);
    }

    /// Leave parallel mode.
    pub fn exit_parallel_mode(&self) {
        self.parallel.store(false, Ordering::Release);
    }

    /// Whether parallel mode is active.
    pub fn is_parallel_mode(&self) -> bool {
        self.parallel.load(Ordering::Acquire)
    }

    /// Refuse `cmd` in a read-only transaction.
    pub fn prevent_if_read_only(&self, cmd: &str) -> Result<(), TxnError> {
        if self.read_only {
            return Err(TxnError::ReadOnly(cmd.to_string()));
        }
        Ok(())
    }

    /// Refuse `cmd` in parallel mode.
    pub fn prevent_if_parallel_mode(&self, cmd: &str) -> Result<(), TxnError> {
        if self.is_parallel_mode() {
            return Err(TxnError::ParallelMode(cmd.to_string()));
        }
        Ok(())
    }

    /// Lock a relation until the end of the transaction.
    pub fn lock_relation(&self, tag: LockTag, mode: LockMode) -> Result<(), TxnError> {
        self.manager.lock_mgr.lock(self.lxid, tag, mode)?;
        Ok(())
    }

    /// Whether this transaction holds `mode` or stronger on `tag`.
    pub fn holds_lock(&self, tag: LockTag, mode: LockMode) -> bool {
        self.manager.lock_mgr.holds(self.lxid, tag, mode)
    }

    /// Run `action` if the transaction commits.
    pub fn on_commit(&self, action: impl FnOnce() + Send + 'static) {
        self.on_commit.lock().push(Box::new(action));
    }

    /// Run `action` if the transaction aborts. Actions run newest first.
    pub fn on_abort(&self, action: impl FnOnce() + Send + 'static) {
        self.on_abort.lock().push(Box::new(action));
    }

    /// Commit: run commit actions, then release locks.
    pub fn commit(mut self) -> TxnStatus {
        self.finish(TxnStatus::Committed)
    }

    /// Abort: undo via abort actions, then release locks.
    pub fn abort(mut self) -> TxnStatus {
        self.finish(TxnStatus::Aborted)
    }

    fn finish(&mut self, status: TxnStatus) -> TxnStatus {
        self.finished = true;
        let (run, discard) = match status {
            TxnStatus::Committed => (&self.on_commit, &self.on_abort),
            _ => (&self.on_abort, &self.on_commit),
        };
        discard.lock().clear();
        let actions = std::mem::take(&mut *run.lock());
        for action in actions.into_iter().rev() {
            action();
        }
        if let Some(xid) = *self.xid.lock() {
            self.manager.statuses.lock().insert(xid, status);
        }
        self.manager.lock_mgr.release_all(self.lxid);
        tracing::trace!(lxid = ?self.lxid, ?status, "transaction finished");
        status
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            self.finish(TxnStatus::Aborted);
        }
    }
}
