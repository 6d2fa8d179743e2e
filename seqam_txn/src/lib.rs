//! Transaction bookkeeping for sequence operations: id allocation,
//! relation locks and end-of-transaction actions.
#![deny(missing_docs)]

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod gtm;
pub mod lock;
pub mod txn;

pub use lock::{LockError, LockManager, LockMode, LockTag};
pub use txn::{Transaction, TxnError, TxnManager, TxnOptions, TxnStatus};

/// Permanent transaction id, assigned lazily when a transaction first writes
/// WAL-logged data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub u32);

impl TransactionId {
    /// No transaction.
    pub const INVALID: TransactionId = TransactionId(0);
    /// Bootstrap transaction.
    pub const BOOTSTRAP: TransactionId = TransactionId(1);
    /// Visible to every snapshot.
    pub const FROZEN: TransactionId = TransactionId(2);
    /// First id handed to a regular transaction.
    pub const FIRST_NORMAL: TransactionId = TransactionId(3);

    /// Whether the id refers to a transaction at all.
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    /// Whether the id was assigned to a regular transaction.
    pub fn is_normal(self) -> bool {
        self >= Self::FIRST_NORMAL
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-transaction id that is always assigned, even to read-only work.
/// Lock ownership and per-transaction caches key on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LocalTransactionId(pub u32);

impl LocalTransactionId {
    /// No transaction.
    pub const INVALID: LocalTransactionId = LocalTransactionId(0);
}
