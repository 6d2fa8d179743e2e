//! Errors surfaced by sequence operations.

use thiserror::Error;

use seqam_catalog::CatalogError;
use seqam_config::ConfigError;
use seqam_storage::StorageError;
use seqam_txn::{LockError, TxnError};

/// Failure of a sequence operation. Each variant maps to one SQLSTATE.
#[derive(Debug, Error)]
pub enum SequenceError {
    /// Bad magic word or missing tuple on the sequence page.
    #[error("{0}")]
    CorruptSequence(String),
    /// `nextval` ran past the bound of a non-cycling sequence.
    #[error("{0}")]
    LimitExceeded(String),
    /// Option validation failed.
    #[error("{0}")]
    InvalidParameter(String),
    /// `currval` or `lastval` before any `nextval`.
    #[error("{0}")]
    NotYetDefined(String),
    /// Missing privilege.
    #[error("{0}")]
    PermissionDenied(String),
    /// Write attempted in a read-only transaction.
    #[error("{0}")]
    ReadOnlyTransaction(String),
    /// Write attempted in parallel mode.
    #[error("{0}")]
    UnsafeInParallelMode(String),
    /// Access method handler returned an incomplete routine.
    #[error("{0}")]
    BadAccessMethodHandle(String),
    /// `setval` value outside the sequence bounds.
    #[error("{0}")]
    OutOfBounds(String),
    /// Operation not supported for this object.
    #[error("{0}")]
    FeatureNotSupported(String),
    /// Named object does not exist.
    #[error("{0}")]
    UndefinedObject(String),
    /// Named relation or column does not exist.
    #[error("{0}")]
    UndefinedTable(String),
    /// Conflicting, redundant or malformed options.
    #[error("{0}")]
    SyntaxError(String),
    /// Object exists but is of the wrong kind.
    #[error("{0}")]
    WrongObjectType(String),
    /// Object exists but is in the wrong state.
    #[error("{0}")]
    PrerequisiteState(String),
    /// Invariant violation inside the engine.
    #[error("{0}")]
    Internal(String),
    /// Storage layer failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// Catalog failure.
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    /// Lock failure.
    #[error(transparent)]
    Lock(#[from] LockError),
    /// Settings failure.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<TxnError> for SequenceError {
    fn from(err: TxnError) -> Self {
        match err {
            TxnError::Lock(e) => SequenceError::Lock(e),
            e @ TxnError::ReadOnly(_) => SequenceError::ReadOnlyTransaction(e.to_string()),
            e @ TxnError::ParallelMode(_) => SequenceError::UnsafeInParallelMode(e.to_string()),
        }
    }
}

impl SequenceError {
    /// SQLSTATE code.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            SequenceError::CorruptSequence(_) => "XX001",
            SequenceError::LimitExceeded(_) => "2200H",
            SequenceError::InvalidParameter(_) => "22023",
            SequenceError::NotYetDefined(_) => "55000",
            SequenceError::PermissionDenied(_) => "42501",
            SequenceError::ReadOnlyTransaction(_) => "25006",
            SequenceError::UnsafeInParallelMode(_) => "25000",
            SequenceError::BadAccessMethodHandle(_) => "XX000",
            SequenceError::OutOfBounds(_) => "22003",
            SequenceError::FeatureNotSupported(_) => "0A000",
            SequenceError::UndefinedObject(_) => "42704",
            SequenceError::UndefinedTable(_) => "42P01",
            SequenceError::SyntaxError(_) => "42601",
            SequenceError::WrongObjectType(_) => "42809",
            SequenceError::PrerequisiteState(_) => "55000",
            SequenceError::Catalog(CatalogError::DuplicateRelation(_)) => "42P07",
            SequenceError::Catalog(CatalogError::RelationNotFound(_)) => "42P01",
            SequenceError::Lock(_) => "40P01",
            SequenceError::Config(_) => "22023",
            SequenceError::Internal(_)
            | SequenceError::Storage(_)
            | SequenceError::Catalog(_) => "XX000",
        }
    }
}

/// Result alias for sequence operations.
pub type Result<T> = std::result::Result<T, SequenceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn txn_errors_keep_their_message() {
        let err: SequenceError = TxnError::ReadOnly("nextval()".into()).into();
        assert_eq!(err.to_string(), "cannot execute nextval() in a read-only transaction");
        assert_eq!(err.sqlstate(), "25006");
        let err: SequenceError = TxnError::ParallelMode("setval()".into()).into();
        assert!(matches!(err, SequenceError::UnsafeInParallelMode(_)));
    }
}
