//! Transaction error types.

use serde::{Deserialize, Serialize};
use tessera_common::types::{NodeId, TxnId};
use thiserror::Error;

/// Errors returned by transaction operations.
///
/// Serializable so a participant can hand the exact failure back to the
/// coordinator inside a [`Response`](crate::message::Response).
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum TxnError {
    /// No live record exists for the transaction on this node.
    #[error("transaction {0} is not live")]
    NotLive(TxnId),

    /// `begin` was called for an id that is already live.
    #[error("transaction {0} already exists")]
    DuplicateTransaction(TxnId),

    /// `commit` was called before a successful `prepare`.
    #[error("transaction {0} is not prepared")]
    NotPrepared(TxnId),

    /// `read` or `write` was called after a successful `prepare`.
    #[error("transaction {0} is already prepared")]
    AlreadyPrepared(TxnId),

    /// A lock request was refused and the transaction was aborted.
    #[error("transaction {txn} aborted: {reason}")]
    LockAborted {
        /// Transaction that was aborted.
        txn: TxnId,
        /// The lock failure.
        reason: String,
    },

    /// A participant failed or could not be reached; the transaction was
    /// aborted on every node.
    #[error("transaction {txn} aborted after failure on node {node}: {reason}")]
    RemoteFailure {
        /// Transaction that was aborted.
        txn: TxnId,
        /// Node that failed.
        node: NodeId,
        /// Description of the failure.
        reason: String,
    },

    /// At least one participant voted no during prepare.
    #[error("transaction {0} was refused by a participant and aborted")]
    CommitRefused(TxnId),

    /// The operation did not run to completion on the serving node.
    #[error("transaction {txn} operation failed internally: {reason}")]
    Internal {
        /// Transaction the operation belonged to.
        txn: TxnId,
        /// Description of the failure.
        reason: String,
    },
}

impl TxnError {
    /// The transaction this error refers to.
    pub fn txn_id(&self) -> TxnId {
        match self {
            TxnError::NotLive(txn)
            | TxnError::DuplicateTransaction(txn)
            | TxnError::NotPrepared(txn)
            | TxnError::AlreadyPrepared(txn)
            | TxnError::CommitRefused(txn) => *txn,
            TxnError::LockAborted { txn, .. }
            | TxnError::RemoteFailure { txn, .. }
            | TxnError::Internal { txn, .. } => *txn,
        }
    }

    /// Returns true if the transaction no longer exists after this error.
    pub fn is_abort(&self) -> bool {
        matches!(
            self,
            TxnError::LockAborted { .. }
                | TxnError::RemoteFailure { .. }
                | TxnError::CommitRefused(_)
        )
    }
}

/// Result type for transaction operations.
pub type TxnResult<T> = Result<T, TxnError>;
