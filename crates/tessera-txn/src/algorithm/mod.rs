//! Concurrency-control algorithms.
//!
//! An algorithm owns the table of live transaction records on a node and
//! implements the transactional operations on top of a
//! [`LockManager`](crate::lock::LockManager) and a
//! [`VersioningStore`](tessera_mvcc::VersioningStore). Two are provided:
//!
//! - [`TwoPhaseLocking`]: reads and writes take conflicting locks held to
//!   the end of the transaction.
//! - [`Mvcc2pl`]: a writer coexists with readers until prepare promotes
//!   its write locks to commit locks.
//!
//! Both are a [`LockingAlgorithm`] over their own [`LockingPolicy`], and
//! both forward operations on keys owned by other nodes through a
//! [`RemoteCoordinator`] when one is configured.

mod locking;
mod mvcc2pl;
mod two_phase_locking;

pub use locking::{AlgorithmStats, AuditReport, LockingAlgorithm, LockingPolicy};
pub use mvcc2pl::{Mvcc2pl, TwoVersionLocking};
pub use two_phase_locking::{StrictLocking, TwoPhaseLocking};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tessera_common::types::{Key, TxnId, Value};

use crate::error::{TxnError, TxnResult};
use crate::remote::RemoteCoordinator;
use crate::transaction::TxnHandle;

/// The transactional interface of a node.
///
/// `locality` is the affinity hash of the key; keys not owned by this node
/// are forwarded to their owner.
pub trait ConcurrencyControl: Send + Sync {
    /// Per-transaction state kept by the algorithm.
    type Payload: Send + 'static;

    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Creates an active record. Fails if `txn_id` is already live.
    fn begin(&self, txn_id: TxnId) -> TxnResult<()>;

    /// Reads `key` as seen by the transaction.
    fn read(&self, txn_id: TxnId, key: &Key, locality: u32) -> TxnResult<Option<Value>>;

    /// Buffers a write.
    fn write(&self, txn_id: TxnId, key: Key, value: Value, locality: u32) -> TxnResult<()>;

    /// Makes the local part of the transaction ready to commit.
    fn prepare(&self, txn_id: TxnId) -> TxnResult<()>;

    /// Commits a prepared transaction on this node.
    fn commit(&self, txn_id: TxnId) -> TxnResult<()>;

    /// Aborts the transaction here and on every participant.
    fn abort(&self, txn_id: TxnId) -> TxnResult<()>;

    /// Periodic maintenance hook.
    fn checkpoint(&self);

    /// Live record for `txn_id`, if any.
    fn lookup(&self, txn_id: TxnId) -> Option<TxnHandle<Self::Payload>>;

    /// Number of live records.
    fn live_transactions(&self) -> usize;

    /// Coordinator for non-local keys, if this node is part of a cluster.
    fn coordinator(&self) -> Option<&RemoteCoordinator>;

    /// Prepares and commits, running two-phase commit when the transaction
    /// has remote participants.
    fn try_commit(&self, txn_id: TxnId) -> TxnResult<()> {
        let handle = self.lookup(txn_id).ok_or(TxnError::NotLive(txn_id))?;
        let distributed = !handle.lock().participants().is_empty();

        match self.coordinator() {
            Some(coordinator) if distributed => coordinator.two_phase_commit(self, &handle),
            _ => {
                self.prepare(txn_id)?;
                self.commit(txn_id)
            }
        }
    }
}

/// Selects one of the bundled algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmKind {
    /// [`TwoPhaseLocking`].
    TwoPhaseLocking,
    /// [`Mvcc2pl`].
    #[default]
    Mvcc2pl,
}

impl AlgorithmKind {
    /// Configuration name of the algorithm.
    pub fn as_str(self) -> &'static str {
        match self {
            AlgorithmKind::TwoPhaseLocking => TwoPhaseLocking::NAME,
            AlgorithmKind::Mvcc2pl => Mvcc2pl::NAME,
        }
    }
}

impl fmt::Display for AlgorithmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlgorithmKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "two_phase_locking" | "2pl" => Ok(AlgorithmKind::TwoPhaseLocking),
            "mvcc2pl" | "mvcc" => Ok(AlgorithmKind::Mvcc2pl),
            other => Err(format!("unknown algorithm: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algorithm_kind_parse() {
        assert_eq!(
            "two_phase_locking".parse::<AlgorithmKind>(),
            Ok(AlgorithmKind::TwoPhaseLocking)
        );
        assert_eq!("mvcc".parse::<AlgorithmKind>(), Ok(AlgorithmKind::Mvcc2pl));
        assert!("occ".parse::<AlgorithmKind>().is_err());
        assert_eq!(AlgorithmKind::default().to_string(), "mvcc2pl");
    }
}
