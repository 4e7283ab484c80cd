//! Two-version two-phase locking.
//!
//! A writer buffers its new version privately while readers keep reading
//! the last committed one, so reads and a single write on a key proceed
//! concurrently. At prepare every write lock is promoted to a commit lock,
//! which excludes all other holders: the writer waits for current readers
//! to finish and new readers wait for the writer to commit.
//!
//! ```text
//!  T1: W(k) ──────────── prepare: W→C (waits for T2) ── commit
//!  T2:    R(k)=old ── commit ─┘
//! ```

use super::locking::{LockingAlgorithm, LockingPolicy};
use crate::lock::{CompatibilityTable, LockMode};

/// Policy of [`Mvcc2pl`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TwoVersionLocking;

impl LockingPolicy for TwoVersionLocking {
    const NAME: &'static str = "mvcc2pl";
    const PREPARE_PROMOTION: Option<(LockMode, LockMode)> =
        Some((LockMode::Write, LockMode::Commit));

    fn compatibility() -> CompatibilityTable {
        CompatibilityTable::mvcc2pl()
    }
}

/// Locking plus multi-versioning.
pub type Mvcc2pl = LockingAlgorithm<TwoVersionLocking>;
