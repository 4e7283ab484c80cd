//! Strict two-phase locking.
//!
//! Reads take [`LockMode::Read`], writes take [`LockMode::Write`]; a write
//! excludes every other holder. All locks are held until commit or abort,
//! and prepare only records that the transaction is ready.

use super::locking::{LockingAlgorithm, LockingPolicy};
use crate::lock::{CompatibilityTable, LockMode};

/// Policy of [`TwoPhaseLocking`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StrictLocking;

impl LockingPolicy for StrictLocking {
    const NAME: &'static str = "two_phase_locking";
    const PREPARE_PROMOTION: Option<(LockMode, LockMode)> = None;

    fn compatibility() -> CompatibilityTable {
        CompatibilityTable::two_phase_locking()
    }
}

/// Pure locking concurrency control.
pub type TwoPhaseLocking = LockingAlgorithm<StrictLocking>;
