//! Background merge worker.
//!
//! The single consumer of the pending-commit queue. It suspends on the
//! queue's condition variable while there is nothing to merge.

use std::sync::atomic::Ordering as AtomicOrdering;

use tracing::{debug, trace};

use super::Shared;

/// Runs the merge loop until shutdown is requested.
pub(crate) fn run(shared: &Shared) {
    debug!("merge worker started");

    loop {
        let next = {
            let mut pending = shared.pending.lock();
            while pending.is_empty() && !shared.shutdown.load(AtomicOrdering::Acquire) {
                shared.pending_signal.wait(&mut pending);
            }
            if shared.shutdown.load(AtomicOrdering::Acquire) {
                debug!(unmerged = pending.len(), "merge worker stopping");
                break;
            }
            pending.back().cloned()
        };

        let Some(buffer) = next else {
            continue;
        };

        // Write into primary before dequeueing so a concurrent read finds
        // the value in one place or the other.
        {
            let mut primary = shared.primary.write();
            for (key, value) in &buffer.writes {
                primary.insert(key.clone(), value.clone());
            }
        }

        let mut pending = shared.pending.lock();
        pending.pop_back();
        shared.stats.record_merge(buffer.writes.len());
        shared.merged_signal.notify_all();
        trace!(txn = %buffer.txn_id, keys = buffer.writes.len(), "merged write buffer");
    }
}
