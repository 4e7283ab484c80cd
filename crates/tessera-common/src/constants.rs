//! System-wide constants for Tessera.

/// Default number of worker threads serving requests on a node.
pub const DEFAULT_WORKER_THREADS: usize = 15;

/// Default interval between two checkpoint invocations, in milliseconds.
pub const DEFAULT_CHECKPOINT_INTERVAL_MS: u64 = 15_000;

/// Default lock wait timeout when the timeout wait policy is selected,
/// in milliseconds.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 1_000;

/// Transactions live longer than this (milliseconds) are reported by the
/// checkpoint audit.
pub const DEFAULT_STALL_THRESHOLD_MS: u64 = 60_000;

/// Name given to the versioning store's merge thread.
pub const MERGE_THREAD_NAME: &str = "tessera-merge";

/// Name given to the checkpoint thread.
pub const CHECKPOINT_THREAD_NAME: &str = "tessera-checkpoint";

/// Fixed SipHash keys for key locality hashing.
///
/// These must never change: every node and client derives key ownership
/// from the same hash.
pub const LOCALITY_HASH_KEYS: (u64, u64) = (0, 0);
