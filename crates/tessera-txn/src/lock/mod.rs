//! Per-key lock management.
//!
//! The lock manager records, per key, an ordered list of `(transaction,
//! mode)` grants and blocks requests that conflict with a grant held by a
//! *different* transaction. Which modes conflict is not hard-wired: every
//! lock manager is built around a [`CompatibilityTable`] supplied by the
//! concurrency-control algorithm that owns it.
//!
//! # Compatibility tables
//!
//! A cell reads "a holder of the row mode admits a requester of the column
//! mode".
//!
//! ```text
//! two_phase_locking        mvcc2pl
//!        │ R │ W │ C │            │ R │ W │ C │
//! ───────┼───┼───┼───┤     ───────┼───┼───┼───┤
//!    R   │ ✓ │ ✗ │ ✗ │         R  │ ✓ │ ✓ │ ✗ │
//!    W   │ ✗ │ ✗ │ ✗ │         W  │ ✓ │ ✗ │ ✗ │
//!    C   │ ✗ │ ✗ │ ✗ │         C  │ ✗ │ ✗ │ ✗ │
//! ```
//!
//! # Waiting
//!
//! Each key owns a mutex and a condition variable. A blocked requester
//! sleeps on the key's condition variable and is woken whenever a grant on
//! that key is released or replaced; it then re-evaluates compatibility.
//! There is no deadlock detection: with [`WaitPolicy::Block`] a cycle of
//! waiters stays blocked forever. [`WaitPolicy::NoWait`] and
//! [`WaitPolicy::Timeout`] turn a conflict into a [`LockError`] instead.
//!
//! Entries are created lazily and retired once no grant and no waiter
//! remains, so the table only ever holds keys that are in use.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tessera_common::types::{Key, TxnId};
use thiserror::Error;
use tracing::trace;

/// Lock mode requested on a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LockMode {
    /// Read lock.
    Read,
    /// Write lock.
    Write,
    /// Commit lock, taken by promoting a write lock during prepare.
    Commit,
}

impl LockMode {
    /// All lock modes, in declaration order.
    pub const ALL: [LockMode; 3] = [LockMode::Read, LockMode::Write, LockMode::Commit];
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Read => write!(f, "R"),
            LockMode::Write => write!(f, "W"),
            LockMode::Commit => write!(f, "C"),
        }
    }
}

/// Mapping from a held mode to the set of requested modes it admits.
///
/// Modes without an entry admit nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompatibilityTable {
    admits: HashMap<LockMode, HashSet<LockMode>>,
}

impl CompatibilityTable {
    /// Creates a table in which every pair of modes conflicts.
    pub fn exclusive_only() -> Self {
        Self::default()
    }

    /// Table for pure two-phase locking: reads share, writes exclude.
    pub fn two_phase_locking() -> Self {
        Self::default().admit(LockMode::Read, &[LockMode::Read])
    }

    /// Table for two-version locking: a single writer may coexist with
    /// readers until it is promoted to a commit lock.
    pub fn mvcc2pl() -> Self {
        Self::default()
            .admit(LockMode::Read, &[LockMode::Read, LockMode::Write])
            .admit(LockMode::Write, &[LockMode::Read])
    }

    /// Declares that a holder of `held` admits requesters of `requested`.
    #[must_use]
    pub fn admit(mut self, held: LockMode, requested: &[LockMode]) -> Self {
        self.admits
            .entry(held)
            .or_default()
            .extend(requested.iter().copied());
        self
    }

    /// Returns true if a grant in `held` mode admits a request for `requested`.
    pub fn is_compatible(&self, held: LockMode, requested: LockMode) -> bool {
        self.admits
            .get(&held)
            .is_some_and(|set| set.contains(&requested))
    }
}

/// What a requester does when its request conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitPolicy {
    /// Wait until the request becomes grantable.
    #[default]
    Block,
    /// Fail immediately.
    NoWait,
    /// Wait at most the given duration.
    Timeout(Duration),
}

/// Configuration for the lock manager.
#[derive(Debug, Clone, Default)]
pub struct LockManagerConfig {
    /// Behaviour on conflict.
    pub wait_policy: WaitPolicy,
}

impl LockManagerConfig {
    /// Configuration that gives up on conflicting requests after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            wait_policy: WaitPolicy::Timeout(timeout),
        }
    }
}

/// Reasons a lock request is refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// The request conflicted and the policy forbids waiting.
    #[error("{mode} lock on {key} conflicts with another transaction")]
    Conflict {
        /// Key requested.
        key: Key,
        /// Mode requested.
        mode: LockMode,
    },

    /// The request was not granted before the deadline.
    #[error("timed out after {waited_ms}ms waiting for {mode} lock on {key}")]
    Timeout {
        /// Key requested.
        key: Key,
        /// Mode requested.
        mode: LockMode,
        /// Time spent waiting.
        waited_ms: u64,
    },
}

/// Result type for lock operations.
pub type LockResult<T> = Result<T, LockError>;

/// Lock modes a single transaction holds, by key.
///
/// Owned by the transaction record and handed back to
/// [`LockManager::release_all`] when the transaction ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeldLocks {
    locks: HashMap<Key, Vec<LockMode>>,
}

impl HeldLocks {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if `mode` is held on `key`.
    pub fn holds(&self, key: &Key, mode: LockMode) -> bool {
        self.locks.get(key).is_some_and(|modes| modes.contains(&mode))
    }

    /// Records that `mode` is held on `key`.
    pub fn add(&mut self, key: Key, mode: LockMode) {
        let modes = self.locks.entry(key).or_default();
        if !modes.contains(&mode) {
            modes.push(mode);
        }
    }

    /// Replaces every mode held on `key` with `mode`.
    pub fn replace(&mut self, key: Key, mode: LockMode) {
        self.locks.insert(key, vec![mode]);
    }

    /// Modes held on `key`, in acquisition order.
    pub fn modes(&self, key: &Key) -> &[LockMode] {
        self.locks.get(key).map_or(&[], Vec::as_slice)
    }

    /// Keys on which `mode` is held.
    pub fn keys_holding(&self, mode: LockMode) -> Vec<Key> {
        self.locks
            .iter()
            .filter(|(_, modes)| modes.contains(&mode))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Iterates over all keys with at least one lock.
    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.locks.keys()
    }

    /// Number of keys locked.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Returns true if nothing is held.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Statistics for the lock manager.
#[derive(Debug, Default)]
pub struct LockStats {
    /// Total locks granted.
    pub acquisitions: AtomicU64,
    /// Total grants released.
    pub releases: AtomicU64,
    /// Requests that had to wait at least once.
    pub waits: AtomicU64,
    /// Successful promotions.
    pub promotions: AtomicU64,
    /// Requests refused by the wait policy.
    pub refusals: AtomicU64,
}

impl LockStats {
    /// Creates new stats.
    pub fn new() -> Self {
        Self::default()
    }

    fn record_acquisition(&self) {
        self.acquisitions.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn record_releases(&self, count: usize) {
        self.releases
            .fetch_add(count as u64, AtomicOrdering::Relaxed);
    }

    fn record_wait(&self) {
        self.waits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn record_promotion(&self) {
        self.promotions.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn record_refusal(&self) {
        self.refusals.fetch_add(1, AtomicOrdering::Relaxed);
    }
}

/// How a grantable request changes the grant list.
#[derive(Clone, Copy)]
enum GrantAction<'a> {
    /// Append the requested mode.
    Add,
    /// Drop the requester's grants in the given modes, then append.
    Replace(&'a [LockMode]),
}

#[derive(Default)]
struct EntryState {
    grants: Vec<(TxnId, LockMode)>,
    waiters: usize,
    retired: bool,
}

#[derive(Default)]
struct LockEntry {
    state: Mutex<EntryState>,
    released: Condvar,
}

/// The lock manager.
pub struct LockManager {
    table: CompatibilityTable,
    entries: RwLock<HashMap<Key, Arc<LockEntry>>>,
    config: LockManagerConfig,
    stats: LockStats,
}

impl LockManager {
    /// Creates a lock manager with the default (blocking) configuration.
    pub fn new(table: CompatibilityTable) -> Self {
        Self::with_config(table, LockManagerConfig::default())
    }

    /// Creates a lock manager with the given configuration.
    pub fn with_config(table: CompatibilityTable, config: LockManagerConfig) -> Self {
        Self {
            table,
            entries: RwLock::new(HashMap::new()),
            config,
            stats: LockStats::new(),
        }
    }

    /// Acquires `mode` on `key` for `txn_id`, waiting per the configured
    /// policy. Already holding exactly `mode` is a no-op.
    pub fn acquire(&self, txn_id: TxnId, key: &Key, mode: LockMode) -> LockResult<()> {
        self.grant(txn_id, key, mode, GrantAction::Add)
    }

    /// Atomically replaces the grants `txn_id` holds on `key` in any of
    /// the `current` modes with a single grant in `new`.
    ///
    /// Waits until `new` is compatible with every other holder; the
    /// `current` grants stay in force while waiting.
    pub fn promote(
        &self,
        txn_id: TxnId,
        key: &Key,
        current: &[LockMode],
        new: LockMode,
    ) -> LockResult<()> {
        self.grant(txn_id, key, new, GrantAction::Replace(current))?;
        self.stats.record_promotion();
        Ok(())
    }

    /// Releases every grant `txn_id` holds on the keys in `held`.
    pub fn release_all(&self, txn_id: TxnId, held: &HeldLocks) {
        for key in held.keys() {
            self.release_where(key, |owner, _| owner == txn_id);
        }
    }

    /// Releases a single grant.
    pub fn release(&self, txn_id: TxnId, key: &Key, mode: LockMode) {
        self.release_where(key, |owner, held| owner == txn_id && held == mode);
    }

    /// Current grants on `key`, oldest first.
    pub fn holders(&self, key: &Key) -> Vec<(TxnId, LockMode)> {
        let entry = self.entries.read().get(key).cloned();
        entry.map_or_else(Vec::new, |entry| entry.state.lock().grants.clone())
    }

    /// Number of keys with an entry in the table.
    pub fn lock_count(&self) -> usize {
        self.entries.read().len()
    }

    /// The compatibility table this manager enforces.
    pub fn compatibility(&self) -> &CompatibilityTable {
        &self.table
    }

    /// Returns lock statistics.
    pub fn stats(&self) -> &LockStats {
        &self.stats
    }

    fn grantable(&self, grants: &[(TxnId, LockMode)], txn_id: TxnId, mode: LockMode) -> bool {
        grants
            .iter()
            .all(|&(owner, held)| owner == txn_id || self.table.is_compatible(held, mode))
    }

    fn grant(
        &self,
        txn_id: TxnId,
        key: &Key,
        mode: LockMode,
        action: GrantAction<'_>,
    ) -> LockResult<()> {
        let started = Instant::now();
        let deadline = match self.config.wait_policy {
            WaitPolicy::Timeout(timeout) => Some(started + timeout),
            _ => None,
        };

        loop {
            let entry = self.entry(key);
            let mut state = entry.state.lock();
            if state.retired {
                continue;
            }

            if let GrantAction::Add = action {
                if state.grants.contains(&(txn_id, mode)) {
                    return Ok(());
                }
            }

            let mut waited = false;
            while !self.grantable(&state.grants, txn_id, mode) {
                let refused = match (self.config.wait_policy, deadline) {
                    (WaitPolicy::NoWait, _) => true,
                    (_, Some(deadline)) => {
                        self.note_wait(&mut waited, txn_id, key, mode);
                        state.waiters += 1;
                        let result = entry.released.wait_until(&mut state, deadline);
                        state.waiters -= 1;
                        result.timed_out() && !self.grantable(&state.grants, txn_id, mode)
                    }
                    (_, None) => {
                        self.note_wait(&mut waited, txn_id, key, mode);
                        state.waiters += 1;
                        entry.released.wait(&mut state);
                        state.waiters -= 1;
                        false
                    }
                };

                if refused {
                    self.stats.record_refusal();
                    let idle = state.grants.is_empty() && state.waiters == 0;
                    drop(state);
                    if idle {
                        self.retire_if_idle(key, &entry);
                    }
                    return Err(match self.config.wait_policy {
                        WaitPolicy::NoWait => LockError::Conflict {
                            key: key.clone(),
                            mode,
                        },
                        _ => LockError::Timeout {
                            key: key.clone(),
                            mode,
                            waited_ms: started.elapsed().as_millis() as u64,
                        },
                    });
                }
            }

            if let GrantAction::Replace(current) = action {
                let before = state.grants.len();
                state
                    .grants
                    .retain(|&(owner, held)| owner != txn_id || !current.contains(&held));
                if state.grants.len() != before {
                    entry.released.notify_all();
                }
            }
            if !state.grants.contains(&(txn_id, mode)) {
                state.grants.push((txn_id, mode));
            }
            self.stats.record_acquisition();
            return Ok(());
        }
    }

    fn note_wait(&self, waited: &mut bool, txn_id: TxnId, key: &Key, mode: LockMode) {
        if !*waited {
            *waited = true;
            self.stats.record_wait();
            trace!(txn = %txn_id, %key, %mode, "waiting for lock");
        }
    }

    fn release_where<F>(&self, key: &Key, matches: F)
    where
        F: Fn(TxnId, LockMode) -> bool,
    {
        let Some(entry) = self.entries.read().get(key).cloned() else {
            return;
        };

        let idle = {
            let mut state = entry.state.lock();
            let before = state.grants.len();
            state.grants.retain(|&(owner, held)| !matches(owner, held));
            let released = before - state.grants.len();
            if released > 0 {
                self.stats.record_releases(released);
                entry.released.notify_all();
            }
            state.grants.is_empty() && state.waiters == 0
        };

        if idle {
            self.retire_if_idle(key, &entry);
        }
    }

    fn entry(&self, key: &Key) -> Arc<LockEntry> {
        if let Some(entry) = self.entries.read().get(key) {
            return Arc::clone(entry);
        }
        Arc::clone(self.entries.write().entry(key.clone()).or_default())
    }

    /// Removes the entry for `key` if it is still `entry` and unused.
    ///
    /// Lock order is table, then entry. Requesters that fetched the entry
    /// before removal observe `retired` and fetch a fresh one.
    fn retire_if_idle(&self, key: &Key, entry: &Arc<LockEntry>) {
        let mut entries = self.entries.write();
        let Some(current) = entries.get(key) else {
            return;
        };
        if !Arc::ptr_eq(current, entry) {
            return;
        }
        let mut state = entry.state.lock();
        if state.grants.is_empty() && state.waiters == 0 && !state.retired {
            state.retired = true;
            entries.remove(key);
        }
    }
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockManager")
            .field("locked_keys", &self.lock_count())
            .field("wait_policy", &self.config.wait_policy)
            .field(
                "acquisitions",
                &self.stats.acquisitions.load(AtomicOrdering::Relaxed),
            )
            .finish()
    }
}
