//! Machinery shared by the lock-based algorithms.
//!
//! Both algorithms keep the same record (the locks a transaction holds),
//! route non-local keys the same way and end transactions the same way.
//! They differ in the compatibility of their lock modes and in what
//! prepare does, which a [`LockingPolicy`] supplies.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tessera_common::constants::DEFAULT_STALL_THRESHOLD_MS;
use tessera_common::types::{Key, TxnId, Value};
use tessera_mvcc::VersioningStore;
use tracing::{debug, info, warn};

use super::ConcurrencyControl;
use crate::error::{TxnError, TxnResult};
use crate::lock::{CompatibilityTable, HeldLocks, LockError, LockManager, LockMode};
use crate::remote::RemoteCoordinator;
use crate::transaction::{Transaction, TxnHandle};

/// Transaction counters for an algorithm.
#[derive(Debug, Default)]
pub struct AlgorithmStats {
    /// Transactions begun.
    pub begun: AtomicU64,
    /// Transactions committed on this node.
    pub committed: AtomicU64,
    /// Transactions aborted on this node, for any reason.
    pub aborted: AtomicU64,
    /// Aborts caused by a refused lock request.
    pub lock_aborts: AtomicU64,
    /// Aborts caused by a failed remote operation.
    pub remote_aborts: AtomicU64,
}

impl AlgorithmStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Committed count.
    pub fn committed(&self) -> u64 {
        self.committed.load(AtomicOrdering::Relaxed)
    }

    /// Aborted count.
    pub fn aborted(&self) -> u64 {
        self.aborted.load(AtomicOrdering::Relaxed)
    }
}

/// Snapshot taken by a checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditReport {
    /// Live records.
    pub live: usize,
    /// Live records in the prepared state.
    pub prepared: usize,
    /// Records that were locked by an in-flight operation and skipped.
    pub busy: usize,
    /// Records older than the stall threshold.
    pub stalled: Vec<TxnId>,
    /// Keys with an entry in the lock table.
    pub locked_keys: usize,
    /// Committed write sets not yet merged into primary storage.
    pub pending_merges: usize,
}

/// State and behaviour common to the lock-based algorithms.
struct LockingCore {
    transactions: DashMap<TxnId, TxnHandle<HeldLocks>>,
    lock_manager: Arc<LockManager>,
    store: Arc<VersioningStore>,
    coordinator: Option<Arc<RemoteCoordinator>>,
    stall_threshold: Duration,
    last_audit: Mutex<Option<AuditReport>>,
    stats: AlgorithmStats,
}

impl LockingCore {
    fn new(lock_manager: Arc<LockManager>, store: Arc<VersioningStore>) -> Self {
        Self {
            transactions: DashMap::new(),
            lock_manager,
            store,
            coordinator: None,
            stall_threshold: Duration::from_millis(DEFAULT_STALL_THRESHOLD_MS),
            last_audit: Mutex::new(None),
            stats: AlgorithmStats::default(),
        }
    }

    fn set_coordinator(&mut self, coordinator: Arc<RemoteCoordinator>) {
        self.coordinator = Some(coordinator);
    }

    fn set_stall_threshold(&mut self, threshold: Duration) {
        self.stall_threshold = threshold;
    }

    fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    fn store(&self) -> &Arc<VersioningStore> {
        &self.store
    }

    fn coordinator(&self) -> Option<&RemoteCoordinator> {
        self.coordinator.as_deref()
    }

    fn stats(&self) -> &AlgorithmStats {
        &self.stats
    }

    fn last_audit(&self) -> Option<AuditReport> {
        self.last_audit.lock().clone()
    }

    fn live_transactions(&self) -> usize {
        self.transactions.len()
    }

    fn lookup(&self, txn_id: TxnId) -> Option<TxnHandle<HeldLocks>> {
        self.transactions
            .get(&txn_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    fn begin(&self, txn_id: TxnId) -> TxnResult<()> {
        match self.transactions.entry(txn_id) {
            Entry::Occupied(_) => Err(TxnError::DuplicateTransaction(txn_id)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(Transaction::new(
                    txn_id,
                    HeldLocks::new(),
                ))));
                AlgorithmStats::bump(&self.stats.begun);
                debug!(txn = %txn_id, "begin");
                Ok(())
            }
        }
    }

    /// Coordinator to forward to, if keys with this hash live elsewhere.
    fn remote_owner(&self, locality: u32) -> Option<&RemoteCoordinator> {
        self.coordinator()
            .filter(|coordinator| !coordinator.is_local(locality))
    }

    /// Locks the live record for `txn_id`.
    ///
    /// Never called while holding a table shard, so a concurrent teardown
    /// cannot deadlock with it.
    fn with_live<T>(
        &self,
        txn_id: TxnId,
        f: impl FnOnce(&mut Transaction<HeldLocks>) -> TxnResult<T>,
    ) -> TxnResult<T> {
        let handle = self.lookup(txn_id).ok_or(TxnError::NotLive(txn_id))?;
        let mut txn = handle.lock();
        if txn.state().is_ended() {
            return Err(TxnError::NotLive(txn_id));
        }
        f(&mut *txn)
    }

    /// Like [`with_live`](Self::with_live), but refuses a prepared record.
    /// A prepared transaction has already fixed its lock set and write set.
    fn with_active<T>(
        &self,
        txn_id: TxnId,
        f: impl FnOnce(&mut Transaction<HeldLocks>) -> TxnResult<T>,
    ) -> TxnResult<T> {
        self.with_live(txn_id, |txn| {
            if txn.is_prepared() {
                return Err(TxnError::AlreadyPrepared(txn_id));
            }
            f(txn)
        })
    }

    fn read(&self, txn_id: TxnId, key: &Key, locality: u32) -> TxnResult<Option<Value>> {
        self.with_active(txn_id, |txn| {
            if let Some(coordinator) = self.remote_owner(locality) {
                return coordinator
                    .remote_read(txn_id, txn.participants_mut(), key, locality)
                    .map_err(|err| self.remote_abort(txn, err));
            }

            self.lock(txn, key, LockMode::Read)?;
            Ok(self.store.read(txn_id, key))
        })
    }

    fn write(&self, txn_id: TxnId, key: Key, value: Value, locality: u32) -> TxnResult<()> {
        self.with_active(txn_id, |txn| {
            if let Some(coordinator) = self.remote_owner(locality) {
                return coordinator
                    .remote_write(txn_id, txn.participants_mut(), key, value, locality)
                    .map_err(|err| self.remote_abort(txn, err));
            }

            self.lock(txn, &key, LockMode::Write)?;
            self.store.write(txn_id, key, value);
            Ok(())
        })
    }

    /// Marks the transaction prepared after promoting every lock held in
    /// `from` mode to `to` mode, if a promotion is given.
    fn prepare(
        &self,
        txn_id: TxnId,
        promotion: Option<(LockMode, LockMode)>,
    ) -> TxnResult<()> {
        self.with_live(txn_id, |txn| {
            if let Some((from, to)) = promotion {
                for key in txn.payload().keys_holding(from) {
                    let current = txn.payload().modes(&key).to_vec();
                    if let Err(err) = self.lock_manager.promote(txn_id, &key, &current, to) {
                        return Err(self.lock_abort(txn, err));
                    }
                    txn.payload_mut().replace(key, to);
                }
            }
            txn.mark_prepared();
            debug!(txn = %txn_id, locks = txn.payload().len(), "prepared");
            Ok(())
        })
    }

    fn commit(&self, txn_id: TxnId) -> TxnResult<()> {
        self.with_live(txn_id, |txn| {
            if !txn.is_prepared() {
                return Err(TxnError::NotPrepared(txn_id));
            }
            self.terminate(txn, true);
            Ok(())
        })
    }

    fn abort(&self, txn_id: TxnId) -> TxnResult<()> {
        self.with_live(txn_id, |txn| {
            self.abort_participants(txn);
            self.terminate(txn, false);
            Ok(())
        })
    }

    fn lock(&self, txn: &mut Transaction<HeldLocks>, key: &Key, mode: LockMode) -> TxnResult<()> {
        if txn.payload().holds(key, mode) {
            return Ok(());
        }
        match self.lock_manager.acquire(txn.id(), key, mode) {
            Ok(()) => {
                txn.payload_mut().add(key.clone(), mode);
                Ok(())
            }
            Err(err) => Err(self.lock_abort(txn, err)),
        }
    }

    fn lock_abort(&self, txn: &mut Transaction<HeldLocks>, err: LockError) -> TxnError {
        warn!(txn = %txn.id(), error = %err, "lock refused, aborting");
        AlgorithmStats::bump(&self.stats.lock_aborts);
        self.abort_participants(txn);
        self.terminate(txn, false);
        TxnError::LockAborted {
            txn: txn.id(),
            reason: err.to_string(),
        }
    }

    fn abort_participants(&self, txn: &mut Transaction<HeldLocks>) {
        if let Some(coordinator) = self.coordinator() {
            if !txn.participants().is_empty() {
                coordinator.distributed_abort(txn.id(), txn.participants_mut());
            }
        }
    }

    /// Local teardown after the coordinator has already aborted remotely.
    fn remote_abort(&self, txn: &mut Transaction<HeldLocks>, err: TxnError) -> TxnError {
        AlgorithmStats::bump(&self.stats.remote_aborts);
        self.terminate(txn, false);
        err
    }

    /// Ends the transaction on this node: applies or discards its writes,
    /// releases its locks and removes the record.
    fn terminate(&self, txn: &mut Transaction<HeldLocks>, commit: bool) {
        let txn_id = txn.id();
        if commit {
            self.store.commit(txn_id);
            AlgorithmStats::bump(&self.stats.committed);
        } else {
            self.store.abort(txn_id);
            AlgorithmStats::bump(&self.stats.aborted);
        }
        self.lock_manager.release_all(txn_id, txn.payload());
        txn.mark_ended(commit);
        self.transactions.remove(&txn_id);
        debug!(txn = %txn_id, committed = commit, "transaction ended");
    }

    /// Collects an [`AuditReport`] and remembers it as the latest one.
    fn audit(&self) -> AuditReport {
        let handles: Vec<_> = self
            .transactions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut report = AuditReport {
            live: handles.len(),
            locked_keys: self.lock_manager.lock_count(),
            pending_merges: self.store.pending_len(),
            ..AuditReport::default()
        };

        for handle in handles {
            // A record held by a blocked operation is skipped rather than
            // waited for.
            let Some(txn) = handle.try_lock() else {
                report.busy += 1;
                continue;
            };
            if txn.is_prepared() {
                report.prepared += 1;
            }
            if txn.age() > self.stall_threshold {
                warn!(
                    txn = %txn.id(),
                    state = %txn.state(),
                    age_ms = txn.age().as_millis() as u64,
                    locks = txn.payload().len(),
                    "transaction exceeds stall threshold"
                );
                report.stalled.push(txn.id());
            }
        }

        *self.last_audit.lock() = Some(report.clone());
        report
    }
}

impl fmt::Debug for LockingCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockingCore")
            .field("live", &self.transactions.len())
            .field("lock_manager", &self.lock_manager)
            .field("distributed", &self.coordinator.is_some())
            .finish()
    }
}

/// What distinguishes one lock-based algorithm from another.
pub trait LockingPolicy: Send + Sync + 'static {
    /// Configuration name.
    const NAME: &'static str;

    /// Lock promotion applied at prepare to every lock held in the first
    /// mode, if any.
    const PREPARE_PROMOTION: Option<(LockMode, LockMode)>;

    /// The lock compatibility the policy relies on.
    fn compatibility() -> CompatibilityTable;
}

/// A lock-based algorithm: reads take [`LockMode::Read`], writes take
/// [`LockMode::Write`] and `P` decides how those interact.
pub struct LockingAlgorithm<P> {
    core: LockingCore,
    policy: PhantomData<fn() -> P>,
}

impl<P: LockingPolicy> LockingAlgorithm<P> {
    /// Configuration name.
    pub const NAME: &'static str = P::NAME;

    /// The lock compatibility this algorithm relies on.
    pub fn compatibility() -> CompatibilityTable {
        P::compatibility()
    }

    /// Creates the algorithm over a lock manager built with
    /// [`compatibility`](Self::compatibility).
    pub fn new(lock_manager: Arc<LockManager>, store: Arc<VersioningStore>) -> Self {
        Self {
            core: LockingCore::new(lock_manager, store),
            policy: PhantomData,
        }
    }

    /// Forwards non-local keys through `coordinator`.
    #[must_use]
    pub fn with_coordinator(mut self, coordinator: Arc<RemoteCoordinator>) -> Self {
        self.core.set_coordinator(coordinator);
        self
    }

    /// Age past which a checkpoint reports a transaction as stalled.
    #[must_use]
    pub fn with_stall_threshold(mut self, threshold: Duration) -> Self {
        self.core.set_stall_threshold(threshold);
        self
    }

    /// The lock manager.
    pub fn lock_manager(&self) -> &Arc<LockManager> {
        self.core.lock_manager()
    }

    /// The versioning store.
    pub fn store(&self) -> &Arc<VersioningStore> {
        self.core.store()
    }

    /// Transaction counters.
    pub fn stats(&self) -> &AlgorithmStats {
        self.core.stats()
    }

    /// Report from the most recent checkpoint.
    pub fn last_audit(&self) -> Option<AuditReport> {
        self.core.last_audit()
    }
}

impl<P: LockingPolicy> ConcurrencyControl for LockingAlgorithm<P> {
    type Payload = HeldLocks;

    fn name(&self) -> &'static str {
        P::NAME
    }

    fn begin(&self, txn_id: TxnId) -> TxnResult<()> {
        self.core.begin(txn_id)
    }

    fn read(&self, txn_id: TxnId, key: &Key, locality: u32) -> TxnResult<Option<Value>> {
        self.core.read(txn_id, key, locality)
    }

    fn write(&self, txn_id: TxnId, key: Key, value: Value, locality: u32) -> TxnResult<()> {
        self.core.write(txn_id, key, value, locality)
    }

    fn prepare(&self, txn_id: TxnId) -> TxnResult<()> {
        self.core.prepare(txn_id, P::PREPARE_PROMOTION)
    }

    fn commit(&self, txn_id: TxnId) -> TxnResult<()> {
        self.core.commit(txn_id)
    }

    fn abort(&self, txn_id: TxnId) -> TxnResult<()> {
        self.core.abort(txn_id)
    }

    fn checkpoint(&self) {
        let report = self.core.audit();
        info!(
            algorithm = P::NAME,
            live = report.live,
            prepared = report.prepared,
            busy = report.busy,
            stalled = report.stalled.len(),
            locked_keys = report.locked_keys,
            pending_merges = report.pending_merges,
            merged = self.core.store().stats().merges.load(AtomicOrdering::Relaxed),
            "checkpoint"
        );
    }

    fn lookup(&self, txn_id: TxnId) -> Option<TxnHandle<HeldLocks>> {
        self.core.lookup(txn_id)
    }

    fn live_transactions(&self) -> usize {
        self.core.live_transactions()
    }

    fn coordinator(&self) -> Option<&RemoteCoordinator> {
        self.core.coordinator()
    }
}

impl<P: LockingPolicy> fmt::Debug for LockingAlgorithm<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockingAlgorithm")
            .field("policy", &P::NAME)
            .field("core", &self.core)
            .finish()
    }
}
