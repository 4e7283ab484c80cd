//! Versioning store: write buffers, pending commits and the primary store.
//!
//! Every active transaction writes into a private buffer. On commit the
//! buffer is pushed, as a whole, to the head of the pending-commit queue and
//! a background worker later merges it into the primary store.
//!
//! # Read Path
//!
//! ```text
//!   read(txn, key)
//!        │
//!        ▼
//!  ┌──────────────┐  hit
//!  │ own buffer   │──────▶ value
//!  └──────────────┘
//!        │ miss
//!        ▼
//!  ┌──────────────────────────────────────┐  first hit
//!  │ pending queue  [newest ... oldest]   │──────────▶ value
//!  └──────────────────────────────────────┘
//!        │ miss                     ▲
//!        ▼                          │ merge worker takes the oldest
//!  ┌──────────────┐                 │ buffer, writes it into primary,
//!  │ primary      │◀────────────────┘ then removes it from the queue
//!  └──────────────┘
//! ```
//!
//! Commit is O(1): it only enqueues. Lookups scan the queue newest first, so
//! a later commit always shadows an earlier one, and merging in FIFO order
//! makes the primary store converge to the same answer.

mod merge;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, RwLock};
use tessera_common::constants::MERGE_THREAD_NAME;
use tessera_common::types::{Key, TxnId, Value};
use tracing::{debug, warn};

/// The writes of a single transaction.
pub type WriteSet = HashMap<Key, Value>;

/// A committed write buffer waiting to be merged into the primary store.
#[derive(Debug)]
pub(crate) struct CommittedBuffer {
    /// Transaction that produced the buffer.
    pub(crate) txn_id: TxnId,
    /// Its writes.
    pub(crate) writes: WriteSet,
}

/// Statistics about the versioning store.
#[derive(Debug, Default)]
pub struct VersioningStats {
    /// Total buffered writes.
    pub writes: AtomicU64,
    /// Total committed buffers.
    pub commits: AtomicU64,
    /// Total discarded buffers.
    pub aborts: AtomicU64,
    /// Total buffers merged into the primary store.
    pub merges: AtomicU64,
    /// Total keys written into the primary store by merges.
    pub merged_keys: AtomicU64,
}

impl VersioningStats {
    /// Creates new stats.
    pub fn new() -> Self {
        Self::default()
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn record_commit(&self) {
        self.commits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn record_abort(&self) {
        self.aborts.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn record_merge(&self, keys: usize) {
        self.merges.fetch_add(1, AtomicOrdering::Relaxed);
        self.merged_keys.fetch_add(keys as u64, AtomicOrdering::Relaxed);
    }
}

/// State shared between the store handle and its merge worker.
pub(crate) struct Shared {
    /// Uncommitted writes, per active transaction.
    pub(crate) buffers: DashMap<TxnId, WriteSet>,
    /// Committed buffers, newest at the front.
    pub(crate) pending: Mutex<VecDeque<Arc<CommittedBuffer>>>,
    /// Signalled when a buffer is enqueued or shutdown is requested.
    pub(crate) pending_signal: Condvar,
    /// Signalled after each merge.
    pub(crate) merged_signal: Condvar,
    /// Fully merged committed values.
    pub(crate) primary: RwLock<HashMap<Key, Value>>,
    /// Whether the merge worker should stop.
    pub(crate) shutdown: AtomicBool,
    /// Statistics.
    pub(crate) stats: VersioningStats,
}

/// Multi-version store for transactional key-value data.
///
/// Constructed explicitly and shared by `Arc`; each instance owns its own
/// merge worker thread, stopped by [`VersioningStore::shutdown`] or on drop.
pub struct VersioningStore {
    shared: Arc<Shared>,
    merger: Mutex<Option<JoinHandle<()>>>,
}

impl VersioningStore {
    /// Creates an empty store and starts its merge worker.
    pub fn new() -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            buffers: DashMap::new(),
            pending: Mutex::new(VecDeque::new()),
            pending_signal: Condvar::new(),
            merged_signal: Condvar::new(),
            primary: RwLock::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
            stats: VersioningStats::new(),
        });

        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(MERGE_THREAD_NAME.to_string())
            .spawn(move || merge::run(&worker))?;

        Ok(Self {
            shared,
            merger: Mutex::new(Some(handle)),
        })
    }

    /// Reads the value of `key` as seen by `txn_id`.
    ///
    /// The transaction's own uncommitted write wins; otherwise the most
    /// recently committed version, whether still pending or already merged.
    pub fn read(&self, txn_id: TxnId, key: &Key) -> Option<Value> {
        if let Some(own) = self
            .shared
            .buffers
            .get(&txn_id)
            .and_then(|buffer| buffer.get(key).cloned())
        {
            return Some(own);
        }

        {
            let pending = self.shared.pending.lock();
            if let Some(value) = pending.iter().find_map(|buffer| buffer.writes.get(key)) {
                return Some(value.clone());
            }
        }

        self.shared.primary.read().get(key).cloned()
    }

    /// Buffers a write of `key` by `txn_id`.
    ///
    /// No locking happens here; callers lock the key first.
    pub fn write(&self, txn_id: TxnId, key: Key, value: Value) {
        self.shared
            .buffers
            .entry(txn_id)
            .or_default()
            .insert(key, value);
        self.shared.stats.record_write();
    }

    /// Publishes the writes of `txn_id`.
    ///
    /// The buffer moves to the head of the pending queue and the merge
    /// worker is woken. Never blocks on the merge and never fails; a
    /// transaction that wrote nothing commits as a no-op.
    pub fn commit(&self, txn_id: TxnId) {
        self.shared.stats.record_commit();

        let Some((_, writes)) = self.shared.buffers.remove(&txn_id) else {
            return;
        };
        if writes.is_empty() {
            return;
        }

        let buffer = Arc::new(CommittedBuffer { txn_id, writes });
        let mut pending = self.shared.pending.lock();
        pending.push_front(buffer);
        self.shared.pending_signal.notify_one();
        debug!(txn = %txn_id, queued = pending.len(), "write buffer queued for merge");
    }

    /// Discards the writes of `txn_id`. Never fails.
    pub fn abort(&self, txn_id: TxnId) {
        self.shared.buffers.remove(&txn_id);
        self.shared.stats.record_abort();
    }

    /// Waits until every pending buffer has been merged.
    ///
    /// Returns `false` if the queue was still non-empty after `timeout`.
    pub fn wait_until_merged(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pending = self.shared.pending.lock();
        while !pending.is_empty() {
            if self
                .shared
                .merged_signal
                .wait_until(&mut pending, deadline)
                .timed_out()
            {
                return pending.is_empty();
            }
        }
        true
    }

    /// Returns the number of committed buffers not yet merged.
    pub fn pending_len(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Returns the number of keys in the primary store.
    pub fn primary_len(&self) -> usize {
        self.shared.primary.read().len()
    }

    /// Returns the number of transactions holding an uncommitted buffer.
    pub fn buffered_transactions(&self) -> usize {
        self.shared.buffers.len()
    }

    /// Returns statistics about the store.
    pub fn stats(&self) -> &VersioningStats {
        &self.shared.stats
    }

    /// Returns true once shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(AtomicOrdering::Acquire)
    }

    /// Stops the merge worker and waits for it to exit.
    ///
    /// A buffer already being merged is finished. Buffers still queued stay
    /// in the queue and remain visible to reads.
    pub fn shutdown(&self) {
        {
            let _pending = self.shared.pending.lock();
            self.shared.shutdown.store(true, AtomicOrdering::Release);
        }
        self.shared.pending_signal.notify_all();

        if let Some(handle) = self.merger.lock().take() {
            if handle.join().is_err() {
                warn!("merge worker panicked");
            }
        }
    }
}

impl Drop for VersioningStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for VersioningStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersioningStore")
            .field("buffered", &self.buffered_transactions())
            .field("pending", &self.pending_len())
            .field("primary", &self.primary_len())
            .finish()
    }
}
