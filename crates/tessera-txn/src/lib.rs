//! # tessera-txn
//!
//! Transaction processing for a Tessera node.
//!
//! - **Lock Management**: per-key read/write/commit locks with a pluggable
//!   compatibility table and blocking, no-wait or timed waits.
//!
//! - **Concurrency Control**: strict two-phase locking and two-version
//!   locking (MVCC2PL) over the versioning store from `tessera-mvcc`.
//!
//! - **Distribution**: operations on keys owned by other nodes are
//!   forwarded, and transactions that touched other nodes commit with
//!   two-phase commit.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                 ConcurrencyControl                         │
//! │        (TwoPhaseLocking | Mvcc2pl, transaction table)      │
//! │            │                 │                  │          │
//! │            ▼                 ▼                  ▼          │
//! │     ┌─────────────┐  ┌────────────────┐  ┌──────────────┐  │
//! │     │ LockManager │  │VersioningStore │  │   Remote     │  │
//! │     │             │  │  (tessera-mvcc)│  │ Coordinator  │  │
//! │     └─────────────┘  └────────────────┘  └──────┬───────┘  │
//! └─────────────────────────────────────────────────┼──────────┘
//!                                                   ▼
//!                                            PeerMessenger
//! ```
//!
//! # Example Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use tessera_common::types::{Key, TxnId, Value};
//! use tessera_mvcc::VersioningStore;
//! use tessera_txn::{ConcurrencyControl, LockManager, Mvcc2pl};
//!
//! let locks = Arc::new(LockManager::new(Mvcc2pl::compatibility()));
//! let store = Arc::new(VersioningStore::new().unwrap());
//! let cc = Mvcc2pl::new(locks, store);
//!
//! let txn = TxnId::new(1);
//! let key = Key::from("greeting");
//! cc.begin(txn).unwrap();
//! cc.write(txn, key.clone(), Value::from("hello"), key.locality_hash()).unwrap();
//! cc.try_commit(txn).unwrap();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Concurrency-control algorithms.
///
/// This module provides:
/// - [`algorithm::ConcurrencyControl`]: the transactional interface
/// - [`algorithm::TwoPhaseLocking`] and [`algorithm::Mvcc2pl`]
pub mod algorithm;

/// Transaction error types.
pub mod error;

/// Lock table implementation.
///
/// This module provides:
/// - [`lock::LockManager`]: Manages all locks
/// - [`lock::CompatibilityTable`]: Which modes may be held together
pub mod lock;

/// Request and response envelopes.
pub mod message;

/// Remote forwarding and two-phase commit.
pub mod remote;

/// Transaction records.
pub mod transaction;

pub use algorithm::{
    AlgorithmKind, AlgorithmStats, AuditReport, ConcurrencyControl, LockingAlgorithm,
    LockingPolicy, Mvcc2pl, TwoPhaseLocking,
};
pub use error::{TxnError, TxnResult};
pub use lock::{
    CompatibilityTable, HeldLocks, LockError, LockManager, LockManagerConfig, LockMode,
    WaitPolicy,
};
pub use message::{Request, RequestKind, Response};
pub use remote::{
    NodeLocality, PeerMessenger, RemoteCoordinator, RoutingTable, TransportError,
    TransportResult,
};
pub use transaction::{ParticipantStatus, Participants, Transaction, TransactionState, TxnHandle};
