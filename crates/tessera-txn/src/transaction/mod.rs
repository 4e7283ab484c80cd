//! Transaction records.
//!
//! A record exists on a node from `begin` until the transaction commits or
//! aborts there. The record is generic over the payload the algorithm
//! keeps per transaction; both bundled algorithms store the locks they
//! hold. Records are shared as [`TxnHandle`]s: the algorithm's table owns
//! one, and in-flight operations clone another, so a handle can outlive
//! its table entry. [`TransactionState::is_ended`] tells such a stale
//! handle apart from a live one.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tessera_common::types::{NodeId, TxnId};

/// Transaction lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    /// Reads and writes are allowed.
    Active,
    /// Prepare succeeded; only commit or abort may follow.
    Prepared,
    /// Committed and removed from the table.
    Committed,
    /// Aborted and removed from the table.
    Aborted,
}

impl TransactionState {
    /// Returns true if the transaction has ended on this node.
    pub fn is_ended(&self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Aborted)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::Active => write!(f, "Active"),
            TransactionState::Prepared => write!(f, "Prepared"),
            TransactionState::Committed => write!(f, "Committed"),
            TransactionState::Aborted => write!(f, "Aborted"),
        }
    }
}

/// How far a remote participant has progressed, as seen by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ParticipantStatus {
    /// No message has been sent to the node yet.
    #[default]
    NotContacted,
    /// The node acknowledged `begin`.
    Began,
    /// The node voted yes in phase one.
    Prepared,
}

/// Remote nodes touched by a transaction coordinated from this node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Participants {
    nodes: BTreeMap<NodeId, ParticipantStatus>,
    remote_aborted: bool,
}

impl Participants {
    /// Status of `node`.
    pub fn status(&self, node: NodeId) -> ParticipantStatus {
        self.nodes.get(&node).copied().unwrap_or_default()
    }

    /// Sets the status of `node`, enlisting it if needed.
    pub fn set(&mut self, node: NodeId, status: ParticipantStatus) {
        self.nodes.insert(node, status);
    }

    /// Enlisted nodes, in id order.
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    /// Number of enlisted nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if no remote node was touched.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns true once the distributed abort has been broadcast.
    pub fn remote_aborted(&self) -> bool {
        self.remote_aborted
    }

    /// Marks the distributed abort as broadcast.
    pub fn mark_remote_aborted(&mut self) {
        self.remote_aborted = true;
    }
}

/// A transaction record.
pub struct Transaction<P> {
    id: TxnId,
    state: TransactionState,
    payload: P,
    participants: Participants,
    started_at: Instant,
}

impl<P> Transaction<P> {
    /// Creates an active record.
    pub fn new(id: TxnId, payload: P) -> Self {
        Self {
            id,
            state: TransactionState::Active,
            payload,
            participants: Participants::default(),
            started_at: Instant::now(),
        }
    }

    /// Transaction id.
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Returns true once prepare has succeeded.
    pub fn is_prepared(&self) -> bool {
        self.state == TransactionState::Prepared
    }

    /// Records a successful prepare.
    pub fn mark_prepared(&mut self) {
        self.state = TransactionState::Prepared;
    }

    /// Records that the transaction ended on this node.
    pub fn mark_ended(&mut self, committed: bool) {
        self.state = if committed {
            TransactionState::Committed
        } else {
            TransactionState::Aborted
        };
    }

    /// Algorithm-specific payload.
    pub fn payload(&self) -> &P {
        &self.payload
    }

    /// Mutable algorithm-specific payload.
    pub fn payload_mut(&mut self) -> &mut P {
        &mut self.payload
    }

    /// Remote participants.
    pub fn participants(&self) -> &Participants {
        &self.participants
    }

    /// Mutable remote participants.
    pub fn participants_mut(&mut self) -> &mut Participants {
        &mut self.participants
    }

    /// Time since `begin`.
    pub fn age(&self) -> Duration {
        self.started_at.elapsed()
    }
}

impl<P> fmt::Debug for Transaction<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("participants", &self.participants.len())
            .field("age_ms", &self.age().as_millis())
            .finish()
    }
}

/// Shared, lockable handle to a transaction record.
pub type TxnHandle<P> = Arc<Mutex<Transaction<P>>>;
