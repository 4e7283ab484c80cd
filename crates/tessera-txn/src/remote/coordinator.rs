//! Remote coordination and two-phase commit.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use tessera_common::types::{Key, NodeId, TxnId, Value};
use tracing::{debug, error, warn};

use super::{NodeLocality, PeerMessenger};
use crate::algorithm::ConcurrencyControl;
use crate::error::{TxnError, TxnResult};
use crate::message::{Request, Response};
use crate::transaction::{ParticipantStatus, Participants, TxnHandle};

/// Counters for remote coordination.
#[derive(Debug, Default)]
pub struct CoordinatorStats {
    /// Participants enlisted with `begin`.
    pub participants_enlisted: AtomicU64,
    /// Reads and writes forwarded to an owner node.
    pub forwarded_ops: AtomicU64,
    /// Forwarded operations that failed.
    pub remote_failures: AtomicU64,
    /// Distributed commits that completed phase one with every vote yes.
    pub commits: AtomicU64,
    /// Distributed commits refused in phase one.
    pub refusals: AtomicU64,
    /// Abort broadcasts sent.
    pub abort_broadcasts: AtomicU64,
    /// Phase-two commit messages that could not be delivered.
    pub in_doubt: AtomicU64,
}

impl CoordinatorStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, AtomicOrdering::Relaxed);
    }
}

/// Forwards non-local operations and drives two-phase commit.
///
/// Participant state lives in each transaction's
/// [`Participants`]; the coordinator itself only holds the transport and
/// the placement function, so one instance serves every transaction of a
/// node.
pub struct RemoteCoordinator {
    locality: Arc<dyn NodeLocality>,
    messenger: Arc<dyn PeerMessenger>,
    stats: CoordinatorStats,
}

impl RemoteCoordinator {
    /// Creates a coordinator.
    pub fn new(locality: Arc<dyn NodeLocality>, messenger: Arc<dyn PeerMessenger>) -> Self {
        Self {
            locality,
            messenger,
            stats: CoordinatorStats::default(),
        }
    }

    /// This node.
    pub fn local_node(&self) -> NodeId {
        self.locality.local_node()
    }

    /// Returns true if keys with this hash are served locally.
    pub fn is_local(&self, locality: u32) -> bool {
        self.locality.is_local(locality)
    }

    /// Node owning keys with this hash.
    pub fn owner_of(&self, locality: u32) -> NodeId {
        self.locality.owner_of(locality)
    }

    /// Returns coordination counters.
    pub fn stats(&self) -> &CoordinatorStats {
        &self.stats
    }

    /// Sends `begin` to `node` unless it is already a participant.
    pub fn ensure_began(
        &self,
        txn_id: TxnId,
        participants: &mut Participants,
        node: NodeId,
    ) -> TxnResult<()> {
        if participants.status(node) != ParticipantStatus::NotContacted {
            return Ok(());
        }

        let response = self.messenger.call(node, Request::Begin { txn: txn_id });
        self.expect(txn_id, node, "begin", response)?;
        participants.set(node, ParticipantStatus::Began);
        CoordinatorStats::bump(&self.stats.participants_enlisted);
        debug!(txn = %txn_id, %node, "enlisted participant");
        Ok(())
    }

    /// Reads `key` on its owner node.
    ///
    /// Any failure aborts the transaction on every participant before the
    /// error is returned; the caller still has to tear down its local part.
    pub fn remote_read(
        &self,
        txn_id: TxnId,
        participants: &mut Participants,
        key: &Key,
        locality: u32,
    ) -> TxnResult<Option<Value>> {
        let node = self.owner_of(locality);
        let request = Request::Read {
            txn: txn_id,
            key: key.clone(),
            locality,
        };
        self.forward(txn_id, participants, node, "read", request)
            .and_then(Response::into_value)
    }

    /// Writes `key` on its owner node. Failure handling matches
    /// [`remote_read`](Self::remote_read).
    pub fn remote_write(
        &self,
        txn_id: TxnId,
        participants: &mut Participants,
        key: Key,
        value: Value,
        locality: u32,
    ) -> TxnResult<()> {
        let node = self.owner_of(locality);
        let request = Request::Write {
            txn: txn_id,
            key,
            locality,
            value,
        };
        self.forward(txn_id, participants, node, "write", request)
            .map(|_| ())
    }

    /// Runs two-phase commit for a transaction with remote participants.
    ///
    /// Phase one prepares the local part and then asks every participant to
    /// prepare; all votes are collected even after a no. If every vote is
    /// yes the local part commits and `Commit` is posted to each
    /// participant. Otherwise the local part and every participant abort
    /// and [`TxnError::CommitRefused`] is returned.
    ///
    /// Delivery failures in phase two are logged and counted as in-doubt;
    /// they do not change the outcome.
    pub fn two_phase_commit<A>(&self, local: &A, handle: &TxnHandle<A::Payload>) -> TxnResult<()>
    where
        A: ConcurrencyControl + ?Sized,
    {
        let (txn_id, nodes) = {
            let txn = handle.lock();
            (txn.id(), txn.participants().nodes().collect::<Vec<_>>())
        };

        let mut all_prepared = match local.prepare(txn_id) {
            Ok(()) => true,
            Err(err) => {
                debug!(txn = %txn_id, error = %err, "local prepare failed");
                false
            }
        };

        if all_prepared {
            for &node in &nodes {
                let vote = match self.messenger.call(node, Request::Prepare { txn: txn_id }) {
                    Ok(response) if response.is_success() => true,
                    Ok(response) => {
                        debug!(txn = %txn_id, %node, ?response, "participant voted no");
                        false
                    }
                    Err(err) => {
                        error!(txn = %txn_id, %node, error = %err, "prepare not delivered");
                        false
                    }
                };
                if vote {
                    handle
                        .lock()
                        .participants_mut()
                        .set(node, ParticipantStatus::Prepared);
                }
                all_prepared &= vote;
            }
        }

        if !all_prepared {
            self.refuse(local, handle, txn_id);
            return Err(TxnError::CommitRefused(txn_id));
        }

        if let Err(err) = local.commit(txn_id) {
            warn!(txn = %txn_id, error = %err, "local commit failed after unanimous prepare");
            self.distributed_abort(txn_id, handle.lock().participants_mut());
            return Err(err);
        }

        for &node in &nodes {
            if let Err(err) = self.messenger.post(node, Request::Commit { txn: txn_id }) {
                CoordinatorStats::bump(&self.stats.in_doubt);
                error!(txn = %txn_id, %node, error = %err, "commit not delivered, participant in doubt");
            }
        }
        CoordinatorStats::bump(&self.stats.commits);
        debug!(txn = %txn_id, participants = nodes.len(), "distributed commit");
        Ok(())
    }

    /// Posts `Abort` to every participant, at most once per transaction.
    ///
    /// Delivery failures are logged; the transaction is marked as aborted
    /// remotely either way.
    pub fn distributed_abort(&self, txn_id: TxnId, participants: &mut Participants) {
        if participants.remote_aborted() {
            return;
        }

        for node in participants.nodes() {
            if let Err(err) = self.messenger.post(node, Request::Abort { txn: txn_id }) {
                error!(txn = %txn_id, %node, error = %err, "abort not delivered");
            }
        }
        participants.mark_remote_aborted();
        CoordinatorStats::bump(&self.stats.abort_broadcasts);
        debug!(txn = %txn_id, participants = participants.len(), "distributed abort");
    }

    fn refuse<A>(&self, local: &A, handle: &TxnHandle<A::Payload>, txn_id: TxnId)
    where
        A: ConcurrencyControl + ?Sized,
    {
        CoordinatorStats::bump(&self.stats.refusals);
        // A failed local prepare has already torn the record down.
        if let Err(err) = local.abort(txn_id) {
            debug!(txn = %txn_id, error = %err, "local part already gone");
        }
        self.distributed_abort(txn_id, handle.lock().participants_mut());
    }

    fn forward(
        &self,
        txn_id: TxnId,
        participants: &mut Participants,
        node: NodeId,
        op: &'static str,
        request: Request,
    ) -> TxnResult<Response> {
        CoordinatorStats::bump(&self.stats.forwarded_ops);
        let result = self.ensure_began(txn_id, participants, node).and_then(|()| {
            let response = self.messenger.call(node, request);
            self.expect(txn_id, node, op, response)
        });

        if result.is_err() {
            CoordinatorStats::bump(&self.stats.remote_failures);
            self.distributed_abort(txn_id, participants);
        }
        result
    }

    /// Maps a transport outcome onto a transaction result.
    fn expect(
        &self,
        txn_id: TxnId,
        node: NodeId,
        op: &'static str,
        response: super::TransportResult<Response>,
    ) -> TxnResult<Response> {
        match response {
            Ok(Response::Failure(err)) => {
                debug!(txn = %txn_id, %node, op, error = %err, "remote operation failed");
                Err(TxnError::RemoteFailure {
                    txn: txn_id,
                    node,
                    reason: err.to_string(),
                })
            }
            Ok(response) => Ok(response),
            Err(err) => {
                error!(txn = %txn_id, %node, op, error = %err, "remote call failed");
                Err(TxnError::RemoteFailure {
                    txn: txn_id,
                    node,
                    reason: err.to_string(),
                })
            }
        }
    }
}

impl fmt::Debug for RemoteCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteCoordinator")
            .field("local_node", &self.local_node())
            .field(
                "forwarded_ops",
                &self.stats.forwarded_ops.load(AtomicOrdering::Relaxed),
            )
            .field("commits", &self.stats.commits.load(AtomicOrdering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{RoutingTable, TransportError, TransportResult};
    use parking_lot::Mutex;

    /// Records every request and answers from a fixed script.
    #[derive(Default)]
    struct ScriptedMessenger {
        sent: Mutex<Vec<(NodeId, Request)>>,
        unreachable: Mutex<Vec<NodeId>>,
        failing_reads: bool,
    }

    impl ScriptedMessenger {
        fn sent(&self) -> Vec<(NodeId, Request)> {
            self.sent.lock().clone()
        }
    }

    impl PeerMessenger for ScriptedMessenger {
        fn call(&self, to: NodeId, request: Request) -> TransportResult<Response> {
            self.sent.lock().push((to, request.clone()));
            if self.unreachable.lock().contains(&to) {
                return Err(TransportError::NodeGone(to));
            }
            Ok(match request {
                Request::Read { txn, .. } if self.failing_reads => {
                    Response::Failure(TxnError::NotLive(txn))
                }
                Request::Read { .. } => Response::Value(Some(Value::from("remote"))),
                _ => Response::Success,
            })
        }

        fn post(&self, to: NodeId, request: Request) -> TransportResult<()> {
            self.call(to, request).map(|_| ())
        }
    }

    fn coordinator(messenger: Arc<ScriptedMessenger>) -> RemoteCoordinator {
        let nodes = [NodeId::new(1), NodeId::new(2), NodeId::new(3)];
        RemoteCoordinator::new(Arc::new(RoutingTable::new(NodeId::new(1), nodes)), messenger)
    }

    #[test]
    fn test_begin_sent_once_per_participant() {
        let messenger = Arc::new(ScriptedMessenger::default());
        let coord = coordinator(Arc::clone(&messenger));
        let mut participants = Participants::default();
        let txn = TxnId::new(10);

        for _ in 0..3 {
            let value = coord
                .remote_read(txn, &mut participants, &Key::from("k"), 1)
                .unwrap();
            assert_eq!(value, Some(Value::from("remote")));
        }

        let begins = messenger
            .sent()
            .iter()
            .filter(|(_, req)| matches!(req, Request::Begin { .. }))
            .count();
        assert_eq!(begins, 1);
        assert_eq!(participants.status(NodeId::new(2)), ParticipantStatus::Began);
        assert_eq!(coord.stats().forwarded_ops.load(AtomicOrdering::Relaxed), 3);
    }

    #[test]
    fn test_failed_read_aborts_every_participant() {
        let messenger = Arc::new(ScriptedMessenger {
            failing_reads: true,
            ..Default::default()
        });
        let coord = coordinator(Arc::clone(&messenger));
        let mut participants = Participants::default();
        let txn = TxnId::new(11);

        coord
            .remote_write(txn, &mut participants, Key::from("a"), Value::from("v"), 2)
            .unwrap();
        let err = coord
            .remote_read(txn, &mut participants, &Key::from("b"), 1)
            .unwrap_err();
        assert!(matches!(err, TxnError::RemoteFailure { node, .. } if node == NodeId::new(2)));
        assert!(participants.remote_aborted());

        let aborted: Vec<NodeId> = messenger
            .sent()
            .into_iter()
            .filter(|(_, req)| matches!(req, Request::Abort { .. }))
            .map(|(node, _)| node)
            .collect();
        assert_eq!(aborted, vec![NodeId::new(2), NodeId::new(3)]);
    }

    #[test]
    fn test_distributed_abort_is_idempotent() {
        let messenger = Arc::new(ScriptedMessenger::default());
        let coord = coordinator(Arc::clone(&messenger));
        let mut participants = Participants::default();
        participants.set(NodeId::new(2), ParticipantStatus::Began);

        coord.distributed_abort(TxnId::new(1), &mut participants);
        coord.distributed_abort(TxnId::new(1), &mut participants);

        assert_eq!(messenger.sent().len(), 1);
        assert_eq!(
            coord.stats().abort_broadcasts.load(AtomicOrdering::Relaxed),
            1
        );
    }

    #[test]
    fn test_unreachable_participant_still_marks_aborted() {
        let messenger = Arc::new(ScriptedMessenger::default());
        messenger.unreachable.lock().push(NodeId::new(2));
        let coord = coordinator(Arc::clone(&messenger));
        let mut participants = Participants::default();
        participants.set(NodeId::new(2), ParticipantStatus::Began);
        participants.set(NodeId::new(3), ParticipantStatus::Began);

        coord.distributed_abort(TxnId::new(1), &mut participants);
        assert!(participants.remote_aborted());
        assert_eq!(messenger.sent().len(), 2);
    }

    #[test]
    fn test_unreachable_owner_fails_forward() {
        let messenger = Arc::new(ScriptedMessenger::default());
        messenger.unreachable.lock().push(NodeId::new(3));
        let coord = coordinator(Arc::clone(&messenger));
        let mut participants = Participants::default();

        let err = coord
            .remote_write(TxnId::new(4), &mut participants, Key::from("z"), Value::from("v"), 2)
            .unwrap_err();
        assert!(matches!(err, TxnError::RemoteFailure { .. }));
        assert_eq!(
            participants.status(NodeId::new(3)),
            ParticipantStatus::NotContacted
        );
        assert_eq!(coord.stats().remote_failures.load(AtomicOrdering::Relaxed), 1);
    }
}
