//! Transactions spanning several nodes of a local cluster.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tessera_common::types::{Key, NodeId, TxnId};
use tessera_server::{
    BuildAlgorithm, LocalCluster, MemoryMessenger, MemoryNetwork, NodeConfig, RequestHandler,
    TransactionManager,
};
use tessera_test::utils::{init_test_logging, key_owned_by, read_committed, test_config, Session};
use tessera_test::workload::TransferWorkload;
use tessera_txn::{
    ConcurrencyControl, Mvcc2pl, NodeLocality, PeerMessenger, Request, RequestKind, Response,
    RoutingTable, TransportResult, TwoPhaseLocking, TxnError,
};

const N1: NodeId = NodeId::new(1);
const N2: NodeId = NodeId::new(2);
const N3: NodeId = NodeId::new(3);

fn cluster<A: BuildAlgorithm>() -> LocalCluster<A> {
    init_test_logging();
    LocalCluster::start(3, &test_config()).unwrap()
}

fn handler<A: BuildAlgorithm>(cluster: &LocalCluster<A>, id: NodeId) -> Arc<dyn RequestHandler> {
    let node = cluster.node(id).unwrap();
    Arc::clone(node) as Arc<dyn RequestHandler>
}

fn live_anywhere<A: BuildAlgorithm>(cluster: &LocalCluster<A>, txn: TxnId) -> bool {
    cluster
        .nodes()
        .any(|node| node.algorithm().lookup(txn).is_some())
}

fn commit_spans_every_node<A: BuildAlgorithm>() {
    let cluster = cluster::<A>();
    let keys: Vec<Key> = [N1, N2, N3]
        .into_iter()
        .map(|owner| key_owned_by(&cluster, "span", owner))
        .collect();

    let session = Session::begin(handler(&cluster, N1));
    for (i, key) in keys.iter().enumerate() {
        session.write(key.clone(), format!("v{i}")).unwrap();
    }
    session.commit().unwrap();
    assert!(!live_anywhere(&cluster, session.txn()));

    for id in [N1, N2, N3] {
        for (i, key) in keys.iter().enumerate() {
            assert_eq!(
                read_committed(handler(&cluster, id), key.clone()),
                Some(format!("v{i}")),
                "node {id} reading {key}"
            );
        }
    }

    let coordinator = cluster.node(N1).unwrap().algorithm().coordinator().unwrap();
    assert_eq!(coordinator.stats().participants_enlisted.load(Ordering::Relaxed), 2);
}

#[test]
fn test_commit_spans_every_node_2pl() {
    commit_spans_every_node::<TwoPhaseLocking>();
}

#[test]
fn test_commit_spans_every_node_mvcc2pl() {
    commit_spans_every_node::<Mvcc2pl>();
}

fn aborted_participant_aborts_everyone<A: BuildAlgorithm>() {
    let cluster = cluster::<A>();
    let k1 = key_owned_by(&cluster, "refuse", N1);
    let k2 = key_owned_by(&cluster, "refuse", N2);
    let k3 = key_owned_by(&cluster, "refuse", N3);

    let session = Session::begin(handler(&cluster, N1));
    session.write(k1.clone(), "x").unwrap();
    session.write(k2.clone(), "x").unwrap();
    session.write(k3.clone(), "x").unwrap();

    // Node 3 loses its part of the transaction before commit.
    assert!(handler(&cluster, N3)
        .handle(Request::Abort {
            txn: session.txn()
        })
        .is_success());

    assert_eq!(
        session.commit(),
        Err(TxnError::CommitRefused(session.txn()))
    );
    assert!(!live_anywhere(&cluster, session.txn()));
    for key in [k1, k2, k3] {
        assert_eq!(read_committed(handler(&cluster, N2), key), None);
    }
}

#[test]
fn test_aborted_participant_aborts_everyone_2pl() {
    aborted_participant_aborts_everyone::<TwoPhaseLocking>();
}

#[test]
fn test_aborted_participant_aborts_everyone_mvcc2pl() {
    aborted_participant_aborts_everyone::<Mvcc2pl>();
}

/// A reader on a participant keeps the writer's commit lock from being
/// granted, so that participant votes no once its lock wait times out.
#[test]
fn test_prepare_timeout_on_participant_aborts_everyone() {
    let cluster = cluster::<Mvcc2pl>();
    let k1 = key_owned_by(&cluster, "vote", N1);
    let k2 = key_owned_by(&cluster, "vote", N2);

    let writer = Session::begin(handler(&cluster, N1));
    writer.write(k1.clone(), "w").unwrap();
    writer.write(k2.clone(), "w").unwrap();

    let reader = Session::begin(handler(&cluster, N2));
    assert_eq!(reader.read(k2.clone()).unwrap(), None);

    assert_eq!(writer.commit(), Err(TxnError::CommitRefused(writer.txn())));
    assert!(!live_anywhere(&cluster, writer.txn()));

    reader.commit().unwrap();
    assert_eq!(read_committed(handler(&cluster, N2), k1), None);
    assert_eq!(read_committed(handler(&cluster, N1), k2), None);

    let coordinator = cluster.node(N1).unwrap().algorithm().coordinator().unwrap();
    assert_eq!(coordinator.stats().refusals.load(Ordering::Relaxed), 1);
}

#[test]
fn test_unreachable_owner_aborts_transaction() {
    let cluster = cluster::<TwoPhaseLocking>();
    let k2 = key_owned_by(&cluster, "cut", N2);
    let k3 = key_owned_by(&cluster, "cut", N3);

    let session = Session::begin(handler(&cluster, N1));
    session.write(k3.clone(), "x").unwrap();

    cluster.network().add_partition(N1, N2);
    let err = session.write(k2, "x").unwrap_err();
    assert!(matches!(err, TxnError::RemoteFailure { node, .. } if node == N2));
    assert!(err.is_abort());

    // The enlisted participant got the abort; node 2 never saw the txn.
    assert!(!live_anywhere(&cluster, session.txn()));
    assert_eq!(read_committed(handler(&cluster, N3), k3), None);

    cluster.network().heal_all();
    assert_eq!(session.commit(), Err(TxnError::NotLive(session.txn())));
}

#[test]
fn test_partition_during_prepare_never_commits() {
    let cluster = cluster::<Mvcc2pl>();
    let k1 = key_owned_by(&cluster, "split", N1);
    let k2 = key_owned_by(&cluster, "split", N2);

    let session = Session::begin(handler(&cluster, N1));
    session.write(k1.clone(), "x").unwrap();
    session.write(k2.clone(), "x").unwrap();

    cluster.network().isolate(N2);
    assert_eq!(session.commit(), Err(TxnError::CommitRefused(session.txn())));
    assert!(cluster.node(N1).unwrap().algorithm().lookup(session.txn()).is_none());

    // The abort was lost in the partition: node 2 still holds its part
    // until it hears from the coordinator again.
    assert!(cluster.node(N2).unwrap().algorithm().lookup(session.txn()).is_some());
    cluster.network().reconnect(N2);
    assert!(handler(&cluster, N2)
        .handle(Request::Abort {
            txn: session.txn()
        })
        .is_success());

    assert_eq!(read_committed(handler(&cluster, N1), k2), None);
    assert_eq!(read_committed(handler(&cluster, N2), k1), None);
}

/// A node cut off from the cluster fails only the transactions that need
/// it, and serves again once reconnected.
fn isolated_node_rejoins<A: BuildAlgorithm>() {
    let cluster = cluster::<A>();
    let k1 = key_owned_by(&cluster, "rejoin", N1);
    let k2 = key_owned_by(&cluster, "rejoin", N2);
    let k3 = key_owned_by(&cluster, "rejoin", N3);

    cluster.network().isolate(N3);

    // Nodes 1 and 2 keep committing together.
    let bystander = Session::begin(handler(&cluster, N1));
    bystander.write(k1.clone(), "a").unwrap();
    bystander.write(k2.clone(), "a").unwrap();
    bystander.commit().unwrap();

    let cut = Session::begin(handler(&cluster, N1));
    cut.write(k1.clone(), "b").unwrap();
    let err = cut.write(k3.clone(), "b").unwrap_err();
    assert!(matches!(err, TxnError::RemoteFailure { node, .. } if node == N3));
    assert!(!live_anywhere(&cluster, cut.txn()));

    cluster.network().reconnect(N3);

    let retry = Session::begin(handler(&cluster, N2));
    retry.write(k1.clone(), "c").unwrap();
    retry.write(k3.clone(), "c").unwrap();
    retry.commit().unwrap();

    assert_eq!(read_committed(handler(&cluster, N3), k1).as_deref(), Some("c"));
    assert_eq!(read_committed(handler(&cluster, N3), k2).as_deref(), Some("a"));
    assert_eq!(read_committed(handler(&cluster, N1), k3).as_deref(), Some("c"));
}

#[test]
fn test_isolated_node_rejoins_2pl() {
    isolated_node_rejoins::<TwoPhaseLocking>();
}

#[test]
fn test_isolated_node_rejoins_mvcc2pl() {
    isolated_node_rejoins::<Mvcc2pl>();
}

fn transfers_across_nodes<A: BuildAlgorithm>() {
    let cluster = cluster::<A>();
    let nodes: Vec<Arc<dyn RequestHandler>> =
        cluster.node_ids().into_iter().map(|id| handler(&cluster, id)).collect();

    let workload = TransferWorkload {
        clients: 3,
        transfers_per_client: 15,
        ..TransferWorkload::default()
    };
    workload.seed_accounts(Arc::clone(&nodes[0])).unwrap();

    let report = workload.run(&nodes);
    assert!(report.committed() > 0);
    assert_eq!(
        workload.total(Arc::clone(&nodes[2])).unwrap(),
        workload.expected_total()
    );

    for node in cluster.nodes() {
        assert_eq!(node.algorithm().live_transactions(), 0);
    }
}

#[test]
fn test_transfers_across_nodes_2pl() {
    transfers_across_nodes::<TwoPhaseLocking>();
}

#[test]
fn test_transfers_across_nodes_mvcc2pl() {
    transfers_across_nodes::<Mvcc2pl>();
}

/// Counts the aborts a node sends.
struct CountingMessenger {
    inner: MemoryMessenger,
    aborts: AtomicUsize,
}

impl PeerMessenger for CountingMessenger {
    fn call(&self, to: NodeId, request: Request) -> TransportResult<Response> {
        self.inner.call(to, request)
    }

    fn post(&self, to: NodeId, request: Request) -> TransportResult<()> {
        if request.kind() == RequestKind::Abort {
            self.aborts.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.post(to, request)
    }
}

fn node_config(id: u32) -> NodeConfig {
    NodeConfig {
        node_id: id,
        cluster_nodes: vec![1, 2],
        ..test_config()
    }
}

#[test]
fn test_abort_broadcast_sent_at_most_once() {
    let network = MemoryNetwork::shared();
    let counting = Arc::new(CountingMessenger {
        inner: network.messenger(N1),
        aborts: AtomicUsize::new(0),
    });

    let to_first: Arc<dyn PeerMessenger> = counting.clone();
    let to_second: Arc<dyn PeerMessenger> = Arc::new(network.messenger(N2));

    let first: Arc<dyn RequestHandler> = Arc::new(
        TransactionManager::<Mvcc2pl>::start(&node_config(1), Some(to_first)).unwrap(),
    );
    let second: Arc<dyn RequestHandler> = Arc::new(
        TransactionManager::<Mvcc2pl>::start(&node_config(2), Some(to_second)).unwrap(),
    );
    network.register(&first);
    network.register(&second);

    let routing = RoutingTable::new(N1, [N1, N2]);
    let remote = (0u32..)
        .map(|i| Key::from(format!("remote-{i}")))
        .find(|key| routing.owner_of(key.locality_hash()) == N2)
        .unwrap();

    // Explicit abort, repeated.
    let session = Session::begin(Arc::clone(&first));
    session.write(remote.clone(), "x").unwrap();
    session.abort().unwrap();
    assert_eq!(session.abort(), Err(TxnError::NotLive(session.txn())));
    assert_eq!(counting.aborts.load(Ordering::SeqCst), 1);

    // Refused commit: local abort and refusal share one broadcast.
    let session = Session::begin(Arc::clone(&first));
    session.write(remote, "x").unwrap();
    second.handle(Request::Abort {
        txn: session.txn(),
    });
    assert_eq!(session.commit(), Err(TxnError::CommitRefused(session.txn())));
    assert_eq!(counting.aborts.load(Ordering::SeqCst), 2);
}
