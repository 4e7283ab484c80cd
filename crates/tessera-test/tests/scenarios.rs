//! Single-node transaction scenarios, run against both algorithms.

use std::sync::Arc;

use tessera_common::types::{Key, TxnId, Value};
use tessera_mvcc::VersioningStore;
use tessera_server::{BuildAlgorithm, RequestHandler, TransactionManager};
use tessera_test::utils::{init_test_logging, read_committed, test_config, Session};
use tessera_txn::{Mvcc2pl, Request, Response, TwoPhaseLocking, TxnError};

fn node<A: BuildAlgorithm>() -> Arc<dyn RequestHandler> {
    init_test_logging();
    Arc::new(TransactionManager::<A>::start(&test_config(), None).expect("node failed to start"))
}

fn commit_then_fresh_read<A: BuildAlgorithm>() {
    let node = node::<A>();
    let t1 = Session::begin(Arc::clone(&node));

    t1.write("k", "v1").unwrap();
    assert_eq!(t1.read_str("k").unwrap().as_deref(), Some("v1"));
    t1.commit().unwrap();

    assert_eq!(read_committed(node, "k").as_deref(), Some("v1"));
}

fn abort_then_fresh_read<A: BuildAlgorithm>() {
    let node = node::<A>();
    let t1 = Session::begin(Arc::clone(&node));

    t1.write("k", "v1").unwrap();
    t1.abort().unwrap();

    assert_eq!(read_committed(node, "k"), None);
}

fn premature_commit_is_refused<A: BuildAlgorithm>() {
    let node = node::<A>();
    let txn = TxnId::new(1);
    node.handle(Request::Begin { txn });
    node.handle(Request::write(txn, Key::from("k"), Value::from("v")));

    assert_eq!(
        node.handle(Request::Commit { txn }),
        Response::Failure(TxnError::NotPrepared(txn))
    );
    // Still active: the write is readable and the transaction can finish.
    assert_eq!(
        node.handle(Request::read(txn, Key::from("k"))),
        Response::Value(Some(Value::from("v")))
    );
    assert!(node.handle(Request::Prepare { txn }).is_success());
    assert!(node.handle(Request::Commit { txn }).is_success());
}

fn duplicate_begin_leaves_record_alone<A: BuildAlgorithm>() {
    let node = node::<A>();
    let txn = TxnId::new(5);
    node.handle(Request::Begin { txn });
    node.handle(Request::write(txn, Key::from("k"), Value::from("kept")));

    assert_eq!(
        node.handle(Request::Begin { txn }),
        Response::Failure(TxnError::DuplicateTransaction(txn))
    );
    assert_eq!(
        node.handle(Request::read(txn, Key::from("k"))),
        Response::Value(Some(Value::from("kept")))
    );
}

fn unknown_transaction_fails<A: BuildAlgorithm>() {
    let node = node::<A>();
    let ghost = TxnId::new(404);
    for request in [
        Request::read(ghost, Key::from("k")),
        Request::write(ghost, Key::from("k"), Value::from("v")),
        Request::Prepare { txn: ghost },
        Request::Commit { txn: ghost },
        Request::Abort { txn: ghost },
        Request::TryCommit { txn: ghost },
    ] {
        assert_eq!(
            node.handle(request),
            Response::Failure(TxnError::NotLive(ghost))
        );
    }
}

#[test]
fn test_commit_then_fresh_read_2pl() {
    commit_then_fresh_read::<TwoPhaseLocking>();
}

#[test]
fn test_commit_then_fresh_read_mvcc2pl() {
    commit_then_fresh_read::<Mvcc2pl>();
}

#[test]
fn test_abort_then_fresh_read_2pl() {
    abort_then_fresh_read::<TwoPhaseLocking>();
}

#[test]
fn test_abort_then_fresh_read_mvcc2pl() {
    abort_then_fresh_read::<Mvcc2pl>();
}

#[test]
fn test_premature_commit_2pl() {
    premature_commit_is_refused::<TwoPhaseLocking>();
}

#[test]
fn test_premature_commit_mvcc2pl() {
    premature_commit_is_refused::<Mvcc2pl>();
}

#[test]
fn test_duplicate_begin_2pl() {
    duplicate_begin_leaves_record_alone::<TwoPhaseLocking>();
}

#[test]
fn test_duplicate_begin_mvcc2pl() {
    duplicate_begin_leaves_record_alone::<Mvcc2pl>();
}

#[test]
fn test_unknown_transaction_2pl() {
    unknown_transaction_fails::<TwoPhaseLocking>();
}

#[test]
fn test_unknown_transaction_mvcc2pl() {
    unknown_transaction_fails::<Mvcc2pl>();
}

/// Two uncommitted writers of the same key, observed by a third
/// transaction as each commits. The later commit wins even though the
/// other writer committed first.
#[test]
fn test_newest_commit_wins_at_the_store() {
    let store = VersioningStore::new().unwrap();
    let (t1, t2, t3) = (TxnId::new(1), TxnId::new(2), TxnId::new(3));
    let k = Key::from("k");

    store.write(t1, k.clone(), Value::from("value1"));
    store.write(t3, k.clone(), Value::from("value3"));
    assert_eq!(store.read(t2, &k), None);

    store.commit(t1);
    assert_eq!(store.read(t2, &k), Some(Value::from("value1")));

    store.commit(t3);
    assert_eq!(store.read(t2, &k), Some(Value::from("value3")));

    assert!(store.wait_until_merged(std::time::Duration::from_secs(5)));
    assert_eq!(store.read(t2, &k), Some(Value::from("value3")));
}
