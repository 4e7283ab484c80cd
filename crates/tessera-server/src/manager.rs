//! The transaction manager hosting one node.
//!
//! A [`TransactionManager`] owns the node's concurrency-control algorithm
//! and its checkpoint timer, and turns [`Request`]s into calls on the
//! algorithm. Requests arriving through [`submit`](TransactionManager::submit)
//! run on tokio's blocking pool, at most `worker_threads` at a time, since
//! a lock wait parks the executing thread.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tessera_common::types::NodeId;
use tessera_mvcc::VersioningStore;
use tessera_txn::{
    CompatibilityTable, ConcurrencyControl, LockManager, LockingAlgorithm, LockingPolicy,
    PeerMessenger, RemoteCoordinator, Request, RequestKind, Response, TxnError,
};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointTimer;
use crate::config::NodeConfig;
use crate::transport::RequestHandler;

/// An algorithm the manager knows how to assemble.
pub trait BuildAlgorithm: ConcurrencyControl + Sized + 'static {
    /// Lock compatibility the algorithm needs from its lock manager.
    fn compatibility() -> CompatibilityTable;

    /// Wires the algorithm to its collaborators.
    fn build(
        lock_manager: Arc<LockManager>,
        store: Arc<VersioningStore>,
        coordinator: Option<Arc<RemoteCoordinator>>,
        stall_threshold: Duration,
    ) -> Self;
}

impl<P: LockingPolicy> BuildAlgorithm for LockingAlgorithm<P> {
    fn compatibility() -> CompatibilityTable {
        P::compatibility()
    }

    fn build(
        lock_manager: Arc<LockManager>,
        store: Arc<VersioningStore>,
        coordinator: Option<Arc<RemoteCoordinator>>,
        stall_threshold: Duration,
    ) -> Self {
        let algorithm = Self::new(lock_manager, store).with_stall_threshold(stall_threshold);
        match coordinator {
            Some(coordinator) => algorithm.with_coordinator(coordinator),
            None => algorithm,
        }
    }
}

/// Request counters.
#[derive(Debug, Default)]
pub struct ManagerStats {
    requests: [AtomicU64; RequestKind::ALL.len()],
    /// Requests answered with a failure.
    pub failures: AtomicU64,
}

impl ManagerStats {
    /// Requests of `kind` handled so far.
    pub fn requests(&self, kind: RequestKind) -> u64 {
        self.requests[kind.index()].load(AtomicOrdering::Relaxed)
    }

    /// Requests of every kind handled so far.
    pub fn total(&self) -> u64 {
        self.requests
            .iter()
            .map(|counter| counter.load(AtomicOrdering::Relaxed))
            .sum()
    }

    /// Failed requests.
    pub fn failures(&self) -> u64 {
        self.failures.load(AtomicOrdering::Relaxed)
    }

    fn record(&self, kind: RequestKind, response: &Response) {
        self.requests[kind.index()].fetch_add(1, AtomicOrdering::Relaxed);
        if !response.is_success() {
            self.failures.fetch_add(1, AtomicOrdering::Relaxed);
        }
    }
}

/// Hosts one node's algorithm.
pub struct TransactionManager<A: BuildAlgorithm> {
    node_id: NodeId,
    algorithm: Arc<A>,
    checkpoint: Mutex<Option<CheckpointTimer>>,
    workers: Arc<Semaphore>,
    stats: ManagerStats,
}

impl<A: BuildAlgorithm> TransactionManager<A> {
    /// Assembles a node from `config` and starts its checkpoint timer.
    ///
    /// `messenger` reaches the other nodes of the cluster. Without one, or
    /// when the configuration names a single node, every key is local.
    pub fn start(config: &NodeConfig, messenger: Option<Arc<dyn PeerMessenger>>) -> Result<Self> {
        config.validate()?;
        let node_id = config.node();

        let lock_manager = Arc::new(LockManager::with_config(
            A::compatibility(),
            config.lock_manager_config(),
        ));
        let store = Arc::new(VersioningStore::new().context("failed to start merge worker")?);

        let coordinator = match messenger {
            Some(messenger) if config.is_distributed() => Some(Arc::new(RemoteCoordinator::new(
                Arc::new(config.routing_table()),
                messenger,
            ))),
            Some(_) => None,
            None => {
                if config.is_distributed() {
                    warn!(node = %node_id, "no messenger configured, serving every key locally");
                }
                None
            }
        };

        let algorithm = Arc::new(A::build(
            lock_manager,
            store,
            coordinator,
            config.stall_threshold(),
        ));

        let checkpoint = {
            let algorithm = Arc::clone(&algorithm);
            CheckpointTimer::start(config.checkpoint_interval(), move || algorithm.checkpoint())
                .context("failed to start checkpoint timer")?
        };

        info!(
            node = %node_id,
            algorithm = algorithm.name(),
            workers = config.worker_threads,
            checkpoint_ms = config.checkpoint_interval_ms,
            "transaction manager started"
        );

        Ok(Self {
            node_id,
            algorithm,
            checkpoint: Mutex::new(Some(checkpoint)),
            workers: Arc::new(Semaphore::new(config.worker_threads)),
            stats: ManagerStats::default(),
        })
    }

    /// The hosted algorithm.
    pub fn algorithm(&self) -> &Arc<A> {
        &self.algorithm
    }

    /// Request counters.
    pub fn stats(&self) -> &ManagerStats {
        &self.stats
    }

    /// Checkpoints run so far.
    pub fn checkpoints(&self) -> u64 {
        self.checkpoint.lock().as_ref().map_or(0, CheckpointTimer::runs)
    }

    /// Runs `request` on the blocking pool once a worker slot is free.
    pub async fn submit(self: &Arc<Self>, request: Request) -> Response {
        let txn = request.txn_id();
        let Ok(_permit) = Arc::clone(&self.workers).acquire_owned().await else {
            return Response::Failure(TxnError::Internal {
                txn,
                reason: "worker pool closed".to_string(),
            });
        };

        let manager = Arc::clone(self);
        match tokio::task::spawn_blocking(move || manager.handle(request)).await {
            Ok(response) => response,
            Err(err) => Response::Failure(TxnError::Internal {
                txn,
                reason: format!("worker failed: {err}"),
            }),
        }
    }

    /// Stops the checkpoint timer and refuses further submissions.
    ///
    /// Live transactions are left as they are.
    pub fn shutdown(&self) {
        self.workers.close();
        if let Some(timer) = self.checkpoint.lock().take() {
            timer.stop();
        }
        debug!(node = %self.node_id, "transaction manager stopped");
    }

    fn dispatch(&self, request: Request) -> Response {
        let algorithm = &self.algorithm;
        match request {
            Request::Begin { txn } => algorithm.begin(txn).into(),
            Request::Read { txn, key, locality } => algorithm.read(txn, &key, locality).into(),
            Request::Write {
                txn,
                key,
                locality,
                value,
            } => algorithm.write(txn, key, value, locality).into(),
            Request::Prepare { txn } => algorithm.prepare(txn).into(),
            Request::Commit { txn } => algorithm.commit(txn).into(),
            Request::Abort { txn } => algorithm.abort(txn).into(),
            Request::TryCommit { txn } => algorithm.try_commit(txn).into(),
        }
    }
}

impl<A: BuildAlgorithm> RequestHandler for TransactionManager<A> {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn handle(&self, request: Request) -> Response {
        let kind = request.kind();
        let txn = request.txn_id();
        let response = self.dispatch(request);
        if let Response::Failure(err) = &response {
            debug!(node = %self.node_id, %txn, %kind, error = %err, "request failed");
        }
        self.stats.record(kind, &response);
        response
    }
}

impl<A: BuildAlgorithm> Drop for TransactionManager<A> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<A: BuildAlgorithm + fmt::Debug> fmt::Debug for TransactionManager<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionManager")
            .field("node_id", &self.node_id)
            .field("algorithm", &self.algorithm)
            .field("requests", &self.stats.total())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_common::types::{Key, TxnId, Value};
    use tessera_txn::{Mvcc2pl, TwoPhaseLocking};

    fn config() -> NodeConfig {
        NodeConfig::builder()
            .checkpoint_interval_ms(10)
            .lock_timeout_ms(100)
            .build()
    }

    fn txn(id: u64) -> TxnId {
        TxnId::new(id)
    }

    #[test]
    fn test_dispatch_round_trip() {
        let manager = TransactionManager::<Mvcc2pl>::start(&config(), None).unwrap();
        let k = Key::from_str("k");

        assert!(manager.handle(Request::Begin { txn: txn(1) }).is_success());
        assert_eq!(
            manager.handle(Request::read(txn(1), k.clone())),
            Response::Value(None)
        );
        assert!(manager
            .handle(Request::write(txn(1), k.clone(), Value::from("v")))
            .is_success());
        assert!(manager.handle(Request::TryCommit { txn: txn(1) }).is_success());

        manager.handle(Request::Begin { txn: txn(2) });
        assert_eq!(
            manager.handle(Request::read(txn(2), k)),
            Response::Value(Some(Value::from("v")))
        );
        assert_eq!(manager.stats().requests(RequestKind::Begin), 2);
        assert_eq!(manager.stats().total(), 6);
        assert_eq!(manager.stats().failures(), 0);
    }

    #[test]
    fn test_failures_are_responses() {
        let manager = TransactionManager::<TwoPhaseLocking>::start(&config(), None).unwrap();
        assert_eq!(
            manager.handle(Request::Commit { txn: txn(7) }),
            Response::Failure(TxnError::NotLive(txn(7)))
        );
        manager.handle(Request::Begin { txn: txn(1) });
        assert_eq!(
            manager.handle(Request::Begin { txn: txn(1) }),
            Response::Failure(TxnError::DuplicateTransaction(txn(1)))
        );
        assert_eq!(manager.stats().failures(), 2);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = NodeConfig::builder().worker_threads(0).build();
        assert!(TransactionManager::<Mvcc2pl>::start(&config, None).is_err());
    }

    #[test]
    fn test_checkpoint_runs_until_shutdown() {
        let manager = TransactionManager::<Mvcc2pl>::start(&config(), None).unwrap();
        std::thread::sleep(Duration::from_millis(80));
        assert!(manager.checkpoints() >= 2);
        assert!(manager.algorithm().last_audit().is_some());

        manager.shutdown();
        assert_eq!(manager.checkpoints(), 0);
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_submit_runs_on_worker_pool() {
        let manager = Arc::new(TransactionManager::<Mvcc2pl>::start(&config(), None).unwrap());
        assert!(manager.submit(Request::Begin { txn: txn(1) }).await.is_success());
        assert!(manager
            .submit(Request::write(txn(1), Key::from_str("a"), Value::from("1")))
            .await
            .is_success());
        assert!(manager.submit(Request::TryCommit { txn: txn(1) }).await.is_success());

        manager.shutdown();
        assert!(matches!(
            manager.submit(Request::Begin { txn: txn(2) }).await,
            Response::Failure(TxnError::Internal { .. })
        ));
    }

    #[tokio::test]
    async fn test_blocked_request_does_not_stall_others() {
        let manager = Arc::new(
            TransactionManager::<TwoPhaseLocking>::start(
                &NodeConfig::builder().worker_threads(4).build(),
                None,
            )
            .unwrap(),
        );
        let k = Key::from_str("hot");

        manager.submit(Request::Begin { txn: txn(1) }).await;
        manager.submit(Request::Begin { txn: txn(2) }).await;
        manager
            .submit(Request::write(txn(1), k.clone(), Value::from("x")))
            .await;

        let blocked = {
            let manager = Arc::clone(&manager);
            let k = k.clone();
            tokio::spawn(async move { manager.submit(Request::read(txn(2), k)).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!blocked.is_finished());

        manager.submit(Request::TryCommit { txn: txn(1) }).await;
        assert_eq!(
            blocked.await.unwrap(),
            Response::Value(Some(Value::from("x")))
        );
    }
}
