use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};

use tessera_common::types::{Key, NodeId, TxnId, Value};
use tessera_server::{BuildAlgorithm, LocalCluster, NodeConfig, RequestHandler};
use tessera_txn::{Request, Response, TxnError};
use tracing_subscriber::EnvFilter;

static NEXT_TXN: AtomicU64 = AtomicU64::new(1_000_000);
static LOGGING: Once = Once::new();

/// A transaction id no other test has used.
pub fn fresh_txn() -> TxnId {
    TxnId::new(NEXT_TXN.fetch_add(1, Ordering::Relaxed))
}

/// Routes `tracing` output to the test harness when `RUST_LOG` is set.
pub fn init_test_logging() {
    LOGGING.call_once(|| {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_test_writer()
                .try_init();
        }
    });
}

/// Node settings for tests: bounded lock waits and frequent checkpoints.
pub fn test_config() -> NodeConfig {
    NodeConfig::builder()
        .lock_timeout_ms(200)
        .checkpoint_interval_ms(50)
        .worker_threads(4)
        .build()
}

/// First key of the form `{prefix}-N` owned by `owner`.
pub fn key_owned_by<A: BuildAlgorithm>(
    cluster: &LocalCluster<A>,
    prefix: &str,
    owner: NodeId,
) -> Key {
    (0u32..)
        .map(|i| Key::from(format!("{prefix}-{i}")))
        .find(|key| cluster.owner_of(key) == owner)
        .unwrap_or_else(|| panic!("no key owned by {owner}"))
}

/// One transaction driven against one node.
pub struct Session {
    node: Arc<dyn RequestHandler>,
    txn: TxnId,
}

impl Session {
    /// Begins a fresh transaction on `node`.
    pub fn begin(node: Arc<dyn RequestHandler>) -> Self {
        Self::begin_with(node, fresh_txn())
    }

    /// Begins transaction `txn` on `node`.
    pub fn begin_with(node: Arc<dyn RequestHandler>, txn: TxnId) -> Self {
        let response = node.handle(Request::Begin { txn });
        assert!(response.is_success(), "begin {txn} failed: {response:?}");
        Self { node, txn }
    }

    /// The transaction id.
    pub fn txn(&self) -> TxnId {
        self.txn
    }

    /// Reads `key`; `Ok(None)` if it has no value.
    pub fn read(&self, key: impl Into<Key>) -> Result<Option<Value>, TxnError> {
        self.node
            .handle(Request::read(self.txn, key.into()))
            .into_value()
    }

    /// Reads `key` as a string.
    pub fn read_str(&self, key: impl Into<Key>) -> Result<Option<String>, TxnError> {
        Ok(self
            .read(key)?
            .and_then(|value| value.as_str().map(str::to_string)))
    }

    /// Writes `key`.
    pub fn write(&self, key: impl Into<Key>, value: impl Into<Value>) -> Result<(), TxnError> {
        self.node
            .handle(Request::write(self.txn, key.into(), value.into()))
            .into_unit()
    }

    /// Prepares and commits.
    pub fn commit(&self) -> Result<(), TxnError> {
        self.send(Request::TryCommit { txn: self.txn })
    }

    /// Aborts.
    pub fn abort(&self) -> Result<(), TxnError> {
        self.send(Request::Abort { txn: self.txn })
    }

    fn send(&self, request: Request) -> Result<(), TxnError> {
        self.node.handle(request).into_unit()
    }
}

/// Reads `key` in a transaction of its own.
pub fn read_committed(node: Arc<dyn RequestHandler>, key: impl Into<Key>) -> Option<String> {
    let session = Session::begin(node);
    let value = session.read_str(key).expect("read failed");
    session.commit().expect("read-only commit failed");
    value
}

/// Writes and commits `key` in a transaction of its own.
pub fn write_committed(
    node: Arc<dyn RequestHandler>,
    key: impl Into<Key>,
    value: impl Into<Value>,
) -> Response {
    let session = Session::begin(node);
    if let Err(err) = session.write(key, value) {
        return Response::Failure(err);
    }
    session.commit().into()
}
