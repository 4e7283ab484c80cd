//! Shared in-memory network.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::RwLock;
use tessera_common::types::NodeId;
use tessera_txn::{PeerMessenger, Request, Response, TransportError, TransportResult};
use tracing::{debug, trace};

use super::RequestHandler;

/// Message counters for a network.
#[derive(Debug, Default)]
pub struct NetworkStats {
    /// Requests handed to a handler.
    pub delivered: AtomicU64,
    /// Posted requests dropped by a partition.
    pub dropped: AtomicU64,
    /// Calls that failed to reach a handler.
    pub failed: AtomicU64,
}

/// A shared network for in-process nodes.
///
/// Holds weak references, so a node that shuts down simply becomes
/// unreachable.
pub struct MemoryNetwork {
    /// Handlers by node.
    nodes: DashMap<NodeId, Weak<dyn RequestHandler>>,
    /// Blocked (from, to) directions.
    partitions: RwLock<HashSet<(NodeId, NodeId)>>,
    stats: NetworkStats,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    /// Creates a new memory network.
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
            partitions: RwLock::new(HashSet::new()),
            stats: NetworkStats::default(),
        }
    }

    /// Creates a new memory network wrapped in Arc.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Makes `handler` reachable as its node.
    pub fn register(&self, handler: &Arc<dyn RequestHandler>) {
        self.nodes.insert(handler.node_id(), Arc::downgrade(handler));
    }

    /// Creates a messenger that sends on behalf of `node_id`.
    pub fn messenger(self: &Arc<Self>, node_id: NodeId) -> MemoryMessenger {
        MemoryMessenger {
            node_id,
            network: Arc::clone(self),
        }
    }

    /// Blocks traffic from `from` to `to`. The reverse direction is
    /// unaffected.
    pub fn add_partition(&self, from: NodeId, to: NodeId) {
        self.partitions.write().insert((from, to));
    }

    /// Cuts `node_id` off from every other registered node, both ways.
    pub fn isolate(&self, node_id: NodeId) {
        let peers = self.node_ids();
        let mut partitions = self.partitions.write();
        for peer in peers.into_iter().filter(|&peer| peer != node_id) {
            partitions.insert((node_id, peer));
            partitions.insert((peer, node_id));
        }
        debug!(node = %node_id, "isolated");
    }

    /// Lifts every partition touching `node_id`. Partitions between other
    /// nodes stay.
    pub fn reconnect(&self, node_id: NodeId) {
        self.partitions
            .write()
            .retain(|&(from, to)| from != node_id && to != node_id);
        debug!(node = %node_id, "reconnected");
    }

    /// Lifts every partition.
    pub fn heal_all(&self) {
        self.partitions.write().clear();
    }

    /// Whether traffic from `from` to `to` is blocked.
    pub fn is_partitioned(&self, from: NodeId, to: NodeId) -> bool {
        self.partitions.read().contains(&(from, to))
    }

    /// Returns all registered node IDs.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Returns message counters.
    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    fn route(&self, from: NodeId, to: NodeId) -> TransportResult<Arc<dyn RequestHandler>> {
        if self.is_partitioned(from, to) {
            return Err(TransportError::ConnectionFailed {
                node_id: to,
                reason: format!("partitioned from node {from}"),
            });
        }

        let handler = self
            .nodes
            .get(&to)
            .map(|entry| entry.value().clone())
            .ok_or(TransportError::UnknownNode(to))?;
        handler.upgrade().ok_or(TransportError::NodeGone(to))
    }

    fn deliver(&self, from: NodeId, to: NodeId, request: Request) -> TransportResult<Response> {
        match self.route(from, to) {
            Ok(handler) => {
                trace!(%from, %to, kind = %request.kind(), txn = %request.txn_id(), "deliver");
                self.stats.delivered.fetch_add(1, AtomicOrdering::Relaxed);
                Ok(handler.handle(request))
            }
            Err(err) => {
                self.stats.failed.fetch_add(1, AtomicOrdering::Relaxed);
                Err(err)
            }
        }
    }
}

impl fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("nodes", &self.node_ids())
            .field("partitions", &self.partitions.read().len())
            .field(
                "delivered",
                &self.stats.delivered.load(AtomicOrdering::Relaxed),
            )
            .finish()
    }
}

/// Sends requests into a [`MemoryNetwork`] on behalf of one node.
///
/// Delivery is synchronous: the target's handler runs on the caller's
/// thread.
#[derive(Clone)]
pub struct MemoryMessenger {
    node_id: NodeId,
    network: Arc<MemoryNetwork>,
}

impl MemoryMessenger {
    /// The sending node.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }
}

impl fmt::Debug for MemoryMessenger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryMessenger")
            .field("node_id", &self.node_id)
            .finish()
    }
}

impl PeerMessenger for MemoryMessenger {
    fn call(&self, to: NodeId, request: Request) -> TransportResult<Response> {
        self.network.deliver(self.node_id, to, request)
    }

    fn post(&self, to: NodeId, request: Request) -> TransportResult<()> {
        // A partition silently drops fire-and-forget traffic.
        if self.network.is_partitioned(self.node_id, to) {
            self.network
                .stats
                .dropped
                .fetch_add(1, AtomicOrdering::Relaxed);
            return Ok(());
        }
        self.network.deliver(self.node_id, to, request).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tessera_common::types::TxnId;

    struct Echo {
        id: NodeId,
        seen: Mutex<Vec<Request>>,
    }

    impl Echo {
        fn new(id: u32) -> Arc<Self> {
            Arc::new(Self {
                id: NodeId::new(id),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    impl RequestHandler for Echo {
        fn node_id(&self) -> NodeId {
            self.id
        }

        fn handle(&self, request: Request) -> Response {
            self.seen.lock().push(request);
            Response::Success
        }
    }

    fn begin(txn: u64) -> Request {
        Request::Begin {
            txn: TxnId::new(txn),
        }
    }

    #[test]
    fn test_call_reaches_handler() {
        let network = MemoryNetwork::shared();
        let echo = Echo::new(2);
        let handler: Arc<dyn RequestHandler> = echo.clone();
        network.register(&handler);

        let messenger = network.messenger(NodeId::new(1));
        assert_eq!(
            messenger.call(NodeId::new(2), begin(1)).unwrap(),
            Response::Success
        );
        assert_eq!(echo.seen.lock().len(), 1);
        assert_eq!(network.stats().delivered.load(AtomicOrdering::Relaxed), 1);
    }

    #[test]
    fn test_unknown_and_gone_nodes() {
        let network = MemoryNetwork::shared();
        let messenger = network.messenger(NodeId::new(1));
        assert_eq!(
            messenger.call(NodeId::new(9), begin(1)),
            Err(TransportError::UnknownNode(NodeId::new(9)))
        );

        {
            let handler: Arc<dyn RequestHandler> = Echo::new(2);
            network.register(&handler);
        }
        assert_eq!(
            messenger.call(NodeId::new(2), begin(1)),
            Err(TransportError::NodeGone(NodeId::new(2)))
        );
        assert_eq!(network.stats().failed.load(AtomicOrdering::Relaxed), 2);
    }

    #[test]
    fn test_partition() {
        let network = MemoryNetwork::shared();
        let echo = Echo::new(2);
        let handler: Arc<dyn RequestHandler> = echo.clone();
        network.register(&handler);
        let messenger = network.messenger(NodeId::new(1));

        network.add_partition(NodeId::new(1), NodeId::new(2));
        assert!(matches!(
            messenger.call(NodeId::new(2), begin(1)),
            Err(TransportError::ConnectionFailed { .. })
        ));
        messenger.post(NodeId::new(2), begin(2)).unwrap();
        assert!(echo.seen.lock().is_empty());
        assert_eq!(network.stats().dropped.load(AtomicOrdering::Relaxed), 1);

        // One-way: the reverse direction still works.
        assert!(!network.is_partitioned(NodeId::new(2), NodeId::new(1)));

        network.heal_all();
        messenger.post(NodeId::new(2), begin(3)).unwrap();
        assert_eq!(echo.seen.lock().len(), 1);
    }

    #[test]
    fn test_isolate_and_reconnect() {
        let network = MemoryNetwork::shared();
        let handlers: Vec<Arc<dyn RequestHandler>> = (1..=3)
            .map(|id| Echo::new(id) as Arc<dyn RequestHandler>)
            .collect();
        for handler in &handlers {
            network.register(handler);
        }
        let (n1, n2, n3) = (NodeId::new(1), NodeId::new(2), NodeId::new(3));

        network.add_partition(n1, n2);
        network.isolate(n3);
        for peer in [n1, n2] {
            assert!(network.is_partitioned(n3, peer));
            assert!(network.is_partitioned(peer, n3));
        }
        assert!(matches!(
            network.messenger(n2).call(n3, begin(1)),
            Err(TransportError::ConnectionFailed { .. })
        ));

        network.reconnect(n3);
        assert!(!network.is_partitioned(n3, n1));
        assert!(!network.is_partitioned(n2, n3));
        assert!(network.is_partitioned(n1, n2));
        assert_eq!(network.messenger(n2).call(n3, begin(2)), Ok(Response::Success));
    }
}
