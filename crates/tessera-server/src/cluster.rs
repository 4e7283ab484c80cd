//! Several nodes in one process.
//!
//! A [`LocalCluster`] boots one [`TransactionManager`] per node, all
//! sharing a [`MemoryNetwork`]. Every node gets its own lock manager,
//! store and checkpoint timer, and the same routing table, so each key has
//! exactly one owner.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{ensure, Context, Result};
use tessera_common::types::{Key, NodeId};
use tessera_txn::{NodeLocality, PeerMessenger, RoutingTable};
use tracing::info;

use crate::config::NodeConfig;
use crate::manager::{BuildAlgorithm, TransactionManager};
use crate::transport::{MemoryNetwork, RequestHandler};

/// A set of in-process nodes.
pub struct LocalCluster<A: BuildAlgorithm> {
    nodes: BTreeMap<NodeId, Arc<TransactionManager<A>>>,
    network: Arc<MemoryNetwork>,
    routing: RoutingTable,
}

impl<A: BuildAlgorithm> LocalCluster<A> {
    /// Starts nodes `1..=size`, each configured from `template` with its own
    /// id and the full membership.
    pub fn start(size: u32, template: &NodeConfig) -> Result<Self> {
        ensure!(size > 0, "a cluster needs at least one node");

        let ids: Vec<u32> = (1..=size).collect();
        let network = MemoryNetwork::shared();
        let mut nodes = BTreeMap::new();

        for &id in &ids {
            let mut config = template.clone();
            config.node_id = id;
            config.cluster_nodes = ids.clone();

            let messenger: Arc<dyn PeerMessenger> = Arc::new(network.messenger(NodeId::new(id)));
            let manager = Arc::new(
                TransactionManager::<A>::start(&config, Some(messenger))
                    .with_context(|| format!("failed to start node {id}"))?,
            );
            let handler: Arc<dyn RequestHandler> = manager.clone();
            network.register(&handler);
            nodes.insert(NodeId::new(id), manager);
        }

        info!(nodes = size, algorithm = %template.algorithm, "local cluster started");

        Ok(Self {
            nodes,
            network,
            routing: RoutingTable::new(NodeId::FIRST, ids.into_iter().map(NodeId::new)),
        })
    }

    /// The node with `id`.
    pub fn node(&self, id: NodeId) -> Option<&Arc<TransactionManager<A>>> {
        self.nodes.get(&id)
    }

    /// All nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &Arc<TransactionManager<A>>> {
        self.nodes.values()
    }

    /// All node ids in order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the cluster has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The node that owns `key`.
    pub fn owner_of(&self, key: &Key) -> NodeId {
        self.routing.owner_of(key.locality_hash())
    }

    /// The shared network, for injecting partitions.
    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }

    /// Stops every node's checkpoint timer and worker pool.
    pub fn shutdown(&self) {
        for manager in self.nodes.values() {
            manager.shutdown();
        }
        info!(nodes = self.nodes.len(), "local cluster stopped");
    }
}

impl<A: BuildAlgorithm> fmt::Debug for LocalCluster<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalCluster")
            .field("nodes", &self.node_ids())
            .field("network", &self.network)
            .finish()
    }
}
