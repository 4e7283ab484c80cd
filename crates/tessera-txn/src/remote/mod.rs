//! Cross-node plumbing for distributed transactions.
//!
//! A transaction may touch keys owned by other nodes. The node that
//! received `begin` from the client acts as coordinator: it forwards
//! non-local operations to the owning node, enlisting that node as a
//! participant, and runs two-phase commit across all participants.
//!
//! ```text
//!   client ──▶ ┌──────────────┐  Read/Write   ┌─────────────┐
//!              │ coordinator  │──────────────▶│ participant │
//!              │   (node 1)   │  Prepare/...  │   (node 2)  │
//!              └──────────────┘──────────────▶└─────────────┘
//! ```
//!
//! The transport is abstract: [`PeerMessenger`] sends a request to a node
//! and (for [`PeerMessenger::call`]) waits for its response, and
//! [`NodeLocality`] maps a key's affinity hash onto its owner.

mod coordinator;

pub use coordinator::{CoordinatorStats, RemoteCoordinator};

use serde::{Deserialize, Serialize};
use tessera_common::types::NodeId;
use thiserror::Error;

use crate::message::{Request, Response};

/// Errors that can occur while talking to a peer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No node with this id is registered.
    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    /// The message could not be delivered.
    #[error("connection failed to node {node_id}: {reason}")]
    ConnectionFailed {
        /// The target node ID.
        node_id: NodeId,
        /// The reason for failure.
        reason: String,
    },

    /// The node was registered but has shut down.
    #[error("node {0} is gone")]
    NodeGone(NodeId),
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Sends requests to other transaction managers.
pub trait PeerMessenger: Send + Sync {
    /// Sends `request` to `to` and waits for its response.
    fn call(&self, to: NodeId, request: Request) -> TransportResult<Response>;

    /// Sends `request` to `to` without waiting for the outcome.
    ///
    /// Success only means the request was handed to the transport.
    fn post(&self, to: NodeId, request: Request) -> TransportResult<()>;
}

/// Decides which node owns a key.
pub trait NodeLocality: Send + Sync {
    /// This node.
    fn local_node(&self) -> NodeId;

    /// Node owning keys with the given affinity hash.
    fn owner_of(&self, locality: u32) -> NodeId;

    /// Returns true if keys with this hash are served locally.
    fn is_local(&self, locality: u32) -> bool {
        self.owner_of(locality) == self.local_node()
    }
}

/// Static hash-modulo placement over a fixed set of nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTable {
    local: NodeId,
    nodes: Vec<NodeId>,
}

impl RoutingTable {
    /// Creates a table. Node order does not matter; duplicates are dropped.
    pub fn new(local: NodeId, nodes: impl IntoIterator<Item = NodeId>) -> Self {
        let mut nodes: Vec<NodeId> = nodes.into_iter().collect();
        nodes.sort_unstable();
        nodes.dedup();
        Self { local, nodes }
    }

    /// A table in which this node owns every key.
    pub fn single_node(local: NodeId) -> Self {
        Self::new(local, [local])
    }

    /// The nodes keys are spread across, in id order.
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }
}

impl NodeLocality for RoutingTable {
    fn local_node(&self) -> NodeId {
        self.local
    }

    fn owner_of(&self, locality: u32) -> NodeId {
        if self.nodes.is_empty() {
            return self.local;
        }
        self.nodes[locality as usize % self.nodes.len()]
    }
}
