//! In-process transport between transaction managers.
//!
//! Nodes of a [`LocalCluster`](crate::cluster::LocalCluster) live in one
//! process and exchange [`Request`]s by direct call through a shared
//! [`MemoryNetwork`]. Nothing is encoded; the network only decides whether
//! a message gets through.
//!
//! ```text
//! ┌──────────┐  MemoryMessenger   ┌───────────────┐  RequestHandler  ┌──────────┐
//! │  node 1  │───────────────────▶│ MemoryNetwork │─────────────────▶│  node 2  │
//! └──────────┘                    │  partitions   │                  └──────────┘
//!                                 └───────────────┘
//! ```

mod memory;

pub use memory::{MemoryMessenger, MemoryNetwork, NetworkStats};

use tessera_common::types::NodeId;
use tessera_txn::{Request, Response};

/// Something that serves transactional requests for a node.
pub trait RequestHandler: Send + Sync {
    /// The node this handler serves.
    fn node_id(&self) -> NodeId;

    /// Executes `request` and reports the outcome. Never panics on a bad
    /// request; failures come back as [`Response::Failure`].
    fn handle(&self, request: Request) -> Response;
}
