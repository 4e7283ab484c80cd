//! # tessera-server
//!
//! Hosting for Tessera nodes.
//!
//! This crate provides:
//!
//! - **Transaction Manager**: owns a node's concurrency-control algorithm,
//!   dispatches requests to it on a bounded worker pool and runs the
//!   periodic checkpoint.
//!
//! - **Configuration**: TOML node configuration with defaults for every
//!   field.
//!
//! - **Local Cluster**: several nodes in one process connected by an
//!   in-memory network that can simulate partitions.
//!
//! # Quick Start
//!
//! ```no_run
//! use tessera_common::types::{Key, NodeId, TxnId, Value};
//! use tessera_server::{LocalCluster, NodeConfig, RequestHandler};
//! use tessera_txn::{Mvcc2pl, Request};
//!
//! let cluster = LocalCluster::<Mvcc2pl>::start(3, &NodeConfig::default())?;
//! let node = cluster.node(NodeId::FIRST).unwrap();
//!
//! let txn = TxnId::new(1);
//! node.handle(Request::Begin { txn });
//! node.handle(Request::write(txn, Key::from("k"), Value::from("v")));
//! assert!(node.handle(Request::TryCommit { txn }).is_success());
//! # Ok::<(), anyhow::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Periodic checkpoint thread.
pub mod checkpoint;

/// In-process cluster.
pub mod cluster;

/// Node configuration.
pub mod config;

/// Transaction manager host.
pub mod manager;

/// In-memory transport.
pub mod transport;

pub use checkpoint::CheckpointTimer;
pub use cluster::LocalCluster;
pub use config::{LockWait, NodeConfig, NodeConfigBuilder};
pub use manager::{BuildAlgorithm, ManagerStats, TransactionManager};
pub use transport::{MemoryMessenger, MemoryNetwork, NetworkStats, RequestHandler};
