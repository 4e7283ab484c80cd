//! Node configuration.
//!
//! This module provides configuration management for a Tessera node.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, ensure, Result};
use serde::{Deserialize, Serialize};
use tessera_common::constants::{
    DEFAULT_CHECKPOINT_INTERVAL_MS, DEFAULT_LOCK_TIMEOUT_MS, DEFAULT_STALL_THRESHOLD_MS,
    DEFAULT_WORKER_THREADS,
};
use tessera_common::types::NodeId;
use tessera_txn::{AlgorithmKind, LockManagerConfig, RoutingTable, WaitPolicy};

/// How lock requests behave on conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockWait {
    /// Wait until granted. Deadlocks are not broken.
    #[default]
    Block,
    /// Abort on the first conflict.
    NoWait,
    /// Wait up to `lock_timeout_ms`, then abort.
    Timeout,
}

/// Node configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's id.
    #[serde(default = "default_node_id")]
    pub node_id: u32,

    /// Concurrency-control algorithm.
    #[serde(default)]
    pub algorithm: AlgorithmKind,

    /// Interval between checkpoints.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval_ms: u64,

    /// Requests executed concurrently by this node.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// Lock wait policy.
    #[serde(default)]
    pub lock_wait: LockWait,

    /// Lock wait bound when `lock_wait` is `timeout`.
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_ms: u64,

    /// Age at which checkpoints report a transaction as stalled.
    #[serde(default = "default_stall_threshold")]
    pub stall_threshold_ms: u64,

    /// Ids of every node in the cluster, this one included. Empty means a
    /// single node owning every key.
    #[serde(default)]
    pub cluster_nodes: Vec<u32>,
}

fn default_node_id() -> u32 {
    NodeId::FIRST.as_u32()
}

fn default_checkpoint_interval() -> u64 {
    DEFAULT_CHECKPOINT_INTERVAL_MS
}

fn default_worker_threads() -> usize {
    DEFAULT_WORKER_THREADS
}

fn default_lock_timeout() -> u64 {
    DEFAULT_LOCK_TIMEOUT_MS
}

fn default_stall_threshold() -> u64 {
    DEFAULT_STALL_THRESHOLD_MS
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            algorithm: AlgorithmKind::default(),
            checkpoint_interval_ms: default_checkpoint_interval(),
            worker_threads: default_worker_threads(),
            lock_wait: LockWait::default(),
            lock_timeout_ms: default_lock_timeout(),
            stall_threshold_ms: default_stall_threshold(),
            cluster_nodes: Vec::new(),
        }
    }
}

impl NodeConfig {
    /// Creates a new default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Saves configuration to a file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = self.to_toml()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, content)?;
        Ok(())
    }

    /// Converts configuration to TOML string.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Checks the configuration for values the node cannot run with.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.node_id != 0, "node_id 0 is reserved");
        ensure!(self.worker_threads > 0, "worker_threads must be positive");
        ensure!(
            self.checkpoint_interval_ms > 0,
            "checkpoint_interval_ms must be positive"
        );
        if self.lock_wait == LockWait::Timeout && self.lock_timeout_ms == 0 {
            bail!("lock_timeout_ms must be positive when lock_wait = \"timeout\"");
        }
        if !self.cluster_nodes.is_empty() {
            ensure!(
                !self.cluster_nodes.contains(&0),
                "cluster_nodes must not contain node 0"
            );
            ensure!(
                self.cluster_nodes.contains(&self.node_id),
                "cluster_nodes does not list this node ({})",
                self.node_id
            );
        }
        Ok(())
    }

    /// This node's id.
    pub fn node(&self) -> NodeId {
        NodeId::new(self.node_id)
    }

    /// Returns true if keys are spread across more than one node.
    pub fn is_distributed(&self) -> bool {
        self.routing_table().nodes().len() > 1
    }

    /// Key placement for this node.
    pub fn routing_table(&self) -> RoutingTable {
        if self.cluster_nodes.is_empty() {
            RoutingTable::single_node(self.node())
        } else {
            RoutingTable::new(
                self.node(),
                self.cluster_nodes.iter().copied().map(NodeId::new),
            )
        }
    }

    /// Lock manager settings derived from `lock_wait`.
    pub fn lock_manager_config(&self) -> LockManagerConfig {
        let wait_policy = match self.lock_wait {
            LockWait::Block => WaitPolicy::Block,
            LockWait::NoWait => WaitPolicy::NoWait,
            LockWait::Timeout => WaitPolicy::Timeout(Duration::from_millis(self.lock_timeout_ms)),
        };
        LockManagerConfig { wait_policy }
    }

    /// Checkpoint interval.
    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }

    /// Stall threshold.
    pub fn stall_threshold(&self) -> Duration {
        Duration::from_millis(self.stall_threshold_ms)
    }

    /// Creates a builder for configuration.
    pub fn builder() -> NodeConfigBuilder {
        NodeConfigBuilder::new()
    }
}

/// Builder for node configuration.
#[derive(Default)]
pub struct NodeConfigBuilder {
    config: NodeConfig,
}

impl NodeConfigBuilder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the node id.
    pub fn node_id(mut self, id: u32) -> Self {
        self.config.node_id = id;
        self
    }

    /// Sets the algorithm.
    pub fn algorithm(mut self, algorithm: AlgorithmKind) -> Self {
        self.config.algorithm = algorithm;
        self
    }

    /// Sets the checkpoint interval.
    pub fn checkpoint_interval_ms(mut self, ms: u64) -> Self {
        self.config.checkpoint_interval_ms = ms;
        self
    }

    /// Sets the number of concurrently executing requests.
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.config.worker_threads = threads;
        self
    }

    /// Sets the lock wait policy.
    pub fn lock_wait(mut self, lock_wait: LockWait) -> Self {
        self.config.lock_wait = lock_wait;
        self
    }

    /// Waits at most `ms` for a lock.
    pub fn lock_timeout_ms(mut self, ms: u64) -> Self {
        self.config.lock_wait = LockWait::Timeout;
        self.config.lock_timeout_ms = ms;
        self
    }

    /// Sets the stall threshold.
    pub fn stall_threshold_ms(mut self, ms: u64) -> Self {
        self.config.stall_threshold_ms = ms;
        self
    }

    /// Sets the cluster membership.
    pub fn cluster_nodes(mut self, nodes: Vec<u32>) -> Self {
        self.config.cluster_nodes = nodes;
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> NodeConfig {
        self.config
    }
}
