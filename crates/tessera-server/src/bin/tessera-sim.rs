//! Tessera workload simulator
//!
//! The `tessera-sim` binary boots a cluster of in-process nodes and drives
//! it with concurrent clients running random read/write transactions:
//! - Each transaction starts at a random node and touches random keys
//! - Keys owned by other nodes are forwarded and committed with 2PC
//! - Committed and aborted counts and throughput are printed at the end
//!
//! # Usage
//!
//! ```bash
//! # Three nodes, default workload
//! tessera-sim
//!
//! # Five nodes under strict two-phase locking
//! tessera-sim --nodes 5 --algorithm two_phase_locking
//!
//! # Node settings from a file, reproducible workload
//! tessera-sim --config node.toml --seed 42
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{ensure, Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use tessera_common::types::{Key, NodeId, TxnId, Value};
use tessera_server::{BuildAlgorithm, LocalCluster, LockWait, NodeConfig};
use tessera_txn::{AlgorithmKind, Mvcc2pl, Request, Response, TwoPhaseLocking};

/// Tessera workload simulator
#[derive(Parser, Debug)]
#[command(
    name = "tessera-sim",
    version,
    about = "Runs a random transactional workload against an in-process Tessera cluster"
)]
struct Args {
    /// Number of nodes
    #[arg(short = 'n', long, default_value_t = 3, env = "TESSERA_NODES")]
    nodes: u32,

    /// Concurrent clients
    #[arg(long, default_value_t = 8)]
    clients: usize,

    /// Transactions per client
    #[arg(short = 't', long, default_value_t = 200)]
    transactions: u64,

    /// Size of the key space
    #[arg(short = 'k', long, default_value_t = 64)]
    keys: u32,

    /// Operations per transaction
    #[arg(long, default_value_t = 4)]
    ops: u32,

    /// Fraction of operations that are writes
    #[arg(long, default_value_t = 0.5)]
    write_ratio: f64,

    /// Concurrency-control algorithm (two_phase_locking, mvcc2pl)
    #[arg(short = 'a', long)]
    algorithm: Option<AlgorithmKind>,

    /// Node configuration file applied to every node
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Seed for the workload generator
    #[arg(long)]
    seed: Option<u64>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", env = "TESSERA_LOG_LEVEL")]
    log_level: String,

    /// Print the node configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[derive(Debug, Default)]
struct Tally {
    committed: AtomicU64,
    aborted: AtomicU64,
    operations: AtomicU64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = load_config(&args)?;

    if args.print_config {
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    ensure!(args.keys > 0, "--keys must be positive");
    ensure!(
        (0.0..=1.0).contains(&args.write_ratio),
        "--write-ratio must be between 0 and 1"
    );

    match config.algorithm {
        AlgorithmKind::TwoPhaseLocking => run::<TwoPhaseLocking>(&args, &config).await,
        AlgorithmKind::Mvcc2pl => run::<Mvcc2pl>(&args, &config).await,
    }
}

fn init_logging(args: &Args) {
    let level = &args.log_level;
    let filter = EnvFilter::try_new(format!(
        "tessera_server={level},tessera_txn={level},tessera_mvcc={level},tessera_sim={level}"
    ))
    .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .init();
}

fn load_config(args: &Args) -> Result<NodeConfig> {
    let mut config = if let Some(path) = &args.config {
        NodeConfig::from_file(path).context("Failed to load config file")?
    } else {
        // Blocking waits can deadlock across nodes; bound them by default.
        NodeConfig {
            lock_wait: LockWait::Timeout,
            ..NodeConfig::default()
        }
    };

    if let Some(algorithm) = args.algorithm {
        config.algorithm = algorithm;
    }

    Ok(config)
}

async fn run<A: BuildAlgorithm>(args: &Args, config: &NodeConfig) -> Result<()> {
    let cluster = Arc::new(LocalCluster::<A>::start(args.nodes, config)?);
    let tally = Arc::new(Tally::default());
    let next_txn = Arc::new(AtomicU64::new(1));
    let seed = args.seed.unwrap_or_else(rand::random);

    info!(
        nodes = args.nodes,
        clients = args.clients,
        transactions = args.transactions,
        algorithm = %config.algorithm,
        seed,
        "starting workload"
    );

    let started = Instant::now();
    let mut clients = Vec::with_capacity(args.clients);
    for client in 0..args.clients {
        let workload = Workload {
            cluster: Arc::clone(&cluster),
            tally: Arc::clone(&tally),
            next_txn: Arc::clone(&next_txn),
            rng: StdRng::seed_from_u64(seed.wrapping_add(client as u64)),
            keys: args.keys,
            ops: args.ops,
            write_ratio: args.write_ratio,
        };
        clients.push(tokio::spawn(workload.run(args.transactions)));
    }

    for client in clients {
        client.await.context("client task failed")?;
    }
    let elapsed = started.elapsed();

    cluster.shutdown();
    report(&tally, elapsed);
    Ok(())
}

struct Workload<A: BuildAlgorithm> {
    cluster: Arc<LocalCluster<A>>,
    tally: Arc<Tally>,
    next_txn: Arc<AtomicU64>,
    rng: StdRng,
    keys: u32,
    ops: u32,
    write_ratio: f64,
}

impl<A: BuildAlgorithm> Workload<A> {
    async fn run(mut self, transactions: u64) {
        for _ in 0..transactions {
            let committed = self.transaction().await;
            let counter = if committed {
                &self.tally.committed
            } else {
                &self.tally.aborted
            };
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Runs one transaction; returns whether it committed.
    async fn transaction(&mut self) -> bool {
        let txn = TxnId::new(self.next_txn.fetch_add(1, Ordering::Relaxed));
        let node_id = NodeId::new(self.rng.gen_range(1..=self.cluster.len() as u32));
        let Some(node) = self.cluster.node(node_id).cloned() else {
            return false;
        };

        if !node.submit(Request::Begin { txn }).await.is_success() {
            return false;
        }

        for _ in 0..self.ops {
            let key = Key::from(format!("key-{}", self.rng.gen_range(0..self.keys)));
            let request = if self.rng.gen_bool(self.write_ratio) {
                let value = Value::from(format!("{txn}:{}", self.rng.gen::<u32>()));
                Request::write(txn, key, value)
            } else {
                Request::read(txn, key)
            };

            self.tally.operations.fetch_add(1, Ordering::Relaxed);
            if let Response::Failure(err) = node.submit(request).await {
                debug!(%txn, error = %err, "operation failed");
                return false;
            }
        }

        match node.submit(Request::TryCommit { txn }).await {
            Response::Failure(err) => {
                debug!(%txn, error = %err, "commit failed");
                false
            }
            _ => true,
        }
    }
}

fn report(tally: &Tally, elapsed: Duration) {
    let committed = tally.committed.load(Ordering::Relaxed);
    let aborted = tally.aborted.load(Ordering::Relaxed);
    let operations = tally.operations.load(Ordering::Relaxed);
    let seconds = elapsed.as_secs_f64().max(f64::EPSILON);

    println!("committed:   {committed}");
    println!("aborted:     {aborted}");
    println!("operations:  {operations}");
    println!("elapsed:     {:.3}s", elapsed.as_secs_f64());
    println!("throughput:  {:.1} txn/s", committed as f64 / seconds);
}
