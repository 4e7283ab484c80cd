//! Bank-transfer workload.
//!
//! Accounts start with a fixed balance and every transaction moves money
//! between two of them. Under serializable execution the total never
//! changes, whatever commits or aborts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tessera_common::types::Key;
use tessera_server::RequestHandler;
use tessera_txn::TxnError;
use tracing::debug;

use crate::utils::Session;

/// Outcome counts of a workload run.
#[derive(Debug, Default)]
pub struct WorkloadReport {
    /// Committed transfers.
    pub committed: AtomicU64,
    /// Transfers that aborted.
    pub aborted: AtomicU64,
}

impl WorkloadReport {
    /// Committed count.
    pub fn committed(&self) -> u64 {
        self.committed.load(Ordering::Relaxed)
    }

    /// Aborted count.
    pub fn aborted(&self) -> u64 {
        self.aborted.load(Ordering::Relaxed)
    }
}

/// Concurrent transfers between accounts.
#[derive(Debug, Clone)]
pub struct TransferWorkload {
    /// Number of accounts.
    pub accounts: u32,
    /// Starting balance of each account.
    pub initial_balance: i64,
    /// Client threads.
    pub clients: usize,
    /// Transfers attempted per client.
    pub transfers_per_client: usize,
    /// Seed for account and amount selection.
    pub seed: u64,
}

impl Default for TransferWorkload {
    fn default() -> Self {
        Self {
            accounts: 8,
            initial_balance: 100,
            clients: 4,
            transfers_per_client: 25,
            seed: 7,
        }
    }
}

impl TransferWorkload {
    /// Key of account `i`.
    pub fn account(i: u32) -> Key {
        Key::from(format!("account-{i}"))
    }

    /// Sum the accounts must always add up to.
    pub fn expected_total(&self) -> i64 {
        self.initial_balance * i64::from(self.accounts)
    }

    /// Writes the starting balances through `node`.
    pub fn seed_accounts(&self, node: Arc<dyn RequestHandler>) -> Result<(), TxnError> {
        let session = Session::begin(node);
        for i in 0..self.accounts {
            session.write(Self::account(i), self.initial_balance.to_string())?;
        }
        session.commit()
    }

    /// Runs the transfers, client `c` sending through `nodes[c % len]`.
    pub fn run(&self, nodes: &[Arc<dyn RequestHandler>]) -> WorkloadReport {
        assert!(!nodes.is_empty(), "no nodes to run against");
        assert!(self.accounts >= 2, "transfers need two accounts");
        let report = Arc::new(WorkloadReport::default());

        let handles: Vec<_> = (0..self.clients)
            .map(|client| {
                let node = Arc::clone(&nodes[client % nodes.len()]);
                let report = Arc::clone(&report);
                let workload = self.clone();
                thread::spawn(move || {
                    let mut rng = StdRng::seed_from_u64(workload.seed + client as u64);
                    for _ in 0..workload.transfers_per_client {
                        let counter = match workload.transfer(&node, &mut rng) {
                            Ok(()) => &report.committed,
                            Err(err) => {
                                debug!(error = %err, "transfer aborted");
                                &report.aborted
                            }
                        };
                        counter.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("client thread panicked");
        }

        Arc::try_unwrap(report).unwrap_or_default()
    }

    /// Reads every account in one transaction and returns the sum.
    pub fn total(&self, node: Arc<dyn RequestHandler>) -> Result<i64, TxnError> {
        let session = Session::begin(node);
        let mut total = 0;
        for i in 0..self.accounts {
            total += balance(&session, &Self::account(i))?;
        }
        session.commit()?;
        Ok(total)
    }

    fn transfer(&self, node: &Arc<dyn RequestHandler>, rng: &mut StdRng) -> Result<(), TxnError> {
        let from = rng.gen_range(0..self.accounts);
        let to = (from + rng.gen_range(1..self.accounts)) % self.accounts;
        let amount = rng.gen_range(1..=10);

        let session = Session::begin(Arc::clone(node));
        let result = move_funds(&session, &Self::account(from), &Self::account(to), amount);
        if let Err(err) = &result {
            // Aborting errors have already torn the transaction down.
            if !err.is_abort() {
                let _ = session.abort();
            }
        }
        result
    }
}

fn move_funds(session: &Session, from: &Key, to: &Key, amount: i64) -> Result<(), TxnError> {
    let from_balance = balance(session, from)?;
    let to_balance = balance(session, to)?;
    session.write(from.clone(), (from_balance - amount).to_string())?;
    session.write(to.clone(), (to_balance + amount).to_string())?;
    session.commit()
}

fn balance(session: &Session, key: &Key) -> Result<i64, TxnError> {
    let value = session.read_str(key.clone())?;
    value
        .as_deref()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| TxnError::Internal {
            txn: session.txn(),
            reason: format!("account {key} has no balance"),
        })
}
