//! # tessera-mvcc
//!
//! Multi-version storage for Tessera.
//!
//! This crate implements:
//! - Per-transaction write buffers (read-your-writes)
//! - A pending-commit queue of committed buffers, scanned newest first
//! - A shared primary store
//! - A background worker merging committed buffers into the primary store
//!   in commit order

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Write buffers, pending-commit queue and primary store
pub mod versioning;

pub use versioning::{VersioningStats, VersioningStore, WriteSet};
