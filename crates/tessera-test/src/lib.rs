//! # tessera-test
//!
//! Integration tests for Tessera.
//!
//! This crate contains:
//! - Helpers for driving nodes one request at a time
//! - A bank-transfer workload whose total balance must never change
//! - End-to-end tests of isolation, visibility and two-phase commit

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Test utilities and helpers
pub mod utils;

/// Workload generators
pub mod workload;
