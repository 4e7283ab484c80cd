//! # tessera-common
//!
//! Common types and constants for Tessera.
//!
//! This crate provides the foundational types shared by every Tessera
//! component:
//!
//! - **Types**: transaction and node identifiers (`TxnId`, `NodeId`), and the
//!   opaque byte wrappers `Key` and `Value`
//! - **Constants**: system-wide defaults
//!
//! ## Example
//!
//! ```rust
//! use tessera_common::types::{Key, NodeId, TxnId, Value};
//!
//! let txn = TxnId::new(1);
//! let node = NodeId::new(2);
//! let key = Key::from_str("user:1");
//! let value = Value::from_str("alice");
//! assert!(txn.is_valid() && node.is_valid());
//! assert_eq!(key.locality_hash(), Key::from_str("user:1").locality_hash());
//! # let _ = value;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod constants;
pub mod types;

pub use constants::*;
pub use types::{Key, NodeId, TxnId, Value};
