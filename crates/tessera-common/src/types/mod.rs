//! Type definitions for Tessera.

mod ids;
mod keys;

pub use ids::{NodeId, TxnId};
pub use keys::{Key, Value};
