//! The recorded variable graph.
//!
//! A [`Variable`] is one node of the instruction trace: an IR statement with
//! up to three operands, or a registered memory region. The [`VariableStore`]
//! keeps all live nodes, deduplicates structurally identical statements
//! through a fingerprint index, and drives the two-level reference-count
//! lifecycle (external holders vs. dependent variables).

pub mod key;
pub mod stmt;
pub mod store;
pub mod var;

pub use key::VariableKey;
pub use store::VariableStore;
pub use var::{VarId, Variable};

#[cfg(test)]
mod test;
