//! Shared in-memory stores, one instance per engine.

pub mod context;
pub mod ledger;

pub use context::ContextStore;
pub use ledger::{LedgerConfig, ResourceLedger};
