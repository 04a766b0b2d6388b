//! Database module for PortWatch.
//!
//! Provides SQLite storage for the scan ledger and the key-value configuration.

mod models;
mod store;

pub use models::*;
pub use store::*;
