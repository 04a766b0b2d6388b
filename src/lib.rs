//! Portwatch - mail and web port blocking monitor
//!
//! Probes a fixed set of ports on one host on a jittered schedule, records every
//! result in SQLite, and flags batches where several mail ports are blocked.

pub mod analyzer;
pub mod config;
pub mod db;
pub mod probe;
pub mod scanner;
pub mod scheduler;
