//! Database module for meshwatch.
//!
//! Provides the SQLite-backed host registry, check history and uptime
//! counters, with embedded migrations.

mod checks;
mod models;
mod store;

pub use models::*;
pub use store::*;

#[cfg(test)]
pub(crate) use store::tests as test_util;
