//! Database module for netpulse.
//!
//! Provides SQLite storage with embedded migrations: the host registry and
//! the probe result time series.

mod hosts;
mod models;
mod results;
mod store;

pub use models::*;
pub use store::*;

#[cfg(test)]
pub(crate) use store::tests::temp_store;
