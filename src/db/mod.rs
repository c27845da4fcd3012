//! Local store: SQLite tables for the sync queue and the product cache.
//!
//! - `model`: row structs decoded by `sqlx` and converted into domain types.
//! - `repo`: SQL-only functions; every multi-row change runs in one transaction.
//!
//! Callers import from `inventory_sync::db`; the repository API is re-exported.

pub mod model;
pub mod repo;

pub use repo::*;
