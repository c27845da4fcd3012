//! Offline-first sync queue for an inventory client.
//!
//! Product mutations are recorded in a local SQLite store and replayed in
//! order against the remote inventory REST API once it is reachable.

pub mod config;
pub mod connectivity;
pub mod db;
pub mod model;
pub mod queue;
pub mod remote;
pub mod worker;

pub use queue::SyncQueue;
