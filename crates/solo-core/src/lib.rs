//! Shared types, configuration, and the SQLite-backed heartbeat store for
//! the solod background-agent coordinator.

pub mod config;
pub mod store;
pub mod types;
