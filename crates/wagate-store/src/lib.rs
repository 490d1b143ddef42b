//! # wagate-store
//!
//! SQLite-backed persistence for session records, device identities, and
//! event sinks.

pub mod store;

pub use store::Store;
