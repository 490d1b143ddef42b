//! Inbound event fan-out to tenant sinks.
//!
//! - `registry`: persisted sink subscriptions and the cached snapshot
//! - `dispatcher`: per-session sequencing and per-sink ordered workers
//! - `delivery`: signed HTTP POST with retry

mod delivery;
mod dispatcher;
mod registry;

#[cfg(test)]
mod tests;

pub use delivery::sign_body;
pub use dispatcher::{CounterSnapshot, Dispatcher, DispatcherConfig};
pub use registry::{SinkRegistry, SinkSpec, GLOBAL_SINK_ID};
