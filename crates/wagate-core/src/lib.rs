//! # wagate-core
//!
//! Core types, traits, configuration, and error handling shared by the
//! gateway, its persistence layer, and the WhatsApp client integration.

pub mod config;
pub mod error;
pub mod event;
pub mod jid;
pub mod session;
pub mod sink;
pub mod traits;
pub mod wa;
