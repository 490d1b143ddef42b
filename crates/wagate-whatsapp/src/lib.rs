//! # wagate-whatsapp
//!
//! WhatsApp-side helpers for the gateway: QR code rendering and an
//! in-process device emulator implementing the client traits.

pub mod emulator;
pub mod qr;

pub use emulator::{EmulatedClient, Emulator, EmulatorConfig, SentMessage};
pub use qr::{generate_qr_image, qr_data_url};
