//! Session lifecycle: one runtime actor per session, owned by the manager.
//!
//! - `runtime`: the per-session actor and its handle
//! - `manager`: id and name indexes, create/delete/restore
//! - `qr`: the live pairing QR shared by waiters
//! - `reconnect`: backoff policy for transport loss
//! - `ops`: group and contact operations run inside the actor

mod manager;
mod ops;
mod qr;
mod reconnect;
mod runtime;


pub use manager::{ConnectOutcome, RestoreReport, RuntimeLease, SessionInfo, SessionManager};
pub use ops::{ContactOp, ContactReply, GroupOp, GroupReply};
pub use qr::{QrBroker, QrCode};
pub use reconnect::ReconnectPolicy;
pub use runtime::{RuntimeConfig, RuntimeDeps, RuntimeHandle, RuntimeStatus, SendLatch};
