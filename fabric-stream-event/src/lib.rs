//! WebSocket event taxonomy: type + payload + envelope.
//!
//! This crate defines the wire shape of a single hub event and envelope injection.
//! It does not depend on fabric-core. fabric-core's agent runtime and listener
//! supervisor build `ProtocolEvent`s; fabric-serve's hub calls `to_json` before
//! writing a frame to a socket.

pub mod envelope;
pub mod event;

pub use envelope::{to_json, Envelope, EnvelopeState};
pub use event::ProtocolEvent;
