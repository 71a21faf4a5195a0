#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cognitive_complexity,
    unused_crate_dependencies,
    unused_extern_crates,
    clippy::unused_self,
    clippy::useless_let_if_seq,
    missing_debug_implementations,
    rust_2018_idioms
)]
#![allow(clippy::type_complexity)]

//! # Depthbridge-Integration
//! Low-level socket plumbing shared by the depthbridge venue integrations.
//!
//! Provides the glue the venue clients are built from:
//! - **WebSocket** connectivity with a bounded handshake, plus convenient type aliases
//!   for the tungstenite stream halves.
//! - **Reconnect backoff** policy & state used by the persistent stream clients.
//! - **Request signing** primitives for venues that authenticate REST calls.

use crate::error::SocketError;

/// All [`Error`](std::error::Error)s generated in Depthbridge-Integration.
pub mod error;

/// Contains [`WebSocket`](protocol::websocket::WebSocket) connectivity and request signing
/// utilities.
pub mod protocol;

/// Exponential backoff policy & state for re-dialling lost connections.
pub mod backoff;

/// [`Validator`]s are capable of determining if their internal state is satisfactory to fulfill
/// some use case defined by the implementor.
///
/// Typically implemented by decoded venue control frames so the client can judge whether a
/// subscription request was accepted.
pub trait Validator {
    /// Check if `Self` is valid for some use case.
    fn validate(self) -> Result<Self, SocketError>
    where
        Self: Sized;
}
