/// Contains `WebSocket` type aliases, a bounded-handshake `connect`, and helpers for
/// classifying disconnections.
pub mod websocket;

/// Request signing primitives for venues that authenticate REST calls.
pub mod http;
