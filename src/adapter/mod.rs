//! The three adapted request shapes multiplexed on top of a channel (§4.8): a unary HTTP
//! bridge, a WebSocket bridge, and a raw TCP/TLS tunnel. Each shares the
//! [`crate::metadata`] preamble; what differs is what runs after it.

pub mod tcp;
pub mod unary;
pub mod websocket;
