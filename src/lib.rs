//! A multiplexed transport that lets one long-lived connection to an adapter server carry
//! many independent unary-HTTP, WebSocket, and raw TCP/TLS byte streams at once, each with
//! its own credit-based flow control.
//!
//! The wire protocol, channel flow control, and transport lifecycle live in [`wire`],
//! [`channel`], and [`transport`]; [`server`] and [`client`] build the two sides of a
//! connection on top of them; [`adapter`] holds the three request shapes multiplexed over a
//! channel.

pub mod adapter;
pub mod backend;
pub mod bridge;
pub mod buffer;
pub mod channel;
pub mod client;
pub mod compat;
pub mod error;
pub mod metadata;
pub mod pipe;
pub mod server;
pub mod tls;
pub mod transport;
pub mod wire;

pub use channel::{Channel, ChannelStream};
pub use client::{Client, ClientOptions};
pub use server::{Server, ServerOptions};
pub use transport::Transport;
