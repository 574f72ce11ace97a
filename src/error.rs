//! Typed errors surfaced to callers of [`crate::channel::Channel`], [`crate::client::Client`]
//! and [`crate::server::Server`].
//!
//! Internal protocol violations never reach a caller directly: they tear down a channel or a
//! transport, and the caller only observes the resulting `io::Error` on its next call.

use std::io;

/// Build an `io::Error` whose kind already communicates most of what the caller needs, so
/// matching on `.kind()` is enough without a bespoke public error enum.
pub fn channel_closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "channel closed")
}

pub fn transport_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "transport closed")
}

pub fn deadline_exceeded() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded")
}

pub fn client_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "client closed")
}

pub fn server_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "server closed")
}

/// The peer violated the flow-control or framing contract. Always fatal to the scope it is
/// raised in (a channel, or the whole transport for framing-level violations).
#[derive(Debug)]
pub struct ProtocolViolation(pub String);

impl std::fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "protocol violation: {}", self.0)
    }
}

impl std::error::Error for ProtocolViolation {}

impl From<ProtocolViolation> for io::Error {
    fn from(value: ProtocolViolation) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, value.0)
    }
}

pub fn protocol_violation(msg: impl Into<String>) -> io::Error {
    io::Error::from(ProtocolViolation(msg.into()))
}

/// Error surfaced from a `Create` response whose code is not `0` (accepted).
#[derive(Debug)]
pub enum CreateError {
    /// Code 1: the peer already has a channel registered under this id.
    IdExists(u64),
    /// Code 2: the peer is at its configured channel-count ceiling.
    TooManyChannels,
    /// Any other code; the wire protocol only defines 0/1/2 but peers may diverge.
    Unknown(u8),
}

impl std::fmt::Display for CreateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CreateError::IdExists(id) => write!(f, "code=1 id already exists: {id}"),
            CreateError::TooManyChannels => write!(f, "code=2 too many channels"),
            CreateError::Unknown(code) => write!(f, "unknown create error ({code})"),
        }
    }
}

impl std::error::Error for CreateError {}

impl From<CreateError> for io::Error {
    fn from(value: CreateError) -> Self {
        io::Error::new(io::ErrorKind::AlreadyExists, value.to_string())
    }
}
