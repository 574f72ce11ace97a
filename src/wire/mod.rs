//! The post-handshake wire format: the hello preamble (`hello`) and the command-framed
//! messages exchanged once a transport is running (`frame`).

pub mod frame;
pub mod hello;

/// Channel window sizes and frame lengths travel as plain `u32`/`u16` on the wire; this alias
/// just documents the role a given integer plays, mirroring the teacher's `WindowSize` alias.
pub type WindowSize = u32;

/// ASCII preamble every hello begins with. Reading this and finding a mismatch is a signal,
/// not an error: the peer is speaking a foreign protocol.
pub const MAGIC: &[u8] = b"httpadapter";

/// The only protocol version this implementation understands. Hello negotiation picks the
/// first entry shared between the client's comma-separated list and this server's own list.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Which side of a transport is decoding a frame. `Create` is the one command whose wire
/// shape differs by direction — a plain request one way, an acknowledgement the other — so
/// the frame reader needs to know which end it's running on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Decodes inbound `Create` frames as acknowledgements (id + result code).
    Client,
    /// Decodes inbound `Create` frames as requests (id only).
    Server,
}
