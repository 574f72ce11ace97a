//! Command frames exchanged once a transport's hello has completed (§4.2).
//!
//! Every frame starts with a single command byte. `Write` and `Confirm` carry a channel id
//! and are always 11 bytes; `Close` carries just the id; `Ping`/`Pong` carry a 4-byte opaque
//! cookie. `Create` is the odd one out: a client sends a bare id to open a channel, and a
//! server answers on the same command byte with the id plus a 1-byte result code — so parsing
//! it needs to know which side of the transport is doing the reading.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::Role;

/// The largest payload a single `Write` frame may carry.
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Ping = 1,
    Pong = 2,
    Create = 3,
    Close = 4,
    Write = 5,
    Confirm = 6,
}

impl Command {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Ping),
            2 => Some(Self::Pong),
            3 => Some(Self::Create),
            4 => Some(Self::Close),
            5 => Some(Self::Write),
            6 => Some(Self::Confirm),
            _ => None,
        }
    }
}

/// Create result codes (§4.2): 0 accepted, 1 id already exists, 2 too many channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateCode {
    Accepted = 0,
    IdExists = 1,
    TooManyChannels = 2,
}

impl CreateCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Accepted),
            1 => Some(Self::IdExists),
            2 => Some(Self::TooManyChannels),
            _ => None,
        }
    }
}

/// A parsed frame. `Write`'s `len` is the payload length still to be read from the stream;
/// `Confirm`'s `credit` is the number of bytes the sender may now add to its in-flight budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    Ping { cookie: [u8; 4] },
    Pong { cookie: [u8; 4] },
    /// Client → server: open a new channel under `id`.
    Create { id: u64 },
    /// Server → client: the outcome of a `Create { id }` request.
    CreateAck { id: u64, code: CreateCode },
    Close { id: u64 },
    Write { id: u64, len: u16 },
    Confirm { id: u64, credit: u16 },
}

impl Frame {
    fn command(&self) -> Command {
        match self {
            Frame::Ping { .. } => Command::Ping,
            Frame::Pong { .. } => Command::Pong,
            Frame::Create { .. } | Frame::CreateAck { .. } => Command::Create,
            Frame::Close { .. } => Command::Close,
            Frame::Write { .. } => Command::Write,
            Frame::Confirm { .. } => Command::Confirm,
        }
    }

    /// Encodes the frame header. For `Write`, this is everything but the payload bytes.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Frame::Ping { cookie } | Frame::Pong { cookie } => {
                let mut buf = Vec::with_capacity(5);
                buf.push(self.command() as u8);
                buf.extend_from_slice(cookie);
                buf
            }
            Frame::Create { id } | Frame::Close { id } => {
                let mut buf = Vec::with_capacity(9);
                buf.push(self.command() as u8);
                buf.extend_from_slice(&id.to_be_bytes());
                buf
            }
            Frame::CreateAck { id, code } => {
                let mut buf = Vec::with_capacity(10);
                buf.push(Command::Create as u8);
                buf.extend_from_slice(&id.to_be_bytes());
                buf.push(*code as u8);
                buf
            }
            Frame::Write { id, len } => {
                let mut buf = Vec::with_capacity(11);
                buf.push(Command::Write as u8);
                buf.extend_from_slice(&id.to_be_bytes());
                buf.extend_from_slice(&len.to_be_bytes());
                buf
            }
            Frame::Confirm { id, credit } => {
                let mut buf = Vec::with_capacity(11);
                buf.push(Command::Confirm as u8);
                buf.extend_from_slice(&id.to_be_bytes());
                buf.extend_from_slice(&credit.to_be_bytes());
                buf
            }
        }
    }

    pub async fn write<W: AsyncWrite + Unpin>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.encode()).await
    }

    /// Reads and parses the next frame. `role` disambiguates `Create`'s wire shape. Returns
    /// `Ok(None)` on a clean EOF before any byte of a new frame has been read.
    pub async fn read<R: AsyncRead + Unpin>(r: &mut R, role: Role) -> io::Result<Option<Frame>> {
        let mut cmd_byte = [0u8; 1];
        if r.read(&mut cmd_byte).await? == 0 {
            return Ok(None);
        }
        let command = Command::from_u8(cmd_byte[0])
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, format!("unknown command byte {}", cmd_byte[0])))?;

        let frame = match command {
            Command::Ping => Frame::Ping { cookie: read_cookie(r).await? },
            Command::Pong => Frame::Pong { cookie: read_cookie(r).await? },
            Command::Create => {
                let id = read_id(r).await?;
                match role {
                    Role::Server => Frame::Create { id },
                    Role::Client => {
                        let mut code_buf = [0u8; 1];
                        r.read_exact(&mut code_buf).await?;
                        let code = CreateCode::from_u8(code_buf[0]).ok_or_else(|| {
                            io::Error::new(io::ErrorKind::InvalidData, format!("unknown create code {}", code_buf[0]))
                        })?;
                        Frame::CreateAck { id, code }
                    }
                }
            }
            Command::Close => Frame::Close { id: read_id(r).await? },
            Command::Write => {
                let id = read_id(r).await?;
                let mut len_buf = [0u8; 2];
                r.read_exact(&mut len_buf).await?;
                Frame::Write { id, len: u16::from_be_bytes(len_buf) }
            }
            Command::Confirm => {
                let id = read_id(r).await?;
                let mut credit_buf = [0u8; 2];
                r.read_exact(&mut credit_buf).await?;
                Frame::Confirm { id, credit: u16::from_be_bytes(credit_buf) }
            }
        };
        Ok(Some(frame))
    }
}

async fn read_id<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).await?;
    Ok(u64::from_be_bytes(buf))
}

async fn read_cookie<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<[u8; 4]> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: Frame, role: Role) -> Frame {
        let encoded = frame.encode();
        futures_executor::block_on(async {
            let mut cursor = std::io::Cursor::new(encoded);
            Frame::read(&mut cursor, role).await.unwrap().unwrap()
        })
    }

    #[test]
    fn ping_pong_carry_a_four_byte_cookie() {
        let ping = Frame::Ping { cookie: [1, 2, 3, 4] };
        assert_eq!(ping.encode().len(), 5);
        assert_eq!(round_trip(ping, Role::Server), ping);

        let pong = Frame::Pong { cookie: [1, 2, 3, 4] };
        assert_eq!(round_trip(pong, Role::Server), pong);
    }

    #[test]
    fn close_round_trips() {
        assert_eq!(round_trip(Frame::Close { id: 42 }, Role::Server), Frame::Close { id: 42 });
    }

    #[test]
    fn create_is_role_dependent() {
        let request = Frame::Create { id: 7 };
        assert_eq!(round_trip(request, Role::Server), request);

        let ack = Frame::CreateAck { id: 7, code: CreateCode::Accepted };
        assert_eq!(round_trip(ack, Role::Client), ack);
    }

    #[test]
    fn write_header_is_eleven_bytes() {
        let frame = Frame::Write { id: 7, len: 1024 };
        assert_eq!(frame.encode().len(), 11);
        assert_eq!(round_trip(frame, Role::Server), frame);
    }

    #[test]
    fn confirm_header_is_eleven_bytes() {
        let frame = Frame::Confirm { id: 7, credit: 4096 };
        assert_eq!(frame.encode().len(), 11);
        assert_eq!(round_trip(frame, Role::Server), frame);
    }

    #[test]
    fn unknown_command_byte_is_rejected() {
        let result = futures_executor::block_on(async {
            let mut cursor = std::io::Cursor::new(vec![0xffu8]);
            Frame::read(&mut cursor, Role::Server).await
        });
        assert!(result.is_err());
    }

    #[test]
    fn clean_eof_before_frame_is_none() {
        let result = futures_executor::block_on(async {
            let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
            Frame::read(&mut cursor, Role::Server).await.unwrap()
        });
        assert!(result.is_none());
    }
}
