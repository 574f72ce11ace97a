//! Client/server hello codec (§4.1).
//!
//! The preamble is read byte-by-byte off the wire rather than through a length-delimited
//! framer: until the magic is confirmed we don't even know whether we're talking to an
//! adapter peer, so nothing downstream can assume a frame boundary yet.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::MAGIC;

/// Result code carried by a [`ServerHello`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelloCode {
    Ok = 0,
    InvalidProtocol = 1,
    InvalidVersion = 2,
    Busy = 3,
    ServerError = 4,
    InvalidWindow = 5,
}

impl HelloCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Ok),
            1 => Some(Self::InvalidProtocol),
            2 => Some(Self::InvalidVersion),
            3 => Some(Self::Busy),
            4 => Some(Self::ServerError),
            5 => Some(Self::InvalidWindow),
            _ => None,
        }
    }

    /// Human-readable description used as the server-hello message on failure.
    pub fn description(self) -> &'static str {
        match self {
            HelloCode::Ok => "Ok",
            HelloCode::InvalidProtocol => "Invalid Protocol",
            HelloCode::InvalidVersion => "Invalid Version",
            HelloCode::Busy => "Server Busy",
            HelloCode::ServerError => "Server Error",
            HelloCode::InvalidWindow => "Invalid Window",
        }
    }
}

impl std::fmt::Display for HelloCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description())
    }
}

/// The client's opening message: the window it will advertise for every channel it creates,
/// and the protocol versions it is willing to speak.
#[derive(Debug, Clone)]
pub struct ClientHello {
    pub window: u32,
    pub versions: Vec<String>,
}

/// Outcome of reading the first bytes off a freshly accepted connection. `ForeignProtocol`
/// carries the bytes already consumed so the listener can replay them in front of the stream.
pub enum ClientHelloOutcome {
    Hello(ClientHello),
    Rejected(HelloCode),
    ForeignProtocol(Vec<u8>),
}

impl ClientHello {
    fn verify(&self) -> Result<(), HelloCode> {
        if self.window == 0 {
            return Err(HelloCode::InvalidWindow);
        }
        if self.versions.is_empty() {
            return Err(HelloCode::InvalidVersion);
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>, HelloCode> {
        self.verify()?;
        let joined = self.versions.join(",");
        if joined.len() > u16::MAX as usize {
            return Err(HelloCode::InvalidVersion);
        }
        let mut buf = Vec::with_capacity(MAGIC.len() + 4 + 2 + joined.len());
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&self.window.to_be_bytes());
        buf.extend_from_slice(&(joined.len() as u16).to_be_bytes());
        buf.extend_from_slice(joined.as_bytes());
        Ok(buf)
    }

    pub async fn write<W: AsyncWrite + Unpin>(&self, w: &mut W) -> io::Result<()> {
        let data = self
            .encode()
            .map_err(|code| io::Error::new(io::ErrorKind::InvalidInput, code.description()))?;
        w.write_all(&data).await
    }

    /// Reads the client hello, recovering the raw bytes if the magic doesn't match so the
    /// caller can hand the connection off to a foreign-protocol fallback.
    pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<ClientHelloOutcome> {
        let mut magic_buf = vec![0u8; MAGIC.len()];
        r.read_exact(&mut magic_buf).await?;
        if magic_buf != MAGIC {
            return Ok(ClientHelloOutcome::ForeignProtocol(magic_buf));
        }

        let mut head = [0u8; 6];
        r.read_exact(&mut head).await?;
        let window = u32::from_be_bytes(head[0..4].try_into().unwrap());
        if window < 1 {
            return Ok(ClientHelloOutcome::Rejected(HelloCode::InvalidWindow));
        }
        let version_len = u16::from_be_bytes(head[4..6].try_into().unwrap()) as usize;
        if version_len == 0 {
            return Ok(ClientHelloOutcome::Rejected(HelloCode::InvalidVersion));
        }

        let mut version_buf = vec![0u8; version_len];
        r.read_exact(&mut version_buf).await?;
        let raw = String::from_utf8(version_buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let versions: Vec<String> = raw.split(',').map(str::to_owned).collect();

        Ok(ClientHelloOutcome::Hello(ClientHello { window, versions }))
    }
}

/// The server's response: the outcome code, the server's own advertised window (meaningful
/// only when `code == Ok`), and a message (the chosen version on success, a description on
/// failure).
#[derive(Debug, Clone)]
pub struct ServerHello {
    pub code: HelloCode,
    pub window: u32,
    pub message: String,
}

impl ServerHello {
    pub fn ok(window: u32, version: impl Into<String>) -> Self {
        Self {
            code: HelloCode::Ok,
            window,
            message: version.into(),
        }
    }

    pub fn rejection(code: HelloCode, window: u32) -> Self {
        debug_assert_ne!(code, HelloCode::Ok);
        Self {
            code,
            window,
            message: code.description().to_owned(),
        }
    }

    fn verify(&self) -> io::Result<()> {
        if self.code == HelloCode::Ok && self.window == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, HelloCode::InvalidWindow.description()));
        }
        if self.code == HelloCode::Ok && self.message.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, HelloCode::InvalidVersion.description()));
        }
        if self.message.len() > u16::MAX as usize {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "message too long"));
        }
        Ok(())
    }

    pub fn encode(&self) -> io::Result<Vec<u8>> {
        self.verify()?;
        let mut buf = Vec::with_capacity(MAGIC.len() + 7 + self.message.len());
        buf.extend_from_slice(MAGIC);
        buf.push(self.code as u8);
        buf.extend_from_slice(&self.window.to_be_bytes());
        buf.extend_from_slice(&(self.message.len() as u16).to_be_bytes());
        buf.extend_from_slice(self.message.as_bytes());
        Ok(buf)
    }

    pub async fn write<W: AsyncWrite + Unpin>(&self, w: &mut W) -> io::Result<()> {
        let data = self.encode()?;
        w.write_all(&data).await
    }

    pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<ServerHello> {
        let mut magic_buf = vec![0u8; MAGIC.len()];
        r.read_exact(&mut magic_buf).await?;
        if magic_buf != MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "unknown protocol"));
        }

        let mut head = [0u8; 7];
        r.read_exact(&mut head).await?;
        let code = HelloCode::from_u8(head[0])
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown hello code"))?;
        let window = u32::from_be_bytes(head[1..5].try_into().unwrap());
        if code == HelloCode::Ok && window < 1 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, HelloCode::InvalidWindow.description()));
        }
        let msg_len = u16::from_be_bytes(head[5..7].try_into().unwrap()) as usize;

        let mut msg_buf = vec![0u8; msg_len];
        if msg_len > 0 {
            r.read_exact(&mut msg_buf).await?;
        }
        let message = String::from_utf8(msg_buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if code == HelloCode::Ok && message.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidData, HelloCode::InvalidVersion.description()));
        }

        Ok(ServerHello { code, window, message })
    }
}

/// Picks the first version in `client_versions` that also appears in `supported`, matching
/// order-of-preference on the client's side.
pub fn negotiate_version(client_versions: &[String], supported: &[&str]) -> Option<String> {
    client_versions
        .iter()
        .find(|v| supported.contains(&v.as_str()))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_hello_round_trips() {
        let hello = ClientHello {
            window: 32 * 1024,
            versions: vec!["1.0".to_owned(), "0.9".to_owned()],
        };
        let encoded = hello.encode().unwrap();
        assert!(encoded.starts_with(MAGIC));

        let decoded = futures_executor::block_on(async {
            let mut cursor = std::io::Cursor::new(encoded);
            ClientHello::read(&mut cursor).await.unwrap()
        });
        match decoded {
            ClientHelloOutcome::Hello(h) => {
                assert_eq!(h.window, hello.window);
                assert_eq!(h.versions, hello.versions);
            }
            _ => panic!("expected a parsed hello"),
        }
    }

    #[test]
    fn client_hello_rejects_zero_window() {
        let hello = ClientHello {
            window: 0,
            versions: vec!["1.0".to_owned()],
        };
        assert!(matches!(hello.encode(), Err(HelloCode::InvalidWindow)));
    }

    #[test]
    fn client_hello_rejects_empty_versions() {
        let hello = ClientHello {
            window: 1024,
            versions: vec![],
        };
        assert!(matches!(hello.encode(), Err(HelloCode::InvalidVersion)));
    }

    #[test]
    fn foreign_protocol_is_recoverable() {
        let decoded = futures_executor::block_on(async {
            let mut cursor = std::io::Cursor::new(b"GET / HTTP/1.1\r\n".to_vec());
            ClientHello::read(&mut cursor).await.unwrap()
        });
        match decoded {
            ClientHelloOutcome::ForeignProtocol(bytes) => {
                assert_eq!(bytes.len(), MAGIC.len());
                assert_eq!(&bytes, b"GET / HTTP/1");
            }
            _ => panic!("expected a foreign-protocol signal"),
        }
    }

    #[test]
    fn server_hello_round_trips() {
        let hello = ServerHello::ok(65536, "1.0");
        let encoded = hello.encode().unwrap();
        let decoded = futures_executor::block_on(async {
            let mut cursor = std::io::Cursor::new(encoded);
            ServerHello::read(&mut cursor).await.unwrap()
        });
        assert_eq!(decoded.code, HelloCode::Ok);
        assert_eq!(decoded.window, 65536);
        assert_eq!(decoded.message, "1.0");
    }

    #[test]
    fn server_hello_rejection_carries_description() {
        let hello = ServerHello::rejection(HelloCode::InvalidVersion, 1);
        assert_eq!(hello.message, "Invalid Version");
    }

    #[test]
    fn negotiate_picks_first_shared_version() {
        let client = vec!["0.9".to_owned(), "1.0".to_owned()];
        assert_eq!(negotiate_version(&client, &["1.0"]).as_deref(), Some("1.0"));
        assert_eq!(negotiate_version(&client, &["2.0"]), None);
    }
}
