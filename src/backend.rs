//! Foreign-protocol fallback dialer and the per-channel handler extension point (§4.6, §10.5).
//!
//! Both are narrow, fire-once capabilities handed to [`crate::server::Server`] through its
//! options rather than baked-in behavior, mirroring the original's `Backend`/`Handler`
//! interfaces: the core only needs to invoke them, never to know what's on the other side.

use std::future::Future;
use std::io;
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Any duplex byte stream the core can hand off to a backend or adapter without caring what
/// it actually is.
pub trait AsyncDuplex: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncDuplex for T {}

pub type BoxedDuplex = Box<dyn AsyncDuplex>;
pub type BackendFuture = Pin<Box<dyn Future<Output = io::Result<BoxedDuplex>> + Send>>;

/// Dials a byte stream to bridge a foreign-protocol connection to, used when the server
/// accepts a connection that isn't speaking the adapter's hello and no HTTP handler is
/// registered (§4.6).
pub trait Backend: Send + Sync {
    fn dial(&self) -> BackendFuture;
}

/// Bridges to a fixed `host:port` over plain TCP, mirroring the original's `NewTCPBackend`.
pub struct TcpBackend {
    addr: String,
}

impl TcpBackend {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

impl Backend for TcpBackend {
    fn dial(&self) -> BackendFuture {
        let addr = self.addr.clone();
        Box::pin(async move {
            let stream = TcpStream::connect(addr).await?;
            Ok(Box::new(stream) as BoxedDuplex)
        })
    }
}

/// Invoked once per newly live server-side channel (§10.5). The crate's own unary/websocket/
/// tunnel adapters are each just one implementation of this trait.
pub trait ChannelHandler: Send + Sync {
    fn handle(&self, stream: crate::channel::ChannelStream) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

impl<F, Fut> ChannelHandler for F
where
    F: Fn(crate::channel::ChannelStream) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn handle(&self, stream: crate::channel::ChannelStream) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(self(stream))
    }
}
