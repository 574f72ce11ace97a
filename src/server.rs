//! The server accept path (§4.6): per-connection hello handling, protocol-vs-foreign demux,
//! and the transport that runs once a hello has succeeded.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{split, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use crate::backend::{Backend, ChannelHandler};
use crate::channel::{Channel, ChannelStream};
use crate::compat::PrefixedStream;
use crate::error::CreateError;
use crate::transport::{ping, writer, Transport};
use crate::wire::frame::CreateCode;
use crate::wire::hello::{ClientHelloOutcome, HelloCode, ServerHello};
use crate::wire::{Role, PROTOCOL_VERSION};

const SUPPORTED_VERSIONS: &[&str] = &[PROTOCOL_VERSION];
const MIN_ACCEPT_BACKOFF: Duration = Duration::from_millis(5);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Invoked for a connection whose first bytes didn't match the adapter's magic (§4.6). Gets
/// the bytes already read replayed in front of the stream.
pub trait ForeignHandler: Send + Sync {
    fn handle(&self, stream: PrefixedStream<TcpStream>) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;
}

impl<F, Fut> ForeignHandler for F
where
    F: Fn(PrefixedStream<TcpStream>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    fn handle(&self, stream: PrefixedStream<TcpStream>) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(self(stream))
    }
}

pub struct ServerOptions {
    /// Local channel ring-buffer size, advertised in the server hello.
    pub window: u32,
    /// Max duration from accept to a successful hello.
    pub timeout: Duration,
    pub read_buffer: usize,
    pub write_buffer: usize,
    /// Per-transport channel-count ceiling; 0 = unlimited.
    pub channels: usize,
    /// Idle interval before emitting a Ping; below 1s disables the scheduler.
    pub ping: Duration,
    pub max_missed_pings: u32,
    pub http: Option<Arc<dyn ForeignHandler>>,
    pub backend: Option<Arc<dyn Backend>>,
    pub channel_handler: Option<Arc<dyn ChannelHandler>>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            window: 32 * 1024,
            timeout: Duration::from_secs(10),
            read_buffer: 4096,
            write_buffer: 4096,
            channels: 0,
            ping: Duration::from_secs(30),
            max_missed_pings: 3,
            http: None,
            backend: None,
            channel_handler: None,
        }
    }
}

pub struct Server {
    options: Arc<ServerOptions>,
}

impl Server {
    pub fn new(options: ServerOptions) -> Self {
        Self { options: Arc::new(options) }
    }

    pub async fn listen_and_serve(&self, addr: impl ToSocketAddrs) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Runs the accept loop until `listener` itself fails fatally. Transient per-accept errors
    /// back off exponentially from 5 ms to 1 s rather than busy-looping (§4.6).
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        let mut backoff = MIN_ACCEPT_BACKOFF;
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    backoff = MIN_ACCEPT_BACKOFF;
                    let options = self.options.clone();
                    tokio::spawn(async move {
                        if let Err(err) = serve_conn(stream, options).await {
                            tracing::debug!(%peer, %err, "connection ended");
                        }
                    });
                }
                Err(err) => {
                    tracing::warn!(%err, backoff_ms = backoff.as_millis() as u64, "transient accept error");
                    tokio::time::sleep(backoff).await;
                    backoff = std::cmp::min(backoff * 2, MAX_ACCEPT_BACKOFF);
                }
            }
        }
    }
}

async fn serve_conn(mut stream: TcpStream, options: Arc<ServerOptions>) -> std::io::Result<()> {
    stream.set_nodelay(true).ok();
    let outcome = tokio::time::timeout(options.timeout, crate::wire::hello::ClientHello::read(&mut stream))
        .await
        .map_err(|_| crate::error::deadline_exceeded())??;

    match outcome {
        ClientHelloOutcome::ForeignProtocol(prefix) => handle_foreign(stream, prefix, &options).await,
        ClientHelloOutcome::Rejected(code) => reject(stream, code).await,
        ClientHelloOutcome::Hello(hello) => {
            let version = match crate::wire::hello::negotiate_version(&hello.versions, SUPPORTED_VERSIONS) {
                Some(v) => v,
                None => return reject(stream, HelloCode::InvalidVersion).await,
            };
            ServerHello::ok(options.window, version).write(&mut stream).await?;
            run_transport(stream, hello.window, &options).await
        }
    }
}

async fn reject(mut stream: TcpStream, code: HelloCode) -> std::io::Result<()> {
    ServerHello::rejection(code, 0).write(&mut stream).await?;
    stream.shutdown().await
}

async fn handle_foreign(stream: TcpStream, prefix: Vec<u8>, options: &ServerOptions) -> std::io::Result<()> {
    if let Some(handler) = &options.http {
        handler.handle(PrefixedStream::new(prefix, stream)).await;
        return Ok(());
    }
    if let Some(backend) = &options.backend {
        let upstream = backend.dial().await?;
        let wrapped = PrefixedStream::new(prefix, stream);
        return crate::bridge::bridge(wrapped, upstream).await;
    }
    let mut stream = stream;
    ServerHello::rejection(HelloCode::InvalidProtocol, 0).write(&mut stream).await?;
    tokio::time::timeout(Duration::from_millis(200), stream.shutdown()).await.ok();
    Ok(())
}

async fn run_transport(stream: TcpStream, peer_window: u32, options: &ServerOptions) -> std::io::Result<()> {
    let (read_half, write_half) = split(stream);
    let reader = BufReader::with_capacity(options.read_buffer, read_half);
    let writer = BufWriter::with_capacity(options.write_buffer, write_half);

    let (outbound_tx, outbound_rx) = tokio::sync::mpsc::channel(50);
    let transport = Transport::new(Role::Server, options.window, peer_window, options.channels, outbound_tx);

    let writer_handle = tokio::spawn(writer::run_writer(writer, outbound_rx));
    let ping_handle = (options.ping >= Duration::from_secs(1)).then(|| {
        tokio::spawn(ping::run_ping_loop(transport.clone(), options.ping, options.max_missed_pings))
    });
    // Guarantees the writer/pinger tasks are reaped and the transport observes teardown even
    // if a future change makes `run_reader` below return early via `?` before reaching the
    // explicit cleanup at the end of this function.
    let _cleanup = scopeguard::guard((writer_handle.abort_handle(), ping_handle.as_ref().map(|h| h.abort_handle())), {
        let transport = transport.clone();
        move |(writer_abort, ping_abort)| {
            writer_abort.abort();
            if let Some(ping_abort) = ping_abort {
                ping_abort.abort();
            }
            tokio::spawn(async move { transport.close().await });
        }
    });

    let channel_handler = options.channel_handler.clone();
    let on_create = move |transport: Arc<Transport>, id: u64| {
        let channel_handler = channel_handler.clone();
        tokio::spawn(async move {
            if transport.at_capacity() {
                let _ = transport.send_create_ack(id, CreateCode::TooManyChannels).await;
                return;
            }
            let channel = Channel::new(id, transport.window(), transport.peer_window(), transport.outbound_sender());
            match transport.register(channel.clone()) {
                Ok(()) => {
                    let _ = transport.send_create_ack(id, CreateCode::Accepted).await;
                    tracing::debug!(channel.id = id, "channel live");
                    if let Some(handler) = channel_handler {
                        handler.handle(ChannelStream::new(channel)).await;
                    }
                }
                Err(CreateError::IdExists(_)) => {
                    let _ = transport.send_create_ack(id, CreateCode::IdExists).await;
                }
                Err(_) => {
                    let _ = transport.send_create_ack(id, CreateCode::TooManyChannels).await;
                }
            }
        });
    };

    let result = transport.clone().run_reader(reader, on_create).await;
    transport.close().await;
    result
}
