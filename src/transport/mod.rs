//! Shared engine behind both [`crate::server::Server`] and [`crate::client::Client`]: the
//! channel registry, the frame reader loop, and the two background tasks every transport
//! keeps running for as long as it's alive (§4.3).
//!
//! A transport owns exactly one outbound direction: everything that needs to write a frame —
//! the reader loop replying to a `Ping`, a `Channel` sending `Write`/`Confirm`, the ping
//! scheduler — goes through the same `mpsc::Sender<Outbound>` so writes to the socket are
//! never interleaved from two tasks at once.

pub mod ping;
pub mod writer;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, oneshot, Notify};

use crate::channel::{Channel, Outbound};
use crate::error::{self, CreateError};
use crate::wire::frame::{CreateCode, Frame};
use crate::wire::Role;
use ping::PingState;

pub struct Transport {
    role: Role,
    window: u32,
    peer_window: u32,
    channel_ceiling: usize,
    channels: Mutex<HashMap<u64, Arc<Channel>>>,
    pending_creates: Mutex<HashMap<u64, oneshot::Sender<CreateCode>>>,
    outbound_tx: mpsc::Sender<Outbound>,
    next_id: AtomicU64,
    closed: AtomicBool,
    done: Notify,
    pub(crate) ping: PingState,
}

impl Transport {
    pub fn new(role: Role, window: u32, peer_window: u32, channel_ceiling: usize, outbound_tx: mpsc::Sender<Outbound>) -> Arc<Self> {
        Arc::new(Self {
            role,
            window,
            peer_window,
            channel_ceiling,
            channels: Mutex::new(HashMap::new()),
            pending_creates: Mutex::new(HashMap::new()),
            outbound_tx,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            done: Notify::new(),
            ping: PingState::new(),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn window(&self) -> u32 {
        self.window
    }

    /// The window the peer advertised during the hello exchange, used as a freshly created
    /// channel's remote-window credit.
    pub fn peer_window(&self) -> u32 {
        self.peer_window
    }

    /// Hands out a clone of the shared outbound sender so a freshly created
    /// [`Channel`](crate::channel::Channel) can enqueue its `Write`/`Confirm` frames onto the
    /// same writer task as everything else on this transport.
    pub fn outbound_sender(&self) -> mpsc::Sender<Outbound> {
        self.outbound_tx.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn get(&self, id: u64) -> Option<Arc<Channel>> {
        self.channels.lock().get(&id).cloned()
    }

    pub fn remove(&self, id: u64) -> Option<Arc<Channel>> {
        self.channels.lock().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    /// `0` means unlimited, matching the server's `channels` option.
    pub fn at_capacity(&self) -> bool {
        self.channel_ceiling != 0 && self.len() >= self.channel_ceiling
    }

    /// Registers a freshly created channel under its id. Fails if the id is already taken —
    /// on the server side this means the peer reused an id it never closed.
    pub fn register(&self, channel: Arc<Channel>) -> Result<(), CreateError> {
        let mut channels = self.channels.lock();
        if channels.contains_key(&channel.id()) {
            return Err(CreateError::IdExists(channel.id()));
        }
        channels.insert(channel.id(), channel);
        Ok(())
    }

    /// Registers a pending client-side create so the reader loop can deliver the peer's
    /// acknowledgement to whoever is waiting on `Dial`.
    pub fn begin_create(&self, id: u64) -> oneshot::Receiver<CreateCode> {
        let (tx, rx) = oneshot::channel();
        self.pending_creates.lock().insert(id, tx);
        rx
    }

    /// Drops a pending create without waiting for its ack — used when a `Dial` is cancelled.
    pub fn cancel_create(&self, id: u64) {
        self.pending_creates.lock().remove(&id);
    }

    /// Delivers a `CreateAck` to its waiting `Dial` call. If nobody is waiting — the caller
    /// already gave up — and the peer accepted the channel anyway, send a `Close` so the
    /// server doesn't keep an orphaned channel around.
    async fn resolve_create(&self, id: u64, code: CreateCode) -> std::io::Result<()> {
        let waiter = self.pending_creates.lock().remove(&id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(code);
                Ok(())
            }
            None if code == CreateCode::Accepted => self.enqueue(Outbound::Frame(Frame::Close { id })).await,
            None => Ok(()),
        }
    }

    pub async fn enqueue(&self, item: Outbound) -> std::io::Result<()> {
        self.outbound_tx.send(item).await.map_err(|_| error::transport_closed())
    }

    pub async fn send_ping(&self) -> std::io::Result<()> {
        self.enqueue(Outbound::Frame(Frame::Ping { cookie: self.ping.next_cookie() })).await
    }

    async fn send_pong(&self, cookie: [u8; 4]) -> std::io::Result<()> {
        self.enqueue(Outbound::Frame(Frame::Pong { cookie })).await
    }

    pub async fn send_create(&self, id: u64) -> std::io::Result<()> {
        self.enqueue(Outbound::Frame(Frame::Create { id })).await
    }

    pub async fn send_create_ack(&self, id: u64, code: CreateCode) -> std::io::Result<()> {
        self.enqueue(Outbound::Frame(Frame::CreateAck { id, code })).await
    }

    /// Tears the transport down: every channel observes this as a peer-initiated close, and
    /// any task parked in [`Transport::closed`] wakes up.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let channels: Vec<_> = self.channels.lock().drain().map(|(_, c)| c).collect();
        for channel in channels {
            channel.close_local_only();
        }
        self.done.notify_waiters();
    }

    pub async fn closed(&self) {
        if self.is_closed() {
            return;
        }
        self.done.notified().await;
    }

    /// Drives the frame reader loop until the peer disconnects or a framing error occurs.
    /// `on_create` is invoked (and expected to spawn its own task) whenever a `Create` request
    /// arrives on a server-role transport; a client transport never sees one.
    pub async fn run_reader<R, F>(self: Arc<Self>, mut reader: R, on_create: F) -> std::io::Result<()>
    where
        R: AsyncRead + Unpin,
        F: Fn(Arc<Transport>, u64) + Send + Sync + 'static,
    {
        loop {
            let frame = match Frame::read(&mut reader, self.role).await {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(()),
                Err(e) => return Err(e),
            };

            match frame {
                // Reader-loop-originated acks never block on the writer's backpressure: they're
                // dispatched fire-and-forget so one slow channel can't stall frame delivery to
                // every other channel on this transport.
                Frame::Ping { cookie } => {
                    let transport = self.clone();
                    tokio::spawn(async move {
                        let _ = transport.send_pong(cookie).await;
                    });
                }
                Frame::Pong { .. } => self.ping.on_pong(),
                Frame::Create { id } => on_create(self.clone(), id),
                Frame::CreateAck { id, code } => self.resolve_create(id, code).await?,
                Frame::Close { id } => {
                    if let Some(channel) = self.remove(id) {
                        channel.close_local_only();
                    }
                }
                Frame::Write { id, len } => {
                    let mut payload = vec![0u8; len as usize];
                    reader.read_exact(&mut payload).await?;
                    match self.get(id) {
                        Some(channel) => {
                            if let Some(credit) = channel.deliver(&payload)? {
                                tokio::spawn(async move {
                                    let _ = channel.send_confirm(credit).await;
                                });
                            }
                        }
                        // The channel is already gone locally (we closed it, or never saw the
                        // matching Create); telling the peer keeps it from retrying forever.
                        None => {
                            let transport = self.clone();
                            tokio::spawn(async move {
                                let _ = transport.enqueue(Outbound::Frame(Frame::Close { id })).await;
                            });
                        }
                    }
                }
                Frame::Confirm { id, credit } => {
                    if let Some(channel) = self.get(id) {
                        if let Err(err) = channel.confirm(credit as u32) {
                            tracing::warn!(channel.id = id, %err, "closing channel after protocol violation");
                            tokio::spawn(async move {
                                let _ = channel.close().await;
                            });
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::hello::{ClientHello, ClientHelloOutcome, HelloCode, ServerHello};
    use crate::wire::PROTOCOL_VERSION;
    use tokio::io::{duplex, split, AsyncReadExt};

    /// Wires a client-role and a server-role transport together over an in-process
    /// `tokio::io::duplex` pair and drives the hello handshake, a `Create`, a `Write` in each
    /// direction, and a `Close` — nothing in this path is mocked, every frame is real.
    #[tokio::test]
    async fn two_transports_complete_a_full_round_trip() {
        let (client_io, server_io) = duplex(8192);
        let (mut client_read, mut client_write) = split(client_io);
        let (mut server_read, mut server_write) = split(server_io);

        let client_hello = ClientHello {
            window: 1024,
            versions: vec![PROTOCOL_VERSION.to_owned()],
        };
        client_hello.write(&mut client_write).await.unwrap();
        let hello = match ClientHello::read(&mut server_read).await.unwrap() {
            ClientHelloOutcome::Hello(h) => h,
            _ => panic!("expected a parsed hello"),
        };
        ServerHello::ok(2048, PROTOCOL_VERSION).write(&mut server_write).await.unwrap();
        let server_hello = ServerHello::read(&mut client_read).await.unwrap();
        assert_eq!(server_hello.code, HelloCode::Ok);

        let (client_tx, client_rx) = mpsc::channel(16);
        let client_transport = Transport::new(Role::Client, 1024, server_hello.window, 0, client_tx);
        tokio::spawn(writer::run_writer(client_write, client_rx));
        let client_reader = client_transport.clone();
        tokio::spawn(async move {
            let _ = client_reader.run_reader(client_read, |_, _| {}).await;
        });

        let (server_tx, server_rx) = mpsc::channel(16);
        let server_transport = Transport::new(Role::Server, 2048, hello.window, 0, server_tx);
        tokio::spawn(writer::run_writer(server_write, server_rx));

        let (accepted_tx, mut accepted_rx) = mpsc::channel(1);
        let server_reader = server_transport.clone();
        tokio::spawn(async move {
            let on_create = move |transport: Arc<Transport>, id: u64| {
                let accepted_tx = accepted_tx.clone();
                tokio::spawn(async move {
                    let channel = Channel::new(id, transport.window(), transport.peer_window(), transport.outbound_sender());
                    transport.register(channel.clone()).unwrap();
                    transport.send_create_ack(id, CreateCode::Accepted).await.unwrap();
                    let _ = accepted_tx.send(channel).await;
                });
            };
            let _ = server_reader.run_reader(server_read, on_create).await;
        });

        let id = client_transport.alloc_id();
        let ack = client_transport.begin_create(id);
        client_transport.send_create(id).await.unwrap();
        assert_eq!(ack.await.unwrap(), CreateCode::Accepted);

        let client_channel = Channel::new(id, client_transport.window(), client_transport.peer_window(), client_transport.outbound_sender());
        client_transport.register(client_channel.clone()).unwrap();
        let server_channel = accepted_rx.recv().await.unwrap();

        client_channel.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        let n = server_channel.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");

        server_channel.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        let n = client_channel.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong!");

        client_channel.close().await.unwrap();
        server_channel.closed().await;
        assert!(server_channel.is_closed());
    }
}
