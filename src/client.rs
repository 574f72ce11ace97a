//! The client transport pool (§4.7): one "hot" transport per target, reopened on demand,
//! with channel creation serialized through a single pool task so no two dials can race on
//! deciding whether the current transport is still healthy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{split, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use crate::channel::{Channel, ChannelStream};
use crate::error::{self, CreateError};
use crate::transport::{ping, writer, Transport};
use crate::wire::frame::CreateCode;
use crate::wire::hello::{ClientHello, HelloCode};
use crate::wire::{Role, PROTOCOL_VERSION};

pub struct ClientOptions {
    pub window: u32,
    pub read_buffer: usize,
    pub write_buffer: usize,
    pub ping: Duration,
    pub max_missed_pings: u32,
    pub hello_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            window: 32 * 1024,
            read_buffer: 4096,
            write_buffer: 4096,
            ping: Duration::from_secs(30),
            max_missed_pings: 3,
            hello_timeout: Duration::from_secs(10),
        }
    }
}

/// One target's hot transport plus the usage counter that forces a fresh one before the
/// client-side id space wraps.
struct Hot {
    transport: Arc<Transport>,
    uses: u64,
}

/// Dials `target` and completes the adapter handshake, returning a transport whose reader
/// loop is already running in a background task.
async fn dial_transport(target: &str, options: &ClientOptions) -> std::io::Result<Arc<Transport>> {
    let mut stream = TcpStream::connect(target).await?;
    stream.set_nodelay(true).ok();

    let hello = ClientHello {
        window: options.window,
        versions: vec![PROTOCOL_VERSION.to_owned()],
    };
    tokio::time::timeout(options.hello_timeout, hello.write(&mut stream))
        .await
        .map_err(|_| error::deadline_exceeded())??;

    let server_hello = tokio::time::timeout(options.hello_timeout, crate::wire::hello::ServerHello::read(&mut stream))
        .await
        .map_err(|_| error::deadline_exceeded())??;
    if server_hello.code != HelloCode::Ok {
        return Err(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, server_hello.message));
    }

    let (read_half, write_half) = split(stream);
    let reader = BufReader::with_capacity(options.read_buffer, read_half);
    let writer = BufWriter::with_capacity(options.write_buffer, write_half);

    let (outbound_tx, outbound_rx) = mpsc::channel(50);
    let transport = Transport::new(Role::Client, options.window, server_hello.window, 0, outbound_tx);

    tokio::spawn(writer::run_writer(writer, outbound_rx));
    if options.ping >= Duration::from_secs(1) {
        tokio::spawn(ping::run_ping_loop(transport.clone(), options.ping, options.max_missed_pings));
    }

    let reader_transport = transport.clone();
    tokio::spawn(async move {
        // A client transport never receives a Create request, only CreateAcks and the usual
        // liveness/flow-control frames, so `on_create` here is unreachable in practice.
        let _ = reader_transport.clone().run_reader(reader, |_, _| {}).await;
        reader_transport.close().await;
    });

    tracing::debug!(window = server_hello.window, "transport established");
    Ok(transport)
}

enum PoolRequest {
    Get { target: String, reply: oneshot::Sender<std::io::Result<Arc<Transport>>> },
}

/// Serializes "give me the hot transport for this target" so two concurrent dials never both
/// decide the old one is dead and open two replacements.
async fn run_pool(options: Arc<ClientOptions>, mut rx: mpsc::Receiver<PoolRequest>) {
    let mut hot: HashMap<String, Hot> = HashMap::new();
    while let Some(PoolRequest::Get { target, reply }) = rx.recv().await {
        let needs_fresh = match hot.get(&target) {
            Some(entry) => entry.transport.is_closed() || entry.uses == u64::MAX,
            None => true,
        };
        if needs_fresh {
            match dial_transport(&target, &options).await {
                Ok(transport) => {
                    hot.insert(target.clone(), Hot { transport: transport.clone(), uses: 1 });
                    let _ = reply.send(Ok(transport));
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            }
            continue;
        }
        let entry = hot.get_mut(&target).unwrap();
        entry.uses += 1;
        let _ = reply.send(Ok(entry.transport.clone()));
    }
}

/// Dials (or reuses) a transport to `target`, opens a channel on it, and returns the live
/// channel as a plain byte stream.
pub struct Client {
    requests: mpsc::Sender<PoolRequest>,
}

impl Client {
    pub fn new(options: ClientOptions) -> Self {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(run_pool(Arc::new(options), rx));
        Self { requests: tx }
    }

    async fn transport_for(&self, target: &str) -> std::io::Result<Arc<Transport>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests
            .send(PoolRequest::Get { target: target.to_owned(), reply: reply_tx })
            .await
            .map_err(|_| error::client_closed())?;
        reply_rx.await.map_err(|_| error::client_closed())?
    }

    /// Opens a new channel to `target`, waiting for the peer's create-ack.
    pub async fn dial(&self, target: &str) -> std::io::Result<ChannelStream> {
        let transport = self.transport_for(target).await?;
        let id = transport.alloc_id();
        let ack = transport.begin_create(id);
        if let Err(e) = transport.send_create(id).await {
            transport.cancel_create(id);
            return Err(e);
        }

        let code = match ack.await {
            Ok(code) => code,
            Err(_) => return Err(error::transport_closed()),
        };
        match code {
            CreateCode::Accepted => {}
            CreateCode::IdExists => return Err(CreateError::IdExists(id).into()),
            CreateCode::TooManyChannels => return Err(CreateError::TooManyChannels.into()),
        }

        let channel = Channel::new(id, transport.window(), transport.peer_window(), transport.outbound_sender());
        transport.register(channel.clone()).map_err(std::io::Error::from)?;
        Ok(ChannelStream::new(channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_match_documented_values() {
        let options = ClientOptions::default();
        assert_eq!(options.window, 32 * 1024);
        assert_eq!(options.read_buffer, 4096);
    }
}
