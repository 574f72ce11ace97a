//! The WebSocket bridge (§4.8): the server dials the real upstream WebSocket and relays
//! frames to/from the channel in a small custom framing, since a channel is just bytes and
//! has no message boundaries of its own.
//!
//! Dialing the upstream mirrors the teacher's own `connect()` in spirit: a plain HTTP/1
//! upgrade request built with `hyper`, completed with `fastwebsockets::handshake::client`.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use fastwebsockets::{Frame, OpCode, Payload, WebSocketRead, WebSocketWrite};
use futures_util::lock::Mutex as AsyncMutex;
use http_body_util::Empty;
use hyper::header::{CONNECTION, HOST, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION, UPGRADE};
use hyper::upgrade::Upgraded;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::backend::BoxedDuplex;
use crate::channel::ChannelStream;
use crate::metadata::WebsocketRequestMetadata;

pub const TYPE_CONTINUATION: u8 = 0;
pub const TYPE_TEXT: u8 = 1;
pub const TYPE_BINARY: u8 = 2;
pub const TYPE_CLOSE: u8 = 8;
pub const TYPE_PING: u8 = 9;
pub const TYPE_PONG: u8 = 10;

type WsRead = WebSocketRead<ReadHalf<TokioIo<Upgraded>>>;
type WsWrite = WebSocketWrite<WriteHalf<TokioIo<Upgraded>>>;

/// Writes one `[type][end][2-byte length][payload]` relay frame.
pub async fn write_relay_frame<W: AsyncWrite + Unpin>(w: &mut W, msg_type: u8, end: bool, payload: &[u8]) -> io::Result<()> {
    if payload.len() > u16::MAX as usize {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "relay frame too large"));
    }
    let mut head = [0u8; 4];
    head[0] = msg_type;
    head[1] = end as u8;
    head[2..4].copy_from_slice(&(payload.len() as u16).to_be_bytes());
    w.write_all(&head).await?;
    w.write_all(payload).await
}

pub async fn read_relay_frame<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<(u8, bool, Vec<u8>)> {
    let mut head = [0u8; 4];
    r.read_exact(&mut head).await?;
    let len = u16::from_be_bytes([head[2], head[3]]) as usize;
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    Ok((head[0], head[1] != 0, payload))
}

fn opcode_to_type(op: OpCode) -> u8 {
    match op {
        OpCode::Continuation => TYPE_CONTINUATION,
        OpCode::Text => TYPE_TEXT,
        OpCode::Binary => TYPE_BINARY,
        OpCode::Close => TYPE_CLOSE,
        OpCode::Ping => TYPE_PING,
        OpCode::Pong => TYPE_PONG,
    }
}

fn type_to_opcode(t: u8) -> io::Result<OpCode> {
    match t {
        TYPE_CONTINUATION => Ok(OpCode::Continuation),
        TYPE_TEXT => Ok(OpCode::Text),
        TYPE_BINARY => Ok(OpCode::Binary),
        TYPE_CLOSE => Ok(OpCode::Close),
        TYPE_PING => Ok(OpCode::Ping),
        TYPE_PONG => Ok(OpCode::Pong),
        other => Err(io::Error::new(io::ErrorKind::InvalidData, format!("unknown relay message type {other}"))),
    }
}

async fn dial_raw(scheme: &str, host: &str, port: u16) -> io::Result<BoxedDuplex> {
    match scheme {
        "ws" | "http" => Ok(Box::new(tokio::net::TcpStream::connect((host, port)).await?)),
        "wss" | "https" => Ok(Box::new(crate::tls::connect(host, port).await?)),
        other => Err(io::Error::new(io::ErrorKind::InvalidInput, format!("unsupported websocket scheme {other}"))),
    }
}

/// Dials the upstream named by `meta.url` and completes the WebSocket upgrade.
pub async fn dial_upstream(meta: &WebsocketRequestMetadata) -> anyhow::Result<(WsRead, WsWrite)> {
    let parsed = url::Url::parse(&meta.url)?;
    let host = parsed.host_str().ok_or_else(|| anyhow::anyhow!("websocket url has no host"))?;
    let port = parsed
        .port_or_known_default()
        .ok_or_else(|| anyhow::anyhow!("websocket url has no resolvable port"))?;
    let stream = dial_raw(parsed.scheme(), host, port).await?;

    let mut builder = Request::builder()
        .method("GET")
        .uri(parsed.path())
        .header(HOST, host)
        .header(UPGRADE, "websocket")
        .header(CONNECTION, "upgrade")
        .header(SEC_WEBSOCKET_KEY, fastwebsockets::handshake::generate_key())
        .header(SEC_WEBSOCKET_VERSION, "13");
    for (name, values) in &meta.header {
        for value in values {
            builder = builder.header(name.as_str(), value.as_str());
        }
    }
    let request = builder.body(Empty::<Bytes>::new())?;

    let (ws, _response) = fastwebsockets::handshake::client(&TokioExecutor::new(), request, stream)
        .await
        .map_err(|e| anyhow::anyhow!("websocket handshake failed: {e}"))?;
    Ok(ws.split(tokio::io::split))
}

/// Server-side handler: reads a WebSocket bridge request off `channel`, dials the upstream,
/// replies with status 101 on success, then bridges both directions until either side closes.
pub async fn serve_websocket(mut channel: ChannelStream) -> io::Result<()> {
    let (req_meta, body_len): (WebsocketRequestMetadata, u64) = crate::metadata::read_preamble(&mut channel).await?;
    if body_len != 0 {
        return reply_error(&mut channel, 400, "websocket bridge request must carry no body").await;
    }

    let (ws_read, ws_write) = match dial_upstream(&req_meta).await {
        Ok(pair) => pair,
        Err(e) => return reply_error(&mut channel, 502, format!("websocket dial failed: {e}")).await,
    };

    crate::metadata::write_preamble(
        &mut channel,
        &crate::metadata::ResponseMetadata { status: 101, header: Default::default() },
        0,
    )
    .await?;
    bridge_websocket(channel, ws_read, ws_write).await
}

async fn reply_error(channel: &mut ChannelStream, status: u16, message: impl Into<String>) -> io::Result<()> {
    let (meta, body) = crate::metadata::error_reply(status, message);
    crate::metadata::write_preamble(channel, &meta, body.len() as u64).await?;
    channel.write_all(&body).await
}

/// Bridges an already-live channel (metadata already consumed, status already replied by the
/// caller) to an upstream WebSocket until either side closes.
pub async fn bridge_websocket(channel: ChannelStream, mut ws_read: WsRead, ws_write: WsWrite) -> io::Result<()> {
    let ws_write = Arc::new(AsyncMutex::new(ws_write));
    let (mut chan_read, mut chan_write) = split(channel);

    let upstream_to_channel = {
        let ws_write = ws_write.clone();
        async move {
            loop {
                let frame = ws_read
                    .read_frame(&mut |f| {
                        let ws_write = ws_write.clone();
                        async move { ws_write.lock().await.write_frame(f).await }
                    })
                    .await
                    .map_err(|e| io::Error::new(io::ErrorKind::ConnectionAborted, e))?;
                let is_close = frame.opcode == OpCode::Close;
                write_relay_frame(&mut chan_write, opcode_to_type(frame.opcode), true, frame.payload.as_ref()).await?;
                if is_close {
                    break;
                }
            }
            Ok::<(), io::Error>(())
        }
    };

    let channel_to_upstream = async move {
        loop {
            let (msg_type, end, payload) = match read_relay_frame(&mut chan_read).await {
                Ok(v) => v,
                Err(_) => break,
            };
            let opcode = type_to_opcode(msg_type)?;
            let is_close = opcode == OpCode::Close;
            ws_write
                .lock()
                .await
                .write_frame(Frame::new(end, opcode, None, Payload::Owned(payload)))
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::ConnectionAborted, e))?;
            if is_close {
                break;
            }
        }
        Ok::<(), io::Error>(())
    };

    let (up, down) = tokio::join!(upstream_to_channel, channel_to_upstream);
    up?;
    down?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn relay_frame_round_trips() {
        let mut buf = Vec::new();
        write_relay_frame(&mut buf, TYPE_BINARY, true, b"payload").await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let (msg_type, end, payload) = read_relay_frame(&mut cursor).await.unwrap();
        assert_eq!(msg_type, TYPE_BINARY);
        assert!(end);
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn unknown_relay_type_is_rejected() {
        assert!(type_to_opcode(200).is_err());
    }

    #[allow(dead_code)]
    fn metadata_header_type_is_used(_: &HashMap<String, Vec<String>>) {}
}
