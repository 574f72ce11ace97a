//! The unary HTTP bridge (§4.8): one request, one response, proxied through a channel.
//!
//! The outbound HTTP client itself is treated as an external collaborator — this module is
//! generic over the connector `hyper_util`'s legacy client uses, so an embedder can supply a
//! plain `HttpConnector` or their own TLS-capable one without this code caring which.

use std::collections::HashMap;
use std::io;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::CONTENT_LENGTH;
use hyper::{Method, Request};
use hyper_util::client::legacy::connect::Connect;
use hyper_util::client::legacy::Client as HyperClient;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::channel::ChannelStream;
use crate::metadata::{error_reply, read_preamble, write_preamble, ResponseMetadata, UnaryRequestMetadata};

const ALLOWED_METHODS: &[&str] = &["GET", "HEAD", "POST", "PUT", "PATCH", "DELETE"];

/// Server-side handler: reads a unary request off `channel`, proxies it to `client`, and
/// writes the response back. Every failure path still produces a well-formed reply (§7) —
/// the channel only ever closes on an actual I/O error talking to the caller.
pub async fn serve_unary<C>(mut channel: ChannelStream, client: &HyperClient<C, Full<Bytes>>) -> io::Result<()>
where
    C: Connect + Clone + Send + Sync + 'static,
{
    let (req_meta, body_len): (UnaryRequestMetadata, u64) = read_preamble(&mut channel).await?;

    if !ALLOWED_METHODS.contains(&req_meta.method.to_uppercase().as_str()) {
        return reply_error(&mut channel, 400, "unsupported method").await;
    }
    let method = match Method::from_bytes(req_meta.method.as_bytes()) {
        Ok(m) => m,
        Err(_) => return reply_error(&mut channel, 400, "malformed method").await,
    };

    let mut body_buf = vec![0u8; body_len as usize];
    channel.read_exact(&mut body_buf).await?;

    let mut builder = Request::builder().method(method).uri(&req_meta.url);
    for (name, values) in &req_meta.header {
        for value in values {
            builder = builder.header(name.as_str(), value.as_str());
        }
    }
    let request = match builder.body(Full::new(Bytes::from(body_buf))) {
        Ok(r) => r,
        Err(_) => return reply_error(&mut channel, 400, "malformed request").await,
    };

    let response = match client.request(request).await {
        Ok(r) => r,
        Err(e) => return reply_error(&mut channel, 502, format!("upstream request failed: {e}")).await,
    };

    let content_length = match response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<i64>().ok())
    {
        Some(len) if (0..=i64::MAX).contains(&len) => len as u64,
        _ => return reply_error(&mut channel, 502, "missing or invalid Content-Length").await,
    };

    let status = response.status().as_u16();
    let mut header: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            header.entry(name.to_string()).or_default().push(value.to_owned());
        }
    }

    write_preamble(&mut channel, &ResponseMetadata { status, header }, content_length).await?;
    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
        .to_bytes();
    channel.write_all(&body).await
}

async fn reply_error(channel: &mut ChannelStream, status: u16, message: impl Into<String>) -> io::Result<()> {
    let (meta, body) = error_reply(status, message);
    write_preamble(channel, &meta, body.len() as u64).await?;
    channel.write_all(&body).await
}

/// Client-side helper: writes a unary request and its body, then reads back the response
/// metadata and its full body.
pub async fn unary_request(
    channel: &mut ChannelStream,
    request: &UnaryRequestMetadata,
    body: &[u8],
) -> io::Result<(ResponseMetadata, Vec<u8>)> {
    write_preamble(channel, request, body.len() as u64).await?;
    channel.write_all(body).await?;

    let (meta, body_len): (ResponseMetadata, u64) = read_preamble(channel).await?;
    let mut body_buf = vec![0u8; body_len as usize];
    channel.read_exact(&mut body_buf).await?;
    Ok((meta, body_buf))
}
