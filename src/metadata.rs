//! The preamble shared by all three adapted request shapes (§4.8): a JSON metadata blob
//! followed by a declared-length body, both framed with fixed-width length prefixes so a
//! reader never has to guess where the body starts.
//!
//! `serde_json` carries the payload itself; this module only owns the length-prefix framing
//! around it, the same separation the teacher draws between header parsing and message
//! bodies.

use std::collections::HashMap;
use std::io;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Request metadata for the unary HTTP bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnaryRequestMetadata {
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub header: HashMap<String, Vec<String>>,
}

/// Response metadata for the unary HTTP bridge, and the generic shape for adapter-layer
/// error replies (§7): `status` carries an HTTP-style code even when nothing was actually
/// proxied upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub status: u16,
    #[serde(default)]
    pub header: HashMap<String, Vec<String>>,
}

/// Request metadata for the WebSocket bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebsocketRequestMetadata {
    pub url: String,
    #[serde(default)]
    pub header: HashMap<String, Vec<String>>,
}

/// Request metadata for the raw TCP/TLS tunnel; `url` carries the `tcp://` or `tls://`
/// scheme and a `host:port`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelRequestMetadata {
    pub url: String,
}

/// Reads the `[2-byte metadata length][8-byte body length][metadata][body-to-follow]`
/// preamble, returning the parsed metadata and the declared body length. The body itself is
/// left on the channel for the caller to stream.
pub async fn read_preamble<R, M>(r: &mut R) -> io::Result<(M, u64)>
where
    R: AsyncRead + Unpin,
    M: for<'de> Deserialize<'de>,
{
    let mut lens = [0u8; 10];
    r.read_exact(&mut lens).await?;
    let meta_len = u16::from_be_bytes(lens[0..2].try_into().unwrap()) as usize;
    let body_len = u64::from_be_bytes(lens[2..10].try_into().unwrap());

    let mut meta_buf = vec![0u8; meta_len];
    r.read_exact(&mut meta_buf).await?;
    let metadata = serde_json::from_slice(&meta_buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok((metadata, body_len))
}

/// Writes the preamble for `metadata`, announcing `body_len` bytes to follow. The caller
/// writes the body itself afterwards.
pub async fn write_preamble<W, M>(w: &mut W, metadata: &M, body_len: u64) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    M: Serialize,
{
    let encoded = serde_json::to_vec(metadata).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if encoded.len() > u16::MAX as usize {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "metadata too large"));
    }
    let mut out = Vec::with_capacity(10 + encoded.len());
    out.extend_from_slice(&(encoded.len() as u16).to_be_bytes());
    out.extend_from_slice(&body_len.to_be_bytes());
    out.extend_from_slice(&encoded);
    w.write_all(&out).await
}

/// Builds a well-formed error reply per §7: a [`ResponseMetadata`] carrying an HTTP-style
/// status, paired with a plain-text body.
pub fn error_reply(status: u16, message: impl Into<String>) -> (ResponseMetadata, Vec<u8>) {
    let body = message.into().into_bytes();
    let mut header = HashMap::new();
    header.insert("content-type".to_owned(), vec!["text/plain; charset=utf-8".to_owned()]);
    header.insert("content-length".to_owned(), vec![body.len().to_string()]);
    (ResponseMetadata { status, header }, body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn preamble_round_trips() {
        let metadata = UnaryRequestMetadata {
            url: "http://x/echo".to_owned(),
            method: "GET".to_owned(),
            header: HashMap::new(),
        };
        let mut buf = Vec::new();
        write_preamble(&mut buf, &metadata, 0).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let (decoded, body_len): (UnaryRequestMetadata, u64) = read_preamble(&mut cursor).await.unwrap();
        assert_eq!(decoded.url, metadata.url);
        assert_eq!(decoded.method, "GET");
        assert_eq!(body_len, 0);
    }

    #[tokio::test]
    async fn truncated_metadata_is_rejected() {
        let mut lens = Vec::new();
        lens.extend_from_slice(&100u16.to_be_bytes());
        lens.extend_from_slice(&0u64.to_be_bytes());
        let mut cursor = std::io::Cursor::new(lens);
        let result: io::Result<(UnaryRequestMetadata, u64)> = read_preamble(&mut cursor).await;
        assert!(result.is_err());
    }

    #[test]
    fn error_reply_sets_content_length() {
        let (meta, body) = error_reply(502, "upstream dial failed");
        assert_eq!(meta.status, 502);
        assert_eq!(body, b"upstream dial failed");
        assert_eq!(meta.header.get("content-length").unwrap()[0], "21");
    }
}
