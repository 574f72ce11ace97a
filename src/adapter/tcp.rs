//! The raw TCP/TLS tunnel bridge (§4.8): dials the target named in the preamble and bridges
//! it byte-for-byte to the channel, no relay framing required since neither side has message
//! boundaries.

use std::io;

use tokio::io::AsyncWriteExt;

use crate::bridge::bridge;
use crate::channel::ChannelStream;
use crate::metadata::{error_reply, read_preamble, write_preamble, ResponseMetadata, TunnelRequestMetadata};

/// Server-side handler: reads a tunnel request off `channel`, dials the target, replies with
/// a 101-style status, then bridges until either side closes.
pub async fn serve_tunnel(mut channel: ChannelStream) -> io::Result<()> {
    let (req_meta, _): (TunnelRequestMetadata, u64) = read_preamble(&mut channel).await?;

    let (scheme, target) = match req_meta.url.split_once("://") {
        Some(parts) => parts,
        None => return reply_error(&mut channel, 400, "malformed tunnel url").await,
    };
    let (host, port) = match target.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host, port),
            Err(_) => return reply_error(&mut channel, 400, "malformed tunnel port").await,
        },
        None => return reply_error(&mut channel, 400, "tunnel url missing port").await,
    };

    let dialed = match scheme {
        "tcp" => tokio::net::TcpStream::connect((host, port)).await.map(|s| Box::new(s) as _),
        "tls" => crate::tls::connect(host, port).await.map(|s| Box::new(s) as _),
        other => return reply_error(&mut channel, 400, format!("unsupported tunnel scheme {other}")).await,
    };
    let upstream: crate::backend::BoxedDuplex = match dialed {
        Ok(s) => s,
        Err(e) => return reply_error(&mut channel, 502, format!("tunnel dial failed: {e}")).await,
    };

    write_preamble(&mut channel, &ResponseMetadata { status: 101, header: Default::default() }, 0).await?;
    bridge(channel, upstream).await
}

async fn reply_error(channel: &mut ChannelStream, status: u16, message: impl Into<String>) -> io::Result<()> {
    let (meta, body) = error_reply(status, message);
    write_preamble(channel, &meta, body.len() as u64).await?;
    channel.write_all(&body).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_url_shape() {
        let meta = TunnelRequestMetadata { url: "not-a-url".to_owned() };
        assert!(meta.url.split_once("://").is_none());
    }
}
