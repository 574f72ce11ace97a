//! Bidirectional byte copy between two duplex streams, used by the foreign-protocol backend
//! fallback (§4.6) and the raw TCP/TLS tunnel adapter (§4.8).

use std::io;
use std::time::Duration;

use tokio::io::{copy, split, AsyncRead, AsyncWrite, AsyncWriteExt};

/// Grace period given to the still-open side after its peer reaches EOF, so a trailing write
/// already in flight isn't severed by an immediate shutdown.
const LINGER: Duration = Duration::from_secs(5);

/// Bridges `a` and `b` until either direction finishes — a non-cooperating peer that never
/// half-closes after the other side does must not hang this task forever.
pub async fn bridge<A, B>(a: A, b: B) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ar, mut aw) = split(a);
    let (mut br, mut bw) = split(b);

    let result = tokio::select! {
        result = copy(&mut ar, &mut bw) => result,
        result = copy(&mut br, &mut aw) => result,
    };

    let _ = tokio::time::timeout(LINGER, aw.shutdown()).await;
    let _ = tokio::time::timeout(LINGER, bw.shutdown()).await;
    result?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn bridges_both_directions() {
        let (mut client_a, server_a) = duplex(64);
        let (mut client_b, server_b) = duplex(64);

        let bridge_handle = tokio::spawn(bridge(server_a, server_b));

        client_a.write_all(b"to-b").await.unwrap();
        let mut buf = [0u8; 4];
        client_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"to-b");

        client_b.write_all(b"to-a").await.unwrap();
        client_a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"to-a");

        drop(client_a);
        drop(client_b);
        bridge_handle.await.unwrap().unwrap();
    }
}
