//! The single task permitted to write to a transport's socket. Every other task reaches the
//! wire only by enqueueing an [`Outbound`] item here, which is what keeps a `Write` frame's
//! header and payload from ever being split by a frame from another channel.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::channel::Outbound;

async fn write_item<W: AsyncWrite + Unpin>(writer: &mut W, item: Outbound) -> std::io::Result<()> {
    match item {
        Outbound::Frame(frame) => frame.write(writer).await,
        Outbound::FrameWithPayload(frame, payload) => {
            frame.write(writer).await?;
            writer.write_all(&payload).await
        }
    }
}

/// Writes every queued item, then flushes once per batch rather than once per item: after the
/// blocking `recv` that starts a batch, anything already queued is drained without blocking so
/// a burst of frames shares a single flush instead of one syscall each.
pub async fn run_writer<W: AsyncWrite + Unpin>(mut writer: W, mut rx: mpsc::Receiver<Outbound>) -> std::io::Result<()> {
    while let Some(item) = rx.recv().await {
        write_item(&mut writer, item).await?;
        while let Ok(item) = rx.try_recv() {
            write_item(&mut writer, item).await?;
        }
        writer.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::frame::Frame;

    #[tokio::test]
    async fn writer_drains_until_senders_drop() {
        let (tx, rx) = mpsc::channel(4);
        let mut buf = Vec::new();
        tx.send(Outbound::Frame(Frame::Ping { cookie: [0; 4] })).await.unwrap();
        tx.send(Outbound::FrameWithPayload(Frame::Write { id: 1, len: 2 }, vec![9, 9]))
            .await
            .unwrap();
        drop(tx);

        run_writer(&mut buf, rx).await.unwrap();
        assert_eq!(buf[0], Frame::Ping { cookie: [0; 4] }.encode()[0]);
        assert!(buf.ends_with(&[9, 9]));
    }
}
