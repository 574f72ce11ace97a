//! A single multiplexed channel: one logical byte stream carried over a shared transport.
//!
//! Flow control is credit-based in both directions. `remote_window` is the peer's advertised
//! read-buffer capacity; `bytes_in_flight` tracks how much of it this side has used without
//! yet being told (via `Confirm`) that the peer has drained it. Inbound bytes accumulate in
//! `unconfirmed` until they cross a batching threshold, at which point a single `Confirm` is
//! sent rather than one per `Write` — acking every byte individually would double the frame
//! count for no benefit.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

use crate::error;
use crate::pipe::Pipe;
use crate::wire::frame::{Frame, MAX_FRAME_LEN};

/// Confirms are batched rather than sent per-byte; this bounds acknowledgement latency to well
/// under one window of data while still keeping the frame count low.
const CONFIRM_DIVISOR: u32 = 10;

/// A frame queued for a transport's single writer task. `FrameWithPayload` keeps the header
/// and body together so the writer can emit both without another channel round-trip.
pub enum Outbound {
    Frame(Frame),
    FrameWithPayload(Frame, Vec<u8>),
}

struct ChannelState {
    bytes_in_flight: u32,
    remote_window: u32,
    unconfirmed: u32,
    closed: bool,
    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
    overall_deadline: Option<Instant>,
}

/// The effective deadline for one direction is the earlier of that direction's own deadline
/// and the overall one; either half may be absent.
fn effective_deadline(overall: Option<Instant>, direction: Option<Instant>) -> Option<Instant> {
    match (overall, direction) {
        (Some(a), Some(b)) => Some(std::cmp::min(a, b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

pub struct Channel {
    id: u64,
    local_window: u32,
    outbound: mpsc::Sender<Outbound>,
    inbound: Pipe,
    state: Mutex<ChannelState>,
    credit_notify: Notify,
    done: Notify,
}

impl Channel {
    pub fn new(id: u64, local_window: u32, remote_window: u32, outbound: mpsc::Sender<Outbound>) -> Arc<Self> {
        Arc::new(Self {
            id,
            local_window,
            outbound,
            inbound: Pipe::new(local_window as usize),
            state: Mutex::new(ChannelState {
                bytes_in_flight: 0,
                remote_window,
                unconfirmed: 0,
                closed: false,
                read_deadline: None,
                write_deadline: None,
                overall_deadline: None,
            }),
            credit_notify: Notify::new(),
            done: Notify::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Sets the overall deadline, composing with any direction-specific one already set.
    /// `None` clears it. §4.5: applies to subsequent operations only.
    pub fn set_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(error::channel_closed());
        }
        state.overall_deadline = deadline;
        Ok(())
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(error::channel_closed());
        }
        state.read_deadline = deadline;
        Ok(())
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(error::channel_closed());
        }
        state.write_deadline = deadline;
        Ok(())
    }

    /// Delivers an inbound `Write` payload into this channel's pipe, returning a `Confirm`
    /// credit to send once the un-acknowledged total crosses the batching threshold.
    pub fn deliver(&self, payload: &[u8]) -> io::Result<Option<u32>> {
        self.inbound.write(payload)?;
        let mut state = self.state.lock();
        state.unconfirmed += payload.len() as u32;
        let threshold = std::cmp::max(self.local_window / CONFIRM_DIVISOR, 1);
        if state.unconfirmed >= threshold {
            let credit = state.unconfirmed;
            state.unconfirmed = 0;
            Ok(Some(credit))
        } else {
            Ok(None)
        }
    }

    /// Sends a `Confirm` for `credit` bytes, splitting across frames since credit travels as
    /// a `u16` on the wire but accumulates as a `u32` locally.
    pub async fn send_confirm(&self, mut credit: u32) -> io::Result<()> {
        while credit > 0 {
            let chunk = std::cmp::min(credit, u16::MAX as u32) as u16;
            self.outbound
                .send(Outbound::Frame(Frame::Confirm { id: self.id, credit: chunk }))
                .await
                .map_err(|_| error::transport_closed())?;
            credit -= chunk as u32;
        }
        Ok(())
    }

    /// Applies an inbound `Confirm`: frees up remote-window credit and wakes any writer
    /// waiting for room. A `credit` larger than what's actually in flight means the peer is
    /// acking bytes it was never sent — a protocol violation, not something to clamp away.
    pub fn confirm(&self, credit: u32) -> io::Result<()> {
        {
            let mut state = self.state.lock();
            if credit > state.bytes_in_flight {
                return Err(error::protocol_violation(format!(
                    "confirm for {credit} bytes exceeds {} in flight on channel {}",
                    state.bytes_in_flight, self.id
                )));
            }
            state.bytes_in_flight -= credit;
        }
        self.credit_notify.notify_waiters();
        Ok(())
    }

    /// Writes `buf`, waiting for remote-window credit and chunking so no `Write` frame
    /// exceeds the wire limit. A write past its deadline fails without enqueueing anything.
    pub async fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut offset = 0;
        while offset < buf.len() {
            let deadline = {
                let state = self.state.lock();
                effective_deadline(state.overall_deadline, state.write_deadline)
            };
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(error::deadline_exceeded());
            }
            let avail = self.wait_for_credit(1, deadline).await?;
            let chunk_len = std::cmp::min(std::cmp::min(avail as usize, MAX_FRAME_LEN), buf.len() - offset);
            let chunk = &buf[offset..offset + chunk_len];
            {
                let mut state = self.state.lock();
                state.bytes_in_flight += chunk_len as u32;
            }
            self.outbound
                .send(Outbound::FrameWithPayload(
                    Frame::Write { id: self.id, len: chunk_len as u16 },
                    chunk.to_vec(),
                ))
                .await
                .map_err(|_| error::transport_closed())?;
            offset += chunk_len;
        }
        Ok(())
    }

    async fn wait_for_credit(&self, min: u32, deadline: Option<Instant>) -> io::Result<u32> {
        loop {
            let notified = self.credit_notify.notified();
            {
                let state = self.state.lock();
                let avail = state.remote_window.saturating_sub(state.bytes_in_flight);
                if avail >= min {
                    return Ok(avail);
                }
                if state.closed {
                    return Err(error::channel_closed());
                }
            }
            match deadline {
                Some(d) => tokio::select! {
                    _ = notified => {}
                    _ = tokio::time::sleep_until(d) => return Err(error::deadline_exceeded()),
                },
                None => notified.await,
            }
        }
    }

    pub async fn read(&self, out: &mut [u8]) -> io::Result<usize> {
        let deadline = {
            let state = self.state.lock();
            effective_deadline(state.overall_deadline, state.read_deadline)
        };
        match deadline {
            Some(d) => tokio::time::timeout_at(d, self.inbound.read(out))
                .await
                .map_err(|_| error::deadline_exceeded())?,
            None => self.inbound.read(out).await,
        }
    }

    /// Marks the channel closed, drops anyone parked on it, and tells the peer. A second call
    /// returns `ChannelClosed` rather than silently no-oping, so callers can tell a close they
    /// actually performed from one that raced with another.
    pub async fn close(&self) -> io::Result<()> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(error::channel_closed());
            }
            state.closed = true;
        }
        self.inbound.close();
        self.credit_notify.notify_waiters();
        self.done.notify_waiters();
        let _ = self.outbound.send(Outbound::Frame(Frame::Close { id: self.id })).await;
        Ok(())
    }

    /// Marks the channel closed without sending a `Close` frame, used when the peer is the
    /// one who closed it.
    pub fn close_local_only(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        drop(state);
        self.inbound.close();
        self.credit_notify.notify_waiters();
        self.done.notify_waiters();
    }

    pub async fn closed(&self) {
        if self.is_closed() {
            return;
        }
        self.done.notified().await;
    }
}

type BoxedIoFuture<T> = Pin<Box<dyn Future<Output = io::Result<T>> + Send>>;

/// Adapts a [`Channel`] to [`tokio::io::AsyncRead`]/[`AsyncWrite`] for adapters that want a
/// plain byte stream rather than the explicit `read`/`write_all` calls.
pub struct ChannelStream {
    channel: Arc<Channel>,
    read_fut: Option<BoxedIoFuture<Vec<u8>>>,
    write_fut: Option<BoxedIoFuture<usize>>,
    shutdown_fut: Option<BoxedIoFuture<()>>,
}

impl ChannelStream {
    pub fn new(channel: Arc<Channel>) -> Self {
        Self {
            channel,
            read_fut: None,
            write_fut: None,
            shutdown_fut: None,
        }
    }
}

impl AsyncRead for ChannelStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if let Some(fut) = this.read_fut.as_mut() {
                let result = match fut.as_mut().poll(cx) {
                    Poll::Ready(r) => r,
                    Poll::Pending => return Poll::Pending,
                };
                this.read_fut = None;
                let data = result?;
                let n = std::cmp::min(data.len(), buf.remaining());
                buf.put_slice(&data[..n]);
                return Poll::Ready(Ok(()));
            }
            let channel = this.channel.clone();
            let want = buf.remaining();
            this.read_fut = Some(Box::pin(async move {
                let mut tmp = vec![0u8; want];
                let n = channel.read(&mut tmp).await?;
                tmp.truncate(n);
                Ok(tmp)
            }));
        }
    }
}

impl AsyncWrite for ChannelStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            if let Some(fut) = this.write_fut.as_mut() {
                let result = match fut.as_mut().poll(cx) {
                    Poll::Ready(r) => r,
                    Poll::Pending => return Poll::Pending,
                };
                this.write_fut = None;
                return Poll::Ready(result);
            }
            let channel = this.channel.clone();
            let data = buf.to_vec();
            let len = data.len();
            this.write_fut = Some(Box::pin(async move {
                channel.write_all(&data).await?;
                Ok(len)
            }));
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if let Some(fut) = this.shutdown_fut.as_mut() {
                let result = match fut.as_mut().poll(cx) {
                    Poll::Ready(r) => r,
                    Poll::Pending => return Poll::Pending,
                };
                this.shutdown_fut = None;
                return Poll::Ready(result);
            }
            let channel = this.channel.clone();
            this.shutdown_fut = Some(Box::pin(async move { channel.close().await }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_channel(local_window: u32, remote_window: u32) -> (Arc<Channel>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(16);
        (Channel::new(1, local_window, remote_window, tx), rx)
    }

    #[tokio::test]
    async fn deliver_then_read_round_trips() {
        let (channel, _rx) = new_channel(1024, 1024);
        channel.deliver(b"hello").unwrap();
        let mut out = [0u8; 5];
        assert_eq!(channel.read(&mut out).await.unwrap(), 5);
        assert_eq!(&out, b"hello");
    }

    #[tokio::test]
    async fn deliver_batches_confirms_past_threshold() {
        let (channel, _rx) = new_channel(100, 1024);
        assert!(channel.deliver(&[0u8; 5]).unwrap().is_none());
        let credit = channel.deliver(&[0u8; 10]).unwrap();
        assert_eq!(credit, Some(15));
    }

    #[tokio::test]
    async fn write_waits_for_remote_window() {
        let (channel, mut rx) = new_channel(1024, 4);
        let writer = channel.clone();
        let handle = tokio::spawn(async move { writer.write_all(b"abcdefgh").await });

        let first = rx.recv().await.unwrap();
        match first {
            Outbound::FrameWithPayload(Frame::Write { len, .. }, payload) => {
                assert_eq!(len as usize, 4);
                assert_eq!(payload, b"abcd");
            }
            _ => panic!("expected a write frame"),
        }

        channel.confirm(4).unwrap();
        let second = rx.recv().await.unwrap();
        match second {
            Outbound::FrameWithPayload(Frame::Write { len, .. }, payload) => {
                assert_eq!(len as usize, 4);
                assert_eq!(payload, b"efgh");
            }
            _ => panic!("expected a second write frame"),
        }

        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn close_unblocks_pending_read() {
        let (channel, _rx) = new_channel(1024, 1024);
        let reader = channel.clone();
        let handle = tokio::spawn(async move {
            let mut out = [0u8; 4];
            reader.read(&mut out).await
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        channel.close().await.unwrap();
        assert_eq!(handle.await.unwrap().unwrap(), 0);
    }

    #[tokio::test]
    async fn closing_twice_is_distinguishable() {
        let (channel, _rx) = new_channel(1024, 1024);
        channel.close().await.unwrap();
        let err = channel.close().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn confirm_beyond_in_flight_is_a_protocol_violation() {
        let (channel, mut rx) = new_channel(1024, 4);
        let writer = channel.clone();
        tokio::spawn(async move { writer.write_all(b"ab").await });
        rx.recv().await.unwrap();

        assert_eq!(channel.confirm(100).unwrap_err().kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test(start_paused = true)]
    async fn write_fails_without_enqueueing_past_its_deadline() {
        let (channel, mut rx) = new_channel(1024, 0);
        channel.set_write_deadline(Some(tokio::time::Instant::now())).unwrap();

        let err = channel.write_all(b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn read_past_its_deadline_times_out() {
        let (channel, _rx) = new_channel(1024, 1024);
        channel.set_read_deadline(Some(tokio::time::Instant::now() + std::time::Duration::from_millis(10))).unwrap();

        let mut out = [0u8; 4];
        let err = channel.read(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn setting_a_deadline_on_a_closed_channel_fails() {
        let (channel, _rx) = new_channel(1024, 1024);
        channel.close_local_only();
        assert!(channel.set_deadline(Some(tokio::time::Instant::now())).is_err());
    }

    #[tokio::test]
    async fn channel_stream_reads_and_writes() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (channel, mut rx) = new_channel(1024, 1024);
        channel.deliver(b"abc").unwrap();
        let mut stream = ChannelStream::new(channel.clone());

        let mut buf = [0u8; 3];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");

        stream.write_all(b"xyz").await.unwrap();
        match rx.recv().await.unwrap() {
            Outbound::FrameWithPayload(Frame::Write { .. }, payload) => assert_eq!(payload, b"xyz"),
            _ => panic!("expected a write frame"),
        }
    }
}
