//! Async-aware wrapper around [`RingBuffer`] used as a channel's inbound data path.
//!
//! The original blocking `sync.Cond` wait becomes a `Notify`: a reader that finds the buffer
//! empty registers for a wakeup and parks; every write and every close fires the notify so at
//! most one extra poll happens before data (or EOF) is observed.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::buffer::RingBuffer;

pub struct Pipe {
    inner: Mutex<RingBuffer>,
    closed: AtomicBool,
    notify: Notify,
}

impl Pipe {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(RingBuffer::new(capacity)),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Queues inbound bytes for a future `read`. Fails if the pipe is closed or the data
    /// doesn't fit — both indicate the sender ignored the flow-control contract.
    pub fn write(&self, buf: &[u8]) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"));
        }
        self.inner.lock().write(buf)?;
        self.notify.notify_waiters();
        Ok(())
    }

    /// Wakes any pending reader with EOF and marks the pipe so that all future reads return
    /// `Ok(0)` once buffered data is drained.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.notify.notify_waiters();
        }
    }

    /// Reads into `out`, parking until data is available or the pipe is closed. A zero-length
    /// `out` always returns `Ok(0)` immediately without waiting, matching `io::Read`'s contract.
    pub async fn read(&self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock();
                let n = inner.read(out);
                if n > 0 {
                    return Ok(n);
                }
                if self.is_closed() {
                    return Ok(0);
                }
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn read_returns_buffered_data() {
        let pipe = Pipe::new(16);
        pipe.write(b"hi").unwrap();
        let mut out = [0u8; 2];
        assert_eq!(pipe.read(&mut out).await.unwrap(), 2);
        assert_eq!(&out, b"hi");
    }

    #[tokio::test]
    async fn read_blocks_until_write() {
        let pipe = Arc::new(Pipe::new(16));
        let reader = pipe.clone();
        let handle = tokio::spawn(async move {
            let mut out = [0u8; 5];
            let n = reader.read(&mut out).await.unwrap();
            (n, out)
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        pipe.write(b"late!").unwrap();

        let (n, out) = handle.await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(&out, b"late!");
    }

    #[tokio::test]
    async fn close_wakes_reader_with_eof() {
        let pipe = Arc::new(Pipe::new(16));
        let reader = pipe.clone();
        let handle = tokio::spawn(async move {
            let mut out = [0u8; 5];
            reader.read(&mut out).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        pipe.close();

        assert_eq!(handle.await.unwrap().unwrap(), 0);
    }

    #[tokio::test]
    async fn zero_length_read_never_waits() {
        let pipe = Pipe::new(16);
        let mut out: [u8; 0] = [];
        assert_eq!(pipe.read(&mut out).await.unwrap(), 0);
    }

    #[test]
    fn write_after_close_is_rejected() {
        let pipe = Pipe::new(16);
        pipe.close();
        assert!(pipe.write(b"x").is_err());
    }
}
