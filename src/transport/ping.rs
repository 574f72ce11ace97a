//! Liveness tracking for a transport: one side sends `Ping` on an interval, the other answers
//! with `Pong`, and a transport that stops hearing back gets torn down rather than left to
//! rot with channels nobody will ever read from again.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::Transport;

pub struct PingState {
    outstanding: AtomicBool,
    missed: AtomicU32,
    cookie_counter: AtomicU32,
}

impl PingState {
    pub fn new() -> Self {
        Self {
            outstanding: AtomicBool::new(false),
            missed: AtomicU32::new(0),
            cookie_counter: AtomicU32::new(0),
        }
    }

    /// Cookie content is unspecified by the protocol; a counter is enough to make each Ping
    /// distinguishable in logs without needing a random source.
    pub fn next_cookie(&self) -> [u8; 4] {
        self.cookie_counter.fetch_add(1, Ordering::Relaxed).to_be_bytes()
    }

    pub fn on_pong(&self) {
        self.outstanding.store(false, Ordering::Release);
        self.missed.store(0, Ordering::Release);
    }

    /// Called once per tick before a new `Ping` goes out. Returns the number of consecutive
    /// pings that have gone unanswered, including the one about to be sent.
    fn on_tick(&self) -> u32 {
        if self.outstanding.swap(true, Ordering::AcqRel) {
            self.missed.fetch_add(1, Ordering::AcqRel) + 1
        } else {
            0
        }
    }
}

impl Default for PingState {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs until the transport closes itself or is closed from elsewhere. `max_missed`
/// consecutive unanswered pings trigger a close; a `max_missed` of 0 disables the check and
/// the loop only ever sends.
pub async fn run_ping_loop(transport: Arc<Transport>, interval: Duration, max_missed: u32) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // first tick fires immediately; skip it so we don't ping at t=0
    loop {
        ticker.tick().await;
        if transport.is_closed() {
            return;
        }
        if max_missed > 0 && transport.ping.on_tick() > max_missed {
            tracing::warn!(missed = max_missed, "transport missed too many pongs, closing");
            transport.close().await;
            return;
        }
        if transport.send_ping().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missed_count_resets_on_pong() {
        let state = PingState::new();
        assert_eq!(state.on_tick(), 0);
        assert_eq!(state.on_tick(), 1);
        assert_eq!(state.on_tick(), 2);
        state.on_pong();
        assert_eq!(state.on_tick(), 0);
    }
}
