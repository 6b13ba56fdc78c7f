//! Relay-level counters.
//!
//! Everything here is a plain atomic so the counters can be read from any
//! task without coordinating with the relay's single-threaded handlers.
//! Transport traffic counters live in the transport crate; the driver's
//! rolling summary stitches the two together.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use transport::DisconnectReason;

/// A poll cycle longer than this is counted and logged as an overrun.
pub const POLL_BUDGET: Duration = Duration::from_millis(50);

/// Upper bucket bounds of the poll-duration histogram, in microseconds.
pub const POLL_BUCKETS_US: [u64; 8] = [50, 100, 250, 500, 1_000, 5_000, 10_000, 50_000];

/// Subsystem labels for the error counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsystem {
    Transport,
    Codec,
    Relay,
}

impl Subsystem {
    pub const ALL: [Subsystem; 3] = [Subsystem::Transport, Subsystem::Codec, Subsystem::Relay];

    pub fn as_str(self) -> &'static str {
        match self {
            Subsystem::Transport => "transport",
            Subsystem::Codec => "codec",
            Subsystem::Relay => "relay",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Counters exposed by the relay.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    /// Currently registered players (gauge).
    pub players_connected: AtomicU64,
    pub players_joined: AtomicU64,
    pub players_left: AtomicU64,

    /// Payloads dropped because their session id did not match.
    pub session_mismatches: AtomicU64,
    /// Inbound payloads of a kind only the server may originate.
    pub server_only_dropped: AtomicU64,
    /// Datagrams or payloads too short to carry their own header.
    pub short_payloads: AtomicU64,

    pub polls: AtomicU64,
    pub poll_micros: AtomicU64,
    pub poll_overruns: AtomicU64,

    disconnects: [AtomicU64; DisconnectReason::ALL.len()],
    errors: [AtomicU64; Subsystem::ALL.len()],
    poll_buckets: [AtomicU64; POLL_BUCKETS_US.len() + 1],
}

impl RelayMetrics {
    pub fn inc_error(&self, subsystem: Subsystem) {
        self.errors[subsystem.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn errors(&self, subsystem: Subsystem) -> u64 {
        self.errors[subsystem.index()].load(Ordering::Relaxed)
    }

    pub fn inc_disconnect(&self, reason: DisconnectReason) {
        self.disconnects[reason.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn disconnects(&self, reason: DisconnectReason) -> u64 {
        self.disconnects[reason.index()].load(Ordering::Relaxed)
    }

    /// Record one poll cycle in the histogram, counting overruns.
    pub fn record_poll(&self, elapsed: Duration) {
        let micros = elapsed.as_micros() as u64;
        self.polls.fetch_add(1, Ordering::Relaxed);
        self.poll_micros.fetch_add(micros, Ordering::Relaxed);
        let bucket = POLL_BUCKETS_US
            .iter()
            .position(|bound| micros <= *bound)
            .unwrap_or(POLL_BUCKETS_US.len());
        self.poll_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        if elapsed > POLL_BUDGET {
            self.poll_overruns.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn poll_bucket(&self, index: usize) -> u64 {
        self.poll_buckets[index].load(Ordering::Relaxed)
    }

    pub fn set_players_connected(&self, count: usize) {
        self.players_connected.store(count as u64, Ordering::Relaxed);
    }
}
