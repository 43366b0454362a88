//! SSH Transport Layer State Machine (RFC 4253).
//!
//! This module tracks the transport session lifecycle and the counters that
//! decide when keys must be renewed.
//!
//! # Transport States
//!
//! ```text
//! Disconnected -> BannerExchange -> InitialKex -> Ready <-> Rekeying
//!                                                   |
//!             (any state) ------------------------> Closing -> Disconnected
//! ```
//!
//! Channels and authentication only operate in `Ready` (and keep flowing
//! through `Rekeying`).
//!
//! # Rekeying
//!
//! A new key exchange is due when any limit in [`RekeyLimits`] is reached:
//! - Data transferred (1 GiB by default)
//! - Packets transferred (2^31 by default)
//! - Time elapsed (1 hour by default)
//!
//! # Example
//!
//! ```rust
//! use latch_proto::ssh::transport::{State, TransportState};
//!
//! let mut state = TransportState::new();
//! assert_eq!(state.current(), State::Disconnected);
//! state.transition(State::BannerExchange).unwrap();
//! assert!(state.transition(State::Ready).is_err());
//! ```

use latch_platform::{LatchError, LatchResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Transport session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// No connection
    Disconnected,
    /// Exchanging identification strings
    BannerExchange,
    /// Running the first key exchange
    InitialKex,
    /// Keys active; channels and authentication may proceed
    Ready,
    /// Re-running key exchange; returns to `Ready`
    Rekeying,
    /// Tearing down after a fatal error or local close
    Closing,
}

impl State {
    /// True while channel traffic may flow.
    pub fn is_established(&self) -> bool {
        matches!(self, State::Ready | State::Rekeying)
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            State::Disconnected => "Disconnected",
            State::BannerExchange => "BannerExchange",
            State::InitialKex => "InitialKex",
            State::Ready => "Ready",
            State::Rekeying => "Rekeying",
            State::Closing => "Closing",
        };
        f.write_str(name)
    }
}

/// Lifecycle state with transition checking.
#[derive(Debug, Clone)]
pub struct TransportState {
    state: State,
    kex_count: u64,
}

impl TransportState {
    /// Starts in `Disconnected`.
    pub fn new() -> Self {
        Self {
            state: State::Disconnected,
            kex_count: 0,
        }
    }

    /// Current state.
    pub fn current(&self) -> State {
        self.state
    }

    /// Completed key exchanges, the initial one included.
    pub fn kex_count(&self) -> u64 {
        self.kex_count
    }

    /// Moves to `next_state`.
    ///
    /// # Errors
    ///
    /// Returns [`LatchError::Protocol`] for a transition the lifecycle does
    /// not allow.
    pub fn transition(&mut self, next_state: State) -> LatchResult<()> {
        let valid = match (self.state, next_state) {
            (State::Disconnected, State::BannerExchange) => true,
            (State::BannerExchange, State::InitialKex) => true,
            (State::InitialKex, State::Ready) => true,
            (State::Ready, State::Rekeying) => true,
            (State::Rekeying, State::Ready) => true,
            // Any live state may start tearing down
            (s, State::Closing) if s != State::Disconnected => true,
            (State::Closing, State::Disconnected) => true,
            (s1, s2) if s1 == s2 => true,
            _ => false,
        };

        if !valid {
            return Err(LatchError::Protocol(format!(
                "Invalid state transition: {} -> {}",
                self.state, next_state
            )));
        }

        if next_state == State::Ready && self.state != State::Ready {
            self.kex_count += 1;
        }
        self.state = next_state;
        Ok(())
    }
}

impl Default for TransportState {
    fn default() -> Self {
        Self::new()
    }
}

/// Thresholds that force a new key exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RekeyLimits {
    /// Bytes in either direction since the last exchange
    pub max_bytes: u64,
    /// Packets in either direction since the last exchange
    pub max_packets: u64,
    /// Time since the last exchange
    pub max_interval: Duration,
}

impl Default for RekeyLimits {
    fn default() -> Self {
        Self {
            max_bytes: 1 << 30,
            max_packets: 1 << 31,
            max_interval: Duration::from_secs(3600),
        }
    }
}

/// Traffic since the last key exchange.
///
/// Updated by the reader and the writer without locking.
#[derive(Debug, Default)]
pub struct RekeyCounters {
    bytes_out: AtomicU64,
    bytes_in: AtomicU64,
    packets_out: AtomicU64,
    packets_in: AtomicU64,
}

impl RekeyCounters {
    /// Zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one outbound packet.
    pub fn add_outbound(&self, bytes: usize) {
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_out.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one inbound packet.
    pub fn add_inbound(&self, bytes: usize) {
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_in.fetch_add(1, Ordering::Relaxed);
    }

    /// Total bytes in both directions.
    pub fn bytes(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed) + self.bytes_in.load(Ordering::Relaxed)
    }

    /// Largest per-direction packet count.
    pub fn packets(&self) -> u64 {
        self.packets_out
            .load(Ordering::Relaxed)
            .max(self.packets_in.load(Ordering::Relaxed))
    }

    /// True if byte or packet limits are reached.
    pub fn exceeds(&self, limits: &RekeyLimits) -> bool {
        self.bytes() >= limits.max_bytes || self.packets() >= limits.max_packets
    }

    /// Clears all counters after a key exchange.
    pub fn reset(&self) {
        self.bytes_out.store(0, Ordering::Relaxed);
        self.bytes_in.store(0, Ordering::Relaxed);
        self.packets_out.store(0, Ordering::Relaxed);
        self.packets_in.store(0, Ordering::Relaxed);
    }
}

/// Time at which the next exchange is due; `None` when the interval is too
/// large to represent.
pub fn rekey_deadline(last_kex: Instant, limits: &RekeyLimits) -> Option<Instant> {
    last_kex.checked_add(limits.max_interval)
}
