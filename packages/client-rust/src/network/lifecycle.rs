//! Connection lifecycle: the state machine, the signal both loops watch, and
//! a count of handler tasks still running.
//!
//! The read loop takes a guard for each dispatch task it spawns. The guard
//! travels with the task and is released when the task ends, panicking
//! handler included, so `close` callers can wait for handlers to finish.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Connection state.
///
/// State machine: Connecting -> `LoggedIn` -> Running -> Closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Stream obtained, loops starting, login not yet confirmed.
    Connecting,
    /// Login handshake succeeded.
    LoggedIn,
    /// Handed to the caller; loops serving traffic.
    Running,
    /// Cancellation signalled; loops stopped or stopping.
    Closed,
}

impl ConnectionState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::LoggedIn => "logged_in",
            Self::Running => "running",
            Self::Closed => "closed",
        }
    }
}

/// Coordinates cancellation of the write and read loops.
///
/// 1. Loops select on `cancel_receiver()` alongside their work
/// 2. `cancel()` moves to Closed and signals every receiver
/// 3. `wait_for_drain()` waits for spawned dispatch tasks to finish
#[derive(Debug)]
pub struct Lifecycle {
    cancel_signal: watch::Sender<bool>,
    in_flight: Arc<AtomicU64>,
    state: ArcSwap<ConnectionState>,
}

impl Lifecycle {
    /// Creates a lifecycle in the `Connecting` state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            cancel_signal: tx,
            in_flight: Arc::new(AtomicU64::new(0)),
            state: ArcSwap::from_pointee(ConnectionState::Connecting),
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        **self.state.load()
    }

    /// Moves to `next` unless the connection is already closed.
    ///
    /// Returns `false` if the transition was refused.
    pub fn advance(&self, next: ConnectionState) -> bool {
        let previous = self.state.rcu(|current| {
            if **current == ConnectionState::Closed {
                Arc::clone(current)
            } else {
                Arc::new(next)
            }
        });
        *previous != ConnectionState::Closed
    }

    /// Returns a receiver that observes `true` once cancellation fires.
    #[must_use]
    pub fn cancel_receiver(&self) -> watch::Receiver<bool> {
        self.cancel_signal.subscribe()
    }

    /// Signals cancellation and moves to `Closed`.
    ///
    /// Returns `true` only for the call that performed the transition.
    pub fn cancel(&self) -> bool {
        let previous = self.state.swap(Arc::new(ConnectionState::Closed));
        // send_replace updates the value even with no live receivers
        self.cancel_signal.send_replace(true);
        *previous != ConnectionState::Closed
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.cancel_signal.borrow()
    }

    /// Counts one dispatch task until the returned guard is dropped.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Polls until no handler task is running or `timeout` passes.
    ///
    /// Frames still arriving keep spawning tasks, so call this after
    /// [`cancel`](Lifecycle::cancel) for a final answer. Returns `false` on
    /// timeout.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.in_flight_count() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
        true
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Held by one dispatch task; releases its count on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
