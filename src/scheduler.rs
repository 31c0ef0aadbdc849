//! Tick pacing for the control loop.
//!
//! The loop waits on a [`Ticker`] between iterations instead of sleeping
//! directly, so tests and offline replays can drive it without wall-clock
//! delay. Shutdown is only observed here, at the tick boundary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Cooperative shutdown request shared between the loop and its owner.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    Shutdown,
}

pub trait Ticker {
    /// Block until the next tick boundary, or return early on shutdown.
    fn wait(&mut self, shutdown: &ShutdownSignal) -> TickOutcome;
}

// upper bound on shutdown latency while waiting for a tick
const SLEEP_SLICE: Duration = Duration::from_millis(5);

/// Fixed-cadence wall-clock ticker. Deadlines advance by whole intervals;
/// if the loop overruns, missed ticks are skipped instead of bursted.
#[derive(Debug)]
pub struct IntervalTicker {
    interval: Duration,
    next: Option<Instant>,
    skipped: u64,
}

impl IntervalTicker {
    pub fn new(interval: Duration) -> Self {
        Self { interval, next: None, skipped: 0 }
    }

    /// Ticks dropped because an iteration ran past its deadline.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

impl Ticker for IntervalTicker {
    fn wait(&mut self, shutdown: &ShutdownSignal) -> TickOutcome {
        let now = Instant::now();
        let mut deadline = self.next.unwrap_or(now + self.interval);
        while deadline < now {
            deadline += self.interval;
            self.skipped += 1;
        }
        self.next = Some(deadline + self.interval);

        loop {
            if shutdown.is_requested() {
                return TickOutcome::Shutdown;
            }
            let now = Instant::now();
            if now >= deadline {
                return TickOutcome::Continue;
            }
            thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}

/// Ticker without delay. Optionally requests shutdown after a fixed number
/// of ticks, for tests and offline replays.
#[derive(Debug, Default)]
pub struct ManualTicker {
    ticks: u64,
    limit: Option<u64>,
}

impl ManualTicker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: u64) -> Self {
        Self { ticks: 0, limit: Some(limit) }
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}

impl Ticker for ManualTicker {
    fn wait(&mut self, shutdown: &ShutdownSignal) -> TickOutcome {
        if shutdown.is_requested() {
            return TickOutcome::Shutdown;
        }
        self.ticks += 1;
        match self.limit {
            Some(limit) if self.ticks >= limit => TickOutcome::Shutdown,
            _ => TickOutcome::Continue,
        }
    }
}
