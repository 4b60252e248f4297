//! Clock sources.
//!
//! Runqueue clocks are fed from a [`ClockSource`] so the whole core can run
//! on virtual time: production uses [`MonotonicClock`] (a wrapper over
//! `Instant`), tests use [`ManualClock`] and advance it explicitly. Every
//! timing-sensitive path (tick accounting, balance rate limiting, bandwidth
//! refill) reads time only through the source it was given.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::types::Time;

/// A monotonic nanosecond time source.
pub trait ClockSource: Send + Sync + core::fmt::Debug {
    /// Current time. Must never go backwards.
    fn now(&self) -> Time;
}

/// Wall-clock-backed monotonic source.
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Creates a source with its origin at construction time.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSource for MonotonicClock {
    fn now(&self) -> Time {
        self.origin.elapsed().into()
    }
}

/// Manually advanced source for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ns: AtomicU64,
}

impl ManualClock {
    /// Creates a source at time zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a shared source at time zero.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Advances the clock by `delta`.
    pub fn advance(&self, delta: Time) {
        self.now_ns.fetch_add(delta.as_nanos(), Ordering::SeqCst);
    }

    /// Sets the clock to `now`. Saturates monotonically: moving backwards
    /// is ignored.
    pub fn set(&self, now: Time) {
        self.now_ns.fetch_max(now.as_nanos(), Ordering::SeqCst);
    }
}

impl ClockSource for ManualClock {
    fn now(&self) -> Time {
        Time::from_nanos(self.now_ns.load(Ordering::SeqCst))
    }
}
