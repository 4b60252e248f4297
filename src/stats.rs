//! Scheduler counters for external statistics exporters.
//!
//! Exporters read these; nothing here mutates core state. Counters are
//! relaxed atomics: individual reads are exact, cross-counter snapshots are
//! approximate, which is all accounting surfaces need.

use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Increments by one.
    #[inline]
    pub fn increment(&self) {
        self.add(1);
    }

    /// Adds `value`.
    #[inline]
    pub fn add(&self, value: u64) {
        self.value.fetch_add(value, Ordering::Relaxed);
    }

    /// Current value.
    #[inline]
    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Scheduler-wide counters.
#[derive(Debug, Default)]
pub struct SchedStats {
    /// Wake-ups that activated a task.
    pub wakeups: Counter,
    /// Wake-ups resolved on the waker's own runqueue.
    pub wakeups_local: Counter,
    /// Wake-up placements that fell back from an invalid class hint.
    pub wakeups_fallback: Counter,
    /// Periodic/idle balance invocations.
    pub balance_attempts: Counter,
    /// Tasks migrated by the periodic/idle balancer.
    pub balance_migrations: Counter,
    /// Active-balance (push) escalations.
    pub active_balances: Counter,
    /// Tasks pushed/pulled by the real-time balancer.
    pub rt_migrations: Counter,
    /// Runqueues throttled by the bandwidth controller.
    pub rt_throttles: Counter,
    /// Runqueues un-throttled by the period timer.
    pub rt_unthrottles: Counter,
    /// Tasks drained by hot-removal.
    pub hotplug_migrations: Counter,
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Wake-ups that activated a task.
    pub wakeups: u64,
    /// Wake-ups resolved on the waker's own runqueue.
    pub wakeups_local: u64,
    /// Wake-up placements that fell back from an invalid class hint.
    pub wakeups_fallback: u64,
    /// Periodic/idle balance invocations.
    pub balance_attempts: u64,
    /// Tasks migrated by the periodic/idle balancer.
    pub balance_migrations: u64,
    /// Active-balance (push) escalations.
    pub active_balances: u64,
    /// Tasks pushed/pulled by the real-time balancer.
    pub rt_migrations: u64,
    /// Runqueues throttled by the bandwidth controller.
    pub rt_throttles: u64,
    /// Runqueues un-throttled by the period timer.
    pub rt_unthrottles: u64,
    /// Tasks drained by hot-removal.
    pub hotplug_migrations: u64,
}

impl SchedStats {
    /// Takes a snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            wakeups: self.wakeups.get(),
            wakeups_local: self.wakeups_local.get(),
            wakeups_fallback: self.wakeups_fallback.get(),
            balance_attempts: self.balance_attempts.get(),
            balance_migrations: self.balance_migrations.get(),
            active_balances: self.active_balances.get(),
            rt_migrations: self.rt_migrations.get(),
            rt_throttles: self.rt_throttles.get(),
            rt_unthrottles: self.rt_unthrottles.get(),
            hotplug_migrations: self.hotplug_migrations.get(),
        }
    }
}
