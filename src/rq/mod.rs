//! Per-processor runqueues and the locking substrate.
//!
//! One [`Runqueue`] exists per possible processor, allocated once at
//! startup and never freed; hot-removal resets fields instead of dropping
//! the slot. The mutable scheduling state ([`RqInner`]) sits behind a
//! per-runqueue lock; cross-processor operations take two locks in
//! ascending processor-index order, which makes lock ordering a total
//! order over the whole set and rules out deadlock.
//!
//! # Locking rules
//!
//! - `current`, `on_rq`, per-class queues, clock, and counters are read and
//!   written only under the runqueue's lock.
//! - [`RunqueueSet::lock_task_rq`] is the safe variant for locking "the
//!   runqueue this task is on": the task can migrate between the lookup and
//!   the acquisition, so it re-checks the assignment and retries.
//! - [`RunqueueSet::double_lock`] orders by processor index; an unfair
//!   fast path first try-locks the second queue, trading a little fairness
//!   for latency when the locks happen to be free.
//!
//! # Clock
//!
//! Each runqueue has a monotonic clock fed from the core's [`ClockSource`].
//! `skip_clock_update` suppresses exactly one update: it is set when a
//! preemption check has already marked the current task for reschedule, so
//! the immediately following dispatch does not pay for a redundant read.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::class::{FairRq, RtRq};
use crate::stats::SchedStats;
use crate::task::Task;
use crate::topology::RootDomain;
use crate::types::{CpuId, Time};

/// Number of decayed load-average slots per runqueue.
pub const CPU_LOAD_IDX_MAX: usize = 5;

/// One-shot cross-processor work executed by the stopper at a dispatch
/// safe point on the target processor.
#[derive(Debug)]
pub(crate) enum StopWork {
    /// Move `task` to `dest_cpu` (affinity change or hot-removal drain).
    /// A no-op if the task moved or blocked by the time it runs.
    MigrateTask {
        /// The task to move.
        task: Arc<Task>,
        /// Destination processor.
        dest_cpu: CpuId,
    },
    /// Push one runnable task toward `dest_cpu` (active balance).
    ActiveBalance {
        /// Processor that requested the push.
        dest_cpu: CpuId,
    },
}

/// Mutable per-processor scheduling state, guarded by the runqueue lock.
#[derive(Debug)]
pub struct RqInner {
    pub(crate) cpu: CpuId,
    /// Monotonic runqueue clock.
    pub(crate) clock: Time,
    /// Suppress the next clock update (set when a reschedule is already
    /// pending and dispatch will re-read the clock immediately).
    pub(crate) skip_clock_update: bool,
    /// Clock value at the last periodic tick, for tick-delta accounting.
    pub(crate) last_tick: Time,
    /// Runnable tasks on this queue (all classes).
    pub(crate) nr_running: usize,
    /// Aggregate fair load weight.
    pub(crate) load_weight: u64,
    /// Context switches performed on this processor.
    pub(crate) nr_switches: u64,
    /// Tasks in uninterruptible sleep last seen on this processor. Signed:
    /// wake-ups on other processors decrement remotely, so a single slot
    /// may go negative; only the sum over all processors is meaningful.
    pub(crate) nr_uninterruptible: i64,
    /// Decayed load history; slot 0 is the instantaneous load.
    pub(crate) cpu_load: [u64; CPU_LOAD_IDX_MAX],
    /// EWMA of how long this processor stays idle.
    pub(crate) avg_idle: Time,
    /// Clock value when the processor last went idle.
    pub(crate) idle_stamp: Time,
    /// The running task.
    pub(crate) current: Arc<Task>,
    /// The dedicated idle task; never absent.
    pub(crate) idle: Arc<Task>,
    /// The dedicated stopper task.
    pub(crate) stopper: Arc<Task>,
    /// Real-time class queue.
    pub(crate) rt: RtRq,
    /// Fair class queue.
    pub(crate) fair: FairRq,
}

impl RqInner {
    /// Updates the runqueue clock, honoring `skip_clock_update`.
    pub(crate) fn update_clock(&mut self, now: Time) {
        if self.skip_clock_update {
            self.skip_clock_update = false;
            return;
        }
        self.clock = self.clock.max(now);
    }

    /// Folds the instantaneous load into the decayed history.
    ///
    /// Slot `i` decays with a half-life of `2^i` ticks:
    /// `load[i] = (old * (2^i - 1) + new) >> i`, rounding up while load is
    /// increasing so a rising queue is never under-reported.
    pub(crate) fn update_cpu_load(&mut self) {
        let this_load = self.load_weight;
        self.cpu_load[0] = this_load;
        let mut scale = 2u64;
        for i in 1..CPU_LOAD_IDX_MAX {
            let old_load = self.cpu_load[i];
            let mut new_load = this_load;
            if new_load > old_load {
                new_load += scale - 1;
            }
            self.cpu_load[i] = (old_load * (scale - 1) + new_load) >> i;
            scale += scale;
        }
    }

    /// Records a sample of how long the processor just idled. The average
    /// is clamped to `max` so one long idle period cannot suppress
    /// newly-idle balancing long after the queue gets busy again.
    pub(crate) fn update_avg_idle(&mut self, now: Time, max: Time) {
        if self.idle_stamp.is_zero() {
            return;
        }
        let sample = now.saturating_sub(self.idle_stamp);
        // avg += (sample - avg) / 8, in saturating time arithmetic.
        let avg = self.avg_idle.as_nanos() as i64;
        let diff = sample.as_nanos() as i64 - avg;
        self.avg_idle = Time::from_nanos((avg + (diff >> 3)).max(0) as u64).min(max);
        self.idle_stamp = Time::ZERO;
    }

    /// True when only fair-class tasks are runnable.
    #[inline]
    pub(crate) fn all_tasks_fair(&self) -> bool {
        self.nr_running == self.fair.nr_running()
    }
}

/// A per-processor runqueue slot.
///
/// Fields outside [`RqInner`] are intentionally lock-free: flags read by
/// remote processors (online/active, pending reschedule), the load mirror
/// the balancer reads without locking every queue, and the stop-work
/// injection queue.
#[derive(Debug)]
pub struct Runqueue {
    cpu: CpuId,
    inner: Mutex<RqInner>,
    /// The current task should yield the processor at the next safe point.
    need_resched: AtomicBool,
    /// Online: participating in scheduling at all.
    online: AtomicBool,
    /// Active: accepting new task placements (cleared early in removal).
    active: AtomicBool,
    /// Lock-free mirror of `RqInner::load_weight`.
    load_mirror: AtomicU64,
    /// Lock-free mirror of `RqInner::nr_running`.
    nr_running_mirror: AtomicUsize,
    /// Tasks currently blocked in I/O wait that last ran here.
    nr_iowait: AtomicUsize,
    /// Pending cross-processor work, drained at dispatch safe points.
    stop_work: SegQueue<StopWork>,
    /// An active-balance request is in flight for this queue.
    active_balance: AtomicBool,
    /// Root domain this runqueue balances within. Readable without the
    /// runqueue lock; swapped only during repartition or hot-removal.
    rd: RwLock<Arc<RootDomain>>,
    /// Shared scheduler counters.
    stats: Arc<SchedStats>,
}

impl Runqueue {
    pub(crate) fn new(
        cpu: CpuId,
        idle: Arc<Task>,
        stopper: Arc<Task>,
        rd: Arc<RootDomain>,
        stats: Arc<SchedStats>,
    ) -> Self {
        let inner = RqInner {
            cpu,
            clock: Time::ZERO,
            skip_clock_update: false,
            last_tick: Time::ZERO,
            nr_running: 0,
            load_weight: 0,
            nr_switches: 0,
            nr_uninterruptible: 0,
            cpu_load: [0; CPU_LOAD_IDX_MAX],
            avg_idle: Time::ZERO,
            idle_stamp: Time::ZERO,
            current: Arc::clone(&idle),
            idle,
            stopper,
            rt: RtRq::new(),
            fair: FairRq::new(),
        };
        Self {
            cpu,
            inner: Mutex::new(inner),
            need_resched: AtomicBool::new(false),
            online: AtomicBool::new(false),
            active: AtomicBool::new(false),
            load_mirror: AtomicU64::new(0),
            nr_running_mirror: AtomicUsize::new(0),
            nr_iowait: AtomicUsize::new(0),
            stop_work: SegQueue::new(),
            active_balance: AtomicBool::new(false),
            rd: RwLock::new(rd),
            stats,
        }
    }

    /// The root domain this runqueue currently belongs to.
    #[must_use]
    pub fn root_domain(&self) -> Arc<RootDomain> {
        Arc::clone(&self.rd.read())
    }

    pub(crate) fn set_root_domain(&self, rd: Arc<RootDomain>) {
        *self.rd.write() = rd;
    }

    /// Shared scheduler counters.
    #[inline]
    pub(crate) fn stats(&self) -> &SchedStats {
        &self.stats
    }

    /// Processor index of this slot.
    #[inline]
    #[must_use]
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    /// True while the processor participates in scheduling.
    #[inline]
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub(crate) fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    /// True while the processor accepts new placements.
    #[inline]
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    /// Marks the current task for reschedule (remote or local).
    pub(crate) fn set_need_resched(&self) {
        self.need_resched.store(true, Ordering::Release);
    }

    pub(crate) fn clear_need_resched(&self) {
        self.need_resched.store(false, Ordering::Release);
    }

    /// True if a reschedule is pending.
    #[inline]
    #[must_use]
    pub fn need_resched(&self) -> bool {
        self.need_resched.load(Ordering::Acquire)
    }

    /// Lock-free load estimate for balancing decisions.
    #[inline]
    pub(crate) fn load_estimate(&self) -> u64 {
        self.load_mirror.load(Ordering::Relaxed)
    }

    /// Lock-free runnable-count estimate.
    #[inline]
    pub(crate) fn nr_running_estimate(&self) -> usize {
        self.nr_running_mirror.load(Ordering::Relaxed)
    }

    pub(crate) fn publish_load(&self, load: u64, nr_running: usize) {
        self.load_mirror.store(load, Ordering::Relaxed);
        self.nr_running_mirror.store(nr_running, Ordering::Relaxed);
    }

    /// Tasks from this processor currently sleeping in I/O wait.
    #[inline]
    #[must_use]
    pub fn nr_iowait(&self) -> usize {
        self.nr_iowait.load(Ordering::Relaxed)
    }

    pub(crate) fn iowait_inc(&self) {
        self.nr_iowait.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn iowait_dec(&self) {
        self.nr_iowait.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn push_stop_work(&self, work: StopWork) {
        self.stop_work.push(work);
    }

    pub(crate) fn pop_stop_work(&self) -> Option<StopWork> {
        self.stop_work.pop()
    }

    /// True when cross-processor work is pending for this queue.
    #[inline]
    pub(crate) fn has_stop_work(&self) -> bool {
        !self.stop_work.is_empty()
    }

    pub(crate) fn set_active_balance(&self, pending: bool) {
        self.active_balance.store(pending, Ordering::Release);
    }

    pub(crate) fn active_balance_pending(&self) -> bool {
        self.active_balance.load(Ordering::Acquire)
    }

    fn guard<'a>(&'a self, inner: MutexGuard<'a, RqInner>) -> RqGuard<'a> {
        RqGuard { rq: self, inner }
    }

    pub(crate) fn lock(&self) -> RqGuard<'_> {
        self.guard(self.inner.lock())
    }

    pub(crate) fn try_lock(&self) -> Option<RqGuard<'_>> {
        self.inner.try_lock().map(|inner| self.guard(inner))
    }
}

/// Lock guard over a runqueue's mutable state.
///
/// Dereferences to [`RqInner`]; also exposes the slot's lock-free side so
/// code holding the lock can flip flags and publish the load mirror
/// without re-finding the slot.
pub struct RqGuard<'a> {
    rq: &'a Runqueue,
    inner: MutexGuard<'a, RqInner>,
}

impl<'a> RqGuard<'a> {
    /// The slot this guard locks.
    #[inline]
    pub(crate) fn outer(&self) -> &'a Runqueue {
        self.rq
    }

    /// Processor index.
    #[inline]
    #[must_use]
    pub fn cpu(&self) -> CpuId {
        self.rq.cpu
    }

    /// Marks the current task for reschedule and suppresses the next
    /// redundant clock update: dispatch is about to run anyway.
    pub(crate) fn resched_curr(&mut self) {
        self.rq.set_need_resched();
        self.inner.skip_clock_update = true;
    }

    /// Publishes the load mirror from the locked state.
    pub(crate) fn publish_load(&mut self) {
        let load = self.inner.load_weight;
        let nr = self.inner.nr_running;
        self.rq.publish_load(load, nr);
    }
}

impl core::ops::Deref for RqGuard<'_> {
    type Target = RqInner;

    #[inline]
    fn deref(&self) -> &RqInner {
        &self.inner
    }
}

impl core::ops::DerefMut for RqGuard<'_> {
    #[inline]
    fn deref_mut(&mut self) -> &mut RqInner {
        &mut self.inner
    }
}

impl core::fmt::Debug for RqGuard<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RqGuard").field("cpu", &self.rq.cpu).finish()
    }
}

/// The arena of runqueue slots, one per possible processor.
#[derive(Debug)]
pub struct RunqueueSet {
    rqs: Box<[Runqueue]>,
}

impl RunqueueSet {
    pub(crate) fn new(rqs: Vec<Runqueue>) -> Self {
        Self {
            rqs: rqs.into_boxed_slice(),
        }
    }

    /// Number of possible processors.
    #[inline]
    #[must_use]
    pub fn cpu_count(&self) -> usize {
        self.rqs.len()
    }

    /// The slot for `cpu`. Panics on an out-of-range index; processor ids
    /// come from validated configuration.
    #[inline]
    #[must_use]
    pub fn rq(&self, cpu: CpuId) -> &Runqueue {
        &self.rqs[cpu]
    }

    /// Iterates over all slots.
    pub fn iter(&self) -> impl Iterator<Item = &Runqueue> {
        self.rqs.iter()
    }

    /// Locks one runqueue ("fast" variant; no assignment re-check).
    pub(crate) fn lock(&self, cpu: CpuId) -> RqGuard<'_> {
        self.rqs[cpu].lock()
    }

    /// Locks the runqueue a task is assigned to ("safe" variant).
    ///
    /// The task may migrate between reading its assignment and acquiring
    /// the lock; re-check and retry. Terminates because a migration
    /// requires the very lock this loop is acquiring.
    pub(crate) fn lock_task_rq(&self, task: &Task) -> RqGuard<'_> {
        loop {
            let cpu = task.cpu();
            let guard = self.rqs[cpu].lock();
            if task.cpu() == cpu {
                return guard;
            }
        }
    }

    /// Locks two distinct runqueues deadlock-free.
    ///
    /// Returns guards in `(a, b)` argument order. Acquisition order is
    /// ascending processor index, with an unfair try-lock fast path.
    pub(crate) fn double_lock(&self, a: CpuId, b: CpuId) -> (RqGuard<'_>, RqGuard<'_>) {
        assert_ne!(a, b, "double_lock requires distinct runqueues");
        // Unfair fast path: if b's lock is free we avoid the drop/reorder
        // dance entirely.
        let first = self.rqs[a].lock();
        if let Some(second) = self.rqs[b].try_lock() {
            return (first, second);
        }
        drop(first);

        if a < b {
            let ga = self.rqs[a].lock();
            let gb = self.rqs[b].lock();
            (ga, gb)
        } else {
            let gb = self.rqs[b].lock();
            let ga = self.rqs[a].lock();
            (ga, gb)
        }
    }

    /// Acquires `other` while already holding `held`.
    ///
    /// Fast path try-locks `other`. Otherwise `held` is released and both
    /// locks are re-acquired in order; the returned flag reports that the
    /// held lock was dropped, so the caller must revalidate any state read
    /// under it.
    pub(crate) fn double_lock_balance<'a>(
        &'a self,
        held: RqGuard<'a>,
        other: CpuId,
    ) -> (RqGuard<'a>, RqGuard<'a>, bool) {
        let this_cpu = held.cpu();
        assert_ne!(this_cpu, other, "double_lock_balance requires distinct runqueues");
        if let Some(second) = self.rqs[other].try_lock() {
            return (held, second, false);
        }
        drop(held);
        let (a, b) = self.double_lock(this_cpu, other);
        (a, b, true)
    }

    /// The set of online processors.
    #[must_use]
    pub fn online_mask(&self) -> crate::types::CpuMask {
        self.rqs
            .iter()
            .filter(|rq| rq.is_online())
            .map(Runqueue::cpu)
            .collect()
    }

    /// The set of processors accepting placements.
    #[must_use]
    pub fn active_mask(&self) -> crate::types::CpuMask {
        self.rqs
            .iter()
            .filter(|rq| rq.is_active())
            .map(Runqueue::cpu)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Task, TaskDesc, TaskTable};
    use crate::topology::RootDomain;
    use crate::types::CpuMask;

    fn make_set(nr_cpus: usize) -> (RunqueueSet, TaskTable) {
        let table = TaskTable::new();
        let rd = Arc::new(RootDomain::new(CpuMask::first_n(nr_cpus)));
        let stats = Arc::new(SchedStats::default());
        let rqs = (0..nr_cpus)
            .map(|cpu| {
                let idle = table.insert_with(|id| Task::new_idle(id, cpu));
                let stopper = table.insert_with(|id| Task::new_stopper(id, cpu));
                let rq = Runqueue::new(cpu, idle, stopper, Arc::clone(&rd), Arc::clone(&stats));
                rq.set_online(true);
                rq.set_active(true);
                rq
            })
            .collect();
        (RunqueueSet::new(rqs), table)
    }

    #[test]
    fn clock_is_monotonic_and_skippable() {
        let (set, _table) = make_set(1);
        let mut rq = set.lock(0);
        rq.update_clock(Time::from_millis(5));
        assert_eq!(rq.clock, Time::from_millis(5));
        rq.update_clock(Time::from_millis(3));
        assert_eq!(rq.clock, Time::from_millis(5));

        rq.skip_clock_update = true;
        rq.update_clock(Time::from_millis(10));
        assert_eq!(rq.clock, Time::from_millis(5), "one update suppressed");
        rq.update_clock(Time::from_millis(10));
        assert_eq!(rq.clock, Time::from_millis(10), "only one");
    }

    #[test]
    fn cpu_load_decays_toward_stable_load() {
        let (set, _table) = make_set(1);
        let mut rq = set.lock(0);
        rq.load_weight = 1024;
        for _ in 0..64 {
            rq.update_cpu_load();
        }
        assert_eq!(rq.cpu_load[0], 1024);
        for i in 1..CPU_LOAD_IDX_MAX {
            assert!(
                rq.cpu_load[i] >= 1000,
                "slot {i} should converge, got {}",
                rq.cpu_load[i]
            );
        }
        // Load disappears: slower slots must lag behind faster ones.
        rq.load_weight = 0;
        rq.update_cpu_load();
        assert_eq!(rq.cpu_load[0], 0);
        assert!(rq.cpu_load[1] < rq.cpu_load[4]);
    }

    #[test]
    fn double_lock_orders_and_returns_argument_order() {
        let (set, _table) = make_set(4);
        let (a, b) = set.double_lock(3, 1);
        assert_eq!(a.cpu(), 3);
        assert_eq!(b.cpu(), 1);
        drop((a, b));

        let (a, b) = set.double_lock(0, 2);
        assert_eq!((a.cpu(), b.cpu()), (0, 2));
    }

    #[test]
    fn lock_task_rq_follows_migration() {
        let (set, table) = make_set(2);
        let task = table.insert(&TaskDesc::new("t"));
        task.set_cpu(1);
        let guard = set.lock_task_rq(&task);
        assert_eq!(guard.cpu(), 1);
    }

    #[test]
    fn double_lock_balance_reports_dropped_lock() {
        let (set, _table) = make_set(2);
        let held = set.lock(0);
        // Nothing holds rq1, so the fast path wins and nothing is dropped.
        let (a, b, dropped) = set.double_lock_balance(held, 1);
        assert!(!dropped);
        assert_eq!((a.cpu(), b.cpu()), (0, 1));
    }

    #[test]
    fn avg_idle_tracks_samples() {
        let (set, _table) = make_set(1);
        let mut rq = set.lock(0);
        rq.idle_stamp = Time::from_millis(1);
        rq.update_avg_idle(Time::from_millis(9), Time::from_secs(1));
        assert_eq!(rq.avg_idle, Time::from_millis(1));
        assert!(rq.idle_stamp.is_zero());
        // No stamp, no update.
        rq.update_avg_idle(Time::from_millis(20), Time::from_secs(1));
        assert_eq!(rq.avg_idle, Time::from_millis(1));
    }

    #[test]
    fn avg_idle_is_clamped() {
        let (set, _table) = make_set(1);
        let mut rq = set.lock(0);
        rq.idle_stamp = Time::from_millis(1);
        // A minute of idleness counts as no more than the clamp.
        rq.update_avg_idle(Time::from_secs(60), Time::from_millis(1));
        assert_eq!(rq.avg_idle, Time::from_millis(1));

        rq.idle_stamp = Time::from_secs(60);
        rq.update_avg_idle(Time::from_secs(60).saturating_add(Time::from_micros(50)), Time::from_millis(1));
        assert!(rq.avg_idle < Time::from_millis(1), "short samples decay the average");
    }
}
