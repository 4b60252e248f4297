//! Real-time bandwidth control.
//!
//! Real-time tasks can starve everything below them, so each bandwidth
//! group grants its members at most `runtime` of processor time per
//! `period`, per processor. The tick path charges the running task's group
//! under the runqueue lock (the per-processor budget mutex nests inside
//! it); when a budget runs dry the group's tasks on that processor are
//! parked until the next refill. Refills run from [`PeriodTimer`] or, in
//! deterministic tests, from an explicit call into the core.
//!
//! Groups form a tree used for admission control only: a group's children
//! may not claim more bandwidth than the group itself holds. Accounting
//! stays flat, each task charges exactly its own group.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::config::RtBandwidthConfig;
use crate::error::{Result, SchedError};
use crate::types::{CpuId, Time, MAX_CPUS};

/// One part per million, the unit of bandwidth claims.
const PPM: u64 = 1_000_000;

/// A group's bandwidth grant.
#[derive(Debug, Clone, Copy)]
pub struct RtBandwidth {
    /// Accounting period.
    pub period: Time,
    /// Runtime per period and processor; `None` is unlimited.
    pub runtime: Option<Time>,
}

impl RtBandwidth {
    /// The grant as parts per million of a processor.
    fn ppm(self) -> u64 {
        match self.runtime {
            None => PPM,
            Some(runtime) => {
                if self.period.is_zero() {
                    PPM
                } else {
                    runtime.as_nanos().saturating_mul(PPM) / self.period.as_nanos()
                }
            }
        }
    }

    fn validate(self) -> Result<()> {
        if self.period.is_zero() {
            return Err(SchedError::ZeroPeriod);
        }
        if let Some(runtime) = self.runtime {
            if runtime > self.period {
                return Err(SchedError::RuntimeExceedsPeriod {
                    runtime_us: runtime.as_micros(),
                    period_us: self.period.as_micros(),
                });
            }
        }
        Ok(())
    }
}

/// Per-processor consumption against a group's grant.
#[derive(Debug, Default, Clone, Copy)]
struct CpuBudget {
    /// Time consumed in the current period.
    rt_time: Time,
    /// Members are parked on this processor.
    throttled: bool,
}

/// A real-time bandwidth group.
#[derive(Debug)]
pub struct RtGroup {
    id: u64,
    name: String,
    parent: Weak<RtGroup>,
    children: Mutex<Vec<Arc<RtGroup>>>,
    bandwidth: Mutex<RtBandwidth>,
    /// Budget mutexes nest inside the owning runqueue's lock.
    budgets: Box<[Mutex<CpuBudget>]>,
    /// Clock of the last refill, for overrun catch-up.
    last_refill: Mutex<Time>,
    /// Live real-time tasks attached to this group.
    nr_tasks: AtomicUsize,
}

impl RtGroup {
    fn new(id: u64, name: String, parent: Weak<RtGroup>, bandwidth: RtBandwidth) -> Self {
        let budgets = (0..MAX_CPUS).map(|_| Mutex::new(CpuBudget::default())).collect();
        Self {
            id,
            name,
            parent,
            children: Mutex::new(Vec::new()),
            bandwidth: Mutex::new(bandwidth),
            budgets,
            last_refill: Mutex::new(Time::ZERO),
            nr_tasks: AtomicUsize::new(0),
        }
    }

    /// Stable group id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Group name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The current grant.
    #[must_use]
    pub fn bandwidth(&self) -> RtBandwidth {
        *self.bandwidth.lock()
    }

    /// Live real-time tasks attached to this group.
    #[must_use]
    pub fn nr_tasks(&self) -> usize {
        self.nr_tasks.load(Ordering::Relaxed)
    }

    pub(crate) fn task_attached(&self) {
        self.nr_tasks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn task_detached(&self) {
        self.nr_tasks.fetch_sub(1, Ordering::Relaxed);
    }

    /// True while this group's members are parked on `cpu`.
    pub(crate) fn is_throttled(&self, cpu: CpuId) -> bool {
        self.budgets[cpu].lock().throttled
    }

    /// Charges `delta` of consumption on `cpu`. Returns true exactly when
    /// this charge crossed the limit, so the caller throttles once. Called
    /// under the runqueue lock.
    pub(crate) fn charge(&self, cpu: CpuId, delta: Time) -> bool {
        let limit = self.bandwidth.lock().runtime;
        let mut budget = self.budgets[cpu].lock();
        budget.rt_time += delta;
        match limit {
            Some(runtime) if !budget.throttled && budget.rt_time > runtime => {
                budget.throttled = true;
                true
            }
            _ => false,
        }
    }

    /// Consumed time on `cpu` in the current period.
    #[must_use]
    pub fn consumed(&self, cpu: CpuId) -> Time {
        self.budgets[cpu].lock().rt_time
    }

    /// Pays back `overruns` periods worth of runtime on `cpu`. Returns
    /// true if the processor was throttled and now has budget again.
    /// Called under the runqueue lock.
    pub(crate) fn refill(&self, cpu: CpuId, overruns: u64) -> bool {
        let bandwidth = *self.bandwidth.lock();
        let mut budget = self.budgets[cpu].lock();
        match bandwidth.runtime {
            None => {
                budget.rt_time = Time::ZERO;
                core::mem::replace(&mut budget.throttled, false)
            }
            Some(runtime) => {
                let payback = runtime.saturating_mul(overruns);
                budget.rt_time = budget.rt_time.saturating_sub(payback);
                if budget.throttled && budget.rt_time < runtime {
                    budget.throttled = false;
                    true
                } else {
                    false
                }
            }
        }
    }
}

/// Owns the group tree and drives refills.
#[derive(Debug)]
pub(crate) struct BandwidthController {
    root: Arc<RtGroup>,
    /// Every live group, root included.
    groups: Mutex<Vec<Arc<RtGroup>>>,
    next_id: AtomicU64,
}

impl BandwidthController {
    pub(crate) fn new(config: &RtBandwidthConfig) -> Self {
        let bandwidth = RtBandwidth {
            period: Time::from(config.period),
            runtime: config.runtime.map(Time::from),
        };
        let root = Arc::new(RtGroup::new(0, "root".to_string(), Weak::new(), bandwidth));
        Self {
            groups: Mutex::new(vec![Arc::clone(&root)]),
            root,
            next_id: AtomicU64::new(1),
        }
    }

    /// The root group every real-time task starts in.
    pub(crate) fn root(&self) -> &Arc<RtGroup> {
        &self.root
    }

    /// Creates a child group under `parent` with the given grant.
    pub(crate) fn create_group(
        &self,
        parent: &Arc<RtGroup>,
        bandwidth: RtBandwidth,
    ) -> Result<Arc<RtGroup>> {
        bandwidth.validate()?;
        let mut children = parent.children.lock();
        let claimed: u64 = children
            .iter()
            .map(|child| child.bandwidth().ppm())
            .sum::<u64>()
            + bandwidth.ppm();
        let parent_ppm = parent.bandwidth().ppm();
        if claimed > parent_ppm {
            return Err(SchedError::BandwidthOvercommitted {
                claimed_ppm: claimed,
                parent_ppm,
            });
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let group = Arc::new(RtGroup::new(
            id,
            format!("{}/{}", parent.name(), id),
            Arc::downgrade(parent),
            bandwidth,
        ));
        children.push(Arc::clone(&group));
        drop(children);
        self.groups.lock().push(Arc::clone(&group));
        Ok(group)
    }

    /// Changes a group's grant, re-validating the tree around it.
    pub(crate) fn set_bandwidth(&self, group: &Arc<RtGroup>, bandwidth: RtBandwidth) -> Result<()> {
        bandwidth.validate()?;
        if bandwidth.runtime == Some(Time::ZERO) && group.nr_tasks() > 0 {
            return Err(SchedError::ZeroRuntimeWithRtTasks);
        }
        // The group must still fit beside its siblings.
        if let Some(parent) = group.parent.upgrade() {
            let children = parent.children.lock();
            let claimed: u64 = children
                .iter()
                .map(|child| {
                    if child.id() == group.id() {
                        bandwidth.ppm()
                    } else {
                        child.bandwidth().ppm()
                    }
                })
                .sum();
            let parent_ppm = parent.bandwidth().ppm();
            if claimed > parent_ppm {
                return Err(SchedError::BandwidthOvercommitted {
                    claimed_ppm: claimed,
                    parent_ppm,
                });
            }
        }
        // And its own children must still fit inside it.
        let children = group.children.lock();
        let claimed: u64 = children.iter().map(|child| child.bandwidth().ppm()).sum();
        if claimed > bandwidth.ppm() {
            return Err(SchedError::BandwidthOvercommitted {
                claimed_ppm: claimed,
                parent_ppm: bandwidth.ppm(),
            });
        }
        drop(children);
        *group.bandwidth.lock() = bandwidth;
        Ok(())
    }

    /// Groups due for a refill at `now`, with their overrun counts.
    ///
    /// Advances each due group's refill stamp by whole periods, so delayed
    /// timers pay back every missed period at once.
    pub(crate) fn due_refills(&self, now: Time) -> Vec<(Arc<RtGroup>, u64)> {
        let mut due = Vec::new();
        for group in self.groups.lock().iter() {
            let period = group.bandwidth().period;
            if period.is_zero() {
                continue;
            }
            let mut last = group.last_refill.lock();
            let elapsed = now.saturating_sub(*last);
            let overruns = elapsed.as_nanos() / period.as_nanos();
            if overruns == 0 {
                continue;
            }
            *last = last.saturating_add(period.saturating_mul(overruns));
            due.push((Arc::clone(group), overruns));
        }
        due
    }

    /// Shortest period among live groups, the timer's wake interval.
    pub(crate) fn min_period(&self) -> Time {
        self.groups
            .lock()
            .iter()
            .map(|g| g.bandwidth().period)
            .filter(|p| !p.is_zero())
            .min()
            .unwrap_or(Time::from_secs(1))
    }
}

#[derive(Debug, Default)]
struct TimerState {
    stop: bool,
}

/// Background thread driving periodic bandwidth refills.
///
/// Holds only a weak reference to the core, so dropping the scheduler also
/// winds down the timer. Tests that need determinism skip the timer and
/// call the core's period tick directly.
#[derive(Debug)]
pub struct PeriodTimer {
    state: Arc<(Mutex<TimerState>, Condvar)>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl PeriodTimer {
    pub(crate) fn spawn<F>(interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let state = Arc::new((Mutex::new(TimerState::default()), Condvar::new()));
        let shared = Arc::clone(&state);
        let thread = std::thread::Builder::new()
            .name("sched-rt-period".to_string())
            .spawn(move || {
                let (lock, cv) = &*shared;
                loop {
                    let mut guard = lock.lock();
                    if guard.stop {
                        break;
                    }
                    cv.wait_for(&mut guard, interval);
                    if guard.stop {
                        break;
                    }
                    drop(guard);
                    // `tick` returns false once the core is gone.
                    if !tick() {
                        break;
                    }
                }
            })
            .expect("spawning the bandwidth timer thread");
        Self {
            state,
            thread: Some(thread),
        }
    }
}

impl Drop for PeriodTimer {
    fn drop(&mut self) {
        let (lock, cv) = &*self.state;
        lock.lock().stop = true;
        cv.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
