//! The real-time class: fixed priorities, FIFO/RR, push/pull migration.
//!
//! Runnable real-time tasks sit in per-priority FIFOs; the highest
//! non-empty priority runs. Round-robin policy rotates within its level on
//! a fixed slice, first-in first-out never rotates. Bandwidth accounting
//! charges every tick the running task consumes to its group's per-cpu
//! budget; when the budget is exhausted the group's tasks are parked until
//! the period timer refills it (see `bandwidth`).
//!
//! # Migration
//!
//! Each runqueue publishes a priority ceiling (its most urgent runnable
//! real-time priority) into the root domain, plus an overload bit when
//! urgent work is queued behind a running real-time task. Wakers and the
//! dispatch loop use those to push tasks that cannot run locally toward the
//! lowest ceiling, and to pull more urgent work when a processor's own
//! ceiling drops. Push and pull run with no lock held and take pairs of
//! runqueue locks through the ordered double-lock helpers, revalidating
//! everything read before the locks were taken.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use crate::bandwidth::RtGroup;
use crate::rq::RqGuard;
use crate::sched::SchedCore;
use crate::task::Task;
use crate::types::{CpuId, DequeueFlags, EnqueueFlags, SchedPolicy, Time, WakeFlags};

use super::{ClassId, SchedClass};

/// Round-robin rotation slice.
const RR_SLICE: Time = Time::from_millis(100);

/// Push retry bound per invocation; each retry re-reads the world.
const MAX_PUSH_ATTEMPTS: usize = 3;

/// Per-runqueue real-time class state.
#[derive(Debug)]
pub struct RtRq {
    /// Waiting tasks by priority; the highest non-empty level runs next.
    /// The current task is not here.
    active: BTreeMap<i32, VecDeque<Arc<Task>>>,
    /// Tasks in `active` (excludes current and parked).
    nr_queued: usize,
    /// All runnable real-time tasks, including current and parked.
    nr_running: usize,
    /// Tasks of throttled groups, keyed by group id. Still runnable and
    /// still counted in `nr_running`; invisible to picking until refill.
    parked: BTreeMap<u64, VecDeque<Arc<Task>>>,
    /// Round-robin slice remaining for the current task.
    slice_left: Time,
}

impl RtRq {
    pub(crate) fn new() -> Self {
        Self {
            active: BTreeMap::new(),
            nr_queued: 0,
            nr_running: 0,
            parked: BTreeMap::new(),
            slice_left: Time::ZERO,
        }
    }

    /// Runnable real-time tasks on this queue, throttled included.
    #[inline]
    #[must_use]
    pub fn nr_running(&self) -> usize {
        self.nr_running
    }

    /// Highest priority with a waiting task.
    fn highest_queued(&self) -> Option<i32> {
        self.active.keys().next_back().copied()
    }

    fn push_active(&mut self, task: Arc<Task>, head: bool) {
        let level = self.active.entry(task.prio()).or_default();
        if head {
            level.push_front(task);
        } else {
            level.push_back(task);
        }
        self.nr_queued += 1;
    }

    fn pop_highest(&mut self) -> Option<Arc<Task>> {
        let (&prio, _) = self.active.iter().next_back()?;
        let level = self.active.get_mut(&prio)?;
        let task = level.pop_front();
        if level.is_empty() {
            self.active.remove(&prio);
        }
        if task.is_some() {
            self.nr_queued -= 1;
        }
        task
    }

    /// Removes a task wherever it waits. Returns false if it is not queued
    /// (for instance because it is the running task).
    fn remove(&mut self, task: &Task) -> bool {
        let mut found = None;
        for (&prio, level) in &mut self.active {
            if let Some(pos) = level.iter().position(|t| t.id() == task.id()) {
                level.remove(pos);
                self.nr_queued -= 1;
                found = Some(prio);
                break;
            }
        }
        if let Some(prio) = found {
            if self.active.get(&prio).is_some_and(VecDeque::is_empty) {
                self.active.remove(&prio);
            }
            return true;
        }
        let mut found = None;
        for (&gid, level) in &mut self.parked {
            if let Some(pos) = level.iter().position(|t| t.id() == task.id()) {
                level.remove(pos);
                found = Some(gid);
                break;
            }
        }
        if let Some(gid) = found {
            if self.parked.get(&gid).is_some_and(VecDeque::is_empty) {
                self.parked.remove(&gid);
            }
            return true;
        }
        false
    }

    fn is_queued(&self, task: &Task) -> bool {
        self.active
            .values()
            .any(|level| level.iter().any(|t| t.id() == task.id()))
    }
}

/// Recomputes this runqueue's ceiling and overload bit in its root domain.
///
/// The ceiling counts the running task; the overload bit is set only when
/// real-time work is queued behind a running real-time task, which is the
/// precondition for a profitable pull.
fn update_ceiling(rq: &mut RqGuard<'_>) {
    let cpu = rq.cpu();
    let mut top = rq.rt.highest_queued().unwrap_or(0);
    let curr_rt = rq.current.is_rt();
    if curr_rt {
        top = top.max(rq.current.prio());
    }
    let overloaded = curr_rt && rq.rt.nr_queued > 0;
    let rd = rq.outer().root_domain();
    rd.set_rt_ceiling(cpu, top);
    rd.set_rt_overloaded(cpu, overloaded);
}

/// Detaches a queued task from `src` and attaches it to `dst`, both locked.
fn move_queued(src: &mut RqGuard<'_>, dst: &mut RqGuard<'_>, task: &Arc<Task>) {
    let removed = src.rt.remove(task);
    debug_assert!(removed, "moving a task that is not queued");
    src.rt.nr_running -= 1;
    src.nr_running -= 1;
    update_ceiling(src);
    src.publish_load();

    task.set_cpu(dst.cpu());
    dst.rt.push_active(Arc::clone(task), false);
    dst.rt.nr_running += 1;
    dst.nr_running += 1;
    update_ceiling(dst);
    dst.publish_load();

    if task.prio() > dst.current.prio() {
        dst.resched_curr();
    }
    src.outer().stats().rt_migrations.increment();
}

/// Highest-priority queued task that could run elsewhere and cannot run
/// here right now.
fn next_pushable(rq: &RqGuard<'_>) -> Option<Arc<Task>> {
    let curr_prio = rq.current.prio();
    for level in rq.rt.active.values().rev() {
        for task in level {
            if task.prio() > curr_prio {
                // It preempts here as soon as dispatch runs; keep it.
                return None;
            }
            if task.affinity().weight() > 1 {
                return Some(Arc::clone(task));
            }
        }
    }
    None
}

/// Highest-priority queued task in `src` that `dst_cpu` may run and that
/// outranks `min_prio`.
fn find_pullable(src: &RqGuard<'_>, dst_cpu: CpuId, min_prio: i32) -> Option<Arc<Task>> {
    for (&prio, level) in src.rt.active.iter().rev() {
        if prio <= min_prio {
            return None;
        }
        for task in level {
            if task.affinity().contains(dst_cpu) {
                return Some(Arc::clone(task));
            }
        }
    }
    None
}

#[derive(Debug)]
pub(crate) struct RtClass;

impl RtClass {
    /// Parks every queued member of `group` and reschedules the current
    /// task if it belongs to the group. Called under the runqueue lock when
    /// the group's budget runs dry.
    fn throttle_group(&self, rq: &mut RqGuard<'_>, group: &RtGroup) {
        let gid = group.id();
        let mut parked = VecDeque::new();
        {
            let rt = &mut rq.rt;
            let mut empties = Vec::new();
            for (&prio, level) in &mut rt.active {
                let mut kept = VecDeque::new();
                while let Some(task) = level.pop_front() {
                    if task.rt_group().is_some_and(|g| g.id() == gid) {
                        rt.nr_queued -= 1;
                        parked.push_back(task);
                    } else {
                        kept.push_back(task);
                    }
                }
                *level = kept;
                if level.is_empty() {
                    empties.push(prio);
                }
            }
            for prio in empties {
                rt.active.remove(&prio);
            }
            if !parked.is_empty() {
                rt.parked.entry(gid).or_default().append(&mut parked);
            }
        }
        if rq.current.rt_group().map_or(false, |g| g.id() == gid) {
            rq.resched_curr();
        }
        update_ceiling(rq);
        rq.outer().stats().rt_throttles.increment();
        tracing::debug!(cpu = rq.cpu(), group = gid, "rt group throttled");
    }

    /// Returns a throttled group's tasks to the active queues. Called by
    /// the bandwidth period timer under the runqueue lock.
    pub(crate) fn unthrottle_group(&self, rq: &mut RqGuard<'_>, gid: u64) {
        let Some(mut parked) = rq.rt.parked.remove(&gid) else {
            return;
        };
        let mut top = 0;
        while let Some(task) = parked.pop_front() {
            top = top.max(task.prio());
            rq.rt.push_active(task, false);
        }
        if top > rq.current.prio() {
            rq.resched_curr();
        }
        update_ceiling(rq);
        rq.outer().stats().rt_unthrottles.increment();
        tracing::debug!(cpu = rq.cpu(), group = gid, "rt group unthrottled");
    }

    /// Pushes queued tasks that cannot run here toward processors with a
    /// strictly lower ceiling. No lock held on entry.
    fn push_tasks(&self, core: &SchedCore, cpu: CpuId) {
        for _ in 0..MAX_PUSH_ATTEMPTS {
            let src = core.rqs().lock(cpu);
            let Some(task) = next_pushable(&src) else {
                return;
            };
            let prio = task.prio();
            let rd = src.outer().root_domain();
            let allowed = task
                .affinity()
                .and(core.rqs().active_mask())
                .and(rd.span())
                .without(cpu);

            let mut target = None;
            let mut target_ceiling = prio;
            for candidate in allowed.iter() {
                let ceiling = rd.rt_ceiling(candidate);
                if ceiling < target_ceiling {
                    target = Some(candidate);
                    target_ceiling = ceiling;
                }
            }
            let Some(target) = target else {
                return;
            };

            let (mut src, mut dst, dropped) = core.rqs().double_lock_balance(src, target);
            if dropped {
                // The world may have moved while the locks were down.
                if task.cpu() != cpu || !task.on_rq() || !src.rt.is_queued(&task) {
                    continue;
                }
            }
            let dst_top = dst
                .rt
                .highest_queued()
                .unwrap_or(0)
                .max(if dst.current.is_rt() { dst.current.prio() } else { 0 });
            if !dst.outer().is_active() || dst_top >= prio {
                continue;
            }
            move_queued(&mut src, &mut dst, &task);
        }
    }

    /// Pulls more urgent work from overloaded processors when this
    /// processor's ceiling is dropping. No lock held on entry.
    fn pull_tasks_from_overloaded(&self, core: &SchedCore, this_cpu: CpuId) {
        let rd = core.rqs().rq(this_cpu).root_domain();
        if !rd.span().contains(this_cpu) {
            return;
        }
        let this_ceiling = rd.rt_ceiling(this_cpu);
        for src_cpu in rd.rt_overloaded().iter() {
            if src_cpu == this_cpu {
                continue;
            }
            if rd.rt_ceiling(src_cpu) <= this_ceiling {
                continue;
            }
            let (mut dst, mut src) = core.rqs().double_lock(this_cpu, src_cpu);
            let min_prio = dst
                .rt
                .highest_queued()
                .unwrap_or(0)
                .max(if dst.current.is_rt() { dst.current.prio() } else { 0 });
            if let Some(task) = find_pullable(&src, this_cpu, min_prio) {
                move_queued(&mut src, &mut dst, &task);
            }
        }
    }
}

impl SchedClass for RtClass {
    fn id(&self) -> ClassId {
        ClassId::Rt
    }

    fn enqueue(&self, rq: &mut RqGuard<'_>, task: &Arc<Task>, flags: EnqueueFlags) {
        // A task joining the class while running stays out of the wait
        // queues; it is already current.
        if rq.current.id() != task.id() {
            let throttled_group = task
                .rt_group()
                .filter(|g| g.is_throttled(rq.cpu()))
                .map(|g| g.id());
            if let Some(gid) = throttled_group {
                rq.rt.parked.entry(gid).or_default().push_back(Arc::clone(task));
            } else {
                rq.rt
                    .push_active(Arc::clone(task), flags.contains(EnqueueFlags::HEAD));
            }
        }
        rq.rt.nr_running += 1;
        update_ceiling(rq);
    }

    fn dequeue(&self, rq: &mut RqGuard<'_>, task: &Arc<Task>, _flags: DequeueFlags) {
        // The current task is not queued; only the counters change for it.
        rq.rt.remove(task);
        rq.rt.nr_running -= 1;
        update_ceiling(rq);
    }

    fn yield_task(&self, rq: &mut RqGuard<'_>) {
        rq.rt.slice_left = Time::ZERO;
    }

    fn check_preempt_curr(&self, rq: &mut RqGuard<'_>, task: &Arc<Task>, _flags: WakeFlags) {
        // Strictly higher priority preempts; equal priority waits its turn.
        if task.prio() > rq.current.prio() {
            rq.resched_curr();
        }
    }

    fn pick_next(&self, rq: &mut RqGuard<'_>) -> Option<Arc<Task>> {
        rq.rt.pop_highest()
    }

    fn put_prev(&self, rq: &mut RqGuard<'_>, task: &Arc<Task>) {
        if !task.on_rq() {
            update_ceiling(rq);
            return;
        }
        let throttled_group = task
            .rt_group()
            .filter(|g| g.is_throttled(rq.cpu()))
            .map(|g| g.id());
        if let Some(gid) = throttled_group {
            rq.rt.parked.entry(gid).or_default().push_back(Arc::clone(task));
        } else {
            rq.rt.push_active(Arc::clone(task), false);
        }
        update_ceiling(rq);
    }

    fn set_curr(&self, rq: &mut RqGuard<'_>) {
        rq.rt.slice_left = if rq.current.policy() == SchedPolicy::RoundRobin {
            RR_SLICE
        } else {
            Time::ZERO
        };
        update_ceiling(rq);
    }

    fn task_tick(&self, rq: &mut RqGuard<'_>, task: &Arc<Task>, tick: Time) {
        if let Some(group) = task.rt_group() {
            if group.charge(rq.cpu(), tick) {
                self.throttle_group(rq, &group);
                return;
            }
        }
        if task.policy() != SchedPolicy::RoundRobin {
            return;
        }
        rq.rt.slice_left = rq.rt.slice_left.saturating_sub(tick);
        if rq.rt.slice_left.is_zero() {
            rq.rt.slice_left = RR_SLICE;
            // Rotate only when a peer at the same level is waiting.
            let has_peer = rq
                .rt
                .active
                .get(&task.prio())
                .map_or(false, |level| !level.is_empty());
            if has_peer {
                rq.resched_curr();
            }
        }
    }

    fn select_task_rq(
        &self,
        core: &SchedCore,
        task: &Arc<Task>,
        prev_cpu: CpuId,
        _flags: WakeFlags,
    ) -> CpuId {
        let allowed = task.affinity().and(core.rqs().active_mask());
        if allowed.is_empty() {
            return prev_cpu;
        }
        let prio = task.prio();
        let rd = core.rqs().rq(prev_cpu).root_domain();
        if allowed.contains(prev_cpu) && rd.rt_ceiling(prev_cpu) < prio {
            return prev_cpu;
        }
        let mut best = prev_cpu;
        let mut best_ceiling = i32::MAX;
        for cpu in allowed.iter() {
            let ceiling = rd.rt_ceiling(cpu);
            if ceiling < best_ceiling {
                best = cpu;
                best_ceiling = ceiling;
            }
        }
        if best_ceiling < prio {
            best
        } else if allowed.contains(prev_cpu) {
            prev_cpu
        } else {
            best
        }
    }

    fn task_woken(&self, core: &SchedCore, task: &Arc<Task>) {
        // If it did not preempt where it landed, try to run it elsewhere.
        if task.on_rq() {
            self.push_tasks(core, task.cpu());
        }
    }

    fn pre_schedule(&self, core: &SchedCore, cpu: CpuId) {
        self.pull_tasks_from_overloaded(core, cpu);
    }

    fn post_schedule(&self, core: &SchedCore, cpu: CpuId) {
        self.push_tasks(core, cpu);
    }

    fn switched_to(&self, rq: &mut RqGuard<'_>, task: &Arc<Task>) {
        if task.on_rq() && task.prio() > rq.current.prio() {
            rq.resched_curr();
        }
        update_ceiling(rq);
    }

    fn switched_from(&self, rq: &mut RqGuard<'_>, _task: &Arc<Task>) {
        update_ceiling(rq);
    }

    fn prio_changed(&self, rq: &mut RqGuard<'_>, task: &Arc<Task>, old_prio: i32) {
        if !task.on_rq() {
            return;
        }
        // Re-file under the new priority.
        if rq.rt.remove(task) {
            rq.rt.push_active(Arc::clone(task), false);
        }
        if task.prio() > old_prio && task.prio() > rq.current.prio() {
            rq.resched_curr();
        }
        update_ceiling(rq);
    }

    fn rr_interval(&self, task: &Arc<Task>) -> Option<Time> {
        (task.policy() == SchedPolicy::RoundRobin).then_some(RR_SLICE)
    }
}
