//! The fair class: weighted round-robin time sharing.
//!
//! Runnable fair tasks wait in a single FIFO per runqueue; the running task
//! is not in the list but stays counted. Each task runs for a slice
//! proportional to its load weight, then rotates to the tail. Placement
//! prefers the task's previous processor while it is idle and otherwise
//! picks the least-loaded allowed processor from the lock-free load
//! mirrors.
//!
//! This is also the only class the periodic balancer moves tasks for;
//! [`FairClass::pull_tasks`] detaches from the tail of the source FIFO
//! (the coldest tasks) and honors affinity per candidate.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::rq::RqGuard;
use crate::sched::SchedCore;
use crate::task::Task;
use crate::types::{CpuId, DequeueFlags, EnqueueFlags, Time, WakeFlags, NICE_0_LOAD};

use super::{ClassId, SchedClass};

/// Slice granted to a nice-0 task before it rotates.
const BASE_SLICE: Time = Time::from_millis(10);

/// Lower bound on any slice, so heavy queues still make progress.
const MIN_SLICE: Time = Time::from_millis(1);

/// Per-runqueue fair-class state.
#[derive(Debug)]
pub struct FairRq {
    /// Waiting tasks, head runs next. The current task is not here.
    queue: VecDeque<Arc<Task>>,
    /// Runnable fair tasks, including the current one.
    nr_running: usize,
    /// Aggregate weight of runnable fair tasks.
    load: u64,
    /// Slice remaining for the current task.
    slice_left: Time,
}

impl FairRq {
    pub(crate) fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            nr_running: 0,
            load: 0,
            slice_left: Time::ZERO,
        }
    }

    /// Runnable fair tasks on this queue.
    #[inline]
    #[must_use]
    pub fn nr_running(&self) -> usize {
        self.nr_running
    }

    /// Aggregate fair load weight.
    #[inline]
    #[must_use]
    pub fn load(&self) -> u64 {
        self.load
    }

    fn remove(&mut self, task: &Task) -> bool {
        if let Some(pos) = self.queue.iter().position(|t| t.id() == task.id()) {
            self.queue.remove(pos);
            true
        } else {
            false
        }
    }
}

fn slice_for(weight: u64) -> Time {
    let ns = BASE_SLICE.as_nanos().saturating_mul(weight) / NICE_0_LOAD;
    Time::from_nanos(ns).max(MIN_SLICE)
}

#[derive(Debug)]
pub(crate) struct FairClass;

impl SchedClass for FairClass {
    fn id(&self) -> ClassId {
        ClassId::Fair
    }

    fn enqueue(&self, rq: &mut RqGuard<'_>, task: &Arc<Task>, flags: EnqueueFlags) {
        let weight = task.load_weight();
        // A task joining the class while running stays out of the wait
        // list; it is already current.
        if rq.current.id() != task.id() {
            if flags.contains(EnqueueFlags::HEAD) {
                rq.fair.queue.push_front(Arc::clone(task));
            } else {
                rq.fair.queue.push_back(Arc::clone(task));
            }
        }
        rq.fair.nr_running += 1;
        rq.fair.load += weight;
        rq.load_weight += weight;
    }

    fn dequeue(&self, rq: &mut RqGuard<'_>, task: &Arc<Task>, _flags: DequeueFlags) {
        // The current task is not in the list; only the counters change.
        rq.fair.remove(task);
        let weight = task.load_weight();
        rq.fair.nr_running -= 1;
        rq.fair.load = rq.fair.load.saturating_sub(weight);
        rq.load_weight = rq.load_weight.saturating_sub(weight);
    }

    fn yield_task(&self, rq: &mut RqGuard<'_>) {
        rq.fair.slice_left = Time::ZERO;
    }

    fn check_preempt_curr(&self, rq: &mut RqGuard<'_>, task: &Arc<Task>, _flags: WakeFlags) {
        // Background (idle-policy) current yields to a normal wake-up.
        if task.prio() > rq.current.prio() {
            rq.resched_curr();
        }
    }

    fn pick_next(&self, rq: &mut RqGuard<'_>) -> Option<Arc<Task>> {
        rq.fair.queue.pop_front()
    }

    fn put_prev(&self, rq: &mut RqGuard<'_>, task: &Arc<Task>) {
        if task.on_rq() {
            rq.fair.queue.push_back(Arc::clone(task));
        }
    }

    fn set_curr(&self, rq: &mut RqGuard<'_>) {
        let weight = rq.current.load_weight();
        rq.fair.slice_left = slice_for(weight);
    }

    fn task_tick(&self, rq: &mut RqGuard<'_>, _task: &Arc<Task>, tick: Time) {
        rq.fair.slice_left = rq.fair.slice_left.saturating_sub(tick);
        if rq.fair.slice_left.is_zero() && !rq.fair.queue.is_empty() {
            rq.resched_curr();
        }
    }

    fn select_task_rq(
        &self,
        core: &SchedCore,
        task: &Arc<Task>,
        prev_cpu: CpuId,
        flags: WakeFlags,
    ) -> CpuId {
        let allowed = task.affinity().and(core.rqs().active_mask());
        if allowed.is_empty() {
            // Caller runs the fallback path.
            return prev_cpu;
        }

        // Sticking to the previous processor keeps whatever cache warmth is
        // left; only worth it when it is not busy with something else.
        if !flags.contains(WakeFlags::FORK)
            && allowed.contains(prev_cpu)
            && core.rqs().rq(prev_cpu).nr_running_estimate() == 0
        {
            return prev_cpu;
        }

        let mut best = prev_cpu;
        let mut best_load = u64::MAX;
        for cpu in allowed.iter() {
            let load = core.rqs().rq(cpu).load_estimate();
            if load < best_load || (load == best_load && cpu == prev_cpu) {
                best = cpu;
                best_load = load;
            }
        }
        best
    }

    fn switched_to(&self, rq: &mut RqGuard<'_>, task: &Arc<Task>) {
        if task.on_rq() && task.prio() > rq.current.prio() {
            rq.resched_curr();
        }
    }

    fn prio_changed(&self, rq: &mut RqGuard<'_>, task: &Arc<Task>, old_prio: i32) {
        if task.on_rq() && task.prio() > old_prio && task.prio() > rq.current.prio() {
            rq.resched_curr();
        }
    }

    fn rr_interval(&self, task: &Arc<Task>) -> Option<Time> {
        Some(slice_for(task.load_weight()))
    }

    fn pull_tasks(
        &self,
        src: &mut RqGuard<'_>,
        dst: &mut RqGuard<'_>,
        max_tasks: usize,
        max_load: u64,
    ) -> usize {
        let dst_cpu = dst.cpu();
        let mut moved = 0;
        let mut moved_load = 0u64;
        // Walk from the tail: those tasks waited longest and are coldest.
        let mut idx = src.fair.queue.len();
        while idx > 0 && moved < max_tasks && moved_load < max_load {
            idx -= 1;
            let candidate = &src.fair.queue[idx];
            if !candidate.affinity().contains(dst_cpu) {
                continue;
            }
            let task = src
                .fair
                .queue
                .remove(idx)
                .unwrap_or_else(|| unreachable!("index in bounds"));
            let weight = task.load_weight();

            src.fair.nr_running -= 1;
            src.fair.load = src.fair.load.saturating_sub(weight);
            src.load_weight = src.load_weight.saturating_sub(weight);
            src.nr_running -= 1;

            task.set_cpu(dst_cpu);

            dst.fair.queue.push_back(Arc::clone(&task));
            dst.fair.nr_running += 1;
            dst.fair.load += weight;
            dst.load_weight += weight;
            dst.nr_running += 1;

            moved += 1;
            moved_load += weight;
        }
        if moved > 0 {
            src.publish_load();
            dst.publish_load();
        }
        moved
    }
}
