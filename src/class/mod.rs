//! Scheduling-class dispatch.
//!
//! Every scheduling decision goes through a fixed chain of classes, highest
//! urgency first: stop, real-time, fair, idle. Picking the next task walks
//! the chain and takes the first hit; the idle class always yields the
//! processor's idle task, so a pick can never come up empty. Preemption
//! between classes is decided purely by chain position; only a wake-up into
//! the running task's own class consults that class's policy.
//!
//! Class methods that touch queue state take the locked runqueue
//! ([`RqGuard`]); hooks that need to take other runqueue locks
//! (`task_woken`, `pre_schedule`, `post_schedule`) run with no lock held so
//! they can use the ordered double-lock helpers without inversion.

use core::fmt;
use std::sync::Arc;

use crate::rq::RqGuard;
use crate::sched::SchedCore;
use crate::task::Task;
use crate::types::{CpuId, DequeueFlags, EnqueueFlags, Time, WakeFlags};

mod fair;
mod idle;
mod rt;
mod stop;

pub use fair::FairRq;
pub use rt::RtRq;

pub(crate) use fair::FairClass;
pub(crate) use idle::IdleClass;
pub(crate) use rt::RtClass;
pub(crate) use stop::StopClass;

/// Identity of a scheduling class, ordered by urgency.
///
/// The discriminant is the class's position in the dispatch chain; a
/// smaller value preempts a larger one unconditionally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ClassId {
    /// Per-processor stopper; runs migration callbacks, preempts everything.
    Stop = 0,
    /// Fixed-priority real-time tasks.
    Rt = 1,
    /// Weighted time-sharing tasks.
    Fair = 2,
    /// The per-processor idle task.
    Idle = 3,
}

impl ClassId {
    /// Decodes a stored class byte. Unknown values map to `Fair`, the
    /// default class.
    #[must_use]
    pub(crate) const fn from_u8(bits: u8) -> Self {
        match bits {
            0 => Self::Stop,
            1 => Self::Rt,
            3 => Self::Idle,
            _ => Self::Fair,
        }
    }

    /// True if `self` preempts `other` by chain position alone.
    #[inline]
    #[must_use]
    pub fn preempts(self, other: Self) -> bool {
        (self as u8) < (other as u8)
    }
}

/// A scheduling class plug-in.
///
/// Implementations own their per-runqueue queue structure (embedded in
/// `RqInner`) and are stateless beyond it; the same instance serves every
/// processor. Methods taking `&mut RqGuard` run under that runqueue's lock.
pub(crate) trait SchedClass: Send + Sync + fmt::Debug {
    /// The class's identity.
    fn id(&self) -> ClassId;

    /// Adds a runnable task to the queue.
    fn enqueue(&self, rq: &mut RqGuard<'_>, task: &Arc<Task>, flags: EnqueueFlags);

    /// Removes a task from the queue.
    fn dequeue(&self, rq: &mut RqGuard<'_>, task: &Arc<Task>, flags: DequeueFlags);

    /// The current task voluntarily yields the processor.
    fn yield_task(&self, rq: &mut RqGuard<'_>);

    /// A task of this class woke on this runqueue while a task of the same
    /// class is running; decide whether to preempt.
    fn check_preempt_curr(&self, rq: &mut RqGuard<'_>, task: &Arc<Task>, flags: WakeFlags);

    /// Picks the most urgent runnable task, or `None` to fall through to
    /// the next class in the chain.
    fn pick_next(&self, rq: &mut RqGuard<'_>) -> Option<Arc<Task>>;

    /// The previously running task is being switched out.
    fn put_prev(&self, rq: &mut RqGuard<'_>, task: &Arc<Task>);

    /// A task of this class just became `current` on this runqueue.
    fn set_curr(&self, rq: &mut RqGuard<'_>);

    /// Periodic tick accounting for the running task.
    fn task_tick(&self, rq: &mut RqGuard<'_>, task: &Arc<Task>, tick: Time);

    /// Chooses the processor a waking (or forking) task should run on.
    /// Called with no runqueue lock held; the returned processor is a hint
    /// that the caller revalidates against affinity and activity.
    fn select_task_rq(
        &self,
        core: &SchedCore,
        task: &Arc<Task>,
        prev_cpu: CpuId,
        flags: WakeFlags,
    ) -> CpuId;

    /// Runs after a wake-up completes and the runqueue lock has been
    /// dropped. Real-time uses this to push the task elsewhere when it
    /// cannot run here immediately.
    fn task_woken(&self, core: &SchedCore, task: &Arc<Task>) {
        let _ = (core, task);
    }

    /// Runs before dispatch picks on `cpu`, no lock held. Real-time uses
    /// this to pull urgent work when this processor's ceiling is dropping.
    fn pre_schedule(&self, core: &SchedCore, cpu: CpuId) {
        let _ = (core, cpu);
    }

    /// Runs after dispatch commits on `cpu`, no lock held.
    fn post_schedule(&self, core: &SchedCore, cpu: CpuId) {
        let _ = (core, cpu);
    }

    /// The task left this class (policy change). Lock held.
    fn switched_from(&self, rq: &mut RqGuard<'_>, task: &Arc<Task>) {
        let _ = (rq, task);
    }

    /// The task joined this class (policy change). Lock held.
    fn switched_to(&self, rq: &mut RqGuard<'_>, task: &Arc<Task>);

    /// The task's priority changed within this class. Lock held.
    fn prio_changed(&self, rq: &mut RqGuard<'_>, task: &Arc<Task>, old_prio: i32);

    /// The round-robin interval for `task`, if the class rotates.
    fn rr_interval(&self, task: &Arc<Task>) -> Option<Time> {
        let _ = task;
        None
    }

    /// Pulls up to `max_tasks` runnable tasks from `src` into `dst`, both
    /// locked, stopping early once `max_load` weight has moved. Returns the
    /// number moved. Classes that never balance keep the default.
    fn pull_tasks(
        &self,
        src: &mut RqGuard<'_>,
        dst: &mut RqGuard<'_>,
        max_tasks: usize,
        max_load: u64,
    ) -> usize {
        let _ = (src, dst, max_tasks, max_load);
        0
    }
}

/// The fixed dispatch chain, shared by all processors.
#[derive(Debug)]
pub(crate) struct Classes {
    stop: StopClass,
    rt: RtClass,
    fair: FairClass,
    idle: IdleClass,
}

impl Classes {
    pub(crate) fn new() -> Self {
        Self {
            stop: StopClass,
            rt: RtClass,
            fair: FairClass,
            idle: IdleClass,
        }
    }

    /// Resolves a class id to its implementation.
    pub(crate) fn get(&self, id: ClassId) -> &dyn SchedClass {
        match id {
            ClassId::Stop => &self.stop,
            ClassId::Rt => &self.rt,
            ClassId::Fair => &self.fair,
            ClassId::Idle => &self.idle,
        }
    }

    /// The chain in dispatch order.
    pub(crate) fn chain(&self) -> [&dyn SchedClass; 4] {
        [&self.stop, &self.rt, &self.fair, &self.idle]
    }

    /// Direct access to the fair class (load balancer).
    pub(crate) fn fair(&self) -> &FairClass {
        &self.fair
    }

    /// Direct access to the real-time class (bandwidth timer).
    pub(crate) fn rt(&self) -> &RtClass {
        &self.rt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_id_round_trips() {
        for id in [ClassId::Stop, ClassId::Rt, ClassId::Fair, ClassId::Idle] {
            assert_eq!(ClassId::from_u8(id as u8), id);
        }
        assert_eq!(ClassId::from_u8(0xff), ClassId::Fair);
    }

    #[test]
    fn chain_order_matches_urgency() {
        let classes = Classes::new();
        let chain = classes.chain();
        assert_eq!(chain[0].id(), ClassId::Stop);
        assert_eq!(chain[1].id(), ClassId::Rt);
        assert_eq!(chain[2].id(), ClassId::Fair);
        assert_eq!(chain[3].id(), ClassId::Idle);
        assert!(ClassId::Stop.preempts(ClassId::Rt));
        assert!(ClassId::Rt.preempts(ClassId::Fair));
        assert!(ClassId::Fair.preempts(ClassId::Idle));
        assert!(!ClassId::Idle.preempts(ClassId::Idle));
    }
}
