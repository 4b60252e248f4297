//! The idle class: last in the chain, never empty-handed.
//!
//! Each processor owns one idle task, created with the runqueue and pinned
//! for life. It is never enqueued or dequeued; the class simply hands it
//! out whenever every other class declines, and stamps the runqueue clock
//! so the next wake-up can measure how long the processor idled.

use std::sync::Arc;

use crate::rq::RqGuard;
use crate::sched::SchedCore;
use crate::task::Task;
use crate::types::{CpuId, DequeueFlags, EnqueueFlags, Time, WakeFlags};

use super::{ClassId, SchedClass};

#[derive(Debug)]
pub(crate) struct IdleClass;

impl SchedClass for IdleClass {
    fn id(&self) -> ClassId {
        ClassId::Idle
    }

    fn enqueue(&self, _rq: &mut RqGuard<'_>, _task: &Arc<Task>, _flags: EnqueueFlags) {
        unreachable!("idle tasks are never enqueued");
    }

    fn dequeue(&self, _rq: &mut RqGuard<'_>, _task: &Arc<Task>, _flags: DequeueFlags) {
        unreachable!("idle tasks are never dequeued");
    }

    fn yield_task(&self, _rq: &mut RqGuard<'_>) {}

    fn check_preempt_curr(&self, rq: &mut RqGuard<'_>, _task: &Arc<Task>, _flags: WakeFlags) {
        // Anything beats idle.
        rq.resched_curr();
    }

    fn pick_next(&self, rq: &mut RqGuard<'_>) -> Option<Arc<Task>> {
        Some(Arc::clone(&rq.idle))
    }

    fn put_prev(&self, _rq: &mut RqGuard<'_>, _task: &Arc<Task>) {}

    fn set_curr(&self, rq: &mut RqGuard<'_>) {
        let now = rq.clock;
        rq.idle_stamp = now;
    }

    fn task_tick(&self, _rq: &mut RqGuard<'_>, _task: &Arc<Task>, _tick: Time) {}

    fn select_task_rq(
        &self,
        _core: &SchedCore,
        task: &Arc<Task>,
        _prev_cpu: CpuId,
        _flags: WakeFlags,
    ) -> CpuId {
        // Idle tasks are pinned; there is nothing to choose.
        task.cpu()
    }

    fn switched_to(&self, _rq: &mut RqGuard<'_>, _task: &Arc<Task>) {}

    fn prio_changed(&self, _rq: &mut RqGuard<'_>, _task: &Arc<Task>, _old_prio: i32) {}
}
