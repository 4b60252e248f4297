//! The stop class: highest urgency, runs cross-processor callbacks.
//!
//! Each processor owns one stopper task. It becomes runnable exactly when
//! its runqueue has pending stop work (a queued migration or an
//! active-balance request) and preempts everything else at the next
//! dispatch. The work itself is executed by the dispatch loop once the
//! stopper is current; this class only decides when the stopper runs.

use std::sync::Arc;

use crate::rq::RqGuard;
use crate::sched::SchedCore;
use crate::task::Task;
use crate::types::{CpuId, DequeueFlags, EnqueueFlags, Time, WakeFlags};

use super::{ClassId, SchedClass};

#[derive(Debug)]
pub(crate) struct StopClass;

impl SchedClass for StopClass {
    fn id(&self) -> ClassId {
        ClassId::Stop
    }

    fn enqueue(&self, _rq: &mut RqGuard<'_>, _task: &Arc<Task>, _flags: EnqueueFlags) {
        unreachable!("stopper tasks are never enqueued");
    }

    fn dequeue(&self, _rq: &mut RqGuard<'_>, _task: &Arc<Task>, _flags: DequeueFlags) {
        unreachable!("stopper tasks are never dequeued");
    }

    fn yield_task(&self, _rq: &mut RqGuard<'_>) {}

    fn check_preempt_curr(&self, _rq: &mut RqGuard<'_>, _task: &Arc<Task>, _flags: WakeFlags) {
        // Nothing outranks a running stopper.
    }

    fn pick_next(&self, rq: &mut RqGuard<'_>) -> Option<Arc<Task>> {
        let outer = rq.outer();
        if outer.has_stop_work() || outer.active_balance_pending() {
            Some(Arc::clone(&rq.stopper))
        } else {
            None
        }
    }

    fn put_prev(&self, _rq: &mut RqGuard<'_>, _task: &Arc<Task>) {}

    fn set_curr(&self, _rq: &mut RqGuard<'_>) {}

    fn task_tick(&self, _rq: &mut RqGuard<'_>, _task: &Arc<Task>, _tick: Time) {}

    fn select_task_rq(
        &self,
        _core: &SchedCore,
        task: &Arc<Task>,
        _prev_cpu: CpuId,
        _flags: WakeFlags,
    ) -> CpuId {
        // Stoppers are pinned.
        task.cpu()
    }

    fn switched_to(&self, _rq: &mut RqGuard<'_>, _task: &Arc<Task>) {}

    fn prio_changed(&self, _rq: &mut RqGuard<'_>, _task: &Arc<Task>, _old_prio: i32) {}
}
