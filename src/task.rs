//! Task records and the task table.
//!
//! A [`Task`] is the schedulable entity: policy, effective priority, the
//! scheduling class currently serving it, a processor affinity mask, the
//! processor it is assigned to, and an on-runqueue flag. Records are shared
//! as `Arc<Task>`; hot fields are atomics whose mutation discipline is the
//! owning runqueue's lock (see `rq`), so cross-processor readers get a
//! coherent view without taking the task table lock.
//!
//! Ownership: a task is held by at most one runqueue at a time. The
//! `on_rq`/`cpu` pair only changes while holding the owning runqueue's lock
//! (or both locks during a migration), which is what makes the lock-free
//! "read cpu, lock, re-check" pattern in `RunqueueSet::lock_task_rq` sound.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::bandwidth::RtGroup;
use crate::class::ClassId;
use crate::types::{
    rt_prio, CpuId, CpuMask, SchedPolicy, StateMask, TaskId, TaskState, DEFAULT_PRIO, IDLE_PRIO,
    NICE_0_LOAD, RT_PRIO_BASE, STOP_PRIO,
};
use crate::util::Arena;

/// Weight of an idle-policy (background) fair task.
const IDLE_POLICY_LOAD: u64 = 3;

/// Description of a task to admit into the scheduler.
#[derive(Debug, Clone)]
pub struct TaskDesc {
    /// Debug name.
    pub name: String,
    /// Requested policy.
    pub policy: SchedPolicy,
    /// Real-time priority within `0..100`; ignored for fair policies.
    pub rt_priority: u32,
    /// Processor affinity.
    pub affinity: CpuMask,
    /// Fair load weight; defaults from the policy when `None`.
    pub weight: Option<u64>,
}

impl Default for TaskDesc {
    fn default() -> Self {
        Self {
            name: String::new(),
            policy: SchedPolicy::Normal,
            rt_priority: 0,
            affinity: CpuMask::from_bits(u64::MAX),
            weight: None,
        }
    }
}

impl TaskDesc {
    /// A default-policy task with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets the policy.
    #[must_use]
    pub fn policy(mut self, policy: SchedPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the real-time priority (`0..100`, higher is more urgent).
    #[must_use]
    pub fn rt_priority(mut self, rt_priority: u32) -> Self {
        self.rt_priority = rt_priority;
        self
    }

    /// Restricts affinity.
    #[must_use]
    pub fn affinity(mut self, affinity: CpuMask) -> Self {
        self.affinity = affinity;
        self
    }

    /// Overrides the fair load weight.
    #[must_use]
    pub fn weight(mut self, weight: u64) -> Self {
        self.weight = Some(weight);
        self
    }

    /// Effective priority this description maps to.
    #[must_use]
    pub(crate) fn effective_prio(&self) -> i32 {
        match self.policy {
            SchedPolicy::Fifo | SchedPolicy::RoundRobin => {
                RT_PRIO_BASE + self.rt_priority.min(99) as i32
            }
            SchedPolicy::Idle => IDLE_PRIO + 1,
            SchedPolicy::Normal | SchedPolicy::Batch => DEFAULT_PRIO,
        }
    }

    /// Load weight this description maps to.
    #[must_use]
    pub(crate) fn effective_weight(&self) -> u64 {
        self.weight.unwrap_or(match self.policy {
            SchedPolicy::Idle => IDLE_POLICY_LOAD,
            _ => NICE_0_LOAD,
        })
    }
}

/// A schedulable task.
#[derive(Debug)]
pub struct Task {
    id: TaskId,
    name: String,
    /// Requested policy; encoded `SchedPolicy`, mutated under the owning
    /// runqueue's lock by `setscheduler`.
    policy: AtomicU8,
    /// Effective priority; may sit above the policy's natural priority
    /// while boosted by priority inheritance.
    prio: AtomicI32,
    /// The class currently serving this task. Changes only under the
    /// owning runqueue's lock (policy change or boost).
    class: AtomicU8,
    /// Wake-up state machine state.
    state: AtomicU8,
    /// Processor this task is assigned to.
    cpu: AtomicUsize,
    /// True while some runqueue holds this task.
    on_rq: AtomicBool,
    /// Affinity mask, stored as raw bits for lock-free readers.
    affinity: AtomicU64,
    /// Fair-class load weight.
    load_weight: AtomicU64,
    /// Set while the task blocks on I/O (iowait accounting).
    in_iowait: AtomicBool,
    /// Processor whose iowait counter this sleep incremented. Retargeting a
    /// blocked task moves its `cpu`, not this.
    iowait_cpu: AtomicUsize,
    /// Bandwidth group for real-time accounting.
    rt_group: Mutex<Option<Arc<RtGroup>>>,
}

impl Task {
    pub(crate) fn new(id: TaskId, desc: &TaskDesc) -> Self {
        let class = match desc.policy {
            SchedPolicy::Fifo | SchedPolicy::RoundRobin => ClassId::Rt,
            _ => ClassId::Fair,
        };
        Self {
            id,
            name: desc.name.clone(),
            policy: AtomicU8::new(encode_policy(desc.policy)),
            prio: AtomicI32::new(desc.effective_prio()),
            class: AtomicU8::new(class as u8),
            state: AtomicU8::new(TaskState::Interruptible as u8),
            cpu: AtomicUsize::new(0),
            on_rq: AtomicBool::new(false),
            affinity: AtomicU64::new(desc.affinity.bits()),
            load_weight: AtomicU64::new(desc.effective_weight()),
            in_iowait: AtomicBool::new(false),
            iowait_cpu: AtomicUsize::new(0),
            rt_group: Mutex::new(None),
        }
    }

    /// Builds the dedicated per-processor idle task.
    pub(crate) fn new_idle(id: TaskId, cpu: CpuId) -> Self {
        let task = Self::new(
            id,
            &TaskDesc::new(format!("idle/{cpu}")).affinity(CpuMask::single(cpu)),
        );
        task.prio.store(IDLE_PRIO, Ordering::Relaxed);
        task.class.store(ClassId::Idle as u8, Ordering::Relaxed);
        task.state.store(TaskState::Running as u8, Ordering::Relaxed);
        task.cpu.store(cpu, Ordering::Relaxed);
        task
    }

    /// Builds the dedicated per-processor stopper task.
    pub(crate) fn new_stopper(id: TaskId, cpu: CpuId) -> Self {
        let task = Self::new(
            id,
            &TaskDesc::new(format!("stopper/{cpu}")).affinity(CpuMask::single(cpu)),
        );
        task.prio.store(STOP_PRIO, Ordering::Relaxed);
        task.class.store(ClassId::Stop as u8, Ordering::Relaxed);
        task.cpu.store(cpu, Ordering::Relaxed);
        task
    }

    /// Task id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Debug name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current policy.
    #[inline]
    #[must_use]
    pub fn policy(&self) -> SchedPolicy {
        decode_policy(self.policy.load(Ordering::Relaxed))
    }

    pub(crate) fn set_policy(&self, policy: SchedPolicy) {
        self.policy.store(encode_policy(policy), Ordering::Relaxed);
    }

    /// Effective priority.
    #[inline]
    #[must_use]
    pub fn prio(&self) -> i32 {
        self.prio.load(Ordering::Relaxed)
    }

    pub(crate) fn set_prio(&self, prio: i32) {
        self.prio.store(prio, Ordering::Relaxed);
    }

    /// True if the effective priority is in the real-time range.
    #[inline]
    #[must_use]
    pub fn is_rt(&self) -> bool {
        rt_prio(self.prio())
    }

    /// The class currently serving this task.
    #[inline]
    #[must_use]
    pub fn class(&self) -> ClassId {
        ClassId::from_u8(self.class.load(Ordering::Relaxed))
    }

    /// Swaps the serving class. Caller holds the owning runqueue's lock.
    pub(crate) fn set_class(&self, class: ClassId) {
        self.class.store(class as u8, Ordering::Relaxed);
    }

    /// Current wake-up state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> TaskState {
        TaskState::from_bits(self.state.load(Ordering::Acquire))
    }

    /// Stores a new state with release ordering, so writes made before a
    /// wake-up are visible to whoever observes the new state.
    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Atomically claims a blocked task for wake-up: transitions any state
    /// accepted by `mask` to `Waking` and returns the observed prior state,
    /// or `Err` with the current state when the mask does not accept it.
    pub(crate) fn claim_for_wakeup(&self, mask: StateMask) -> core::result::Result<TaskState, TaskState> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let observed = TaskState::from_bits(current);
            if !mask.accepts(observed) {
                return Err(observed);
            }
            match self.state.compare_exchange_weak(
                current,
                TaskState::Waking as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(observed),
                Err(actual) => current = actual,
            }
        }
    }

    /// Atomically retires a blocked task: transitions a sleeping (or already
    /// stopped) state to `Stopped`. Fails against a running task or one a
    /// concurrent waker has already claimed; that waker will enqueue it.
    pub(crate) fn claim_for_exit(&self) -> core::result::Result<(), TaskState> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let observed = TaskState::from_bits(current);
            if !matches!(
                observed,
                TaskState::Interruptible | TaskState::Uninterruptible | TaskState::Stopped
            ) {
                return Err(observed);
            }
            match self.state.compare_exchange_weak(
                current,
                TaskState::Stopped as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Processor this task is assigned to.
    #[inline]
    #[must_use]
    pub fn cpu(&self) -> CpuId {
        self.cpu.load(Ordering::Acquire)
    }

    pub(crate) fn set_cpu(&self, cpu: CpuId) {
        self.cpu.store(cpu, Ordering::Release);
    }

    /// True while some runqueue holds this task.
    #[inline]
    #[must_use]
    pub fn on_rq(&self) -> bool {
        self.on_rq.load(Ordering::Acquire)
    }

    pub(crate) fn set_on_rq(&self, on_rq: bool) {
        self.on_rq.store(on_rq, Ordering::Release);
    }

    /// Current affinity mask.
    #[inline]
    #[must_use]
    pub fn affinity(&self) -> CpuMask {
        CpuMask::from_bits(self.affinity.load(Ordering::Acquire))
    }

    pub(crate) fn store_affinity(&self, mask: CpuMask) {
        self.affinity.store(mask.bits(), Ordering::Release);
    }

    /// Fair load weight.
    #[inline]
    #[must_use]
    pub fn load_weight(&self) -> u64 {
        self.load_weight.load(Ordering::Relaxed)
    }

    pub(crate) fn set_load_weight(&self, weight: u64) {
        self.load_weight.store(weight, Ordering::Relaxed);
    }

    /// True while blocked on I/O.
    #[inline]
    #[must_use]
    pub fn in_iowait(&self) -> bool {
        self.in_iowait.load(Ordering::Relaxed)
    }

    pub(crate) fn set_in_iowait(&self, iowait: bool) {
        self.in_iowait.store(iowait, Ordering::Relaxed);
    }

    /// Processor holding this task's iowait count, valid while the sleep
    /// is committed.
    pub(crate) fn iowait_cpu(&self) -> CpuId {
        self.iowait_cpu.load(Ordering::Relaxed)
    }

    pub(crate) fn set_iowait_cpu(&self, cpu: CpuId) {
        self.iowait_cpu.store(cpu, Ordering::Relaxed);
    }

    /// True when a blocked instance of this task counts toward load
    /// average (uninterruptible sleep).
    #[inline]
    #[must_use]
    pub fn contributes_to_load(&self) -> bool {
        self.state() == TaskState::Uninterruptible
    }

    /// The task's bandwidth group, if any.
    #[must_use]
    pub fn rt_group(&self) -> Option<Arc<RtGroup>> {
        self.rt_group.lock().clone()
    }

    pub(crate) fn set_rt_group(&self, group: Option<Arc<RtGroup>>) {
        *self.rt_group.lock() = group;
    }
}

fn encode_policy(policy: SchedPolicy) -> u8 {
    match policy {
        SchedPolicy::Normal => 0,
        SchedPolicy::Batch => 1,
        SchedPolicy::Idle => 2,
        SchedPolicy::Fifo => 3,
        SchedPolicy::RoundRobin => 4,
    }
}

fn decode_policy(bits: u8) -> SchedPolicy {
    match bits {
        1 => SchedPolicy::Batch,
        2 => SchedPolicy::Idle,
        3 => SchedPolicy::Fifo,
        4 => SchedPolicy::RoundRobin,
        _ => SchedPolicy::Normal,
    }
}

/// Registry of all live tasks, keyed by generational [`TaskId`].
///
/// The table lock is a leaf: it is only held for id resolution and
/// insertion/removal, never while acquiring a runqueue lock.
#[derive(Debug, Default)]
pub(crate) struct TaskTable {
    tasks: Mutex<Arena<Arc<Task>>>,
}

impl TaskTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Admits a task described by `desc`.
    pub(crate) fn insert(&self, desc: &TaskDesc) -> Arc<Task> {
        let mut tasks = self.tasks.lock();
        let mut created: Option<Arc<Task>> = None;
        tasks.insert_with(|idx| {
            let task = Arc::new(Task::new(TaskId(idx), desc));
            created = Some(Arc::clone(&task));
            task
        });
        created.expect("insert_with always runs the constructor")
    }

    /// Admits a task built by `f`, which receives the assigned id.
    pub(crate) fn insert_with(&self, f: impl FnOnce(TaskId) -> Task) -> Arc<Task> {
        let mut tasks = self.tasks.lock();
        let mut created: Option<Arc<Task>> = None;
        tasks.insert_with(|idx| {
            let task = Arc::new(f(TaskId(idx)));
            created = Some(Arc::clone(&task));
            task
        });
        created.expect("insert_with always runs the constructor")
    }

    /// Resolves an id to its task.
    pub(crate) fn get(&self, id: TaskId) -> Option<Arc<Task>> {
        self.tasks.lock().get(id.0).cloned()
    }

    /// Removes a task from the table.
    pub(crate) fn remove(&self, id: TaskId) -> Option<Arc<Task>> {
        self.tasks.lock().remove(id.0)
    }

    /// Number of live tasks.
    pub(crate) fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Clones out all live tasks (hot-removal drain, debugging).
    pub(crate) fn all(&self) -> Vec<Arc<Task>> {
        self.tasks.lock().iter().map(|(_, t)| Arc::clone(t)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desc_maps_policy_to_prio_and_class() {
        let rt = TaskDesc::new("rt").policy(SchedPolicy::Fifo).rt_priority(10);
        assert_eq!(rt.effective_prio(), RT_PRIO_BASE + 10);

        let fair = TaskDesc::new("fair");
        assert_eq!(fair.effective_prio(), DEFAULT_PRIO);
        assert_eq!(fair.effective_weight(), NICE_0_LOAD);

        let idle = TaskDesc::new("bg").policy(SchedPolicy::Idle);
        assert_eq!(idle.effective_weight(), IDLE_POLICY_LOAD);
    }

    #[test]
    fn table_insert_and_resolve() {
        let table = TaskTable::new();
        let task = table.insert(&TaskDesc::new("a"));
        assert_eq!(table.get(task.id()).map(|t| t.id()), Some(task.id()));
        assert_eq!(table.len(), 1);

        let removed = table.remove(task.id()).expect("task present");
        assert_eq!(removed.id(), task.id());
        assert!(table.get(task.id()).is_none());
    }

    #[test]
    fn stale_id_does_not_resolve_after_reuse() {
        let table = TaskTable::new();
        let old = table.insert(&TaskDesc::new("old"));
        let old_id = old.id();
        table.remove(old_id);
        let new = table.insert(&TaskDesc::new("new"));
        assert_eq!(new.id().index(), old_id.index());
        assert!(table.get(old_id).is_none());
        assert_eq!(table.get(new.id()).map(|t| t.id()), Some(new.id()));
    }

    #[test]
    fn claim_for_wakeup_respects_mask() {
        let table = TaskTable::new();
        let task = table.insert(&TaskDesc::new("t"));
        assert_eq!(task.state(), TaskState::Interruptible);

        assert_eq!(
            task.claim_for_wakeup(StateMask::NORMAL),
            Ok(TaskState::Interruptible)
        );
        assert_eq!(task.state(), TaskState::Waking);

        // A second claim races against the first and loses.
        assert_eq!(
            task.claim_for_wakeup(StateMask::NORMAL),
            Err(TaskState::Waking)
        );
    }

    #[test]
    fn exit_claim_loses_to_a_wakeup_claim() {
        let table = TaskTable::new();
        let task = table.insert(&TaskDesc::new("t"));

        // A waker got there first; the task is about to be enqueued.
        assert!(task.claim_for_wakeup(StateMask::NORMAL).is_ok());
        assert_eq!(task.claim_for_exit(), Err(TaskState::Waking));

        let other = table.insert(&TaskDesc::new("u"));
        assert_eq!(other.claim_for_exit(), Ok(()));
        assert_eq!(other.state(), TaskState::Stopped);
        // A stopped task is no longer wakeable.
        assert_eq!(
            other.claim_for_wakeup(StateMask::NORMAL),
            Err(TaskState::Stopped)
        );
    }

    #[test]
    fn idle_task_is_pinned_and_lowest_prio() {
        let table = TaskTable::new();
        let idle = table.insert_with(|id| Task::new_idle(id, 3));
        assert_eq!(idle.prio(), IDLE_PRIO);
        assert_eq!(idle.class(), ClassId::Idle);
        assert_eq!(idle.affinity(), CpuMask::single(3));
        assert_eq!(idle.cpu(), 3);
    }
}
