//! The scheduler core: dispatch, wake-up, tick, and administration.
//!
//! [`SchedCore`] ties the pieces together: the task table, the per-processor
//! runqueues, the class chain, the bandwidth controller, and the topology.
//! A host embeds the core and drives it explicitly: one call to
//! [`SchedCore::schedule`] per dispatch point, one call to
//! [`SchedCore::scheduler_tick`] per tick per processor. Nothing here spins
//! up threads except the optional bandwidth [`PeriodTimer`].
//!
//! # Wake-up
//!
//! A wake-up claims the task by moving its state to `Waking` with a single
//! compare-exchange; only the claiming waker proceeds, so two concurrent
//! wake-ups cannot double-enqueue. If the task never left its runqueue
//! (woken between deciding to sleep and being switched out) the wake is a
//! cheap state flip. Otherwise the waker asks the task's class for a
//! placement hint, validates it against affinity and the active set, takes
//! only the destination lock, and enqueues there.
//!
//! # Dispatch
//!
//! `schedule` runs with the processor's runqueue lock: it retires the
//! previous task (dequeues it if it is blocking, requeues it if it was
//! preempted), walks the class chain for the next one, and commits. A
//! processor about to go idle first tries a newly-idle balance; a chosen
//! stopper executes the pending cross-processor work and dispatch repeats.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::balance;
use crate::bandwidth::{BandwidthController, PeriodTimer, RtBandwidth, RtGroup};
use crate::class::{ClassId, Classes, SchedClass};
use crate::clock::{ClockSource, MonotonicClock};
use crate::config::SchedConfig;
use crate::error::{Result, SchedError};
use crate::rq::{RqGuard, Runqueue, RunqueueSet, StopWork};
use crate::stats::{SchedStats, StatsSnapshot};
use crate::task::{Task, TaskDesc, TaskTable};
use crate::topology::{build_chains, DomainChain, EpochCell, RootDomain, TopologyDesc};
use crate::types::{
    CpuId, CpuMask, DequeueFlags, EnqueueFlags, SchedPolicy, StateMask, TaskId, TaskState, Time,
    WakeFlags, RT_PRIO_BASE,
};

/// Interval between global load-average folds.
const LOAD_FREQ: Time = Time::from_secs(5);
/// Fixed-point one for the load average (11 fractional bits).
const LOAD_FIXED_1: u64 = 2048;
/// Decay factors for the 1, 5 and 15 minute averages at `LOAD_FREQ`.
const LOAD_EXP: [u64; 3] = [1884, 2014, 2037];

#[derive(Debug)]
struct GlobalLoad {
    next_update: Time,
    avg: [u64; 3],
}

#[derive(Debug)]
struct TopologyState {
    desc: TopologyDesc,
    /// Disjoint realm spans; one root domain each.
    partitions: Vec<CpuMask>,
}

/// The multi-processor scheduler core.
#[derive(Debug)]
pub struct SchedCore {
    config: SchedConfig,
    clock: Arc<dyn ClockSource>,
    tasks: TaskTable,
    rqs: RunqueueSet,
    classes: Classes,
    stats: Arc<SchedStats>,
    bandwidth: BandwidthController,
    /// Per-processor domain chains, epoch-protected for tick-path readers.
    domains: Box<[EpochCell<DomainChain>]>,
    topology: Mutex<TopologyState>,
    /// Held while balancing a SERIALIZE domain level.
    serialize: Mutex<()>,
    /// Serializes processor removal and re-addition.
    hotplug: Mutex<()>,
    load: Mutex<GlobalLoad>,
}

impl SchedCore {
    /// Builds a core with the real-time wall clock.
    pub fn new(config: SchedConfig) -> Result<Arc<Self>> {
        Self::with_clock(config, Arc::new(MonotonicClock::new()))
    }

    /// Builds a core on an explicit clock source (tests use `ManualClock`).
    pub fn with_clock(config: SchedConfig, clock: Arc<dyn ClockSource>) -> Result<Arc<Self>> {
        config.validate()?;
        let nr_cpus = config.nr_cpus;
        let all = CpuMask::first_n(nr_cpus);

        let tasks = TaskTable::new();
        let stats = Arc::new(SchedStats::default());
        let rd = Arc::new(RootDomain::new(all));
        let rqs: Vec<Runqueue> = (0..nr_cpus)
            .map(|cpu| {
                let idle = tasks.insert_with(|id| Task::new_idle(id, cpu));
                let stopper = tasks.insert_with(|id| Task::new_stopper(id, cpu));
                let rq = Runqueue::new(cpu, idle, stopper, Arc::clone(&rd), Arc::clone(&stats));
                rq.set_online(true);
                rq.set_active(true);
                rq
            })
            .collect();

        let desc = TopologyDesc::flat(nr_cpus);
        let base = Time::from(config.balance.base_interval);
        let chains = build_chains(&desc, all, base)?;
        let mut cells: Vec<EpochCell<DomainChain>> = (0..nr_cpus)
            .map(|_| EpochCell::new(DomainChain::default()))
            .collect();
        for (cpu, chain) in chains {
            cells[cpu] = EpochCell::new(chain);
        }

        let core = Arc::new(Self {
            bandwidth: BandwidthController::new(&config.rt),
            config,
            clock,
            tasks,
            rqs: RunqueueSet::new(rqs),
            classes: Classes::new(),
            stats,
            domains: cells.into_boxed_slice(),
            topology: Mutex::new(TopologyState {
                desc,
                partitions: vec![all],
            }),
            serialize: Mutex::new(()),
            hotplug: Mutex::new(()),
            load: Mutex::new(GlobalLoad {
                next_update: LOAD_FREQ,
                avg: [0; 3],
            }),
        });
        tracing::info!(nr_cpus, "scheduler core initialized");
        Ok(core)
    }

    /// Spawns the background bandwidth refill timer for this core.
    ///
    /// The timer holds a weak reference and stops by itself once the core
    /// is dropped. Deterministic tests skip this and call
    /// [`SchedCore::rt_period_tick`] directly.
    #[must_use]
    pub fn start_period_timer(self: &Arc<Self>) -> PeriodTimer {
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = std::time::Duration::from(self.bandwidth.min_period());
        PeriodTimer::spawn(interval, move || {
            if let Some(core) = weak.upgrade() {
                core.rt_period_tick();
                true
            } else {
                false
            }
        })
    }

    // Accessors shared with the class and balance modules.

    /// The runqueue slots (read-only observation; locking stays internal).
    #[inline]
    #[must_use]
    pub fn rqs(&self) -> &RunqueueSet {
        &self.rqs
    }

    #[inline]
    pub(crate) fn classes(&self) -> &Classes {
        &self.classes
    }

    /// Shared counters.
    #[inline]
    #[must_use]
    pub fn stats(&self) -> &SchedStats {
        &self.stats
    }

    /// The configuration this core was built with.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &SchedConfig {
        &self.config
    }

    pub(crate) fn domains(&self, cpu: CpuId) -> &EpochCell<DomainChain> {
        &self.domains[cpu]
    }

    pub(crate) fn serialize_lock(&self) -> &Mutex<()> {
        &self.serialize
    }

    #[inline]
    fn now(&self) -> Time {
        self.clock.now()
    }

    /// Point-in-time counter snapshot.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Processors currently accepting placements.
    #[must_use]
    pub fn active_cpus(&self) -> CpuMask {
        self.rqs.active_mask()
    }

    /// Resolves a task id.
    pub fn task(&self, id: TaskId) -> Result<Arc<Task>> {
        self.tasks.get(id).ok_or(SchedError::UnknownTask(id))
    }

    // ------------------------------------------------------------------
    // Admission and exit
    // ------------------------------------------------------------------

    /// Admits a new task and places it on a runqueue.
    pub fn spawn(&self, desc: TaskDesc) -> Result<Arc<Task>> {
        if desc.policy.is_realtime() {
            if desc.rt_priority > 99 {
                return Err(SchedError::InvalidPriority {
                    prio: desc.rt_priority as i32,
                    policy: desc.policy,
                });
            }
        } else if desc.rt_priority != 0 {
            return Err(SchedError::InvalidPriority {
                prio: desc.rt_priority as i32,
                policy: desc.policy,
            });
        }
        let active = self.rqs.active_mask();
        if desc.affinity.and(active).is_empty() {
            return Err(SchedError::AffinityDisjoint {
                requested: desc.affinity,
                active,
            });
        }
        let task = self.tasks.insert(&desc);
        if task.policy().is_realtime() {
            let root = Arc::clone(self.bandwidth.root());
            root.task_attached();
            task.set_rt_group(Some(root));
        }
        self.wake_up_new_task(&task);
        tracing::debug!(task = %task.id(), name = task.name(), "task admitted");
        Ok(task)
    }

    /// Fork placement: like a wake-up, but the task has no history to be
    /// warm on, so the class may spread it freely.
    fn wake_up_new_task(&self, task: &Arc<Task>) {
        let class = self.classes.get(task.class());
        let hint = class.select_task_rq(self, task, task.cpu(), WakeFlags::FORK);
        let cpu = self.validate_placement(task, hint);

        let mut rq = self.rqs.lock(cpu);
        rq.update_clock(self.now());
        task.set_cpu(cpu);
        self.activate_task(&mut rq, task, EnqueueFlags::WAKEUP);
        task.set_state(TaskState::Running);
        self.check_preempt(&mut rq, task, WakeFlags::FORK);
        drop(rq);
        class.task_woken(self, task);
    }

    /// Removes a task that is no longer runnable from the scheduler.
    ///
    /// The task must have blocked or never run; a task still owned by a
    /// runqueue cannot be removed out from under it.
    pub fn exit_task(&self, id: TaskId) -> Result<()> {
        let task = self.task(id)?;
        let rq = self.rqs.lock_task_rq(&task);
        if task.on_rq() || rq.current.id() == task.id() {
            drop(rq);
            // Still owned by the runqueue; the host must block it first.
            return Err(SchedError::TaskRunnable(id));
        }
        // The stop must win the state word: a waker that already claimed the
        // task is going to enqueue it, so removal has to wait.
        if task.claim_for_exit().is_err() {
            drop(rq);
            return Err(SchedError::TaskRunnable(id));
        }
        drop(rq);
        if let Some(group) = task.rt_group() {
            group.task_detached();
        }
        task.set_rt_group(None);
        self.tasks.remove(id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Wake-up engine
    // ------------------------------------------------------------------

    /// Wakes a task blocked in an interruptible or uninterruptible sleep.
    /// Returns false if the task was not in a wakeable state (already
    /// runnable, already being woken, or stopped).
    pub fn wake_up(&self, id: TaskId) -> Result<bool> {
        let task = self.task(id)?;
        Ok(self.try_to_wake_up(&task, StateMask::NORMAL, WakeFlags::empty()))
    }

    /// Wake restricted to the given states, with flags.
    pub fn wake_up_state(&self, id: TaskId, mask: StateMask, flags: WakeFlags) -> Result<bool> {
        let task = self.task(id)?;
        Ok(self.try_to_wake_up(&task, mask, flags))
    }

    fn try_to_wake_up(&self, task: &Arc<Task>, mask: StateMask, flags: WakeFlags) -> bool {
        let Ok(prior) = task.claim_for_wakeup(mask) else {
            return false;
        };
        self.stats.wakeups.increment();
        let prev_cpu = task.cpu();

        // Fast path: it never left its runqueue (woken between deciding to
        // sleep and being switched out). Flip it back under the lock. The
        // iowait counter was never incremented in this window, so only the
        // task flag needs clearing.
        {
            let mut rq = self.rqs.lock_task_rq(task);
            if task.on_rq() {
                task.set_in_iowait(false);
                task.set_state(TaskState::Running);
                self.stats.wakeups_local.increment();
                self.check_preempt(&mut rq, task, flags);
                return true;
            }
        }
        if task.in_iowait() {
            // The committed sleep incremented the counter where it was
            // dispatched, which is not necessarily `task.cpu()` any more.
            task.set_in_iowait(false);
            self.rqs.rq(task.iowait_cpu()).iowait_dec();
        }

        let class = self.classes.get(task.class());
        let hint = class.select_task_rq(self, task, prev_cpu, flags);
        let mut cpu = self.validate_placement(task, hint);

        // Hot removal may deactivate the destination between the placement
        // check and the lock; re-check under the lock and re-route.
        let mut rq = loop {
            let rq = self.rqs.lock(cpu);
            if rq.outer().is_active() {
                break rq;
            }
            drop(rq);
            cpu = self.select_fallback_rq(task);
        };
        rq.update_clock(self.now());
        if prior == TaskState::Uninterruptible {
            // Balances the increment made when the sleep dequeued it.
            rq.nr_uninterruptible -= 1;
        }
        task.set_cpu(cpu);
        let mut enqueue = EnqueueFlags::WAKEUP;
        if cpu != prev_cpu {
            enqueue |= EnqueueFlags::WAKING;
        }
        self.activate_task(&mut rq, task, enqueue);
        task.set_state(TaskState::Running);
        self.check_preempt(&mut rq, task, flags);
        if rq.current.id() == rq.idle.id() {
            let now = rq.clock;
            let horizon = self.config.balance.migration_cost.saturating_mul(2);
            rq.update_avg_idle(now, horizon);
        }
        if cpu == prev_cpu {
            self.stats.wakeups_local.increment();
        }
        drop(rq);

        // With the lock down, the class may try to run it elsewhere.
        self.classes.get(task.class()).task_woken(self, task);
        true
    }

    /// Validates a placement hint against affinity and the active set,
    /// falling back when it does not hold.
    fn validate_placement(&self, task: &Arc<Task>, hint: CpuId) -> CpuId {
        let active = self.rqs.active_mask();
        if hint < self.rqs.cpu_count() && task.affinity().contains(hint) && active.contains(hint) {
            return hint;
        }
        self.select_fallback_rq(task)
    }

    /// Last-resort placement: the nearest allowed active processor, widening
    /// the affinity mask when nothing allowed remains active.
    fn select_fallback_rq(&self, task: &Arc<Task>) -> CpuId {
        self.stats.wakeups_fallback.increment();
        let active = self.rqs.active_mask();
        let allowed = task.affinity().and(active);
        let prev = task.cpu();

        // Prefer the smallest domain around the previous home.
        if prev < self.rqs.cpu_count() {
            let near = self.domains[prev].read(|chain| {
                chain
                    .domains
                    .iter()
                    .find_map(|domain| domain.span.and(allowed).first())
            });
            if let Some(cpu) = near {
                return cpu;
            }
        }
        if let Some(cpu) = allowed.first() {
            return cpu;
        }
        // Nothing allowed is active: widen rather than strand the task.
        tracing::warn!(task = %task.id(), "no allowed active processor; widening affinity");
        task.store_affinity(active);
        active.first().unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // Blocking and yielding
    // ------------------------------------------------------------------

    /// Marks the current task on `cpu` as about to block. The sleep takes
    /// effect at the next [`SchedCore::schedule`] call; a wake-up arriving
    /// in between simply flips the state back (no lost wake-ups).
    pub fn block_current(&self, cpu: CpuId, state: TaskState, iowait: bool) -> Result<()> {
        if cpu >= self.rqs.cpu_count() {
            return Err(SchedError::NoSuchCpu(cpu));
        }
        debug_assert!(matches!(
            state,
            TaskState::Interruptible | TaskState::Uninterruptible
        ));
        let rq = self.rqs.lock(cpu);
        let curr = Arc::clone(&rq.current);
        if curr.id() == rq.idle.id() || curr.id() == rq.stopper.id() {
            return Ok(());
        }
        if iowait {
            curr.set_in_iowait(true);
        }
        curr.set_state(state);
        rq.outer().set_need_resched();
        Ok(())
    }

    /// The current task on `cpu` yields; peers of equal standing run first.
    pub fn yield_current(&self, cpu: CpuId) -> Result<()> {
        if cpu >= self.rqs.cpu_count() {
            return Err(SchedError::NoSuchCpu(cpu));
        }
        let mut rq = self.rqs.lock(cpu);
        let class = rq.current.class();
        self.classes.get(class).yield_task(&mut rq);
        rq.resched_curr();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Picks and commits the next task to run on `cpu`, retiring the
    /// previous one. Returns the task now current.
    pub fn schedule(&self, cpu: CpuId) -> Result<Arc<Task>> {
        if cpu >= self.rqs.cpu_count() {
            return Err(SchedError::NoSuchCpu(cpu));
        }
        loop {
            // A dropping real-time ceiling pulls urgent work first.
            let rd = self.rqs.rq(cpu).root_domain();
            if !rd.rt_overloaded().without(cpu).is_empty() {
                self.classes.rt().pre_schedule(self, cpu);
            }

            let now = self.now();
            let mut rq = self.rqs.lock(cpu);
            rq.outer().clear_need_resched();
            rq.update_clock(now);

            let prev = Arc::clone(&rq.current);
            let prev_state = prev.state();
            if prev.on_rq()
                && matches!(
                    prev_state,
                    TaskState::Interruptible | TaskState::Uninterruptible
                )
            {
                self.deactivate_task(&mut rq, &prev, DequeueFlags::SLEEP);
                if prev_state == TaskState::Uninterruptible {
                    rq.nr_uninterruptible += 1;
                }
                if prev.in_iowait() {
                    rq.outer().iowait_inc();
                    prev.set_iowait_cpu(cpu);
                }
            }
            self.classes.get(prev.class()).put_prev(&mut rq, &prev);

            // About to idle: try to pull work before committing to it.
            if rq.nr_running == 0 && !rq.outer().has_stop_work() && rq.outer().is_online() {
                drop(rq);
                balance::rebalance_newidle(self, cpu);
                rq = self.rqs.lock(cpu);
                rq.update_clock(self.now());
            }

            let next = self.pick_next_task(&mut rq);
            if next.id() != prev.id() {
                rq.nr_switches += 1;
                rq.current = Arc::clone(&next);
            }
            self.classes.get(next.class()).set_curr(&mut rq);
            rq.publish_load();
            let next_is_stopper = next.id() == rq.stopper.id();
            let next_class = next.class();
            drop(rq);

            if next_is_stopper {
                // The stopper runs its callbacks immediately, then the
                // processor reschedules.
                self.run_stop_work(cpu);
                continue;
            }
            if next_class == ClassId::Rt || prev.class() == ClassId::Rt {
                self.classes.rt().post_schedule(self, cpu);
            }
            return Ok(next);
        }
    }

    fn pick_next_task(&self, rq: &mut RqGuard<'_>) -> Arc<Task> {
        // Common case: only fair tasks are runnable and no stop work is
        // pending, so the chain walk collapses to one class.
        if rq.all_tasks_fair()
            && !rq.outer().has_stop_work()
            && !rq.outer().active_balance_pending()
        {
            let fair: &dyn SchedClass = self.classes.fair();
            if let Some(task) = fair.pick_next(rq) {
                return task;
            }
        }
        for class in self.classes.chain() {
            if let Some(task) = class.pick_next(rq) {
                return task;
            }
        }
        unreachable!("the idle class always yields a task");
    }

    /// True if `cpu` has a reschedule pending.
    #[must_use]
    pub fn need_resched(&self, cpu: CpuId) -> bool {
        self.rqs.rq(cpu).need_resched()
    }

    /// The task currently committed on `cpu`.
    pub fn current(&self, cpu: CpuId) -> Result<Arc<Task>> {
        if cpu >= self.rqs.cpu_count() {
            return Err(SchedError::NoSuchCpu(cpu));
        }
        Ok(Arc::clone(&self.rqs.lock(cpu).current))
    }

    /// Executes pending cross-processor callbacks on `cpu`.
    fn run_stop_work(&self, cpu: CpuId) {
        while let Some(work) = self.rqs.rq(cpu).pop_stop_work() {
            match work {
                StopWork::MigrateTask { task, dest_cpu } => {
                    self.execute_migration(cpu, &task, dest_cpu);
                }
                StopWork::ActiveBalance { dest_cpu } => {
                    self.execute_active_balance(cpu, dest_cpu);
                }
            }
        }
        self.rqs.rq(cpu).set_active_balance(false);
    }

    /// Moves `task` from `cpu` to `dest_cpu` if the request still applies.
    /// A request superseded by a migration or a sleep is a no-op.
    fn execute_migration(&self, cpu: CpuId, task: &Arc<Task>, dest_cpu: CpuId) {
        if dest_cpu == cpu || dest_cpu >= self.rqs.cpu_count() {
            return;
        }
        let (mut src, mut dst) = self.rqs.double_lock(cpu, dest_cpu);
        let applies = task.cpu() == cpu
            && task.on_rq()
            && src.current.id() != task.id()
            && task.affinity().contains(dest_cpu)
            && dst.outer().is_active();
        if !applies {
            return;
        }
        self.deactivate_task(&mut src, task, DequeueFlags::empty());
        task.set_cpu(dest_cpu);
        self.activate_task(&mut dst, task, EnqueueFlags::empty());
        self.check_preempt(&mut dst, task, WakeFlags::empty());
        tracing::debug!(task = %task.id(), from = cpu, to = dest_cpu, "migration executed");
    }

    /// Pushes one fair task from `cpu` toward `dest_cpu` (the balancer
    /// escalation for queues that keep defeating regular pulls).
    fn execute_active_balance(&self, cpu: CpuId, dest_cpu: CpuId) {
        if dest_cpu == cpu || dest_cpu >= self.rqs.cpu_count() {
            return;
        }
        if !self.rqs.rq(dest_cpu).is_active() {
            return;
        }
        let (mut src, mut dst) = self.rqs.double_lock(cpu, dest_cpu);
        let moved = self
            .classes
            .fair()
            .pull_tasks(&mut src, &mut dst, 1, u64::MAX);
        if moved > 0 {
            self.stats.balance_migrations.add(moved as u64);
        }
    }

    // ------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------

    /// Periodic tick for `cpu`: clock and load bookkeeping, class tick
    /// accounting, then periodic balancing and bandwidth refills.
    pub fn scheduler_tick(&self, cpu: CpuId) -> Result<()> {
        if cpu >= self.rqs.cpu_count() {
            return Err(SchedError::NoSuchCpu(cpu));
        }
        let now = self.now();
        let mut rq = self.rqs.lock(cpu);
        rq.update_clock(now);
        let delta = rq.clock.saturating_sub(rq.last_tick);
        rq.last_tick = rq.clock;
        rq.update_cpu_load();
        let curr = Arc::clone(&rq.current);
        self.classes
            .get(curr.class())
            .task_tick(&mut rq, &curr, delta);
        rq.publish_load();
        drop(rq);

        self.calc_global_load(now);
        self.rt_period_tick();
        if self.rqs.rq(cpu).is_online() {
            balance::rebalance_tick(self, cpu, now);
        }
        Ok(())
    }

    /// Refills due bandwidth budgets and unparks throttled groups. Called
    /// from the period timer, or directly by deterministic hosts.
    pub fn rt_period_tick(&self) {
        let now = self.now();
        for (group, overruns) in self.bandwidth.due_refills(now) {
            for cpu in 0..self.rqs.cpu_count() {
                let mut rq = self.rqs.lock(cpu);
                if group.refill(cpu, overruns) {
                    self.classes.rt().unthrottle_group(&mut rq, group.id());
                }
            }
        }
    }

    fn calc_global_load(&self, now: Time) {
        let mut load = self.load.lock();
        if now < load.next_update {
            return;
        }
        load.next_update = now.saturating_add(LOAD_FREQ);
        let mut active: i64 = 0;
        for rq in self.rqs.iter() {
            let guard = rq.lock();
            active += guard.nr_running as i64 + guard.nr_uninterruptible;
        }
        let active = (active.max(0) as u64).saturating_mul(LOAD_FIXED_1);
        for (avg, exp) in load.avg.iter_mut().zip(LOAD_EXP) {
            *avg = (*avg * exp + active * (LOAD_FIXED_1 - exp)) / LOAD_FIXED_1;
        }
    }

    /// The 1, 5 and 15 minute runnable+uninterruptible load averages.
    #[must_use]
    pub fn load_avg(&self) -> [f64; 3] {
        let load = self.load.lock();
        load.avg.map(|avg| avg as f64 / LOAD_FIXED_1 as f64)
    }

    // ------------------------------------------------------------------
    // Attribute changes
    // ------------------------------------------------------------------

    /// Restricts the processors a task may run on, migrating it away if it
    /// currently sits somewhere the new mask forbids.
    pub fn set_affinity(&self, id: TaskId, mask: CpuMask) -> Result<()> {
        let task = self.task(id)?;
        let active = self.rqs.active_mask();
        if mask.and(active).is_empty() {
            return Err(SchedError::AffinityDisjoint {
                requested: mask,
                active,
            });
        }
        let rq = self.rqs.lock_task_rq(&task);
        task.store_affinity(mask);
        let here = task.cpu();
        if mask.contains(here) && self.rqs.rq(here).is_active() {
            return Ok(());
        }
        let dest = mask
            .and(active)
            .iter()
            .min_by_key(|&cpu| self.rqs.rq(cpu).load_estimate())
            .unwrap_or_else(|| unreachable!("mask intersects the active set"));

        if rq.current.id() == task.id() {
            // Running: evict at the next safe point via the stopper.
            rq.outer().push_stop_work(StopWork::MigrateTask {
                task: Arc::clone(&task),
                dest_cpu: dest,
            });
            rq.outer().set_need_resched();
            return Ok(());
        }
        if !task.on_rq() {
            // Blocked: just retarget its next wake-up.
            task.set_cpu(dest);
            return Ok(());
        }
        let (mut src, mut dst, dropped) = self.rqs.double_lock_balance(rq, dest);
        if dropped && (task.cpu() != here || !task.on_rq() || src.current.id() == task.id()) {
            // Lost the race; the wake or dispatch that won respects the
            // already-stored mask.
            return Ok(());
        }
        self.deactivate_task(&mut src, &task, DequeueFlags::empty());
        task.set_cpu(dest);
        self.activate_task(&mut dst, &task, EnqueueFlags::empty());
        self.check_preempt(&mut dst, &task, WakeFlags::empty());
        Ok(())
    }

    /// Changes a task's policy and real-time priority.
    pub fn setscheduler(&self, id: TaskId, policy: SchedPolicy, rt_priority: u32) -> Result<()> {
        if policy.is_realtime() {
            if rt_priority > 99 {
                return Err(SchedError::InvalidPriority {
                    prio: rt_priority as i32,
                    policy,
                });
            }
        } else if rt_priority != 0 {
            return Err(SchedError::InvalidPriority {
                prio: rt_priority as i32,
                policy,
            });
        }
        let task = self.task(id)?;
        let mut rq = self.rqs.lock_task_rq(&task);

        let old_class = task.class();
        let old_prio = task.prio();
        let was_on_rq = task.on_rq();
        let running = rq.current.id() == task.id();

        if was_on_rq {
            self.deactivate_task(&mut rq, &task, DequeueFlags::empty());
        }

        let desc = TaskDesc {
            policy,
            rt_priority,
            ..TaskDesc::default()
        };
        task.set_policy(policy);
        task.set_prio(desc.effective_prio());
        task.set_load_weight(desc.effective_weight());
        let new_class = if policy.is_realtime() {
            ClassId::Rt
        } else {
            ClassId::Fair
        };
        task.set_class(new_class);

        // Bandwidth group membership follows the class.
        match (old_class, new_class) {
            (ClassId::Rt, ClassId::Rt) | (ClassId::Fair, ClassId::Fair) => {}
            (_, ClassId::Rt) => {
                let root = Arc::clone(self.bandwidth.root());
                root.task_attached();
                task.set_rt_group(Some(root));
            }
            (ClassId::Rt, _) => {
                if let Some(group) = task.rt_group() {
                    group.task_detached();
                }
                task.set_rt_group(None);
            }
            _ => {}
        }

        if was_on_rq {
            self.activate_task(&mut rq, &task, EnqueueFlags::empty());
        }
        if running {
            self.classes.get(new_class).set_curr(&mut rq);
        }
        if old_class != new_class {
            self.classes.get(old_class).switched_from(&mut rq, &task);
            self.classes.get(new_class).switched_to(&mut rq, &task);
        } else {
            self.classes
                .get(new_class)
                .prio_changed(&mut rq, &task, old_prio);
        }
        if running && (old_class != new_class || task.prio() < old_prio) {
            // It may no longer be the most urgent choice.
            rq.resched_curr();
        }
        Ok(())
    }

    /// Attaches a real-time task to a bandwidth group.
    pub fn attach_to_group(&self, id: TaskId, group: &Arc<RtGroup>) -> Result<()> {
        let task = self.task(id)?;
        if !task.policy().is_realtime() {
            return Err(SchedError::InvalidPriority {
                prio: task.prio() - RT_PRIO_BASE,
                policy: task.policy(),
            });
        }
        let _rq = self.rqs.lock_task_rq(&task);
        if let Some(old) = task.rt_group() {
            old.task_detached();
        }
        group.task_attached();
        task.set_rt_group(Some(Arc::clone(group)));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Bandwidth groups
    // ------------------------------------------------------------------

    /// The root bandwidth group.
    #[must_use]
    pub fn rt_root_group(&self) -> &Arc<RtGroup> {
        self.bandwidth.root()
    }

    /// Creates a bandwidth group under `parent`.
    pub fn create_rt_group(
        &self,
        parent: &Arc<RtGroup>,
        bandwidth: RtBandwidth,
    ) -> Result<Arc<RtGroup>> {
        self.bandwidth.create_group(parent, bandwidth)
    }

    /// Changes a group's bandwidth grant.
    pub fn set_rt_bandwidth(&self, group: &Arc<RtGroup>, bandwidth: RtBandwidth) -> Result<()> {
        self.bandwidth.set_bandwidth(group, bandwidth)
    }

    // ------------------------------------------------------------------
    // Topology
    // ------------------------------------------------------------------

    /// Replaces the topology description and rebuilds every domain chain.
    /// On failure the previous chains remain in effect.
    pub fn set_topology(&self, desc: TopologyDesc) -> Result<()> {
        let mut state = self.topology.lock();
        let partitions = state.partitions.clone();
        self.rebuild_domains(&desc, &partitions)?;
        state.desc = desc;
        Ok(())
    }

    /// Splits the processors into disjoint balancing realms. Tasks are
    /// never balanced or pushed across realm boundaries.
    pub fn partition_domains(&self, partitions: &[CpuMask]) -> Result<()> {
        if partitions.is_empty() {
            return Err(SchedError::EmptyPartition);
        }
        let mut seen = CpuMask::from_bits(0);
        for &part in partitions {
            if part.is_empty() {
                return Err(SchedError::EmptyPartition);
            }
            let overlap = seen.and(part);
            if !overlap.is_empty() {
                return Err(SchedError::OverlappingPartitions(overlap));
            }
            seen = seen.or(part);
        }
        let mut state = self.topology.lock();
        let desc = state.desc.clone();
        self.rebuild_domains(&desc, partitions)?;
        state.partitions = partitions.to_vec();
        Ok(())
    }

    /// Builds the whole new forest first, then publishes per processor.
    fn rebuild_domains(&self, desc: &TopologyDesc, partitions: &[CpuMask]) -> Result<()> {
        let active = self.rqs.active_mask();
        let base = Time::from(self.config.balance.base_interval);

        let mut built: Vec<(Arc<RootDomain>, Vec<(CpuId, DomainChain)>)> = Vec::new();
        for &part in partitions {
            let realm = part.and(active);
            if realm.is_empty() {
                continue;
            }
            let chains = build_chains(desc, realm, base)?;
            built.push((Arc::new(RootDomain::new(realm)), chains));
        }

        // Validation passed for every realm; publish.
        let mut covered = CpuMask::from_bits(0);
        for (rd, chains) in built {
            for (cpu, chain) in chains {
                covered = covered.with(cpu);
                self.domains[cpu].replace(chain);
                self.rqs.rq(cpu).set_root_domain(Arc::clone(&rd));
            }
        }
        for cpu in 0..self.rqs.cpu_count() {
            if !covered.contains(cpu) {
                self.domains[cpu].replace(DomainChain::default());
                self.rqs
                    .rq(cpu)
                    .set_root_domain(Arc::new(RootDomain::new(CpuMask::single(cpu))));
            }
        }
        tracing::info!(realms = covered.weight(), "scheduling domains rebuilt");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Hot removal
    // ------------------------------------------------------------------

    /// Takes a processor out of service, migrating its runnable tasks to
    /// allowed active processors. The running task is evicted through the
    /// stopper at the next dispatch on that processor.
    pub fn cpu_down(&self, cpu: CpuId) -> Result<()> {
        if cpu >= self.rqs.cpu_count() {
            return Err(SchedError::NoSuchCpu(cpu));
        }
        let _hotplug = self.hotplug.lock();
        let rq = self.rqs.rq(cpu);
        if !rq.is_online() {
            return Err(SchedError::CpuOffline(cpu));
        }
        if self.rqs.active_mask().without(cpu).is_empty() {
            return Err(SchedError::LastActiveCpu);
        }
        // No new placements from here on.
        rq.set_active(false);
        tracing::info!(cpu, "processor going offline");

        // Drain queued tasks one at a time; each iteration revalidates
        // under fresh locks.
        loop {
            let guard = self.rqs.lock(cpu);
            let victim = self.tasks.all().into_iter().find(|t| {
                t.cpu() == cpu
                    && t.on_rq()
                    && guard.current.id() != t.id()
                    && guard.idle.id() != t.id()
                    && guard.stopper.id() != t.id()
            });
            let Some(task) = victim else {
                break;
            };
            let dest = self.select_fallback_rq(&task);
            let (mut src, mut dst, dropped) = self.rqs.double_lock_balance(guard, dest);
            if dropped && (task.cpu() != cpu || !task.on_rq() || src.current.id() == task.id()) {
                continue;
            }
            self.deactivate_task(&mut src, &task, DequeueFlags::empty());
            task.set_cpu(dest);
            self.activate_task(&mut dst, &task, EnqueueFlags::empty());
            self.check_preempt(&mut dst, &task, WakeFlags::empty());
            self.stats.hotplug_migrations.increment();
        }

        // The running task leaves at the next dispatch, via the stopper.
        {
            let guard = self.rqs.lock(cpu);
            let curr = Arc::clone(&guard.current);
            if curr.id() != guard.idle.id() && curr.id() != guard.stopper.id() {
                let dest = self.select_fallback_rq(&curr);
                guard.outer().push_stop_work(StopWork::MigrateTask {
                    task: curr,
                    dest_cpu: dest,
                });
                guard.outer().set_need_resched();
            }
        }

        // Blocked tasks homed here wake somewhere else. The per-processor
        // idle and stopper tasks stay pinned where they are.
        let (idle_id, stopper_id) = {
            let guard = self.rqs.lock(cpu);
            (guard.idle.id(), guard.stopper.id())
        };
        for task in self.tasks.all() {
            if task.id() == idle_id || task.id() == stopper_id {
                continue;
            }
            if task.cpu() == cpu && !task.on_rq() && task.state() != TaskState::Running {
                let dest = self.select_fallback_rq(&task);
                task.set_cpu(dest);
                self.stats.hotplug_migrations.increment();
            }
        }

        // Fold the uninterruptible count into a survivor so the global
        // load average stays conserved.
        let survivor = self
            .rqs
            .active_mask()
            .first()
            .unwrap_or_else(|| unreachable!("checked above"));
        let (mut down, mut keep) = self.rqs.double_lock(cpu, survivor);
        keep.nr_uninterruptible += down.nr_uninterruptible;
        down.nr_uninterruptible = 0;
        drop((down, keep));

        rq.set_online(false);
        let state = self.topology.lock();
        let (desc, partitions) = (state.desc.clone(), state.partitions.clone());
        drop(state);
        self.rebuild_domains(&desc, &partitions)
    }

    /// Returns a previously removed processor to service.
    pub fn cpu_up(&self, cpu: CpuId) -> Result<()> {
        if cpu >= self.rqs.cpu_count() {
            return Err(SchedError::NoSuchCpu(cpu));
        }
        let _hotplug = self.hotplug.lock();
        let rq = self.rqs.rq(cpu);
        if rq.is_online() {
            return Ok(());
        }
        rq.set_online(true);
        rq.set_active(true);
        tracing::info!(cpu, "processor online");
        let state = self.topology.lock();
        let (desc, partitions) = (state.desc.clone(), state.partitions.clone());
        drop(state);
        self.rebuild_domains(&desc, &partitions)
    }

    // ------------------------------------------------------------------
    // Internal queue plumbing
    // ------------------------------------------------------------------

    pub(crate) fn activate_task(
        &self,
        rq: &mut RqGuard<'_>,
        task: &Arc<Task>,
        flags: EnqueueFlags,
    ) {
        self.classes.get(task.class()).enqueue(rq, task, flags);
        rq.nr_running += 1;
        task.set_on_rq(true);
        rq.publish_load();
    }

    pub(crate) fn deactivate_task(
        &self,
        rq: &mut RqGuard<'_>,
        task: &Arc<Task>,
        flags: DequeueFlags,
    ) {
        self.classes.get(task.class()).dequeue(rq, task, flags);
        rq.nr_running -= 1;
        task.set_on_rq(false);
        rq.publish_load();
    }

    /// Cross-class preemption is decided by chain position alone; only a
    /// wake into the running task's own class consults its policy.
    pub(crate) fn check_preempt(&self, rq: &mut RqGuard<'_>, task: &Arc<Task>, flags: WakeFlags) {
        let curr_class = rq.current.class();
        let task_class = task.class();
        if task_class.preempts(curr_class) {
            rq.resched_curr();
        } else if task_class == curr_class {
            self.classes
                .get(task_class)
                .check_preempt_curr(rq, task, flags);
        }
    }
}
