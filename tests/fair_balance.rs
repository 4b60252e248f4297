//! Fair load balancing: newly-idle pulls, periodic tick balancing, and
//! active-balance escalation when pulls keep failing.

use std::sync::Arc;

use schedcore::{ClassId, CpuMask, ManualClock, SchedConfig, SchedCore, TaskDesc, Time};

fn core_with_clock(nr_cpus: usize) -> (Arc<SchedCore>, Arc<ManualClock>) {
    let clock = ManualClock::shared();
    let core = SchedCore::with_clock(SchedConfig::with_cpus(nr_cpus), clock.clone())
        .expect("valid config");
    (core, clock)
}

/// Queues `n` fair tasks on processor 0 that are free to run anywhere.
fn stack_on_cpu0(core: &SchedCore, n: usize) -> Vec<Arc<schedcore::Task>> {
    (0..n)
        .map(|i| {
            let task = core
                .spawn(TaskDesc::new(format!("stacked-{i}")).affinity(CpuMask::single(0)))
                .unwrap();
            core.set_affinity(task.id(), CpuMask::first_n(core.config().nr_cpus))
                .unwrap();
            task
        })
        .collect()
}

#[test]
fn newly_idle_processor_pulls_one_task() {
    let (core, _clock) = core_with_clock(2);
    let tasks = stack_on_cpu0(&core, 2);

    // Processor 1 is about to idle; it pulls a waiter instead.
    let next = core.schedule(1).unwrap();
    assert_eq!(next.class(), ClassId::Fair);
    assert_eq!(next.cpu(), 1);
    assert!(tasks.iter().any(|t| t.id() == next.id()));
    // Exactly one task moved; the other stayed behind.
    assert_eq!(tasks.iter().filter(|t| t.cpu() == 0).count(), 1);
    assert_eq!(core.snapshot().balance_migrations, 1);
}

#[test]
fn newly_idle_balance_is_skipped_for_short_idle_periods() {
    let (core, clock) = core_with_clock(2);

    // Teach processor 1 that its idle periods are tiny: idle, then a wake
    // almost immediately.
    let probe = core
        .spawn(TaskDesc::new("probe").affinity(CpuMask::single(1)))
        .unwrap();
    assert_eq!(core.schedule(1).unwrap().id(), probe.id());
    clock.advance(Time::from_millis(1));
    core.block_current(1, schedcore::TaskState::Interruptible, false)
        .unwrap();
    core.schedule(1).unwrap();
    clock.advance(Time::from_micros(50));
    assert!(core.wake_up(probe.id()).unwrap());
    assert_eq!(core.schedule(1).unwrap().id(), probe.id());
    core.block_current(1, schedcore::TaskState::Interruptible, false)
        .unwrap();
    core.schedule(1).unwrap();

    let tasks = stack_on_cpu0(&core, 2);

    // Idle average (50us) is below the migration cost (500us): no pull.
    assert_eq!(core.schedule(1).unwrap().class(), ClassId::Idle);
    assert_eq!(tasks.iter().filter(|t| t.cpu() == 0).count(), 2);
}

#[test]
fn tick_balance_evens_out_a_two_zero_split() {
    let (core, clock) = core_with_clock(2);
    let tasks = stack_on_cpu0(&core, 2);

    clock.advance(Time::from_millis(1));
    core.scheduler_tick(1).unwrap();

    let on_cpu0 = tasks.iter().filter(|t| t.cpu() == 0).count();
    let on_cpu1 = tasks.iter().filter(|t| t.cpu() == 1).count();
    assert_eq!((on_cpu0, on_cpu1), (1, 1));
    assert!(core.snapshot().balance_attempts >= 1);
    assert_eq!(core.snapshot().balance_migrations, 1);
}

#[test]
fn balance_claims_are_rate_limited_per_domain() {
    let (core, clock) = core_with_clock(2);
    stack_on_cpu0(&core, 2);

    clock.advance(Time::from_millis(1));
    core.scheduler_tick(1).unwrap();
    let attempts = core.snapshot().balance_attempts;

    // Within the same interval the claim fails and no balance runs.
    clock.advance(Time::from_millis(1));
    core.scheduler_tick(1).unwrap();
    assert_eq!(core.snapshot().balance_attempts, attempts);

    // Past the interval the level is due again.
    clock.advance(Time::from_millis(4));
    core.scheduler_tick(1).unwrap();
    assert!(core.snapshot().balance_attempts > attempts);
}

#[test]
fn repeated_pull_failures_escalate_to_an_active_balance() {
    let (core, clock) = core_with_clock(2);

    // A movable task that is always running and a pinned waiter: the
    // regular pull can take neither.
    let runner = core
        .spawn(TaskDesc::new("runner").affinity(CpuMask::single(0)))
        .unwrap();
    assert_eq!(core.schedule(0).unwrap().id(), runner.id());
    core.set_affinity(runner.id(), CpuMask::first_n(2)).unwrap();
    let pinned = core
        .spawn(TaskDesc::new("pinned").affinity(CpuMask::single(0)))
        .unwrap();

    // Three claimed balance rounds from processor 1, all moving nothing.
    for _ in 0..3 {
        clock.advance(Time::from_millis(5));
        core.scheduler_tick(1).unwrap();
    }
    assert_eq!(core.snapshot().active_balances, 1);
    assert!(core.need_resched(0));

    // The stopper on processor 0 pushes the running task out; the pinned
    // waiter takes over.
    assert_eq!(core.schedule(0).unwrap().id(), pinned.id());
    assert_eq!(runner.cpu(), 1);
    assert!(runner.on_rq());
    assert_eq!(core.schedule(1).unwrap().id(), runner.id());
}
