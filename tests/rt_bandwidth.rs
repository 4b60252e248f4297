//! Real-time bandwidth enforcement: throttling at the tick, refill at the
//! period boundary, and hierarchical admission control.

use std::sync::Arc;
use std::time::Duration;

use schedcore::{
    ClassId, ManualClock, RtBandwidth, SchedConfig, SchedCore, SchedError, SchedPolicy, TaskDesc,
    Time,
};

fn rt_core(runtime_ms: u64) -> (Arc<SchedCore>, Arc<ManualClock>) {
    let clock = ManualClock::shared();
    let mut config = SchedConfig::with_cpus(1);
    config.rt.period = Duration::from_secs(1);
    config.rt.runtime = Some(Duration::from_millis(runtime_ms));
    let core = SchedCore::with_clock(config, clock.clone()).expect("valid config");
    (core, clock)
}

fn fifo(name: &str, prio: u32) -> TaskDesc {
    TaskDesc::new(name).policy(SchedPolicy::Fifo).rt_priority(prio)
}

#[test]
fn group_throttles_when_the_budget_is_exhausted() {
    let (core, clock) = rt_core(500);
    let task = core.spawn(fifo("spinner", 10)).unwrap();
    assert_eq!(core.schedule(0).unwrap().id(), task.id());

    // 500ms consumed: at the limit, not over it.
    for _ in 0..50 {
        clock.advance(Time::from_millis(10));
        core.scheduler_tick(0).unwrap();
    }
    assert_eq!(core.snapshot().rt_throttles, 0);
    assert!(!core.need_resched(0));
    assert_eq!(core.rt_root_group().consumed(0), Time::from_millis(500));

    // The tick that crosses the limit parks the group.
    clock.advance(Time::from_millis(10));
    core.scheduler_tick(0).unwrap();
    assert_eq!(core.snapshot().rt_throttles, 1);
    assert!(core.need_resched(0));

    // With the only runnable task parked, idle runs.
    assert_eq!(core.schedule(0).unwrap().class(), ClassId::Idle);
    assert!(task.on_rq());
}

#[test]
fn period_refill_unparks_the_group() {
    let (core, clock) = rt_core(500);
    let task = core.spawn(fifo("spinner", 10)).unwrap();
    assert_eq!(core.schedule(0).unwrap().id(), task.id());

    for _ in 0..51 {
        clock.advance(Time::from_millis(10));
        core.scheduler_tick(0).unwrap();
    }
    assert_eq!(core.schedule(0).unwrap().class(), ClassId::Idle);

    // Cross the period boundary; the tick path runs the refill.
    clock.advance(Time::from_millis(500));
    core.scheduler_tick(0).unwrap();
    assert_eq!(core.snapshot().rt_unthrottles, 1);
    assert!(core.need_resched(0));
    assert_eq!(core.schedule(0).unwrap().id(), task.id());
}

#[test]
fn fair_tasks_run_while_the_rt_group_is_parked() {
    let (core, clock) = rt_core(100);
    let spinner = core.spawn(fifo("spinner", 10)).unwrap();
    let background = core.spawn(TaskDesc::new("background")).unwrap();

    assert_eq!(core.schedule(0).unwrap().id(), spinner.id());
    for _ in 0..11 {
        clock.advance(Time::from_millis(10));
        core.scheduler_tick(0).unwrap();
    }
    assert_eq!(core.snapshot().rt_throttles, 1);
    // The starved fair task finally gets the processor.
    assert_eq!(core.schedule(0).unwrap().id(), background.id());
}

#[test]
fn child_group_throttles_independently_of_the_root() {
    let (core, clock) = rt_core(500);
    let child = core
        .create_rt_group(
            core.rt_root_group(),
            RtBandwidth {
                period: Time::from_secs(1),
                runtime: Some(Time::from_millis(50)),
            },
        )
        .unwrap();
    let task = core.spawn(fifo("capped", 10)).unwrap();
    core.attach_to_group(task.id(), &child).unwrap();

    assert_eq!(core.schedule(0).unwrap().id(), task.id());
    for _ in 0..6 {
        clock.advance(Time::from_millis(10));
        core.scheduler_tick(0).unwrap();
    }
    assert_eq!(core.snapshot().rt_throttles, 1);
    assert_eq!(child.consumed(0), Time::from_millis(60));
    // Only the child's budget was consumed.
    assert_eq!(core.rt_root_group().consumed(0), Time::ZERO);

    assert_eq!(core.schedule(0).unwrap().class(), ClassId::Idle);
    clock.advance(Time::from_millis(950));
    core.scheduler_tick(0).unwrap();
    assert_eq!(core.schedule(0).unwrap().id(), task.id());
}

#[test]
fn admission_rejects_overcommitted_children() {
    let (core, _clock) = rt_core(500);
    let half = RtBandwidth {
        period: Time::from_secs(1),
        runtime: Some(Time::from_millis(300)),
    };
    core.create_rt_group(core.rt_root_group(), half).unwrap();
    // A second 300ms/1s child would exceed the root's 500ms/1s grant.
    assert!(matches!(
        core.create_rt_group(core.rt_root_group(), half),
        Err(SchedError::BandwidthOvercommitted { .. })
    ));
}

#[test]
fn admission_rejects_runtime_beyond_period() {
    let (core, _clock) = rt_core(500);
    let result = core.create_rt_group(
        core.rt_root_group(),
        RtBandwidth {
            period: Time::from_millis(10),
            runtime: Some(Time::from_millis(20)),
        },
    );
    assert!(matches!(
        result,
        Err(SchedError::RuntimeExceedsPeriod { .. })
    ));
}

#[test]
fn zero_runtime_is_refused_while_the_group_has_tasks() {
    let (core, _clock) = rt_core(500);
    let child = core
        .create_rt_group(
            core.rt_root_group(),
            RtBandwidth {
                period: Time::from_secs(1),
                runtime: Some(Time::from_millis(100)),
            },
        )
        .unwrap();
    let task = core.spawn(fifo("member", 10)).unwrap();
    core.attach_to_group(task.id(), &child).unwrap();

    assert_eq!(
        core.set_rt_bandwidth(
            &child,
            RtBandwidth {
                period: Time::from_secs(1),
                runtime: Some(Time::ZERO),
            },
        ),
        Err(SchedError::ZeroRuntimeWithRtTasks)
    );
}

#[test]
fn period_timer_starts_and_shuts_down_cleanly() {
    let core = SchedCore::new(SchedConfig::with_cpus(1)).unwrap();
    let timer = core.start_period_timer();
    // Dropping the handle joins the refill thread.
    drop(timer);
    // The core keeps working without it.
    let task = core.spawn(fifo("after", 10)).unwrap();
    assert_eq!(core.schedule(0).unwrap().id(), task.id());
}

#[test]
fn bandwidth_groups_cannot_hold_fair_tasks() {
    let (core, _clock) = rt_core(500);
    let task = core.spawn(TaskDesc::new("fair")).unwrap();
    let root = Arc::clone(core.rt_root_group());
    assert!(matches!(
        core.attach_to_group(task.id(), &root),
        Err(SchedError::InvalidPriority { .. })
    ));
}
