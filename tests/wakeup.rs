//! Wake-up semantics: single-winner claims under contention, the on-rq
//! fast path, and placement decisions.

use std::sync::Arc;
use std::thread;

use schedcore::{
    ClassId, CpuMask, ManualClock, SchedConfig, SchedCore, TaskDesc, TaskState, Time,
};

fn core_with_clock(nr_cpus: usize) -> (Arc<SchedCore>, Arc<ManualClock>) {
    let clock = ManualClock::shared();
    let core = SchedCore::with_clock(SchedConfig::with_cpus(nr_cpus), clock.clone())
        .expect("valid config");
    (core, clock)
}

#[test]
fn exactly_one_concurrent_waker_wins() {
    let (core, _clock) = core_with_clock(1);
    let task = core.spawn(TaskDesc::new("contended")).unwrap();
    assert_eq!(core.schedule(0).unwrap().id(), task.id());
    core.block_current(0, TaskState::Interruptible, false)
        .unwrap();
    core.schedule(0).unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let core = Arc::clone(&core);
        let id = task.id();
        handles.push(thread::spawn(move || core.wake_up(id).unwrap()));
    }
    let wins: usize = handles
        .into_iter()
        .map(|h| usize::from(h.join().unwrap()))
        .sum();

    assert_eq!(wins, 1);
    assert_eq!(task.state(), TaskState::Running);
    assert!(task.on_rq());
    assert_eq!(core.snapshot().wakeups, 1);
}

#[test]
fn waking_a_running_task_is_a_no_op() {
    let (core, _clock) = core_with_clock(1);
    let task = core.spawn(TaskDesc::new("runner")).unwrap();
    assert_eq!(core.schedule(0).unwrap().id(), task.id());

    assert!(!core.wake_up(task.id()).unwrap());
}

#[test]
fn wake_before_dispatch_takes_the_fast_path() {
    let (core, _clock) = core_with_clock(1);
    let task = core.spawn(TaskDesc::new("racer")).unwrap();
    assert_eq!(core.schedule(0).unwrap().id(), task.id());

    // Blocked but not yet dispatched away: still on the runqueue.
    core.block_current(0, TaskState::Interruptible, false)
        .unwrap();
    assert!(task.on_rq());

    assert!(core.wake_up(task.id()).unwrap());
    assert_eq!(task.state(), TaskState::Running);
    assert_eq!(core.snapshot().wakeups_local, 1);

    // The aborted sleep never leaves the processor.
    assert_eq!(core.schedule(0).unwrap().id(), task.id());
}

#[test]
fn exit_races_with_a_concurrent_waker() {
    let (core, _clock) = core_with_clock(1);
    for _ in 0..100 {
        let task = core.spawn(TaskDesc::new("ephemeral")).unwrap();
        let id = task.id();
        assert_eq!(core.schedule(0).unwrap().id(), id);
        core.block_current(0, TaskState::Interruptible, false)
            .unwrap();
        core.schedule(0).unwrap();

        let waker = {
            let core = Arc::clone(&core);
            thread::spawn(move || core.wake_up(id))
        };
        let exited = core.exit_task(id);
        let woke = waker.join().unwrap();

        match exited {
            Ok(()) => {
                // Removal won; the waker cannot have made it runnable.
                assert!(!matches!(woke, Ok(true)));
                assert!(core.task(id).is_err());
            }
            Err(_) => {
                // The wake won; run the task out and retire it for real.
                core.wake_up(id).unwrap();
                assert_eq!(core.schedule(0).unwrap().id(), id);
                core.block_current(0, TaskState::Interruptible, false)
                    .unwrap();
                core.schedule(0).unwrap();
                core.exit_task(id).unwrap();
            }
        }
    }
}

#[test]
fn wake_prefers_the_previous_processor_while_it_is_idle() {
    let (core, _clock) = core_with_clock(2);
    let a = core.spawn(TaskDesc::new("a")).unwrap();
    let b = core.spawn(TaskDesc::new("b")).unwrap();

    // Fork placement spread them out.
    assert_ne!(a.cpu(), b.cpu());
    let b_cpu = b.cpu();
    assert_eq!(core.schedule(a.cpu()).unwrap().id(), a.id());
    assert_eq!(core.schedule(b_cpu).unwrap().id(), b.id());

    core.block_current(b_cpu, TaskState::Interruptible, false)
        .unwrap();
    assert_eq!(core.schedule(b_cpu).unwrap().class(), ClassId::Idle);

    assert!(core.wake_up(b.id()).unwrap());
    assert_eq!(b.cpu(), b_cpu);
    assert!(b.on_rq());
}

#[test]
fn wake_avoids_a_busy_previous_processor() {
    let (core, _clock) = core_with_clock(2);
    let a = core.spawn(TaskDesc::new("a").affinity(CpuMask::single(0))).unwrap();
    let b = core.spawn(TaskDesc::new("b").affinity(CpuMask::single(0))).unwrap();

    assert_eq!(core.schedule(0).unwrap().id(), a.id());
    core.block_current(0, TaskState::Interruptible, false)
        .unwrap();
    assert_eq!(core.schedule(0).unwrap().id(), b.id());

    // Processor 0 is busy with b; a may go anywhere now.
    core.set_affinity(a.id(), CpuMask::first_n(2)).unwrap();
    assert!(core.wake_up(a.id()).unwrap());
    assert_eq!(a.cpu(), 1);
    assert!(a.on_rq());
}

#[test]
fn fork_placement_balances_across_idle_processors() {
    let (core, _clock) = core_with_clock(4);
    let tasks: Vec<_> = (0..4)
        .map(|i| core.spawn(TaskDesc::new(format!("worker-{i}"))).unwrap())
        .collect();

    let mut seen = CpuMask::from_bits(0);
    for task in &tasks {
        seen = seen.with(task.cpu());
    }
    // Four forks onto four idle processors spread out fully.
    assert_eq!(seen, CpuMask::first_n(4));
}

#[test]
fn wake_from_iowait_clears_the_flag_without_dispatch() {
    let (core, clock) = core_with_clock(1);
    let task = core.spawn(TaskDesc::new("reader")).unwrap();
    assert_eq!(core.schedule(0).unwrap().id(), task.id());

    // Block with iowait but wake before the dispatch point is reached.
    core.block_current(0, TaskState::Uninterruptible, true)
        .unwrap();
    clock.advance(Time::from_micros(10));
    assert!(core.wake_up(task.id()).unwrap());

    assert!(!task.in_iowait());
    assert_eq!(core.rqs().rq(0).nr_iowait(), 0);
    assert_eq!(core.schedule(0).unwrap().id(), task.id());
}
