//! Scheduling-domain topology: partitioned balancing realms and
//! hierarchical level descriptions.

use std::sync::Arc;

use schedcore::{
    ClassId, CpuMask, DomainFlags, ManualClock, SchedConfig, SchedCore, SchedError, TaskDesc,
    Time, TopologyDesc,
};

fn core_with_clock(nr_cpus: usize) -> (Arc<SchedCore>, Arc<ManualClock>) {
    let clock = ManualClock::shared();
    let core = SchedCore::with_clock(SchedConfig::with_cpus(nr_cpus), clock.clone())
        .expect("valid config");
    (core, clock)
}

#[test]
fn partitions_define_the_root_domain_spans() {
    let (core, _clock) = core_with_clock(4);
    core.partition_domains(&[CpuMask::from_bits(0b0011), CpuMask::from_bits(0b1100)])
        .unwrap();

    assert_eq!(core.rqs().rq(0).root_domain().span(), CpuMask::from_bits(0b0011));
    assert_eq!(core.rqs().rq(1).root_domain().span(), CpuMask::from_bits(0b0011));
    assert_eq!(core.rqs().rq(2).root_domain().span(), CpuMask::from_bits(0b1100));
    assert_eq!(core.rqs().rq(3).root_domain().span(), CpuMask::from_bits(0b1100));
}

#[test]
fn partition_validation() {
    let (core, _clock) = core_with_clock(4);
    assert_eq!(core.partition_domains(&[]), Err(SchedError::EmptyPartition));
    assert_eq!(
        core.partition_domains(&[CpuMask::from_bits(0b0011), CpuMask::from_bits(0)]),
        Err(SchedError::EmptyPartition)
    );
    assert_eq!(
        core.partition_domains(&[CpuMask::from_bits(0b0011), CpuMask::from_bits(0b0110)]),
        Err(SchedError::OverlappingPartitions(CpuMask::from_bits(0b0010)))
    );
    // A failed call leaves the single full-machine realm in place.
    assert_eq!(core.rqs().rq(0).root_domain().span(), CpuMask::first_n(4));
}

#[test]
fn balancing_does_not_cross_realm_boundaries() {
    let (core, clock) = core_with_clock(2);
    core.partition_domains(&[CpuMask::single(0), CpuMask::single(1)])
        .unwrap();

    // Two waiters on processor 0, both allowed everywhere.
    let tasks: Vec<_> = (0..2)
        .map(|i| {
            let t = core
                .spawn(TaskDesc::new(format!("t{i}")).affinity(CpuMask::single(0)))
                .unwrap();
            core.set_affinity(t.id(), CpuMask::first_n(2)).unwrap();
            t
        })
        .collect();

    // Neither the newly-idle pull nor the periodic balance may reach into
    // the other realm.
    assert_eq!(core.schedule(1).unwrap().class(), ClassId::Idle);
    clock.advance(Time::from_millis(10));
    core.scheduler_tick(1).unwrap();
    assert!(tasks.iter().all(|t| t.cpu() == 0));

    // Re-uniting the realms makes the imbalance visible again.
    core.partition_domains(&[CpuMask::first_n(2)]).unwrap();
    let next = core.schedule(1).unwrap();
    assert_eq!(next.class(), ClassId::Fair);
    assert_eq!(next.cpu(), 1);
}

#[test]
fn realtime_push_stays_inside_the_realm() {
    let (core, _clock) = core_with_clock(2);
    core.partition_domains(&[CpuMask::single(0), CpuMask::single(1)])
        .unwrap();

    let top = core
        .spawn(
            TaskDesc::new("top")
                .policy(schedcore::SchedPolicy::Fifo)
                .rt_priority(10)
                .affinity(CpuMask::single(0)),
        )
        .unwrap();
    assert_eq!(core.schedule(0).unwrap().id(), top.id());

    let waiter = core
        .spawn(
            TaskDesc::new("waiter")
                .policy(schedcore::SchedPolicy::Fifo)
                .rt_priority(5)
                .affinity(CpuMask::single(0)),
        )
        .unwrap();
    core.set_affinity(waiter.id(), CpuMask::first_n(2)).unwrap();

    // Processor 1 is idle but in a foreign realm; no push happens.
    assert_eq!(core.schedule(0).unwrap().id(), top.id());
    assert_eq!(waiter.cpu(), 0);
    assert_eq!(core.snapshot().rt_migrations, 0);
}

#[test]
fn two_level_topology_balances_within_the_package_first() {
    let (core, clock) = core_with_clock(4);
    let desc = TopologyDesc::default()
        .with_level(
            "pkg",
            vec![CpuMask::from_bits(0b0011), CpuMask::from_bits(0b1100)],
            DomainFlags::standard(),
        )
        .with_level(
            "node",
            vec![CpuMask::first_n(4)],
            DomainFlags::standard() | DomainFlags::SERIALIZE,
        );
    core.set_topology(desc).unwrap();

    // Stack two waiters on processor 0.
    let tasks: Vec<_> = (0..2)
        .map(|i| {
            let t = core
                .spawn(TaskDesc::new(format!("t{i}")).affinity(CpuMask::single(0)))
                .unwrap();
            core.set_affinity(t.id(), CpuMask::first_n(4)).unwrap();
            t
        })
        .collect();

    // The package sibling picks one up at its inner level.
    clock.advance(Time::from_millis(1));
    core.scheduler_tick(1).unwrap();
    assert_eq!(tasks.iter().filter(|t| t.cpu() == 1).count(), 1);
    assert_eq!(tasks.iter().filter(|t| t.cpu() == 0).count(), 1);
}

#[test]
fn invalid_topology_is_rejected_and_keeps_the_old_chains() {
    let (core, _clock) = core_with_clock(2);
    let bad = TopologyDesc::flat(2).with_level(
        "broken",
        vec![CpuMask::single(0), CpuMask::single(0)],
        DomainFlags::standard(),
    );
    assert!(matches!(
        core.set_topology(bad),
        Err(SchedError::OverlappingPartitions(_))
    ));

    // The previous flat topology still balances.
    let task = core
        .spawn(TaskDesc::new("t").affinity(CpuMask::single(0)))
        .unwrap();
    let other = core
        .spawn(TaskDesc::new("u").affinity(CpuMask::single(0)))
        .unwrap();
    core.set_affinity(task.id(), CpuMask::first_n(2)).unwrap();
    core.set_affinity(other.id(), CpuMask::first_n(2)).unwrap();
    let next = core.schedule(1).unwrap();
    assert_eq!(next.class(), ClassId::Fair);
}
