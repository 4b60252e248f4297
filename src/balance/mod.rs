//! Topology-aware fair load balancing.
//!
//! Periodic balancing runs from the tick on each processor, walking that
//! processor's domain chain bottom-up. At each due level it compares its
//! own group's load against the sibling groups, finds the busiest
//! processor in the heaviest group, and pulls queued fair tasks toward
//! itself under an ordered pair of runqueue locks. Newly-idle balancing is
//! the same walk, run eagerly from dispatch when a processor is about to
//! idle and its measured idle periods are long enough to amortize a
//! migration.
//!
//! When pinned or running tasks keep defeating the pull, the balancer
//! escalates: it flags the busiest runqueue for an active balance, and
//! that processor's stopper pushes one task here instead.
//!
//! Load comparisons use the lock-free per-runqueue load mirrors; locks are
//! taken only for the actual move, and everything read beforehand is
//! revalidated by the pull itself (it skips tasks that are gone or
//! disallowed).

use crate::class::SchedClass;
use crate::rq::RunqueueSet;
use crate::sched::SchedCore;
use crate::topology::{DomainFlags, SchedDomain};
use crate::types::{CpuId, Time, NICE_0_LOAD};

/// A pull decision at one domain level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PullPlan {
    /// Processor to pull from.
    pub src_cpu: CpuId,
    /// Weight the pull should move.
    pub imbalance: u64,
}

/// Finds the busiest processor visible from `this_cpu` at `domain`, if the
/// imbalance is worth acting on.
pub(crate) fn find_busiest(
    rqs: &RunqueueSet,
    domain: &SchedDomain,
    this_cpu: CpuId,
) -> Option<PullPlan> {
    let local = domain.groups.first()?;
    debug_assert!(local.span.contains(this_cpu));

    let group_load = |span: crate::types::CpuMask| -> u64 {
        span.iter().map(|cpu| rqs.rq(cpu).load_estimate()).sum()
    };
    let local_avg = group_load(local.span) * NICE_0_LOAD / local.capacity;

    let mut busiest: Option<(&crate::topology::SchedGroup, u64)> = None;
    for group in domain.groups.iter().skip(1) {
        let avg = group_load(group.span) * NICE_0_LOAD / group.capacity;
        if avg > local_avg && busiest.map_or(true, |(_, best)| avg > best) {
            busiest = Some((group, avg));
        }
    }
    let (busiest_group, busiest_avg) = busiest?;

    // Move half the difference, scaled back to weight units.
    let imbalance =
        ((busiest_avg - local_avg) / 2 * busiest_group.capacity / NICE_0_LOAD).max(1);

    // Busiest processor within the group; it must have something queued
    // beyond its running task, or there is nothing a pull can take.
    let src_cpu = busiest_group
        .span
        .iter()
        .filter(|&cpu| cpu != this_cpu && rqs.rq(cpu).nr_running_estimate() > 1)
        .max_by_key(|&cpu| rqs.rq(cpu).load_estimate())?;

    Some(PullPlan { src_cpu, imbalance })
}

/// Periodic balance from the tick path on `this_cpu`. No lock held.
pub(crate) fn rebalance_tick(core: &SchedCore, this_cpu: CpuId, now: Time) {
    core.domains(this_cpu).read(|chain| {
        for domain in &chain.domains {
            if !domain.flags.contains(DomainFlags::LOAD_BALANCE) {
                continue;
            }
            if !domain.try_claim_balance(now) {
                continue;
            }
            // Serialized levels balance on one processor at a time.
            let _serial = if domain.flags.contains(DomainFlags::SERIALIZE) {
                match core.serialize_lock().try_lock() {
                    Some(guard) => Some(guard),
                    None => continue,
                }
            } else {
                None
            };
            balance_domain(core, domain, this_cpu, false);
        }
    });
}

/// Newly-idle balance from dispatch, just before `this_cpu` goes idle.
pub(crate) fn rebalance_newidle(core: &SchedCore, this_cpu: CpuId) {
    // Not worth migrating a cache-warm task into an idle period shorter
    // than the migration itself.
    let avg_idle = core.rqs().lock(this_cpu).avg_idle;
    if !avg_idle.is_zero() && avg_idle < core.config().balance.migration_cost {
        return;
    }
    core.domains(this_cpu).read(|chain| {
        for domain in &chain.domains {
            if !domain.flags.contains(DomainFlags::NEWIDLE) {
                continue;
            }
            if balance_domain(core, domain, this_cpu, true) > 0 {
                break;
            }
        }
    });
}

/// Balances one domain level. Returns the number of tasks moved.
fn balance_domain(core: &SchedCore, domain: &SchedDomain, this_cpu: CpuId, newidle: bool) -> usize {
    core.stats().balance_attempts.increment();
    let Some(plan) = find_busiest(core.rqs(), domain, this_cpu) else {
        domain.reset_balance_failures();
        return 0;
    };

    let max_tasks = if newidle {
        1
    } else {
        core.config().balance.nr_migrate
    };
    let (mut dst, mut src) = core.rqs().double_lock(this_cpu, plan.src_cpu);
    let moved = core
        .classes()
        .fair()
        .pull_tasks(&mut src, &mut dst, max_tasks, plan.imbalance);
    drop((dst, src));

    if moved > 0 {
        core.stats().balance_migrations.add(moved as u64);
        domain.reset_balance_failures();
        tracing::trace!(
            cpu = this_cpu,
            src = plan.src_cpu,
            moved,
            level = domain.level,
            "balance moved tasks"
        );
        return moved;
    }

    // Nothing movable: everything pinned or running. Escalate to an
    // active balance once the streak is long enough.
    let failures = domain.record_balance_failure();
    if !newidle && failures > core.config().balance.active_balance_threshold {
        let src_rq = core.rqs().rq(plan.src_cpu);
        if !src_rq.active_balance_pending() {
            src_rq.set_active_balance(true);
            src_rq.push_stop_work(crate::rq::StopWork::ActiveBalance { dest_cpu: this_cpu });
            src_rq.set_need_resched();
            core.stats().active_balances.increment();
            tracing::debug!(src = plan.src_cpu, dst = this_cpu, "active balance requested");
        }
        domain.reset_balance_failures();
    }
    0
}
