//! Processor topology: scheduling domains and root domains.
//!
//! A [`TopologyDesc`] describes the machine as a stack of levels, bottom
//! up: each level partitions processors into cells (siblings, packages,
//! nodes). From it the builder derives one domain chain per processor,
//! where each [`SchedDomain`] spans that processor's cell at its level and
//! is partitioned into groups along the child level's cells. Balancing
//! walks the chain bottom-up, evening load between groups at each level.
//!
//! Chains are immutable once built; a rebuild constructs the whole new
//! forest first and only then publishes it per processor through an
//! epoch-protected cell, so tick-path readers never see a half-built tree
//! and a failed rebuild leaves the previous one in place.
//!
//! Degenerate levels are pruned: a domain with a single group balances
//! nothing, and a parent that spans exactly its child adds nothing.

mod epoch;
mod root_domain;

pub(crate) use epoch::EpochCell;
pub use root_domain::RootDomain;

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;
use smallvec::SmallVec;

use crate::error::{Result, SchedError};
use crate::types::{CpuId, CpuMask, Time, NICE_0_LOAD};

bitflags! {
    /// Behavior switches for one domain level.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DomainFlags: u32 {
        /// Periodic balancing runs at this level.
        const LOAD_BALANCE = 1 << 0;
        /// A processor going idle may pull from this level immediately.
        const NEWIDLE = 1 << 1;
        /// Fork placement may spread across this level.
        const FORK = 1 << 2;
        /// Wake placement may consider this level.
        const WAKE = 1 << 3;
        /// Members share execution capacity (hardware threads).
        const SHARE_CPUCAPACITY = 1 << 4;
        /// Members share package resources (caches).
        const SHARE_PKG_RESOURCES = 1 << 5;
        /// Balance this level on one processor at a time.
        const SERIALIZE = 1 << 6;
        /// Prefer filling sibling groups before spilling outward.
        const PREFER_SIBLING = 1 << 7;
    }
}

impl DomainFlags {
    /// Flags that make a single-group domain worth keeping.
    const PLACEMENT: Self = Self::FORK.union(Self::WAKE);

    /// Defaults for an ordinary balancing level.
    #[must_use]
    pub fn standard() -> Self {
        Self::LOAD_BALANCE | Self::NEWIDLE | Self::FORK | Self::WAKE
    }
}

/// One level of the topology description, bottom up.
#[derive(Debug, Clone)]
pub struct TopologyLevel {
    /// Level name for logs ("smt", "pkg", "node").
    pub name: String,
    /// Disjoint cells partitioning the processors at this level.
    pub cells: Vec<CpuMask>,
    /// Behavior of domains derived from this level.
    pub flags: DomainFlags,
}

/// Description of the machine's processor topology.
#[derive(Debug, Clone, Default)]
pub struct TopologyDesc {
    /// Levels, innermost first.
    pub levels: Vec<TopologyLevel>,
}

impl TopologyDesc {
    /// A single flat level spanning `nr_cpus` processors.
    #[must_use]
    pub fn flat(nr_cpus: usize) -> Self {
        Self {
            levels: vec![TopologyLevel {
                name: "flat".to_string(),
                cells: vec![CpuMask::first_n(nr_cpus)],
                flags: DomainFlags::standard(),
            }],
        }
    }

    /// Appends a level on top of the existing ones.
    #[must_use]
    pub fn with_level(
        mut self,
        name: impl Into<String>,
        cells: Vec<CpuMask>,
        flags: DomainFlags,
    ) -> Self {
        self.levels.push(TopologyLevel {
            name: name.into(),
            cells,
            flags,
        });
        self
    }

    /// Validates the description: every level's cells must be non-empty
    /// and pairwise disjoint.
    pub fn validate(&self) -> Result<()> {
        for level in &self.levels {
            let mut seen = CpuMask::from_bits(0);
            for &cell in &level.cells {
                if cell.is_empty() {
                    return Err(SchedError::EmptyPartition);
                }
                let overlap = seen.and(cell);
                if !overlap.is_empty() {
                    return Err(SchedError::OverlappingPartitions(overlap));
                }
                seen = seen.or(cell);
            }
        }
        Ok(())
    }
}

/// A balancing group inside a domain: one child cell.
#[derive(Debug, Clone)]
pub struct SchedGroup {
    /// Processors in the group.
    pub span: CpuMask,
    /// Nominal capacity, `NICE_0_LOAD` per processor.
    pub capacity: u64,
}

/// One level of a processor's domain chain.
#[derive(Debug)]
pub struct SchedDomain {
    /// Level name, for logs.
    pub name: String,
    /// Processors this domain spans.
    pub span: CpuMask,
    /// Behavior switches.
    pub flags: DomainFlags,
    /// Groups partitioning the span; the first contains the owner.
    pub groups: SmallVec<[SchedGroup; 4]>,
    /// Position in the chain, zero innermost.
    pub level: usize,
    /// Interval between periodic balances at this level.
    pub balance_interval: Time,
    /// Next time a periodic balance may run, nanoseconds.
    next_balance: AtomicU64,
    /// Consecutive balances that moved nothing; drives escalation.
    nr_balance_failed: AtomicU32,
}

impl SchedDomain {
    /// True if a periodic balance is due; advances the deadline when so,
    /// letting exactly one caller per interval through.
    pub(crate) fn try_claim_balance(&self, now: Time) -> bool {
        let due = self.next_balance.load(Ordering::Relaxed);
        if now.as_nanos() < due {
            return false;
        }
        let next = now.saturating_add(self.balance_interval).as_nanos();
        self.next_balance
            .compare_exchange(due, next, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// Records a balance that moved nothing; returns the streak length.
    pub(crate) fn record_balance_failure(&self) -> u32 {
        self.nr_balance_failed.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Clears the failure streak after a successful balance.
    pub(crate) fn reset_balance_failures(&self) {
        self.nr_balance_failed.store(0, Ordering::Relaxed);
    }
}

/// A processor's full chain, innermost domain first.
#[derive(Debug, Default)]
pub struct DomainChain {
    /// Domains, bottom up. Empty for a processor outside every realm.
    pub domains: Vec<SchedDomain>,
}

/// Builds the domain chains for every processor in `realm`.
///
/// `base_interval` seeds each level's balance interval; outer levels
/// balance progressively less often. Fails without side effects when the
/// description is invalid.
pub(crate) fn build_chains(
    desc: &TopologyDesc,
    realm: CpuMask,
    base_interval: Time,
) -> Result<Vec<(CpuId, DomainChain)>> {
    desc.validate()?;

    let mut chains = Vec::new();
    for cpu in realm.iter() {
        let mut domains = Vec::new();
        // The child partition starts as one singleton per processor.
        let mut child_cells: Vec<CpuMask> = realm.iter().map(CpuMask::single).collect();

        for (level_idx, level) in desc.levels.iter().enumerate() {
            let Some(cell) = level.cells.iter().find(|c| c.contains(cpu)) else {
                break;
            };
            let span = cell.and(realm);
            if span.is_empty() {
                break;
            }

            let mut groups: SmallVec<[SchedGroup; 4]> = child_cells
                .iter()
                .map(|&c| c.and(span))
                .filter(|c| !c.is_empty())
                .map(|span| SchedGroup {
                    span,
                    capacity: span.weight() as u64 * NICE_0_LOAD,
                })
                .collect();
            for group in &groups {
                if group.capacity == 0 {
                    return Err(SchedError::ZeroCapacityGroup(group.span));
                }
            }
            // The owner's group leads; balancing compares it to the rest.
            if let Some(pos) = groups.iter().position(|g| g.span.contains(cpu)) {
                groups.rotate_left(pos);
            }

            domains.push(SchedDomain {
                name: level.name.clone(),
                span,
                flags: level.flags,
                groups,
                level: level_idx,
                balance_interval: base_interval.saturating_mul(level_idx as u64 + 1),
                next_balance: AtomicU64::new(0),
                nr_balance_failed: AtomicU32::new(0),
            });
            child_cells = level.cells.iter().map(|&c| c.and(realm)).collect();
        }

        // Prune: single-group domains with no placement role, and parents
        // that add no processors over their child.
        let mut pruned: Vec<SchedDomain> = Vec::new();
        for domain in domains {
            if domain.groups.len() < 2 && !domain.flags.intersects(DomainFlags::PLACEMENT) {
                continue;
            }
            if let Some(prev) = pruned.last() {
                if prev.span == domain.span && prev.flags.contains(domain.flags) {
                    continue;
                }
            }
            pruned.push(domain);
        }
        chains.push((cpu, DomainChain { domains: pruned }));
    }
    Ok(chains)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask(bits: u64) -> CpuMask {
        CpuMask::from_bits(bits)
    }

    #[test]
    fn flat_topology_builds_one_domain_per_cpu() {
        let desc = TopologyDesc::flat(4);
        let chains = build_chains(&desc, mask(0b1111), Time::from_millis(4)).expect("valid");
        assert_eq!(chains.len(), 4);
        for (cpu, chain) in &chains {
            assert_eq!(chain.domains.len(), 1);
            let domain = &chain.domains[0];
            assert_eq!(domain.span, mask(0b1111));
            assert_eq!(domain.groups.len(), 4);
            assert!(domain.groups[0].span.contains(*cpu), "owner group leads");
        }
    }

    #[test]
    fn two_level_topology_nests_groups() {
        // Two packages of two processors each.
        let desc = TopologyDesc::default()
            .with_level(
                "pkg",
                vec![mask(0b0011), mask(0b1100)],
                DomainFlags::standard() | DomainFlags::SHARE_PKG_RESOURCES,
            )
            .with_level("sys", vec![mask(0b1111)], DomainFlags::standard());
        let chains = build_chains(&desc, mask(0b1111), Time::from_millis(4)).expect("valid");
        let (_, chain) = &chains[0];
        assert_eq!(chain.domains.len(), 2);
        assert_eq!(chain.domains[0].span, mask(0b0011));
        assert_eq!(chain.domains[0].groups.len(), 2, "singleton groups");
        assert_eq!(chain.domains[1].span, mask(0b1111));
        assert_eq!(chain.domains[1].groups.len(), 2, "package groups");
        assert_eq!(chain.domains[1].groups[0].span, mask(0b0011));
        assert_eq!(chain.domains[1].groups[0].capacity, 2 * NICE_0_LOAD);
        assert!(chain.domains[1].balance_interval > chain.domains[0].balance_interval);
    }

    #[test]
    fn realm_restriction_shrinks_spans() {
        let desc = TopologyDesc::flat(4);
        let chains = build_chains(&desc, mask(0b0111), Time::from_millis(4)).expect("valid");
        assert_eq!(chains.len(), 3);
        for (_, chain) in &chains {
            assert_eq!(chain.domains[0].span, mask(0b0111));
        }
    }

    #[test]
    fn degenerate_single_cpu_domain_is_pruned() {
        let desc = TopologyDesc::default().with_level(
            "lone",
            vec![mask(0b0001)],
            DomainFlags::LOAD_BALANCE,
        );
        let chains = build_chains(&desc, mask(0b0001), Time::from_millis(4)).expect("valid");
        assert!(chains[0].1.domains.is_empty(), "one group, no placement role");
    }

    #[test]
    fn overlapping_cells_are_rejected() {
        let desc = TopologyDesc::default().with_level(
            "bad",
            vec![mask(0b0011), mask(0b0110)],
            DomainFlags::standard(),
        );
        let err = build_chains(&desc, mask(0b0111), Time::from_millis(4)).unwrap_err();
        assert!(matches!(err, SchedError::OverlappingPartitions(m) if m == mask(0b0010)));
    }

    #[test]
    fn empty_cell_is_rejected() {
        let desc =
            TopologyDesc::default().with_level("bad", vec![mask(0)], DomainFlags::standard());
        assert!(matches!(
            build_chains(&desc, mask(0b1), Time::from_millis(4)),
            Err(SchedError::EmptyPartition)
        ));
    }

    #[test]
    fn balance_claim_rate_limits() {
        let desc = TopologyDesc::flat(2);
        let chains = build_chains(&desc, mask(0b11), Time::from_millis(4)).expect("valid");
        let domain = &chains[0].1.domains[0];
        assert!(domain.try_claim_balance(Time::from_millis(1)));
        assert!(!domain.try_claim_balance(Time::from_millis(2)), "within interval");
        assert!(domain.try_claim_balance(Time::from_millis(6)));
    }
}
