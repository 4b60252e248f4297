//! Root domains: disjoint balancing realms.
//!
//! Every runqueue belongs to exactly one root domain; balancing and
//! real-time push/pull never cross realm boundaries. The realm carries the
//! lock-free state remote processors consult without taking runqueue locks:
//! per-processor real-time ceilings and the overload mask.

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use crate::types::{CpuId, CpuMask, MAX_CPUS};

/// A balancing realm covering a fixed span of processors.
#[derive(Debug)]
pub struct RootDomain {
    /// Processors belonging to this realm.
    span: CpuMask,
    /// Highest runnable real-time priority per processor, running task
    /// included. Zero means no real-time work.
    rt_ceiling: Box<[AtomicI32]>,
    /// Processors with real-time work queued behind a running real-time
    /// task; pull candidates.
    rt_overload: AtomicU64,
}

impl RootDomain {
    /// Creates a realm spanning `span`.
    #[must_use]
    pub fn new(span: CpuMask) -> Self {
        let rt_ceiling = (0..MAX_CPUS).map(|_| AtomicI32::new(0)).collect();
        Self {
            span,
            rt_ceiling,
            rt_overload: AtomicU64::new(0),
        }
    }

    /// The processors this realm covers.
    #[inline]
    #[must_use]
    pub fn span(&self) -> CpuMask {
        self.span
    }

    /// The published real-time ceiling of `cpu`.
    #[inline]
    #[must_use]
    pub fn rt_ceiling(&self, cpu: CpuId) -> i32 {
        self.rt_ceiling[cpu].load(Ordering::Acquire)
    }

    pub(crate) fn set_rt_ceiling(&self, cpu: CpuId, prio: i32) {
        self.rt_ceiling[cpu].store(prio, Ordering::Release);
    }

    pub(crate) fn set_rt_overloaded(&self, cpu: CpuId, overloaded: bool) {
        let bit = 1u64 << cpu;
        if overloaded {
            self.rt_overload.fetch_or(bit, Ordering::AcqRel);
        } else {
            self.rt_overload.fetch_and(!bit, Ordering::AcqRel);
        }
    }

    /// Processors currently flagged as real-time overloaded.
    #[must_use]
    pub fn rt_overloaded(&self) -> CpuMask {
        CpuMask::from_bits(self.rt_overload.load(Ordering::Acquire))
    }
}
