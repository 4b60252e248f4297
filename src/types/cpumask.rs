//! Processor sets as fixed-width bitmasks.
//!
//! The core supports up to 64 logical processors; a `CpuMask` is a plain
//! `u64` bitset with one bit per processor. Masks are `Copy` and all
//! operations are branch-light, so they can be passed around freely on
//! scheduling hot paths and stored in atomics (see `Task::affinity`).

use core::fmt;

use crate::types::CpuId;

/// Maximum number of logical processors the core supports.
pub const MAX_CPUS: usize = 64;

/// A set of processors, one bit per [`CpuId`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CpuMask(u64);

impl CpuMask {
    /// The empty set.
    pub const EMPTY: Self = Self(0);

    /// Creates a mask from raw bits.
    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Returns the raw bits.
    #[inline]
    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// A mask containing a single processor.
    #[inline]
    #[must_use]
    pub const fn single(cpu: CpuId) -> Self {
        Self(1u64 << cpu)
    }

    /// A mask containing processors `0..n`.
    #[inline]
    #[must_use]
    pub const fn first_n(n: usize) -> Self {
        if n >= MAX_CPUS {
            Self(u64::MAX)
        } else {
            Self((1u64 << n) - 1)
        }
    }

    /// Tests whether `cpu` is in the set.
    #[inline]
    #[must_use]
    pub const fn contains(self, cpu: CpuId) -> bool {
        cpu < MAX_CPUS && self.0 & (1u64 << cpu) != 0
    }

    /// Returns the set with `cpu` added.
    #[inline]
    #[must_use]
    pub const fn with(self, cpu: CpuId) -> Self {
        Self(self.0 | (1u64 << cpu))
    }

    /// Returns the set with `cpu` removed.
    #[inline]
    #[must_use]
    pub const fn without(self, cpu: CpuId) -> Self {
        Self(self.0 & !(1u64 << cpu))
    }

    /// Set intersection.
    #[inline]
    #[must_use]
    pub const fn and(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Set union.
    #[inline]
    #[must_use]
    pub const fn or(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Set difference (`self` minus `other`).
    #[inline]
    #[must_use]
    pub const fn and_not(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// True if the set is empty.
    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Number of processors in the set.
    #[inline]
    #[must_use]
    pub const fn weight(self) -> u32 {
        self.0.count_ones()
    }

    /// The lowest-numbered processor in the set, if any.
    #[inline]
    #[must_use]
    pub const fn first(self) -> Option<CpuId> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as CpuId)
        }
    }

    /// True if `other` contains every processor of `self`.
    #[inline]
    #[must_use]
    pub const fn is_subset_of(self, other: Self) -> bool {
        self.0 & !other.0 == 0
    }

    /// True if the two sets share at least one processor.
    #[inline]
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Iterates over the processors in the set, lowest first.
    pub fn iter(self) -> impl Iterator<Item = CpuId> {
        let mut bits = self.0;
        core::iter::from_fn(move || {
            if bits == 0 {
                None
            } else {
                let cpu = bits.trailing_zeros() as CpuId;
                bits &= bits - 1;
                Some(cpu)
            }
        })
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuMask({:#x})", self.0)
    }
}

impl fmt::Display for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        let mut first = true;
        for cpu in self.iter() {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{cpu}")?;
            first = false;
        }
        write!(f, "}}")
    }
}

impl FromIterator<CpuId> for CpuMask {
    fn from_iter<I: IntoIterator<Item = CpuId>>(iter: I) -> Self {
        let mut mask = Self::EMPTY;
        for cpu in iter {
            mask = mask.with(cpu);
        }
        mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_set_operations() {
        let m = CpuMask::EMPTY.with(0).with(3).with(5);
        assert!(m.contains(0));
        assert!(m.contains(3));
        assert!(!m.contains(1));
        assert_eq!(m.weight(), 3);
        assert_eq!(m.first(), Some(0));
        assert_eq!(m.without(0).first(), Some(3));
    }

    #[test]
    fn first_n_covers_prefix() {
        let m = CpuMask::first_n(4);
        assert_eq!(m.weight(), 4);
        assert!(m.contains(3));
        assert!(!m.contains(4));
        assert_eq!(CpuMask::first_n(64), CpuMask::from_bits(u64::MAX));
    }

    #[test]
    fn intersection_and_difference() {
        let a = CpuMask::first_n(4);
        let b = CpuMask::single(2).with(7);
        assert_eq!(a.and(b), CpuMask::single(2));
        assert!(a.intersects(b));
        assert_eq!(a.and_not(b), CpuMask::first_n(4).without(2));
        assert!(CpuMask::single(2).is_subset_of(a));
        assert!(!b.is_subset_of(a));
    }

    #[test]
    fn iteration_is_ordered() {
        let m = CpuMask::single(9).with(1).with(4);
        let cpus: Vec<_> = m.iter().collect();
        assert_eq!(cpus, vec![1, 4, 9]);
        let back: CpuMask = cpus.into_iter().collect();
        assert_eq!(back, m);
    }

    #[test]
    fn display_lists_members() {
        let m = CpuMask::single(0).with(2);
        assert_eq!(m.to_string(), "{0,2}");
    }
}
