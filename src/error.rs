//! Error types and error-handling strategy.
//!
//! The core distinguishes three failure classes and treats them very
//! differently:
//!
//! - **Configuration rejection**: invalid bandwidth ratios, affinity sets
//!   disjoint from the active processors, topology inputs with empty or
//!   zero-capacity groups. Rejected before any state mutation; prior state
//!   stays intact; surfaced as [`SchedError`].
//! - **Transient races**: a task observed mid-wake during an affinity
//!   change, a runqueue that changed under a lock-free lookup. These are
//!   retried internally with bounded conditions and never surface as
//!   errors.
//! - **Invariant violations**: a class other than idle returning no task
//!   when it claims runnable work, the idle class returning none, a
//!   migration that would double-own a task. These abort via `panic!` —
//!   continuing would corrupt fairness globally. Nothing is recovered and
//!   ignored silently.

use thiserror::Error;

use crate::types::{CpuId, CpuMask, SchedPolicy, TaskId};

/// Result alias for fallible core operations.
pub type Result<T> = core::result::Result<T, SchedError>;

/// Errors surfaced to the configuration surface.
///
/// Every variant is a pre-mutation rejection: when one of these is
/// returned, no scheduler state has changed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedError {
    /// Processor count outside `1..=MAX_CPUS`.
    #[error("invalid processor count {0} (supported: 1..=64)")]
    InvalidCpuCount(usize),

    /// A task id that does not resolve to a live task.
    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    /// The task is still runnable or running and cannot be removed.
    #[error("task {0} is still runnable")]
    TaskRunnable(TaskId),

    /// The requested affinity mask shares no processor with the active set.
    #[error("affinity {requested} is disjoint from the active set {active}")]
    AffinityDisjoint {
        /// The rejected mask.
        requested: CpuMask,
        /// Active processors at the time of the call.
        active: CpuMask,
    },

    /// A priority outside the valid range for the given policy.
    #[error("priority {prio} invalid for policy {policy:?}")]
    InvalidPriority {
        /// The rejected priority.
        prio: i32,
        /// The policy it was requested for.
        policy: SchedPolicy,
    },

    /// The named processor is not part of this scheduler.
    #[error("no such processor {0}")]
    NoSuchCpu(CpuId),

    /// The named processor is already offline.
    #[error("processor {0} is offline")]
    CpuOffline(CpuId),

    /// Refusing to take the last active processor offline.
    #[error("cannot remove the last active processor")]
    LastActiveCpu,

    /// Bandwidth period must be positive.
    #[error("bandwidth period must be positive")]
    ZeroPeriod,

    /// Bandwidth runtime larger than the period.
    #[error("bandwidth runtime {runtime_us}us exceeds period {period_us}us")]
    RuntimeExceedsPeriod {
        /// Requested runtime, microseconds.
        runtime_us: u64,
        /// Requested period, microseconds.
        period_us: u64,
    },

    /// The sum of the children's bandwidth ratios would exceed the parent's.
    #[error("group bandwidth over-committed: children claim {claimed_ppm}ppm of the parent's {parent_ppm}ppm")]
    BandwidthOvercommitted {
        /// Sum of child runtime/period ratios, parts per million.
        claimed_ppm: u64,
        /// Parent ratio, parts per million.
        parent_ppm: u64,
    },

    /// Runtime of zero requested for a group that has runnable RT tasks.
    #[error("group has runnable real-time tasks; runtime cannot be zero")]
    ZeroRuntimeWithRtTasks,

    /// A topology partition with no processors.
    #[error("empty topology partition")]
    EmptyPartition,

    /// Partitions must be mutually exclusive.
    #[error("topology partitions overlap on {0}")]
    OverlappingPartitions(CpuMask),

    /// A scheduling group whose computed capacity is zero.
    #[error("topology group {0} has zero compute capacity")]
    ZeroCapacityGroup(CpuMask),
}

/// Coarse classification used by the configuration surface for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Scheduler-wide setup (cpu count, task lookup, priorities).
    Configuration,
    /// Affinity and placement constraints.
    Placement,
    /// Real-time bandwidth control.
    Bandwidth,
    /// Scheduling-domain topology.
    Topology,
}

impl SchedError {
    /// Returns the category of this error.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidCpuCount(_)
            | Self::UnknownTask(_)
            | Self::TaskRunnable(_)
            | Self::InvalidPriority { .. } => ErrorCategory::Configuration,
            Self::AffinityDisjoint { .. }
            | Self::NoSuchCpu(_)
            | Self::CpuOffline(_)
            | Self::LastActiveCpu => ErrorCategory::Placement,
            Self::ZeroPeriod
            | Self::RuntimeExceedsPeriod { .. }
            | Self::BandwidthOvercommitted { .. }
            | Self::ZeroRuntimeWithRtTasks => ErrorCategory::Bandwidth,
            Self::EmptyPartition
            | Self::OverlappingPartitions(_)
            | Self::ZeroCapacityGroup(_) => ErrorCategory::Topology,
        }
    }
}
