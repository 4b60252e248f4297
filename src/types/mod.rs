//! Core identifier, policy, and flag vocabulary.
//!
//! Everything here is small, `Copy`, and shared across the whole core:
//! processor ids, task ids, scheduling policies, the task state machine's
//! states, and the flag sets passed through the class dispatch interface.

mod cpumask;
mod time;

pub use cpumask::{CpuMask, MAX_CPUS};
pub use time::Time;

use core::fmt;

use bitflags::bitflags;

use crate::util::ArenaIndex;

/// Index of a logical processor. Valid ids are `0..nr_cpus`.
pub type CpuId = usize;

/// Identifier of a schedulable task.
///
/// Task ids are generational arena indices: a freed id is never confused
/// with the record that later reuses its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub(crate) ArenaIndex);

impl TaskId {
    /// Returns the raw slot index (stable for the task's lifetime).
    #[must_use]
    pub fn index(self) -> u32 {
        self.0.index()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}:{}", self.0.index(), self.0.generation())
    }
}

/// Scheduling policy requested for a task.
///
/// The policy selects the scheduling class; the class never changes behind
/// the policy's back except for the temporary boost applied by priority
/// inheritance (see `Task::sched_class`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SchedPolicy {
    /// Time-shared fair policy (the default).
    #[default]
    Normal,
    /// Fair policy for throughput-oriented background work.
    Batch,
    /// Runs only when the processor would otherwise idle.
    Idle,
    /// Real-time, first-in first-out within a priority level.
    Fifo,
    /// Real-time, round-robin within a priority level.
    RoundRobin,
}

impl SchedPolicy {
    /// True for the two real-time policies.
    #[inline]
    #[must_use]
    pub const fn is_realtime(self) -> bool {
        matches!(self, Self::Fifo | Self::RoundRobin)
    }

    /// True for the policies served by the fair class.
    #[inline]
    #[must_use]
    pub const fn is_fair(self) -> bool {
        matches!(self, Self::Normal | Self::Batch | Self::Idle)
    }
}

/// States of the wake-up state machine.
///
/// `Waking` is transitional: the task has been claimed by a waker, left its
/// old runqueue's protection, and is being placed. Only the waker that made
/// the `Interruptible`/`Uninterruptible` to `Waking` transition may move it
/// to `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TaskState {
    /// Runnable or running.
    Running = 1 << 0,
    /// Blocked, wakeable by signals and explicit wake-ups.
    Interruptible = 1 << 1,
    /// Blocked, wakeable only by explicit wake-ups; counts toward load.
    Uninterruptible = 1 << 2,
    /// Mid wake-up: claimed by a waker, not yet enqueued.
    Waking = 1 << 3,
    /// Exited or parked; never runs again.
    Stopped = 1 << 4,
}

impl TaskState {
    /// Decodes a raw state byte. Unknown bit patterns map to `Stopped`.
    #[must_use]
    pub(crate) const fn from_bits(bits: u8) -> Self {
        match bits {
            b if b == Self::Running as u8 => Self::Running,
            b if b == Self::Interruptible as u8 => Self::Interruptible,
            b if b == Self::Uninterruptible as u8 => Self::Uninterruptible,
            b if b == Self::Waking as u8 => Self::Waking,
            _ => Self::Stopped,
        }
    }
}

bitflags! {
    /// Mask of task states accepted by a wake-up.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StateMask: u8 {
        const RUNNING = TaskState::Running as u8;
        const INTERRUPTIBLE = TaskState::Interruptible as u8;
        const UNINTERRUPTIBLE = TaskState::Uninterruptible as u8;
        const WAKING = TaskState::Waking as u8;
        const STOPPED = TaskState::Stopped as u8;
    }
}

impl StateMask {
    /// The states a normal wake-up is allowed to act on.
    pub const NORMAL: Self = Self::INTERRUPTIBLE.union(Self::UNINTERRUPTIBLE);

    /// True if the mask accepts `state`.
    #[inline]
    #[must_use]
    pub fn accepts(self, state: TaskState) -> bool {
        self.bits() & state as u8 != 0
    }
}

bitflags! {
    /// Flags for class `enqueue` calls.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EnqueueFlags: u32 {
        /// The enqueue is part of a wake-up (statistics, preemption hints).
        const WAKEUP = 1 << 0;
        /// Place at the head of the task's level (requeue after rotation).
        const HEAD = 1 << 1;
        /// The task migrated here while in the `Waking` state.
        const WAKING = 1 << 2;
    }
}

bitflags! {
    /// Flags for class `dequeue` calls.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DequeueFlags: u32 {
        /// The task is blocking (as opposed to being migrated or retuned).
        const SLEEP = 1 << 0;
    }
}

bitflags! {
    /// Flags qualifying a wake-up or fork placement.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WakeFlags: u32 {
        /// The waker expects to block soon; favor the waker's processor.
        const SYNC = 1 << 0;
        /// Placement of a freshly forked task.
        const FORK = 1 << 1;
    }
}

/// Highest effective priority plus one. Priorities are `0..=MAX_PRIO`,
/// higher is more urgent; `MAX_PRIO` itself is reserved for the stopper.
pub const MAX_PRIO: i32 = 200;

/// First real-time priority. Effective priorities at or above this value
/// are served by the real-time class.
pub const RT_PRIO_BASE: i32 = 100;

/// Default priority for fair tasks (nice 0).
pub const DEFAULT_PRIO: i32 = 50;

/// Priority of the per-processor idle task; below every schedulable task.
pub const IDLE_PRIO: i32 = 0;

/// Priority reserved for the per-processor stopper; above everything.
pub const STOP_PRIO: i32 = MAX_PRIO;

/// True if `prio` falls in the real-time range.
#[inline]
#[must_use]
pub const fn rt_prio(prio: i32) -> bool {
    prio >= RT_PRIO_BASE && prio < MAX_PRIO
}

/// Load weight contributed by a fair task at nice 0.
pub const NICE_0_LOAD: u64 = 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_classification() {
        assert!(SchedPolicy::Fifo.is_realtime());
        assert!(SchedPolicy::RoundRobin.is_realtime());
        assert!(SchedPolicy::Normal.is_fair());
        assert!(SchedPolicy::Idle.is_fair());
        assert!(!SchedPolicy::Normal.is_realtime());
    }

    #[test]
    fn state_mask_accepts() {
        assert!(StateMask::NORMAL.accepts(TaskState::Interruptible));
        assert!(StateMask::NORMAL.accepts(TaskState::Uninterruptible));
        assert!(!StateMask::NORMAL.accepts(TaskState::Running));
        assert!(StateMask::all().accepts(TaskState::Waking));
    }

    #[test]
    fn state_round_trips_through_bits() {
        for state in [
            TaskState::Running,
            TaskState::Interruptible,
            TaskState::Uninterruptible,
            TaskState::Waking,
            TaskState::Stopped,
        ] {
            assert_eq!(TaskState::from_bits(state as u8), state);
        }
        assert_eq!(TaskState::from_bits(0xff), TaskState::Stopped);
    }

    #[test]
    fn priority_ranges() {
        assert!(rt_prio(RT_PRIO_BASE));
        assert!(rt_prio(MAX_PRIO - 1));
        assert!(!rt_prio(DEFAULT_PRIO));
        assert!(!rt_prio(STOP_PRIO));
    }
}
