//! A multi-processor runqueue scheduler core.
//!
//! `schedcore` is the dispatch heart of an SMP scheduler, packaged as a
//! library the host drives explicitly: per-processor runqueues behind a
//! strict lock ordering, a fixed chain of scheduling classes (stop,
//! real-time, fair, idle), a lock-minimal wake-up state machine,
//! topology-aware load balancing over hierarchical scheduling domains,
//! real-time bandwidth throttling, and processor hot-removal with task
//! evacuation.
//!
//! There are no threads of its own (aside from the optional bandwidth
//! refill timer) and no blocking: the host calls [`SchedCore::schedule`]
//! at its dispatch points and [`SchedCore::scheduler_tick`] on its tick,
//! and the core tells it what to run. Time comes from a pluggable
//! [`clock::ClockSource`], so everything is deterministic under a
//! [`clock::ManualClock`].
//!
//! ```
//! use schedcore::{SchedConfig, SchedCore, TaskDesc};
//!
//! let core = SchedCore::new(SchedConfig::with_cpus(2))?;
//! let task = core.spawn(TaskDesc::new("worker"))?;
//! let next = core.schedule(0)?;
//! assert_eq!(next.id(), task.id());
//! # Ok::<(), schedcore::SchedError>(())
//! ```

mod balance;
pub mod bandwidth;
pub mod class;
pub mod clock;
pub mod config;
pub mod error;
pub mod rq;
mod sched;
pub mod stats;
pub mod task;
pub mod topology;
pub mod types;
pub mod util;

pub use bandwidth::{RtBandwidth, RtGroup};
pub use class::ClassId;
pub use clock::{ClockSource, ManualClock, MonotonicClock};
pub use config::{BalanceConfig, RtBandwidthConfig, SchedConfig};
pub use error::{Result, SchedError};
pub use sched::SchedCore;
pub use stats::StatsSnapshot;
pub use task::{Task, TaskDesc};
pub use topology::{DomainFlags, TopologyDesc, TopologyLevel};
pub use types::{CpuId, CpuMask, SchedPolicy, TaskId, TaskState, Time};
