//! Scheduler configuration.
//!
//! Hierarchical configuration with validated guardrail invariants; every
//! knob has a default matching the classic scheduler's tuning. Validation
//! runs before any scheduler state exists, so a rejected configuration has
//! no side effects.

use std::time::Duration;

use crate::error::{Result, SchedError};
use crate::types::{Time, MAX_CPUS};

/// Top-level configuration for a scheduler core.
#[derive(Debug, Clone)]
pub struct SchedConfig {
    /// Number of logical processors to allocate runqueues for.
    pub nr_cpus: usize,
    /// Load-balancing tuning.
    pub balance: BalanceConfig,
    /// Root real-time bandwidth.
    pub rt: RtBandwidthConfig,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            nr_cpus: 1,
            balance: BalanceConfig::default(),
            rt: RtBandwidthConfig::default(),
        }
    }
}

impl SchedConfig {
    /// A configuration for `nr_cpus` processors with default tuning.
    #[must_use]
    pub fn with_cpus(nr_cpus: usize) -> Self {
        Self {
            nr_cpus,
            ..Self::default()
        }
    }

    /// Validates guardrail invariants.
    pub fn validate(&self) -> Result<()> {
        if self.nr_cpus == 0 || self.nr_cpus > MAX_CPUS {
            return Err(SchedError::InvalidCpuCount(self.nr_cpus));
        }
        self.rt.validate()?;
        Ok(())
    }
}

/// Load-balancer tuning.
#[derive(Debug, Clone)]
pub struct BalanceConfig {
    /// Base balance interval at the lowest domain level; each level up
    /// doubles it.
    pub base_interval: Duration,
    /// Estimated cost of migrating a cache-warm task; newly idle balancing
    /// is skipped when the expected idle period is shorter than this.
    pub migration_cost: Time,
    /// Upper bound on tasks moved per balance invocation.
    pub nr_migrate: usize,
    /// Consecutive balance failures before an active (push) balance is
    /// escalated.
    pub active_balance_threshold: u32,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_millis(4),
            migration_cost: Time::from_micros(500),
            nr_migrate: 32,
            active_balance_threshold: 2,
        }
    }
}

/// Real-time bandwidth: runtime quota per period.
#[derive(Debug, Clone, Copy)]
pub struct RtBandwidthConfig {
    /// Enforcement period.
    pub period: Duration,
    /// Runtime quota per period; `None` means unlimited.
    pub runtime: Option<Duration>,
}

impl Default for RtBandwidthConfig {
    fn default() -> Self {
        // 950ms of RT time per 1s period: always leave a sliver for fair
        // tasks unless explicitly configured otherwise.
        Self {
            period: Duration::from_micros(1_000_000),
            runtime: Some(Duration::from_micros(950_000)),
        }
    }
}

impl RtBandwidthConfig {
    /// Validates period/runtime sanity.
    pub fn validate(&self) -> Result<()> {
        if self.period.is_zero() {
            return Err(SchedError::ZeroPeriod);
        }
        if let Some(runtime) = self.runtime {
            if runtime > self.period {
                return Err(SchedError::RuntimeExceedsPeriod {
                    runtime_us: runtime.as_micros() as u64,
                    period_us: self.period.as_micros() as u64,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(SchedConfig::default().validate().is_ok());
        assert!(SchedConfig::with_cpus(8).validate().is_ok());
    }

    #[test]
    fn rejects_bad_cpu_counts() {
        assert_eq!(
            SchedConfig::with_cpus(0).validate(),
            Err(SchedError::InvalidCpuCount(0))
        );
        assert_eq!(
            SchedConfig::with_cpus(65).validate(),
            Err(SchedError::InvalidCpuCount(65))
        );
    }

    #[test]
    fn rejects_runtime_beyond_period() {
        let mut config = SchedConfig::with_cpus(2);
        config.rt.period = Duration::from_millis(10);
        config.rt.runtime = Some(Duration::from_millis(20));
        assert!(matches!(
            config.validate(),
            Err(SchedError::RuntimeExceedsPeriod { .. })
        ));
    }

    #[test]
    fn unlimited_runtime_is_valid() {
        let mut config = SchedConfig::with_cpus(2);
        config.rt.runtime = None;
        assert!(config.validate().is_ok());
    }
}
