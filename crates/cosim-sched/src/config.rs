use std::env;

use thiserror::Error;

/// One tenth of a second of virtual time (`TCG_KICK_PERIOD`).
pub const DEFAULT_KICK_PERIOD_NS: u64 = 1_000_000_000 / 10;

pub const ENV_KICK_PERIOD_NS: &str = "COSIM_KICK_PERIOD_NS";
pub const ENV_ICOUNT_BUDGET: &str = "COSIM_ICOUNT_BUDGET";
pub const ENV_SLICE_BUDGET: &str = "COSIM_SLICE_BUDGET";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{var}={value:?} is not a valid unsigned integer")]
    InvalidNumber { var: &'static str, value: String },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Virtual-time period of the kick timer.
    pub kick_period_ns: u64,
    /// Total instruction budget per scheduler iteration when instruction counting is enabled.
    /// Shared fairly between the live vCPUs.
    pub icount_budget: Option<u64>,
    /// Per-slice instruction cap when instruction counting is disabled. `u64::MAX` leaves slice
    /// length entirely to the kick timer.
    pub slice_budget: u64,
    /// Lockstep (co-simulation) mode: every slice is exactly one instruction.
    pub lockstep: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            kick_period_ns: DEFAULT_KICK_PERIOD_NS,
            icount_budget: None,
            slice_budget: u64::MAX,
            lockstep: false,
        }
    }
}

impl SchedulerConfig {
    pub fn lockstep() -> Self {
        Self {
            lockstep: true,
            ..Self::default()
        }
    }

    /// Defaults overlaid with `COSIM_*` environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        if let Some(period) = parse_u64(&lookup, ENV_KICK_PERIOD_NS)? {
            if period == 0 {
                return Err(ConfigError::Zero(ENV_KICK_PERIOD_NS));
            }
            cfg.kick_period_ns = period;
        }
        if let Some(budget) = parse_u64(&lookup, ENV_ICOUNT_BUDGET)? {
            if budget == 0 {
                return Err(ConfigError::Zero(ENV_ICOUNT_BUDGET));
            }
            cfg.icount_budget = Some(budget);
        }
        if let Some(budget) = parse_u64(&lookup, ENV_SLICE_BUDGET)? {
            if budget == 0 {
                return Err(ConfigError::Zero(ENV_SLICE_BUDGET));
            }
            cfg.slice_budget = budget;
        }
        Ok(cfg)
    }

    /// Instruction budget for one slice given the current live vCPU count.
    pub fn slice_budget_for(&self, cpu_count: usize) -> u64 {
        if self.lockstep {
            return 1;
        }
        match self.icount_budget {
            Some(total) => {
                let count = u64::try_from(cpu_count.max(1)).unwrap_or(u64::MAX);
                (total / count).max(1)
            }
            None => self.slice_budget,
        }
    }
}

fn parse_u64(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<u64>, ConfigError> {
    let Some(value) = lookup(var) else {
        return Ok(None);
    };
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::InvalidNumber { var, value })
}
