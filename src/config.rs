//! Scheduler configuration.
//!
//! [`SchedulerConfig`] is a plain struct with public fields plus a
//! [`validate`](SchedulerConfig::validate) pass; construction of a
//! [`PriorityScheduler`](crate::scheduler::PriorityScheduler) validates before
//! any thread is started.
//!
//! # Example
//!
//! ```
//! use priopool::{SchedulerConfig, TaskPriority};
//! use std::time::Duration;
//!
//! let mut config = SchedulerConfig::new(2, 8, Duration::from_secs(10));
//! config.default_priority = TaskPriority::Low;
//! assert!(config.validate().is_ok());
//! ```

use std::time::Duration;

use crate::error::{Error, ErrorKind};
use crate::task::TaskPriority;

/// Default wait for an existing worker before a low-priority task may grow
/// the pool.
pub const DEFAULT_LOW_PRIORITY_MAX_WAIT: Duration = Duration::from_millis(500);

/// Configuration for a [`PriorityScheduler`](crate::scheduler::PriorityScheduler).
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Pool size maintained while idle. Must be at least 1.
    pub core_pool_size: usize,
    /// Maximum allowed worker count. Must be at least `core_pool_size`.
    pub max_pool_size: usize,
    /// How long a worker may sit idle before it is killed.
    pub keep_alive: Duration,
    /// Priority assigned to submissions that do not specify one.
    pub default_priority: TaskPriority,
    /// How long a low-priority task waits for an existing worker before it is
    /// allowed to grow the pool.
    pub max_wait_for_low_priority: Duration,
    /// Whether core workers are also subject to idle expiration.
    pub allow_core_timeout: bool,
    /// Prefix for worker and dispatcher thread names.
    pub thread_name_prefix: String,
    /// Whether a recurring task that panics is still rescheduled. `true`
    /// matches the behavior of running the reschedule in a `finally` block;
    /// `false` drops the task after its first panic.
    pub reschedule_on_panic: bool,
}

impl SchedulerConfig {
    /// Creates a configuration with the given pool bounds and keep-alive,
    /// defaulting everything else.
    #[must_use]
    pub fn new(core_pool_size: usize, max_pool_size: usize, keep_alive: Duration) -> Self {
        Self {
            core_pool_size,
            max_pool_size,
            keep_alive,
            ..Self::default()
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidConfiguration`] when `core_pool_size` is
    /// zero or `max_pool_size` is below `core_pool_size`.
    pub fn validate(&self) -> Result<(), Error> {
        if self.core_pool_size < 1 {
            return Err(Error::with_message(
                ErrorKind::InvalidConfiguration,
                "core_pool_size must be >= 1",
            ));
        }
        if self.max_pool_size < self.core_pool_size {
            return Err(Error::with_message(
                ErrorKind::InvalidConfiguration,
                "max_pool_size must be >= core_pool_size",
            ));
        }
        Ok(())
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            core_pool_size: 1,
            max_pool_size: 1,
            keep_alive: Duration::from_secs(1),
            default_priority: TaskPriority::High,
            max_wait_for_low_priority: DEFAULT_LOW_PRIORITY_MAX_WAIT,
            allow_core_timeout: false,
            thread_name_prefix: "priopool".to_string(),
            reschedule_on_panic: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(SchedulerConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_core_pool_size_is_rejected() {
        let config = SchedulerConfig::new(0, 4, Duration::ZERO);
        let err = config.validate().expect_err("core_pool_size 0 must fail");
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
    }

    #[test]
    fn max_below_core_is_rejected() {
        let config = SchedulerConfig::new(4, 2, Duration::ZERO);
        let err = config.validate().expect_err("max < core must fail");
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
    }

    #[test]
    fn new_defaults_the_rest() {
        let config = SchedulerConfig::new(2, 4, Duration::from_millis(50));
        assert_eq!(config.default_priority, TaskPriority::High);
        assert_eq!(config.max_wait_for_low_priority, DEFAULT_LOW_PRIORITY_MAX_WAIT);
        assert!(config.reschedule_on_panic);
        assert!(!config.allow_core_timeout);
    }
}
