//! The reconciliation controller.
//!
//! The controller consumes invocation notifications and periodic ticks,
//! projects the invocation plus its workflow, asks the scheduler for a
//! decision, and dispatches the resulting actions through the task API.
//! It emits only events, never entity state.

mod invocation;

pub use invocation::InvocationController;

use std::time::Duration;

/// Configuration for the invocation controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Worker pool bound: reconciliations of distinct invocations running
    /// in parallel. At most one reconciliation per invocation regardless.
    pub workers: usize,

    /// Periodic tick for deadline checks and missed notifications.
    pub tick_interval: Duration,

    /// Deadline for one reconciliation; exceeded reconciliations abort
    /// cleanly and re-queue.
    pub reconcile_deadline: Duration,

    /// Base delay for retry backoff after reconciliation failures.
    pub backoff_base: Duration,

    /// Maximum delay for retry backoff.
    pub backoff_max: Duration,

    /// Buffer size of the controller's notification subscription.
    pub notification_buffer: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            tick_interval: Duration::from_secs(1),
            reconcile_deadline: Duration::from_secs(10),
            backoff_base: Duration::from_millis(200),
            backoff_max: Duration::from_secs(5),
            notification_buffer: 64,
        }
    }
}

impl ControllerConfig {
    /// Exponential backoff for the given consecutive failure count.
    pub(crate) fn backoff(&self, failures: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(failures.saturating_sub(1));
        let delay = self.backoff_base.saturating_mul(multiplier);
        delay.min(self.backoff_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ControllerConfig::default();

        assert_eq!(config.workers, 4);
        assert_eq!(config.tick_interval, Duration::from_secs(1));
        assert_eq!(config.reconcile_deadline, Duration::from_secs(10));
        assert_eq!(config.notification_buffer, 64);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let config = ControllerConfig::default();

        assert_eq!(config.backoff(1), Duration::from_millis(200));
        assert_eq!(config.backoff(2), Duration::from_millis(400));
        assert_eq!(config.backoff(3), Duration::from_millis(800));
        assert_eq!(config.backoff(10), Duration::from_secs(5));
    }
}
