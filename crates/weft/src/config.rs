//! Engine configuration.

use std::time::Duration;

use crate::controller::ControllerConfig;
use crate::store::MemoryBackendConfig;
#[cfg(feature = "postgres")]
use crate::store::PgBackendConfig;

/// Which event backend the engine runs on.
#[derive(Debug, Clone)]
pub enum BackendConfig {
    /// Bounded in-memory log for development and tests.
    Memory(MemoryBackendConfig),
    /// Durable append-only log on PostgreSQL.
    #[cfg(feature = "postgres")]
    Postgres(PgBackendConfig),
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Memory(MemoryBackendConfig::default())
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Event backend selection.
    pub backend: BackendConfig,
    /// Controller settings (worker pool, tick, backoff).
    pub controller: ControllerConfig,
    /// Buffer size for cache subscriptions and notifications.
    pub notification_buffer: usize,
    /// Deadline applied to invocations created without one.
    pub default_deadline: Option<Duration>,
    /// How far ahead of the estimated start prepare actions are emitted.
    pub prepare_horizon: Duration,
    /// Maximum time to wait for workers during shutdown.
    pub shutdown_timeout: Duration,
    /// Debug mode: log at full verbosity, no sampling.
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            controller: ControllerConfig::default(),
            notification_buffer: 64,
            default_deadline: None,
            prepare_horizon: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            debug: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();

        assert!(matches!(config.backend, BackendConfig::Memory(_)));
        assert_eq!(config.notification_buffer, 64);
        assert!(config.default_deadline.is_none());
        assert_eq!(config.prepare_horizon, Duration::from_secs(30));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
        assert!(!config.debug);
    }
}
