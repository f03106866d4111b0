//! Configuration for cache handles and the in-process engine runtime.

use std::time::Duration;

use crate::error::FetchError;
use crate::labels::StrategyType;

// =============================================================================
// Cache Configuration
// =============================================================================

/// Default energy budget before the goal time (percent of battery).
pub const DEFAULT_ENERGY_BUDGET: f64 = 5.0;

/// Default mobile data budget before the goal time (bytes).
pub const DEFAULT_DATA_BUDGET: u64 = 16 * 1024 * 1024;

/// Configuration for a [`CacheEngineHandle`](crate::CacheEngineHandle).
#[derive(Clone, Debug, PartialEq)]
pub struct CacheConfig {
    /// Prefetch strategy the engine is created with.
    pub strategy: StrategyType,

    /// Time from construction until the user is expected to need results.
    ///
    /// `None` leaves the goal time unset until
    /// [`update_goal_time`](crate::CacheEngineHandle::update_goal_time).
    pub goal_delay: Option<Duration>,

    /// Energy spendable on prefetching before the goal time.
    pub energy_budget: f64,

    /// Mobile data spendable on prefetching before the goal time.
    pub data_budget: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyType::default(),
            goal_delay: None,
            energy_budget: DEFAULT_ENERGY_BUDGET,
            data_budget: DEFAULT_DATA_BUDGET,
        }
    }
}

impl CacheConfig {
    /// Sets the prefetch strategy.
    pub fn with_strategy(mut self, strategy: StrategyType) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the initial goal delay.
    pub fn with_goal_delay(mut self, delay: Duration) -> Self {
        self.goal_delay = Some(delay);
        self
    }

    /// Sets the energy budget.
    pub fn with_energy_budget(mut self, budget: f64) -> Self {
        self.energy_budget = budget;
        self
    }

    /// Sets the data budget.
    pub fn with_data_budget(mut self, bytes: u64) -> Self {
        self.data_budget = bytes;
        self
    }
}

// =============================================================================
// Local Runtime Configuration
// =============================================================================

/// Default number of concurrent background prefetch attempts.
pub const DEFAULT_BACKGROUND_WORKERS: usize = 10;

/// Default number of async worker threads driving the engine.
pub const DEFAULT_WORKER_THREADS: usize = 2;

/// Default time to wait for running fetches when the runtime is dropped.
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 1_000;

/// Configuration for [`LocalRuntime`](crate::engine::LocalRuntime).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalRuntimeConfig {
    /// Maximum background prefetches running at once.
    ///
    /// Foreground and demand fetches are not bounded by this.
    pub background_workers: usize,

    /// Async worker threads.
    pub worker_threads: usize,

    /// Grace period for in-flight fetches at shutdown.
    pub shutdown_grace: Duration,
}

impl Default for LocalRuntimeConfig {
    fn default() -> Self {
        Self {
            background_workers: DEFAULT_BACKGROUND_WORKERS,
            worker_threads: DEFAULT_WORKER_THREADS,
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
        }
    }
}

impl LocalRuntimeConfig {
    /// Sets the background concurrency limit (minimum 1).
    pub fn with_background_workers(mut self, workers: usize) -> Self {
        self.background_workers = workers.max(1);
        self
    }

    /// Sets the async worker thread count (minimum 1).
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads.max(1);
        self
    }

    /// Sets the shutdown grace period.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Checks values set directly on the public fields.
    ///
    /// Zero background workers would defer every prefetch until it is
    /// demanded, and zero worker threads cannot run the engine at all.
    pub fn validate(&self) -> Result<(), FetchError> {
        if self.background_workers == 0 {
            return Err(FetchError::engine_unavailable(
                "background_workers must be at least 1",
            ));
        }
        if self.worker_threads == 0 {
            return Err(FetchError::engine_unavailable("worker_threads must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_config_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.strategy, StrategyType::Aggressive);
        assert!(config.goal_delay.is_none());
        assert_eq!(config.data_budget, DEFAULT_DATA_BUDGET);
    }

    #[test]
    fn test_cache_config_builders() {
        let config = CacheConfig::default()
            .with_strategy(StrategyType::Conservative)
            .with_goal_delay(Duration::from_secs(30))
            .with_energy_budget(1.5)
            .with_data_budget(1024);
        assert_eq!(config.strategy, StrategyType::Conservative);
        assert_eq!(config.goal_delay, Some(Duration::from_secs(30)));
        assert_eq!(config.energy_budget, 1.5);
        assert_eq!(config.data_budget, 1024);
    }

    #[test]
    fn test_runtime_config_defaults() {
        let config = LocalRuntimeConfig::default();
        assert_eq!(config.background_workers, 10);
        assert_eq!(config.worker_threads, 2);
        assert_eq!(config.shutdown_grace, Duration::from_secs(1));
    }

    #[test]
    fn test_runtime_config_validate_rejects_zero() {
        assert!(LocalRuntimeConfig::default().validate().is_ok());

        let mut config = LocalRuntimeConfig::default();
        config.worker_threads = 0;
        assert!(matches!(config.validate(), Err(FetchError::EngineUnavailable(_))));

        let mut config = LocalRuntimeConfig::default();
        config.background_workers = 0;
        assert!(matches!(config.validate(), Err(FetchError::EngineUnavailable(_))));
    }

    #[test]
    fn test_runtime_config_clamps_to_one() {
        let config = LocalRuntimeConfig::default()
            .with_background_workers(0)
            .with_worker_threads(0);
        assert_eq!(config.background_workers, 1);
        assert_eq!(config.worker_threads, 1);
    }
}
