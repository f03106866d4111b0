//! Common types and fetchers shared across CLI commands.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::ValueEnum;
use eacache::{
    CacheConfig, CacheEngineHandle, FetchLabels, Fetcher, FetcherError, LocalRuntime,
    LocalRuntimeConfig, StrategyType,
};

use crate::error::CliError;

/// Granularity at which demo fetchers check for cancellation.
const CANCEL_POLL: Duration = Duration::from_millis(5);

/// Prefetch strategy selection for CLI arguments.
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum StrategyArg {
    /// Start every prefetch as soon as it is hinted
    Aggressive,
    /// Never prefetch; fetch only when a result is demanded
    Conservative,
    /// Start prefetches and track the goal time
    Adaptive,
}

impl From<StrategyArg> for StrategyType {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Aggressive => StrategyType::Aggressive,
            StrategyArg::Conservative => StrategyType::Conservative,
            StrategyArg::Adaptive => StrategyType::Adaptive,
        }
    }
}

/// Submission mode selection for CLI arguments.
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum ModeArg {
    /// Hint a background prefetch
    Prefetch,
    /// Start a prefetch immediately
    PrefetchNow,
    /// Start a demand fetch
    Fetch,
}

/// Starts an engine runtime and a cache handle on it.
pub fn start_cache(strategy: StrategyArg) -> Result<(Arc<LocalRuntime>, CacheEngineHandle), CliError> {
    let runtime = LocalRuntime::start(LocalRuntimeConfig::default()).map_err(CliError::Startup)?;
    let cache = CacheEngineHandle::new(
        runtime.clone(),
        CacheConfig::default().with_strategy(strategy.into()),
    )
    .map_err(CliError::Startup)?;
    Ok((runtime, cache))
}

/// Sleeps for a fixed time, then returns a label.
///
/// Stops early when cancelled with interruption.
pub struct SleepFetcher {
    name: String,
    delay: Duration,
    cancelled: AtomicBool,
}

impl SleepFetcher {
    pub fn new(name: impl Into<String>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            delay,
            cancelled: AtomicBool::new(false),
        })
    }
}

impl Fetcher for SleepFetcher {
    type Output = String;

    fn call(&self, labels: FetchLabels) -> Result<String, FetcherError> {
        let deadline = Instant::now() + self.delay;
        while Instant::now() < deadline {
            if self.cancelled.load(Ordering::SeqCst) {
                return Err(FetcherError::new(format!("{} interrupted", self.name)));
            }
            thread::sleep(CANCEL_POLL.min(deadline.saturating_duration_since(Instant::now())));
        }
        Ok(format!("{} {:?}", self.name, labels))
    }

    fn on_cancelled(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// Blocks until cancelled.
#[derive(Default)]
pub struct BlockingFetcher {
    cancelled: AtomicBool,
}

impl Fetcher for BlockingFetcher {
    type Output = String;

    fn call(&self, _labels: FetchLabels) -> Result<String, FetcherError> {
        while !self.cancelled.load(Ordering::SeqCst) {
            thread::sleep(CANCEL_POLL);
        }
        Err(FetcherError::new("interrupted"))
    }

    fn on_cancelled(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_arg_maps_to_engine_type() {
        assert_eq!(StrategyType::from(StrategyArg::Aggressive), StrategyType::Aggressive);
        assert_eq!(StrategyType::from(StrategyArg::Conservative), StrategyType::Conservative);
        assert_eq!(StrategyType::from(StrategyArg::Adaptive), StrategyType::Adaptive);
    }

    #[test]
    fn test_sleep_fetcher_stops_when_cancelled() {
        let fetcher = SleepFetcher::new("slow", Duration::from_secs(60));
        fetcher.on_cancelled();
        let err = fetcher.call(FetchLabels::ONDEMAND).unwrap_err();
        assert!(err.message().contains("interrupted"));
    }

    #[test]
    fn test_sleep_fetcher_returns_name() {
        let fetcher = SleepFetcher::new("quick", Duration::ZERO);
        assert!(fetcher.call(FetchLabels::BACKGROUND).unwrap().starts_with("quick"));
    }
}
