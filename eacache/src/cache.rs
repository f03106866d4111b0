//! Submission API for the cache engine.
//!
//! # Example
//!
//! ```ignore
//! use eacache::{CacheConfig, CacheEngineHandle, LocalRuntime, LocalRuntimeConfig, StrategyType};
//!
//! let runtime = LocalRuntime::start(LocalRuntimeConfig::default())?;
//! let cache = CacheEngineHandle::new(runtime, CacheConfig::default().with_strategy(StrategyType::Aggressive))?;
//!
//! // Hint a prefetch; the strategy decides when it runs.
//! let future = cache.prefetch(Some(Arc::new(PageFetcher::new(url))))?;
//!
//! // Later, when the user needs the page:
//! if let Some(future) = future {
//!     let page = future.get()?;
//! }
//! ```

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::bridge::{
    ConstantTable, EngineParams, FetcherOwnershipBridge, ForeignRef, ForeignRuntime, RuntimeBridge,
};
use crate::config::CacheConfig;
use crate::error::FetchError;
use crate::fetcher::Fetcher;
use crate::future::FetchFuture;
use crate::labels::{StrategyType, SubmitMode, TimeUnit};
use crate::stats::CacheStatsSnapshot;

/// Handle to one cache engine instance.
///
/// Construction resolves every engine constant and creates the engine; it
/// either succeeds completely or returns [`FetchError::EngineUnavailable`].
/// After that the handle is read-only and may be shared across threads.
pub struct CacheEngineHandle {
    engine: Option<ForeignRef>,
    bridge: RuntimeBridge,
    ownership: Arc<FetcherOwnershipBridge>,
    time_units: Arc<ConstantTable<TimeUnit>>,
    strategy: StrategyType,
}

impl CacheEngineHandle {
    /// Creates an engine on `runtime`.
    pub fn new(runtime: Arc<dyn ForeignRuntime>, config: CacheConfig) -> Result<Self, FetchError> {
        let bridge = RuntimeBridge::new(runtime);
        let env = bridge.env()?;

        let time_units = ConstantTable::<TimeUnit>::resolve(&env)?;
        let strategies = ConstantTable::<StrategyType>::resolve(&env)?;

        let params = EngineParams {
            strategy: strategies.get(config.strategy),
            goal_delay_ms: config
                .goal_delay
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            energy_budget: config.energy_budget,
            data_budget: config.data_budget,
        };
        let engine = env
            .call(|rt| rt.create_engine(&params))
            .map_err(|e| FetchError::engine_unavailable(format!("can't create engine: {}", e)))?;

        info!(
            runtime = bridge.runtime_id().as_raw(),
            strategy = %config.strategy,
            "Cache engine handle ready"
        );
        drop(env);

        Ok(Self {
            engine: Some(engine),
            bridge,
            ownership: FetcherOwnershipBridge::new(),
            time_units: Arc::new(time_units),
            strategy: config.strategy,
        })
    }

    /// Hints a prefetch; the engine's strategy decides when it starts.
    ///
    /// Returns `Ok(None)` without contacting the engine when `fetcher` is
    /// `None`.
    pub fn prefetch<F: Fetcher>(&self, fetcher: Option<Arc<F>>) -> Result<Option<FetchFuture<F::Output>>, FetchError> {
        self.submit(fetcher, SubmitMode::Background)
    }

    /// Starts a prefetch immediately.
    pub fn prefetch_now<F: Fetcher>(&self, fetcher: Option<Arc<F>>) -> Result<Option<FetchFuture<F::Output>>, FetchError> {
        self.submit(fetcher, SubmitMode::Foreground)
    }

    /// Starts a demand fetch immediately.
    pub fn fetch<F: Fetcher>(&self, fetcher: Option<Arc<F>>) -> Result<Option<FetchFuture<F::Output>>, FetchError> {
        self.submit(fetcher, SubmitMode::Demand)
    }

    /// Moves the engine's goal time to `start_delay_ms` from now.
    pub fn update_goal_time(&self, start_delay_ms: u64) -> Result<(), FetchError> {
        let engine = self.engine()?;
        let env = self.bridge.env()?;
        env.call(|rt| rt.update_goal_time(engine, start_delay_ms))
    }

    /// Returns the engine's cache statistics.
    pub fn stats(&self) -> Result<CacheStatsSnapshot, FetchError> {
        let engine = self.engine()?;
        let env = self.bridge.env()?;
        env.call(|rt| rt.engine_stats(engine))
    }

    /// Strategy this engine was created with.
    pub fn strategy(&self) -> StrategyType {
        self.strategy
    }

    /// Ownership cells for fetchers still held by the engine.
    pub fn live_fetchers(&self) -> usize {
        self.ownership.live_cells()
    }

    fn submit<F: Fetcher>(
        &self,
        fetcher: Option<Arc<F>>,
        mode: SubmitMode,
    ) -> Result<Option<FetchFuture<F::Output>>, FetchError> {
        let engine = self.engine()?;
        let env = self.bridge.env()?;
        let Some(fetcher) = fetcher else {
            debug!(mode = %mode, "No fetcher supplied; nothing submitted");
            return Ok(None);
        };

        let proxy = self.ownership.transfer(&env, fetcher)?;
        let submitted = env.call(|rt| rt.submit(engine, &proxy, mode));
        // Tasks keep the proxy alive; this handle's reference is no longer
        // needed either way.
        env.release(proxy);

        let task = submitted?;
        debug!(task = task.as_raw(), mode = %mode, "Fetch submitted");
        Ok(Some(FetchFuture::new(task, self.bridge.clone(), Arc::clone(&self.time_units))))
    }

    fn engine(&self) -> Result<&ForeignRef, FetchError> {
        self.engine
            .as_ref()
            .ok_or_else(|| FetchError::engine_unavailable("engine handle already released"))
    }
}

impl Drop for CacheEngineHandle {
    fn drop(&mut self) {
        let Some(engine) = self.engine.take() else {
            return;
        };
        match self.bridge.env() {
            Ok(env) => env.release(engine),
            Err(e) => warn!(error = %e, "Cannot reach engine to release it; reference leaked"),
        }
    }
}

impl fmt::Debug for CacheEngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEngineHandle")
            .field("runtime", &self.bridge.runtime_id())
            .field("strategy", &self.strategy)
            .field("ownership", &self.ownership)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{BoundaryOp, LocalRuntime, LocalRuntimeConfig};
    use crate::error::FetcherError;
    use crate::labels::FetchLabels;

    struct Constant(&'static str);

    impl Fetcher for Constant {
        type Output = String;

        fn call(&self, _labels: FetchLabels) -> Result<String, FetcherError> {
            Ok(self.0.to_string())
        }
    }

    fn runtime() -> Arc<LocalRuntime> {
        LocalRuntime::start(LocalRuntimeConfig::default().with_worker_threads(1)).unwrap()
    }

    #[test]
    fn test_fetch_returns_value() {
        let runtime = runtime();
        let cache = CacheEngineHandle::new(runtime.clone(), CacheConfig::default()).unwrap();
        let future = cache.fetch(Some(Arc::new(Constant("page")))).unwrap().unwrap();
        assert_eq!(future.get().unwrap().as_str(), "page");
    }

    #[test]
    fn test_none_fetcher_submits_nothing() {
        let runtime = runtime();
        let cache = CacheEngineHandle::new(runtime.clone(), CacheConfig::default()).unwrap();
        let refs_before = runtime.live_refs();

        assert!(cache.prefetch::<Constant>(None).unwrap().is_none());
        assert!(cache.prefetch_now::<Constant>(None).unwrap().is_none());
        assert!(cache.fetch::<Constant>(None).unwrap().is_none());
        assert_eq!(runtime.live_refs(), refs_before);
        assert_eq!(cache.live_fetchers(), 0);
    }

    #[test]
    fn test_construction_fails_on_missing_constant() {
        let runtime = runtime();
        runtime.hide_constant("CONSERVATIVE");
        let err = CacheEngineHandle::new(runtime.clone(), CacheConfig::default()).unwrap_err();
        assert!(matches!(err, FetchError::EngineUnavailable(_)));
        assert_eq!(runtime.live_refs(), 0);
    }

    #[test]
    fn test_construction_fails_on_engine_fault() {
        let runtime = runtime();
        runtime.fail_next(BoundaryOp::CreateEngine);
        let err = CacheEngineHandle::new(runtime.clone(), CacheConfig::default()).unwrap_err();
        assert!(matches!(err, FetchError::EngineUnavailable(_)));
        assert_eq!(runtime.live_refs(), 0);
    }

    #[test]
    fn test_failed_submit_reclaims_fetcher() {
        let runtime = runtime();
        let cache = CacheEngineHandle::new(runtime.clone(), CacheConfig::default()).unwrap();
        let fetcher = Arc::new(Constant("never"));

        runtime.fail_next(BoundaryOp::Submit);
        let err = cache.prefetch(Some(fetcher.clone())).unwrap_err();
        assert!(matches!(err, FetchError::Foreign { .. }));
        assert_eq!(cache.live_fetchers(), 0);
        assert_eq!(Arc::strong_count(&fetcher), 1);
    }

    #[test]
    fn test_update_goal_time_and_stats() {
        let runtime = runtime();
        let cache = CacheEngineHandle::new(
            runtime.clone(),
            CacheConfig::default().with_strategy(StrategyType::Adaptive),
        )
        .unwrap();
        assert_eq!(cache.strategy(), StrategyType::Adaptive);
        cache.update_goal_time(60_000).unwrap();

        let future = cache.prefetch(Some(Arc::new(Constant("x")))).unwrap().unwrap();
        future.get().unwrap();
        let stats = cache.stats().unwrap();
        assert_eq!(stats.hints, 1);
        assert_eq!(stats.demand_requests, 1);
    }

    #[test]
    fn test_huge_goal_delay_saturates() {
        let runtime = runtime();
        let config = CacheConfig::default()
            .with_strategy(StrategyType::Adaptive)
            .with_goal_delay(std::time::Duration::MAX);
        let cache = CacheEngineHandle::new(runtime.clone(), config).unwrap();
        cache.update_goal_time(u64::MAX).unwrap();
        let future = cache.prefetch(Some(Arc::new(Constant("late")))).unwrap().unwrap();
        assert_eq!(future.get().unwrap().as_str(), "late");
    }

    #[test]
    fn test_drop_releases_engine() {
        let runtime = runtime();
        let cache = CacheEngineHandle::new(runtime.clone(), CacheConfig::default()).unwrap();
        assert_eq!(runtime.live_refs(), 1);
        drop(cache);
        assert_eq!(runtime.live_refs(), 0);
    }
}
