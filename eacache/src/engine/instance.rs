//! Shared state of one cache engine instance.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::debug;

use super::strategy::{strategy_for, PrefetchStrategy};
use crate::labels::StrategyType;
use crate::stats::CacheStats;

/// One engine: its strategy, worker pools and statistics.
///
/// Engine tasks hold an `Arc` to their core, so a core outlives the
/// reference that created it for as long as any of its tasks are alive.
pub struct EngineCore {
    strategy_type: StrategyType,
    strategy: Box<dyn PrefetchStrategy>,
    stats: CacheStats,
    background: Arc<Semaphore>,
    handle: Handle,
    next_task_id: AtomicU64,
}

impl EngineCore {
    pub fn new(strategy_type: StrategyType, background_workers: usize, handle: Handle) -> Self {
        Self {
            strategy_type,
            strategy: strategy_for(strategy_type),
            stats: CacheStats::new(),
            background: Arc::new(Semaphore::new(background_workers)),
            handle,
            next_task_id: AtomicU64::new(1),
        }
    }

    pub fn strategy(&self) -> &dyn PrefetchStrategy {
        self.strategy.as_ref()
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Permits for the bounded background pool.
    pub fn background_permits(&self) -> Arc<Semaphore> {
        Arc::clone(&self.background)
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn next_task_id(&self) -> u64 {
        self.next_task_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Moves the goal time to `start_delay` from now.
    ///
    /// The strategy owns the goal; the core only forwards it.
    pub fn update_goal_time(&self, start_delay: Duration) {
        let now = Instant::now();
        let goal = now.checked_add(start_delay).unwrap_or(now);
        self.strategy.goal_time_updated(goal);
        debug!(
            strategy = self.strategy.name(),
            delay_ms = u64::try_from(start_delay.as_millis()).unwrap_or(u64::MAX),
            "Goal time updated"
        );
    }
}

impl fmt::Debug for EngineCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineCore")
            .field("strategy", &self.strategy_type)
            .field("background_available", &self.background.available_permits())
            .finish()
    }
}
