//! Prefetch strategies.
//!
//! A strategy decides whether a hinted (background) prefetch starts as soon
//! as it is enqueued. Foreground and demand submissions bypass it.

use std::time::Instant;

use parking_lot::Mutex;
use tracing::debug;

use crate::labels::StrategyType;

/// What a strategy sees about a hinted prefetch.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PrefetchRequest {
    /// Expected transfer size reported by the fetcher.
    pub bytes_to_transfer: u64,
}

/// Decides when hinted prefetches start.
pub trait PrefetchStrategy: Send + Sync {
    /// Strategy name for logs.
    fn name(&self) -> &'static str;

    /// Returns true if the prefetch should start on enqueue.
    fn start_on_enqueue(&self, request: &PrefetchRequest) -> bool;

    /// Notification that the goal time moved.
    fn goal_time_updated(&self, _goal: Instant) {}

    /// The goal time this strategy is working towards, if it tracks one.
    fn goal(&self) -> Option<Instant> {
        None
    }
}

/// Starts every hinted prefetch immediately.
#[derive(Debug, Default)]
pub struct AggressiveStrategy;

impl PrefetchStrategy for AggressiveStrategy {
    fn name(&self) -> &'static str {
        "aggressive"
    }

    fn start_on_enqueue(&self, _request: &PrefetchRequest) -> bool {
        true
    }
}

/// Never prefetches; work starts only when a result is demanded.
#[derive(Debug, Default)]
pub struct ConservativeStrategy;

impl PrefetchStrategy for ConservativeStrategy {
    fn name(&self) -> &'static str {
        "conservative"
    }

    fn start_on_enqueue(&self, _request: &PrefetchRequest) -> bool {
        false
    }
}

/// Starts on enqueue and tracks the goal time it is working towards.
#[derive(Debug, Default)]
pub struct AdaptiveStrategy {
    goal: Mutex<Option<Instant>>,
}

impl PrefetchStrategy for AdaptiveStrategy {
    fn name(&self) -> &'static str {
        "adaptive"
    }

    fn start_on_enqueue(&self, request: &PrefetchRequest) -> bool {
        debug!(
            bytes = request.bytes_to_transfer,
            goal_set = self.goal.lock().is_some(),
            "Adaptive strategy admitting prefetch"
        );
        true
    }

    fn goal_time_updated(&self, goal: Instant) {
        *self.goal.lock() = Some(goal);
    }

    fn goal(&self) -> Option<Instant> {
        *self.goal.lock()
    }
}

/// Builds the strategy for a strategy type.
pub fn strategy_for(kind: StrategyType) -> Box<dyn PrefetchStrategy> {
    match kind {
        StrategyType::Aggressive => Box::new(AggressiveStrategy),
        StrategyType::Conservative => Box::new(ConservativeStrategy),
        StrategyType::Adaptive => Box::new(AdaptiveStrategy::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const REQUEST: PrefetchRequest = PrefetchRequest {
        bytes_to_transfer: 4096,
    };

    #[test]
    fn test_strategy_for_maps_every_type() {
        assert_eq!(strategy_for(StrategyType::Aggressive).name(), "aggressive");
        assert_eq!(strategy_for(StrategyType::Conservative).name(), "conservative");
        assert_eq!(strategy_for(StrategyType::Adaptive).name(), "adaptive");
    }

    #[test]
    fn test_start_on_enqueue() {
        assert!(AggressiveStrategy.start_on_enqueue(&REQUEST));
        assert!(!ConservativeStrategy.start_on_enqueue(&REQUEST));
        assert!(AdaptiveStrategy::default().start_on_enqueue(&REQUEST));
    }

    #[test]
    fn test_fixed_strategies_track_no_goal() {
        let goal = Instant::now() + Duration::from_secs(60);
        AggressiveStrategy.goal_time_updated(goal);
        ConservativeStrategy.goal_time_updated(goal);
        assert!(AggressiveStrategy.goal().is_none());
        assert!(ConservativeStrategy.goal().is_none());
    }

    #[test]
    fn test_adaptive_records_goal() {
        let strategy = AdaptiveStrategy::default();
        assert!(strategy.goal().is_none());
        let goal = Instant::now() + Duration::from_secs(60);
        strategy.goal_time_updated(goal);
        assert_eq!(strategy.goal(), Some(goal));
    }
}
