//! Engine tasks: one submitted fetch and its outcome.
//!
//! ```text
//!             submit
//!               │
//!               ▼
//!   ┌──────── Pending ────────┐
//!   │  attempt 1 ─► attempt 2 │   (promotion supersedes a non-demand attempt)
//!   └────┬─────────┬──────────┘
//!        │         │         │
//!        ▼         ▼         ▼
//!      Done     Failed   Cancelled
//! ```
//!
//! Exactly one terminal outcome is published. Every transition happens under
//! the task mutex, so a cancel that has been accepted cannot be overtaken by
//! an attempt finishing late.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::instance::EngineCore;
use super::proxy::FetcherProxy;
use super::strategy::PrefetchRequest;
use crate::fault::{class, ForeignFault};
use crate::fetcher::FetchValue;
use crate::labels::{FetchLabels, SubmitMode};

/// Terminal or pending result of a task.
enum Outcome {
    Pending,
    Done(FetchValue),
    Failed(String),
    Cancelled,
}

impl Outcome {
    fn is_pending(&self) -> bool {
        matches!(self, Outcome::Pending)
    }
}

/// One run of the fetcher on behalf of a task.
///
/// A background attempt's pool permit lives here once it starts running, so
/// clearing the attempt (completion, cancellation, or being superseded)
/// returns the slot to the pool even if the fetcher call is still unwinding.
struct Attempt {
    generation: u64,
    labels: FetchLabels,
    cancel: CancellationToken,
    running: bool,
    permit: Option<OwnedSemaphorePermit>,
}

struct TaskState {
    outcome: Outcome,
    attempt: Option<Attempt>,
    generation: u64,
    demanded: bool,
}

/// A fetch submitted to an engine.
pub struct EngineTask {
    id: u64,
    mode: SubmitMode,
    core: Arc<EngineCore>,
    proxy: Arc<FetcherProxy>,
    created_at: Instant,
    state: Mutex<TaskState>,
    finished: Condvar,
}

impl EngineTask {
    /// Creates a task and starts it as `mode` requires.
    pub fn submit(core: Arc<EngineCore>, proxy: Arc<FetcherProxy>, mode: SubmitMode) -> Arc<Self> {
        let task = Arc::new(Self {
            id: core.next_task_id(),
            mode,
            core,
            proxy,
            created_at: Instant::now(),
            state: Mutex::new(TaskState {
                outcome: Outcome::Pending,
                attempt: None,
                generation: 0,
                demanded: mode == SubmitMode::Demand,
            }),
            finished: Condvar::new(),
        });

        let mut state = task.state.lock();
        match mode {
            SubmitMode::Background => {
                task.core.stats().prefetch_hinted();
                let request = PrefetchRequest {
                    bytes_to_transfer: task.proxy.bytes_to_transfer(),
                };
                if task.core.strategy().start_on_enqueue(&request) {
                    task.start_attempt(&mut state, mode.initial_labels(), true);
                } else {
                    debug!(
                        task = task.id,
                        strategy = task.core.strategy().name(),
                        "Prefetch deferred until demanded"
                    );
                }
            }
            SubmitMode::Foreground => {
                task.start_attempt(&mut state, mode.initial_labels(), false);
            }
            SubmitMode::Demand => {
                task.core.stats().demand_fetch(false, Duration::ZERO);
                task.start_attempt(&mut state, mode.initial_labels(), false);
            }
        }
        drop(state);
        task
    }

    /// Waits for the outcome, promoting the task to demand first.
    ///
    /// With a timeout, an expired wait raises a timeout fault and leaves the
    /// task running.
    pub fn get(self: &Arc<Self>, timeout: Option<Duration>) -> Result<FetchValue, ForeignFault> {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut state = self.state.lock();
        self.promote(&mut state);

        loop {
            match &state.outcome {
                Outcome::Done(value) => return Ok(Arc::clone(value)),
                Outcome::Failed(message) => {
                    return Err(ForeignFault::new(class::EXECUTION, message.clone()))
                }
                Outcome::Cancelled => {
                    return Err(ForeignFault::cancellation(format!("task {} was cancelled", self.id)))
                }
                Outcome::Pending => {}
            }

            match deadline {
                Some(deadline) => {
                    let expired = self.finished.wait_until(&mut state, deadline).timed_out();
                    if expired && state.outcome.is_pending() {
                        return Err(ForeignFault::timeout(format!(
                            "task {} still pending after {:?}",
                            self.id,
                            timeout.unwrap_or_default()
                        )));
                    }
                }
                None => self.finished.wait(&mut state),
            }
        }
    }

    /// Cancels the task.
    ///
    /// Returns true if the task is now cancelled (including when it already
    /// was) and false if it had already finished otherwise.
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        let mut state = self.state.lock();
        match state.outcome {
            Outcome::Cancelled => return true,
            Outcome::Done(_) | Outcome::Failed(_) => return false,
            Outcome::Pending => {}
        }

        state.outcome = Outcome::Cancelled;
        let interrupted = match state.attempt.take() {
            Some(attempt) => {
                attempt.cancel.cancel();
                attempt.running && may_interrupt
            }
            None => false,
        };
        drop(state);

        self.core.stats().fetch_cancelled();
        self.finished.notify_all();
        debug!(task = self.id, may_interrupt, interrupted, "Task cancelled");

        if interrupted {
            self.proxy.on_cancelled();
        }
        true
    }

    /// Returns true once the task has any terminal outcome.
    pub fn is_done(&self) -> bool {
        !self.state.lock().outcome.is_pending()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.state.lock().outcome, Outcome::Cancelled)
    }

    /// Returns the labels of the current attempt, if one is live.
    pub fn current_labels(&self) -> Option<FetchLabels> {
        self.state.lock().attempt.as_ref().map(|a| a.labels)
    }

    /// Raises the task to demand priority on first demand.
    fn promote(self: &Arc<Self>, state: &mut MutexGuard<'_, TaskState>) {
        if state.demanded {
            return;
        }
        state.demanded = true;

        let hit = matches!(state.outcome, Outcome::Done(_));
        self.core.stats().demand_fetch(hit, self.created_at.elapsed());
        if !state.outcome.is_pending() {
            return;
        }

        let labels = match state.attempt.take() {
            Some(attempt) if attempt.labels.is_demand() => {
                state.attempt = Some(attempt);
                return;
            }
            Some(attempt) => {
                attempt.cancel.cancel();
                debug!(
                    task = self.id,
                    superseded = attempt.generation,
                    was_running = attempt.running,
                    released_permit = attempt.permit.is_some(),
                    "Superseding prefetch attempt with demand fetch"
                );
                let labels = attempt.labels.with_demand(true);
                drop(attempt);
                labels
            }
            None => self.mode.initial_labels().with_demand(true),
        };
        self.start_attempt(state, labels, false);
    }

    /// Issues a new attempt; any previous attempt must already be cleared.
    fn start_attempt(self: &Arc<Self>, state: &mut TaskState, labels: FetchLabels, bounded: bool) {
        state.generation += 1;
        let generation = state.generation;
        let cancel = CancellationToken::new();
        state.attempt = Some(Attempt {
            generation,
            labels,
            cancel: cancel.clone(),
            running: false,
            permit: None,
        });
        if !labels.is_demand() {
            self.core.stats().prefetch_issued();
        }
        trace!(task = self.id, generation, labels = ?labels, bounded, "Starting attempt");

        let task = Arc::clone(self);
        let permits = bounded.then(|| self.core.background_permits());
        self.core.handle().spawn(async move {
            let permit = match permits {
                Some(permits) => tokio::select! {
                    _ = cancel.cancelled() => {
                        trace!(task = task.id, generation, "Attempt cancelled while queued");
                        return;
                    }
                    permit = permits.acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => return,
                    },
                },
                None => None,
            };

            let runner = Arc::clone(&task);
            let result = tokio::task::spawn_blocking(move || {
                if !runner.begin_attempt(generation, permit) {
                    return None;
                }
                Some(runner.proxy.call(labels))
            })
            .await;

            let outcome = match result {
                Ok(None) => return,
                Ok(Some(Ok(value))) => Outcome::Done(value),
                Ok(Some(Err(e))) => Outcome::Failed(e.to_string()),
                Err(join_error) => Outcome::Failed(format!("fetcher panicked: {}", join_error)),
            };
            task.complete(generation, outcome);
        });
    }

    /// Marks an attempt as running and hands it its pool permit.
    ///
    /// Returns false, dropping the permit, if the attempt was superseded or
    /// cancelled before it started.
    fn begin_attempt(&self, generation: u64, permit: Option<OwnedSemaphorePermit>) -> bool {
        let mut state = self.state.lock();
        if !state.outcome.is_pending() {
            return false;
        }
        match state.attempt.as_mut() {
            Some(attempt) if attempt.generation == generation && !attempt.cancel.is_cancelled() => {
                attempt.running = true;
                attempt.permit = permit;
                true
            }
            _ => false,
        }
    }

    /// Publishes an attempt's outcome if it is still the current attempt.
    fn complete(&self, generation: u64, outcome: Outcome) {
        let mut state = self.state.lock();
        let current = state
            .attempt
            .as_ref()
            .map(|a| a.generation == generation)
            .unwrap_or(false);
        if !state.outcome.is_pending() || !current {
            trace!(task = self.id, generation, "Discarding stale attempt result");
            return;
        }

        if let Outcome::Failed(message) = &outcome {
            warn!(task = self.id, error = %message, "Fetch failed");
        } else {
            self.core.stats().fetch_completed();
        }
        state.outcome = outcome;
        state.attempt = None;
        drop(state);

        self.finished.notify_all();
        debug!(
            task = self.id,
            generation,
            elapsed_ms = u64::try_from(self.created_at.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Task finished"
        );
    }
}

impl fmt::Debug for EngineTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineTask")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("proxy", &self.proxy.token())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{CorrelationToken, NativeCallbacks};
    use crate::error::FetcherError;
    use crate::labels::StrategyType;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Callbacks that block until released, recording the labels they saw.
    #[derive(Default)]
    struct GatedCallbacks {
        open: Mutex<bool>,
        opened: Condvar,
        seen: Mutex<Vec<FetchLabels>>,
        cancellations: AtomicU32,
    }

    impl GatedCallbacks {
        fn open(&self) {
            *self.open.lock() = true;
            self.opened.notify_all();
        }
    }

    impl NativeCallbacks for GatedCallbacks {
        fn call(&self, _: CorrelationToken, labels: FetchLabels) -> Result<FetchValue, FetcherError> {
            self.seen.lock().push(labels);
            let mut open = self.open.lock();
            while !*open {
                self.opened.wait(&mut open);
            }
            Ok(Arc::new(labels.bits()))
        }

        fn bytes_to_transfer(&self, _: CorrelationToken) -> u64 {
            0
        }

        fn estimate_fetch_time(&self, _: CorrelationToken, _: u32, _: u32, _: u32) -> f64 {
            0.0
        }

        fn on_cancelled(&self, _: CorrelationToken) {
            self.cancellations.fetch_add(1, Ordering::SeqCst);
            self.open();
        }

        fn on_proxy_released(&self, _: CorrelationToken) {}
    }

    type Fixture = (tokio::runtime::Runtime, Arc<EngineCore>, Arc<GatedCallbacks>, Arc<FetcherProxy>);

    fn fixture(strategy: StrategyType) -> Fixture {
        fixture_with(strategy, 2)
    }

    fn fixture_with(strategy: StrategyType, background_workers: usize) -> Fixture {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .build()
            .unwrap();
        let core = Arc::new(EngineCore::new(strategy, background_workers, runtime.handle().clone()));
        let callbacks = Arc::new(GatedCallbacks::default());
        let proxy = Arc::new(FetcherProxy::new(
            CorrelationToken::from_raw(1),
            false,
            callbacks.clone(),
        ));
        (runtime, core, callbacks, proxy)
    }

    fn wait_for_calls(callbacks: &GatedCallbacks, count: usize) {
        wait_until("fetcher was never called", || callbacks.seen.lock().len() >= count);
    }

    fn wait_until(what: &str, condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "{}", what);
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_demand_task_completes_with_demand_labels() {
        let (_rt, core, callbacks, proxy) = fixture(StrategyType::Aggressive);
        callbacks.open();
        let task = EngineTask::submit(core.clone(), proxy, SubmitMode::Demand);

        let value = task.get(None).unwrap();
        assert_eq!(*value.downcast::<u32>().unwrap(), FetchLabels::ONDEMAND.bits());
        assert!(task.is_done());
        assert!(!task.is_cancelled());
        assert_eq!(core.stats().snapshot().completed_fetches, 1);
    }

    #[test]
    fn test_timed_get_expires_then_succeeds() {
        let (_rt, core, callbacks, proxy) = fixture(StrategyType::Aggressive);
        let task = EngineTask::submit(core, proxy, SubmitMode::Demand);

        let fault = task.get(Some(Duration::from_millis(20))).unwrap_err();
        assert_eq!(fault.class(), class::TIMEOUT);
        assert!(!task.is_done());

        callbacks.open();
        assert!(task.get(None).is_ok());
    }

    #[test]
    fn test_cancel_wins_over_late_result() {
        let (_rt, core, callbacks, proxy) = fixture(StrategyType::Aggressive);
        let task = EngineTask::submit(core.clone(), proxy, SubmitMode::Demand);
        wait_for_calls(&callbacks, 1);

        assert!(task.cancel(true));
        assert_eq!(callbacks.cancellations.load(Ordering::SeqCst), 1);

        let fault = task.get(None).unwrap_err();
        assert_eq!(fault.class(), class::CANCELLATION);
        assert!(task.is_cancelled());
        assert!(task.is_done());
        assert_eq!(core.stats().snapshot().cancelled_fetches, 1);
    }

    #[test]
    fn test_cancel_twice_and_after_done() {
        let (_rt, core, callbacks, proxy) = fixture(StrategyType::Aggressive);
        let pending = EngineTask::submit(core.clone(), Arc::clone(&proxy), SubmitMode::Demand);
        assert!(pending.cancel(false));
        assert!(pending.cancel(false));

        callbacks.open();
        let finished = EngineTask::submit(core, proxy, SubmitMode::Demand);
        finished.get(None).unwrap();
        assert!(!finished.cancel(true));
        assert!(!finished.is_cancelled());
    }

    #[test]
    fn test_conservative_prefetch_starts_on_demand() {
        let (_rt, core, callbacks, proxy) = fixture(StrategyType::Conservative);
        callbacks.open();
        let task = EngineTask::submit(core.clone(), proxy, SubmitMode::Background);
        assert!(task.current_labels().is_none());

        let value = task.get(None).unwrap();
        let bits = *value.downcast::<u32>().unwrap();
        assert_eq!(bits, FetchLabels::ONDEMAND.bits());

        let snap = core.stats().snapshot();
        assert_eq!(snap.hints, 1);
        assert_eq!(snap.demand_requests, 1);
        assert_eq!(snap.hits, 0);
    }

    #[test]
    fn test_promotion_supersedes_running_prefetch() {
        let (_rt, core, callbacks, proxy) = fixture(StrategyType::Aggressive);
        let task = EngineTask::submit(core, proxy, SubmitMode::Foreground);
        wait_for_calls(&callbacks, 1);
        assert_eq!(task.current_labels(), Some(FetchLabels::BACKGROUND));

        let waiter = {
            let task = Arc::clone(&task);
            std::thread::spawn(move || task.get(None))
        };
        wait_for_calls(&callbacks, 2);
        assert!(task.current_labels().unwrap().is_demand());

        callbacks.open();
        let value = waiter.join().unwrap().unwrap();
        assert!(FetchLabels::from_bits(*value.downcast::<u32>().unwrap()).is_demand());
        // Superseding is not a cancellation.
        assert_eq!(callbacks.cancellations.load(Ordering::SeqCst), 0);
        assert!(!task.is_cancelled());
    }

    #[test]
    fn test_demand_on_finished_prefetch_is_hit() {
        let (_rt, core, callbacks, proxy) = fixture(StrategyType::Aggressive);
        callbacks.open();
        let task = EngineTask::submit(core.clone(), proxy, SubmitMode::Background);

        let deadline = Instant::now() + Duration::from_secs(5);
        while !task.is_done() {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(2));
        }
        task.get(None).unwrap();
        task.get(None).unwrap();

        let snap = core.stats().snapshot();
        assert_eq!(snap.demand_requests, 1);
        assert_eq!(snap.hits, 1);
    }

    #[test]
    fn test_superseded_prefetch_returns_its_permit() {
        let (_rt, core, callbacks, proxy) = fixture_with(StrategyType::Aggressive, 2);
        let permits = core.background_permits();
        let task = EngineTask::submit(core, proxy, SubmitMode::Background);
        wait_for_calls(&callbacks, 1);
        assert_eq!(permits.available_permits(), 1);

        let waiter = {
            let task = Arc::clone(&task);
            std::thread::spawn(move || task.get(None))
        };
        wait_for_calls(&callbacks, 2);
        // The background call is still blocked, but its slot is free again.
        assert_eq!(permits.available_permits(), 2);

        callbacks.open();
        assert!(waiter.join().unwrap().is_ok());
        assert_eq!(permits.available_permits(), 2);
    }

    #[test]
    fn test_cancel_while_waiting_for_permit() {
        let (_rt, core, callbacks, proxy) = fixture_with(StrategyType::Aggressive, 1);
        let permits = core.background_permits();
        let running = EngineTask::submit(core.clone(), Arc::clone(&proxy), SubmitMode::Background);
        wait_for_calls(&callbacks, 1);
        assert_eq!(permits.available_permits(), 0);

        let queued = EngineTask::submit(core, proxy, SubmitMode::Background);
        assert!(queued.cancel(true));
        assert!(queued.is_cancelled());
        // Not running, so the fetcher is not interrupted.
        assert_eq!(callbacks.cancellations.load(Ordering::SeqCst), 0);

        // The queued attempt stops waiting and drops its task reference
        // while the only permit is still held.
        wait_until("queued attempt kept waiting for a permit", || {
            Arc::strong_count(&queued) == 1
        });
        assert_eq!(permits.available_permits(), 0);

        assert!(running.cancel(true));
        assert_eq!(permits.available_permits(), 1);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(callbacks.seen.lock().len(), 1);
    }
}
