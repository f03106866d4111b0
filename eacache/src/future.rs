//! Handle to one submitted fetch.
//!
//! A [`FetchFuture`] owns exactly one engine task reference, created when the
//! fetch was submitted and released when the future is released or dropped.
//!
//! ```text
//!   PENDING ──── fetch finishes ────► DONE
//!      │
//!      └──── cancel accepted ───────► CANCELLED
//! ```
//!
//! Dropping a future that is not cancelled issues one `cancel(true)` before
//! the reference is released, so abandoned fetches do not keep running
//! unnoticed.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::bridge::{ConstantTable, ForeignRef, RuntimeBridge};
use crate::error::FetchError;
use crate::fault::class;
use crate::fetcher::FetchValue;
use crate::labels::TimeUnit;

const RELEASED: &str = "fetch future already released";

/// The pending result of a fetch submitted to a
/// [`CacheEngineHandle`](crate::CacheEngineHandle).
pub struct FetchFuture<V> {
    task: Option<ForeignRef>,
    bridge: RuntimeBridge,
    time_units: Arc<ConstantTable<TimeUnit>>,
    _value: PhantomData<fn() -> V>,
}

impl<V: Send + Sync + 'static> FetchFuture<V> {
    pub(crate) fn new(task: ForeignRef, bridge: RuntimeBridge, time_units: Arc<ConstantTable<TimeUnit>>) -> Self {
        Self {
            task: Some(task),
            bridge,
            time_units,
            _value: PhantomData,
        }
    }

    /// Blocks until the fetch finishes.
    ///
    /// Calling `get` promotes a prefetch to a demand fetch.
    ///
    /// # Errors
    ///
    /// - [`FetchError::Cancelled`] if the fetch was cancelled
    /// - [`FetchError::Foreign`] if the fetcher failed
    /// - [`FetchError::InvalidState`] after [`release`](Self::release)
    pub fn get(&self) -> Result<Arc<V>, FetchError> {
        let task = self.task()?;
        let env = self.bridge.env()?;
        let value = env.call(|rt| rt.task_get(task))?;
        Self::downcast(value)
    }

    /// Blocks until the fetch finishes or `timeout` units elapse.
    ///
    /// An expired wait returns [`FetchError::Timeout`] and leaves the fetch
    /// running; a later call may still succeed.
    pub fn get_timeout(&self, timeout: u64, unit: TimeUnit) -> Result<Arc<V>, FetchError> {
        let task = self.task()?;
        let constant = self.time_units.get(unit);
        let env = self.bridge.env()?;
        let value = env.call(|rt| rt.task_get_timeout(task, timeout, constant))?;
        Self::downcast(value)
    }

    /// [`get_timeout`](Self::get_timeout) with a `Duration`.
    pub fn get_for(&self, timeout: Duration) -> Result<Arc<V>, FetchError> {
        let nanos = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        self.get_timeout(nanos, TimeUnit::Nanoseconds)
    }

    /// Requests cancellation.
    ///
    /// Returns true unless the fetch had already completed. With
    /// `may_interrupt` a running fetcher is notified through
    /// [`Fetcher::on_cancelled`](crate::Fetcher::on_cancelled); without it
    /// only a fetch that has not started yet is stopped.
    pub fn cancel(&self, may_interrupt: bool) -> Result<bool, FetchError> {
        let task = self.task()?;
        let env = self.bridge.env()?;
        env.call(|rt| rt.task_cancel(task, may_interrupt))
    }

    /// Returns true once the fetch finished, failed, or was cancelled.
    pub fn is_done(&self) -> Result<bool, FetchError> {
        let task = self.task()?;
        let env = self.bridge.env()?;
        env.call(|rt| rt.task_is_done(task))
    }

    /// Returns true if the fetch was cancelled.
    pub fn is_cancelled(&self) -> Result<bool, FetchError> {
        let task = self.task()?;
        let env = self.bridge.env()?;
        env.call(|rt| rt.task_is_cancelled(task))
    }

    /// Returns true once the task reference was released.
    pub fn is_released(&self) -> bool {
        self.task.is_none()
    }

    /// Cancels the fetch unless it is already cancelled, then releases the
    /// task reference.
    ///
    /// Idempotent; every other operation fails with
    /// [`FetchError::InvalidState`] afterwards.
    pub fn release(&mut self) {
        release_task(&mut self.task, &self.bridge);
    }

    fn task(&self) -> Result<&ForeignRef, FetchError> {
        self.task.as_ref().ok_or(FetchError::InvalidState(RELEASED))
    }

    fn downcast(value: FetchValue) -> Result<Arc<V>, FetchError> {
        value.downcast::<V>().map_err(|_| FetchError::Foreign {
            class: class::CLASS_CAST.to_string(),
            message: format!("fetch result is not a {}", std::any::type_name::<V>()),
        })
    }
}

impl<V> Drop for FetchFuture<V> {
    fn drop(&mut self) {
        release_task(&mut self.task, &self.bridge);
    }
}

/// Shared by `release` and `Drop`, which cannot carry the `V` bounds.
fn release_task(task: &mut Option<ForeignRef>, bridge: &RuntimeBridge) {
    let Some(task) = task.take() else {
        return;
    };
    let env = match bridge.env() {
        Ok(env) => env,
        Err(e) => {
            error!(
                task = task.as_raw(),
                error = %e,
                "Cannot reach engine to release fetch task; reference leaked"
            );
            return;
        }
    };
    match env.call(|rt| rt.task_is_cancelled(&task)) {
        Ok(true) => {}
        Ok(false) => {
            if let Err(e) = env.call(|rt| rt.task_cancel(&task, true)) {
                warn!(task = task.as_raw(), error = %e, "Cancel on release failed");
            }
        }
        Err(e) => warn!(task = task.as_raw(), error = %e, "Cancellation check on release failed"),
    }
    debug!(task = task.as_raw(), "Released fetch task");
    env.release(task);
}

impl<V> fmt::Debug for FetchFuture<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchFuture")
            .field("task", &self.task.as_ref().map(ForeignRef::as_raw))
            .field("value", &std::any::type_name::<V>())
            .finish()
    }
}
