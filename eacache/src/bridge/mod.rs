//! The call boundary between native callers and the foreign cache runtime.
//!
//! The cache engine lives in a separately scheduled runtime. Native code
//! reaches it only through the [`ForeignRuntime`] trait, and the runtime
//! reaches back only through [`NativeCallbacks`]:
//!
//! ```text
//!  native thread                         foreign runtime
//! ┌──────────────────┐   ensure_attached  ┌───────────────────────┐
//! │ CacheEngineHandle │──────────────────►│ attach_thread          │
//! │ FetchFuture       │   CallEnv::call    │ submit / task_get / .. │
//! │                   │──────────────────►│                        │
//! │ FetcherOwnership  │◄──────────────────│ NativeCallbacks        │
//! │   Bridge          │  call(token, ..)   │ (fetcher proxy)        │
//! └──────────────────┘  on_proxy_released └───────────────────────┘
//! ```
//!
//! Every fallible boundary call goes through [`CallEnv::call`], which applies
//! the [`FaultTranslator`] to whatever fault the runtime raised.

mod attachment;
mod constants;
mod ownership;

pub use attachment::ThreadAttachmentRegistry;
pub use constants::ConstantTable;
pub use ownership::{CorrelationToken, FetcherOwnershipBridge};

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::ThreadId;

use tracing::warn;

use crate::error::{FetchError, FetcherError};
use crate::fault::{FaultTranslator, ForeignFault};
use crate::fetcher::FetchValue;
use crate::labels::{FetchLabels, SubmitMode};
use crate::stats::CacheStatsSnapshot;

/// Identity of one foreign runtime instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuntimeId(u64);

impl RuntimeId {
    /// Creates a runtime id from its raw value.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

/// An owned global reference to an object inside the foreign runtime.
///
/// Not `Clone`: [`ForeignRuntime::release_ref`] consumes it, so a reference
/// can be released at most once.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct ForeignRef(u64);

impl ForeignRef {
    /// Wraps a raw reference minted by a runtime implementation.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw reference value.
    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

/// A resolved engine-side constant (time unit, strategy type).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ForeignConstant(u32);

impl ForeignConstant {
    /// Wraps a raw constant minted by a runtime implementation.
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw constant value.
    pub fn as_raw(&self) -> u32 {
        self.0
    }
}

/// Parameters for creating an engine instance.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EngineParams {
    /// Resolved strategy constant.
    pub strategy: ForeignConstant,
    /// Milliseconds from now until the goal time, if any.
    pub goal_delay_ms: Option<u64>,
    /// Energy spendable before the goal time (percent of battery).
    pub energy_budget: f64,
    /// Mobile data spendable before the goal time (bytes).
    pub data_budget: u64,
}

/// The narrow call boundary into the foreign cache runtime.
///
/// All operations other than [`attach_thread`](Self::attach_thread) and
/// [`detach_thread`](Self::detach_thread) may only be called from a thread
/// that is attached to this runtime.
pub trait ForeignRuntime: Send + Sync + 'static {
    /// Returns this runtime's identity.
    fn id(&self) -> RuntimeId;

    /// Returns false once the runtime has stopped accepting calls.
    fn is_running(&self) -> bool {
        true
    }

    /// Attaches the given (current) thread. Attaching twice is a no-op.
    fn attach_thread(&self, thread: ThreadId) -> Result<(), ForeignFault>;

    /// Detaches a thread previously attached.
    fn detach_thread(&self, thread: ThreadId);

    /// Resolves a named constant of the given class.
    fn lookup_constant(&self, class: &str, name: &str) -> Result<ForeignConstant, ForeignFault>;

    /// Creates the cache engine instance.
    fn create_engine(&self, params: &EngineParams) -> Result<ForeignRef, ForeignFault>;

    /// Creates the proxy object that stands for a native fetcher.
    ///
    /// When `owns_fetcher` is true the proxy notifies
    /// [`NativeCallbacks::on_proxy_released`] exactly once when it is
    /// finalized. If this call fails no notification is ever sent.
    fn new_fetcher_proxy(
        &self,
        token: CorrelationToken,
        owns_fetcher: bool,
        callbacks: Arc<dyn NativeCallbacks>,
    ) -> Result<ForeignRef, ForeignFault>;

    /// Submits a fetcher proxy to the engine and returns its task handle.
    fn submit(
        &self,
        engine: &ForeignRef,
        proxy: &ForeignRef,
        mode: SubmitMode,
    ) -> Result<ForeignRef, ForeignFault>;

    /// Blocks until the task finishes.
    fn task_get(&self, task: &ForeignRef) -> Result<FetchValue, ForeignFault>;

    /// Blocks until the task finishes or the timeout elapses.
    fn task_get_timeout(
        &self,
        task: &ForeignRef,
        timeout: u64,
        unit: ForeignConstant,
    ) -> Result<FetchValue, ForeignFault>;

    /// Requests cancellation; returns true if the outcome changed.
    fn task_cancel(&self, task: &ForeignRef, may_interrupt: bool) -> Result<bool, ForeignFault>;

    /// Returns true if the task is no longer pending.
    fn task_is_done(&self, task: &ForeignRef) -> Result<bool, ForeignFault>;

    /// Returns true if the task was cancelled.
    fn task_is_cancelled(&self, task: &ForeignRef) -> Result<bool, ForeignFault>;

    /// Moves the engine's goal time to `start_delay_ms` from now.
    fn update_goal_time(&self, engine: &ForeignRef, start_delay_ms: u64) -> Result<(), ForeignFault>;

    /// Returns the engine's cache statistics.
    fn engine_stats(&self, engine: &ForeignRef) -> Result<CacheStatsSnapshot, ForeignFault>;

    /// Releases a global reference.
    fn release_ref(&self, reference: ForeignRef);
}

/// Calls the foreign runtime makes back into native code for a fetcher proxy.
///
/// Every method may be invoked from any thread.
pub trait NativeCallbacks: Send + Sync + 'static {
    /// Runs the fetcher bound to `token`.
    fn call(&self, token: CorrelationToken, labels: FetchLabels) -> Result<FetchValue, FetcherError>;

    /// Returns the bound fetcher's expected transfer size.
    fn bytes_to_transfer(&self, token: CorrelationToken) -> u64;

    /// Returns the bound fetcher's estimated fetch time in seconds.
    fn estimate_fetch_time(
        &self,
        token: CorrelationToken,
        bandwidth_down: u32,
        bandwidth_up: u32,
        rtt_ms: u32,
    ) -> f64;

    /// Tells the bound fetcher its running fetch was cancelled.
    fn on_cancelled(&self, token: CorrelationToken);

    /// One-time notification that the proxy for `token` was finalized.
    fn on_proxy_released(&self, token: CorrelationToken);
}

/// Entry point to the foreign runtime for native threads.
///
/// Cloning is cheap; every clone refers to the same runtime.
#[derive(Clone)]
pub struct RuntimeBridge {
    runtime: Arc<dyn ForeignRuntime>,
}

impl RuntimeBridge {
    /// Creates a bridge to the given runtime.
    pub fn new(runtime: Arc<dyn ForeignRuntime>) -> Self {
        Self { runtime }
    }

    /// Returns the runtime's identity.
    pub fn runtime_id(&self) -> RuntimeId {
        self.runtime.id()
    }

    /// Attaches the calling thread if needed and returns a call handle.
    ///
    /// The bridge never detaches; the detach happens when the thread exits.
    /// A stopped runtime is reported as [`FetchError::EngineUnavailable`],
    /// whether or not this thread attached before it stopped.
    pub fn env(&self) -> Result<CallEnv<'_>, FetchError> {
        if !self.runtime.is_running() {
            return Err(FetchError::engine_unavailable(format!(
                "foreign runtime {} has stopped",
                self.runtime.id().as_raw()
            )));
        }
        ThreadAttachmentRegistry::ensure_attached(&self.runtime).map_err(|fault| {
            warn!(
                runtime = self.runtime.id().as_raw(),
                error = %fault,
                "Failed to attach thread to foreign runtime"
            );
            FetchError::engine_unavailable(fault)
        })?;
        Ok(CallEnv {
            runtime: self.runtime.as_ref(),
            _thread_bound: PhantomData,
        })
    }
}

impl fmt::Debug for RuntimeBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeBridge")
            .field("runtime", &self.runtime.id())
            .finish()
    }
}

/// Call handle valid on the thread that obtained it.
pub struct CallEnv<'a> {
    runtime: &'a dyn ForeignRuntime,
    // Attachment is per thread, so the handle must not leave it.
    _thread_bound: PhantomData<*const ()>,
}

impl fmt::Debug for CallEnv<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallEnv")
            .field("runtime", &self.runtime.id())
            .finish()
    }
}

impl CallEnv<'_> {
    /// Performs one boundary call and translates any fault it raised.
    ///
    /// A fault raised because the runtime stopped during the call is
    /// reported as [`FetchError::EngineUnavailable`].
    pub fn call<T>(
        &self,
        op: impl FnOnce(&dyn ForeignRuntime) -> Result<T, ForeignFault>,
    ) -> Result<T, FetchError> {
        op(self.runtime).map_err(|fault| {
            if self.runtime.is_running() {
                FaultTranslator::translate(fault)
            } else {
                FetchError::engine_unavailable(fault)
            }
        })
    }

    /// Releases a global reference.
    pub fn release(&self, reference: ForeignRef) {
        self.runtime.release_ref(reference);
    }
}
