//! In-process cache engine.
//!
//! [`LocalRuntime`] implements the [`ForeignRuntime`] boundary on its own
//! multi-threaded tokio runtime. Objects handed across the boundary live in a
//! global reference table; a [`ForeignRef`] is just a key into it.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                         LocalRuntime                           │
//! │                                                                │
//! │  refs: DashMap<u64, ForeignObject>                             │
//! │    ├── Engine(Arc<EngineCore>)   strategy, stats, bg permits   │
//! │    ├── Proxy(Arc<FetcherProxy>)  token + native callbacks      │
//! │    └── Task(Arc<EngineTask>)     outcome + current attempt     │
//! │                                                                │
//! │  attempt ──► [background permit] ──► spawn_blocking(fetch)     │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! The runtime also carries test hooks: [`LocalRuntime::fail_next`] injects a
//! fault into the next call of an operation and
//! [`LocalRuntime::hide_constant`] makes a constant unresolvable.

mod instance;
mod proxy;
mod strategy;
mod task;

pub use instance::EngineCore;
pub use proxy::FetcherProxy;
pub use strategy::{
    strategy_for, AdaptiveStrategy, AggressiveStrategy, ConservativeStrategy, PrefetchRequest,
    PrefetchStrategy,
};
pub use task::EngineTask;

pub use crate::config::LocalRuntimeConfig;

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::runtime::{Handle, Runtime};
use tracing::{debug, info, warn};

use crate::bridge::{
    CorrelationToken, EngineParams, ForeignConstant, ForeignRef, ForeignRuntime, NativeCallbacks,
    RuntimeId,
};
use crate::error::FetchError;
use crate::fault::{class, ForeignFault};
use crate::fetcher::FetchValue;
use crate::labels::{ForeignConstantKey, StrategyType, SubmitMode, TimeUnit};
use crate::stats::CacheStatsSnapshot;

// =============================================================================
// Constants
// =============================================================================

/// Constant namespace for time units.
const TIME_UNIT_BASE: u32 = 0x100;

/// Constant namespace for strategy types.
const STRATEGY_BASE: u32 = 0x200;

static NEXT_RUNTIME_ID: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// Boundary Operations
// =============================================================================

/// Boundary operations that can have a fault injected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BoundaryOp {
    AttachThread,
    LookupConstant,
    CreateEngine,
    NewFetcherProxy,
    Submit,
    TaskGet,
    TaskCancel,
    TaskIsDone,
    TaskIsCancelled,
    UpdateGoalTime,
    EngineStats,
}

impl BoundaryOp {
    /// Fault class raised when a failure is injected.
    fn fault_class(&self) -> &'static str {
        match self {
            BoundaryOp::CreateEngine | BoundaryOp::NewFetcherProxy => class::OUT_OF_MEMORY,
            BoundaryOp::LookupConstant => class::NOT_FOUND,
            _ => class::ILLEGAL_STATE,
        }
    }
}

/// An object reachable through a [`ForeignRef`].
enum ForeignObject {
    Engine(Arc<EngineCore>),
    Proxy(Arc<FetcherProxy>),
    Task(Arc<EngineTask>),
}

impl ForeignObject {
    fn kind(&self) -> &'static str {
        match self {
            ForeignObject::Engine(_) => "engine",
            ForeignObject::Proxy(_) => "proxy",
            ForeignObject::Task(_) => "task",
        }
    }
}

// =============================================================================
// Local Runtime
// =============================================================================

/// The in-process engine runtime.
pub struct LocalRuntime {
    id: RuntimeId,
    config: LocalRuntimeConfig,
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    refs: DashMap<u64, ForeignObject>,
    next_ref: AtomicU64,
    attached: DashMap<ThreadId, ()>,
    stopped: AtomicBool,
    inject: Mutex<HashSet<BoundaryOp>>,
    hidden_constants: Mutex<HashSet<String>>,
    cancel_requests: AtomicU64,
}

impl LocalRuntime {
    /// Starts a runtime with its own worker threads.
    pub fn start(config: LocalRuntimeConfig) -> Result<Arc<Self>, FetchError> {
        config.validate()?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads)
            .thread_name("eacache-engine")
            .enable_time()
            .build()
            .map_err(|e| FetchError::engine_unavailable(format!("failed to start engine runtime: {}", e)))?;
        let handle = runtime.handle().clone();
        let id = RuntimeId::new(NEXT_RUNTIME_ID.fetch_add(1, Ordering::Relaxed));

        info!(
            runtime = id.as_raw(),
            worker_threads = config.worker_threads,
            background_workers = config.background_workers,
            "Engine runtime started"
        );

        Ok(Arc::new(Self {
            id,
            config,
            runtime: Mutex::new(Some(runtime)),
            handle,
            refs: DashMap::new(),
            next_ref: AtomicU64::new(1),
            attached: DashMap::new(),
            stopped: AtomicBool::new(false),
            inject: Mutex::new(HashSet::new()),
            hidden_constants: Mutex::new(HashSet::new()),
            cancel_requests: AtomicU64::new(0),
        }))
    }

    /// Stops accepting work. Later attaches and calls fail.
    pub fn shutdown(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            info!(runtime = self.id.as_raw(), live_refs = self.refs.len(), "Engine runtime stopping");
        }
    }

    /// Returns true once [`shutdown`](Self::shutdown) was called.
    pub fn is_shut_down(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Makes the next call of `op` raise a fault.
    pub fn fail_next(&self, op: BoundaryOp) {
        self.inject.lock().insert(op);
    }

    /// Makes the named constant unresolvable.
    pub fn hide_constant(&self, name: &str) {
        self.hidden_constants.lock().insert(name.to_string());
    }

    /// Number of references not yet released.
    pub fn live_refs(&self) -> usize {
        self.refs.len()
    }

    /// Number of `task_cancel` calls received.
    pub fn cancel_requests(&self) -> u64 {
        self.cancel_requests.load(Ordering::SeqCst)
    }

    /// Number of threads currently attached.
    pub fn attached_threads(&self) -> usize {
        self.attached.len()
    }

    // -------------------------------------------------------------------------
    // Reference table
    // -------------------------------------------------------------------------

    fn insert(&self, object: ForeignObject) -> ForeignRef {
        let raw = self.next_ref.fetch_add(1, Ordering::Relaxed);
        debug!(runtime = self.id.as_raw(), reference = raw, kind = object.kind(), "New global reference");
        self.refs.insert(raw, object);
        ForeignRef::from_raw(raw)
    }

    fn engine(&self, reference: &ForeignRef) -> Result<Arc<EngineCore>, ForeignFault> {
        match self.refs.get(&reference.as_raw()).as_deref() {
            Some(ForeignObject::Engine(core)) => Ok(Arc::clone(core)),
            Some(other) => Err(Self::wrong_kind(reference, "engine", other)),
            None => Err(Self::stale(reference)),
        }
    }

    fn proxy(&self, reference: &ForeignRef) -> Result<Arc<FetcherProxy>, ForeignFault> {
        match self.refs.get(&reference.as_raw()).as_deref() {
            Some(ForeignObject::Proxy(proxy)) => Ok(Arc::clone(proxy)),
            Some(other) => Err(Self::wrong_kind(reference, "proxy", other)),
            None => Err(Self::stale(reference)),
        }
    }

    fn task(&self, reference: &ForeignRef) -> Result<Arc<EngineTask>, ForeignFault> {
        match self.refs.get(&reference.as_raw()).as_deref() {
            Some(ForeignObject::Task(task)) => Ok(Arc::clone(task)),
            Some(other) => Err(Self::wrong_kind(reference, "task", other)),
            None => Err(Self::stale(reference)),
        }
    }

    fn wrong_kind(reference: &ForeignRef, expected: &str, found: &ForeignObject) -> ForeignFault {
        ForeignFault::new(
            class::CLASS_CAST,
            format!("reference {} is a {}, not a {}", reference.as_raw(), found.kind(), expected),
        )
    }

    fn stale(reference: &ForeignRef) -> ForeignFault {
        ForeignFault::illegal_state(format!("reference {} is not live", reference.as_raw()))
    }

    // -------------------------------------------------------------------------
    // Call checks
    // -------------------------------------------------------------------------

    /// Rejects calls after shutdown, from unattached threads, or with an
    /// injected failure pending.
    fn enter(&self, op: BoundaryOp) -> Result<(), ForeignFault> {
        if self.is_shut_down() {
            return Err(ForeignFault::illegal_state("engine runtime is shut down"));
        }
        if !self.attached.contains_key(&thread::current().id()) {
            return Err(ForeignFault::illegal_state(format!(
                "{:?} called from a thread that is not attached",
                op
            )));
        }
        self.injected(op)
    }

    fn injected(&self, op: BoundaryOp) -> Result<(), ForeignFault> {
        if self.inject.lock().remove(&op) {
            debug!(runtime = self.id.as_raw(), op = ?op, "Raising injected fault");
            return Err(ForeignFault::new(op.fault_class(), format!("injected failure in {:?}", op)));
        }
        Ok(())
    }

    fn decode<K: ForeignConstantKey>(base: u32, constant: ForeignConstant) -> Result<K, ForeignFault> {
        constant
            .as_raw()
            .checked_sub(base)
            .and_then(|index| K::ALL.get(index as usize))
            .copied()
            .ok_or_else(|| {
                ForeignFault::new(
                    class::CLASS_CAST,
                    format!("constant {:#x} is not a {}", constant.as_raw(), K::CLASS),
                )
            })
    }

    fn encode<K: ForeignConstantKey>(&self, base: u32, name: &str) -> Result<ForeignConstant, ForeignFault> {
        let index = K::ALL
            .iter()
            .position(|key| key.foreign_name() == name)
            .filter(|_| !self.hidden_constants.lock().contains(name))
            .ok_or_else(|| ForeignFault::new(class::NOT_FOUND, format!("{}.{}", K::CLASS, name)))?;
        Ok(ForeignConstant::from_raw(base + index as u32))
    }
}

impl ForeignRuntime for LocalRuntime {
    fn id(&self) -> RuntimeId {
        self.id
    }

    fn is_running(&self) -> bool {
        !self.is_shut_down()
    }

    fn attach_thread(&self, thread: ThreadId) -> Result<(), ForeignFault> {
        if self.is_shut_down() {
            return Err(ForeignFault::illegal_state("engine runtime is shut down"));
        }
        self.injected(BoundaryOp::AttachThread)?;
        self.attached.insert(thread, ());
        Ok(())
    }

    fn detach_thread(&self, thread: ThreadId) {
        self.attached.remove(&thread);
    }

    fn lookup_constant(&self, class_name: &str, name: &str) -> Result<ForeignConstant, ForeignFault> {
        self.enter(BoundaryOp::LookupConstant)?;
        if class_name == TimeUnit::CLASS {
            self.encode::<TimeUnit>(TIME_UNIT_BASE, name)
        } else if class_name == StrategyType::CLASS {
            self.encode::<StrategyType>(STRATEGY_BASE, name)
        } else {
            Err(ForeignFault::new(class::NOT_FOUND, format!("no such class {}", class_name)))
        }
    }

    fn create_engine(&self, params: &EngineParams) -> Result<ForeignRef, ForeignFault> {
        self.enter(BoundaryOp::CreateEngine)?;
        let strategy: StrategyType = Self::decode(STRATEGY_BASE, params.strategy)?;
        let core = Arc::new(EngineCore::new(
            strategy,
            self.config.background_workers,
            self.handle.clone(),
        ));
        if let Some(delay) = params.goal_delay_ms {
            core.update_goal_time(Duration::from_millis(delay));
        }
        // Budgets are reported, not enforced.
        info!(
            runtime = self.id.as_raw(),
            strategy = %strategy,
            energy_budget = params.energy_budget,
            data_budget = params.data_budget,
            "Cache engine created"
        );
        Ok(self.insert(ForeignObject::Engine(core)))
    }

    fn new_fetcher_proxy(
        &self,
        token: CorrelationToken,
        owns_fetcher: bool,
        callbacks: Arc<dyn NativeCallbacks>,
    ) -> Result<ForeignRef, ForeignFault> {
        self.enter(BoundaryOp::NewFetcherProxy)?;
        let proxy = Arc::new(FetcherProxy::new(token, owns_fetcher, callbacks));
        Ok(self.insert(ForeignObject::Proxy(proxy)))
    }

    fn submit(&self, engine: &ForeignRef, proxy: &ForeignRef, mode: SubmitMode) -> Result<ForeignRef, ForeignFault> {
        self.enter(BoundaryOp::Submit)?;
        let core = self.engine(engine)?;
        let proxy = self.proxy(proxy)?;
        debug!(runtime = self.id.as_raw(), token = %proxy.token(), mode = %mode, "Fetch submitted");
        let task = EngineTask::submit(core, proxy, mode);
        Ok(self.insert(ForeignObject::Task(task)))
    }

    fn task_get(&self, task: &ForeignRef) -> Result<FetchValue, ForeignFault> {
        self.enter(BoundaryOp::TaskGet)?;
        self.task(task)?.get(None)
    }

    fn task_get_timeout(&self, task: &ForeignRef, timeout: u64, unit: ForeignConstant) -> Result<FetchValue, ForeignFault> {
        self.enter(BoundaryOp::TaskGet)?;
        let unit: TimeUnit = Self::decode(TIME_UNIT_BASE, unit)?;
        self.task(task)?.get(Some(unit.to_duration(timeout)))
    }

    fn task_cancel(&self, task: &ForeignRef, may_interrupt: bool) -> Result<bool, ForeignFault> {
        self.enter(BoundaryOp::TaskCancel)?;
        self.cancel_requests.fetch_add(1, Ordering::SeqCst);
        Ok(self.task(task)?.cancel(may_interrupt))
    }

    fn task_is_done(&self, task: &ForeignRef) -> Result<bool, ForeignFault> {
        self.enter(BoundaryOp::TaskIsDone)?;
        Ok(self.task(task)?.is_done())
    }

    fn task_is_cancelled(&self, task: &ForeignRef) -> Result<bool, ForeignFault> {
        self.enter(BoundaryOp::TaskIsCancelled)?;
        Ok(self.task(task)?.is_cancelled())
    }

    fn update_goal_time(&self, engine: &ForeignRef, start_delay_ms: u64) -> Result<(), ForeignFault> {
        self.enter(BoundaryOp::UpdateGoalTime)?;
        self.engine(engine)?
            .update_goal_time(Duration::from_millis(start_delay_ms));
        Ok(())
    }

    fn engine_stats(&self, engine: &ForeignRef) -> Result<CacheStatsSnapshot, ForeignFault> {
        self.enter(BoundaryOp::EngineStats)?;
        Ok(self.engine(engine)?.stats().snapshot())
    }

    fn release_ref(&self, reference: ForeignRef) {
        // Dropped after the shard lock is released; a proxy's finalizer may
        // call back into native code.
        let removed = self.refs.remove(&reference.as_raw());
        match removed {
            Some((raw, object)) => {
                debug!(runtime = self.id.as_raw(), reference = raw, kind = object.kind(), "Released global reference");
                drop(object);
            }
            None => warn!(
                runtime = self.id.as_raw(),
                reference = reference.as_raw(),
                "Release of unknown global reference"
            ),
        }
    }
}

impl Drop for LocalRuntime {
    fn drop(&mut self) {
        let Some(runtime) = self.runtime.lock().take() else {
            return;
        };
        // Blocking shutdown is not allowed from inside an async context.
        if Handle::try_current().is_ok() {
            runtime.shutdown_background();
        } else {
            runtime.shutdown_timeout(self.config.shutdown_grace);
        }
        debug!(runtime = self.id.as_raw(), "Engine runtime dropped");
    }
}

impl fmt::Debug for LocalRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalRuntime")
            .field("id", &self.id)
            .field("live_refs", &self.refs.len())
            .field("attached_threads", &self.attached.len())
            .field("stopped", &self.is_shut_down())
            .finish()
    }
}
