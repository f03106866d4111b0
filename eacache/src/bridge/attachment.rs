//! Per-thread attachment bookkeeping.
//!
//! A native thread must be attached to a foreign runtime before calling into
//! it. Attaching around every call is correct but slow, so each thread
//! attaches once per runtime and records a detach obligation that fires when
//! the thread exits.
//!
//! The records live in a thread-local; no other thread ever touches them.

use std::cell::RefCell;
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use tracing::{debug, warn};

use super::{ForeignRuntime, RuntimeId};
use crate::fault::ForeignFault;

/// Detach obligation for one (thread, runtime) pair.
struct AttachmentRecord {
    runtime_id: RuntimeId,
    thread: ThreadId,
    runtime: Weak<dyn ForeignRuntime>,
}

/// All attachments held by the current thread.
#[derive(Default)]
struct ThreadAttachments {
    records: Vec<AttachmentRecord>,
}

impl ThreadAttachments {
    fn contains(&self, runtime_id: RuntimeId) -> bool {
        self.records.iter().any(|r| r.runtime_id == runtime_id)
    }
}

impl Drop for ThreadAttachments {
    fn drop(&mut self) {
        for record in self.records.drain(..) {
            // A runtime that is already gone has nothing left to detach from.
            if let Some(runtime) = record.runtime.upgrade() {
                runtime.detach_thread(record.thread);
                debug!(
                    runtime = record.runtime_id.as_raw(),
                    thread = ?record.thread,
                    "Detached exiting thread from foreign runtime"
                );
            }
        }
    }
}

thread_local! {
    static ATTACHMENTS: RefCell<ThreadAttachments> = RefCell::new(ThreadAttachments::default());
}

/// Thread-scoped registry of foreign runtime attachments.
pub struct ThreadAttachmentRegistry;

impl ThreadAttachmentRegistry {
    /// Attaches the current thread to `runtime` unless it already is.
    ///
    /// The first successful attachment registers a detach that runs when
    /// the thread exits.
    pub fn ensure_attached(runtime: &Arc<dyn ForeignRuntime>) -> Result<(), ForeignFault> {
        let runtime_id = runtime.id();
        if Self::is_attached(runtime_id) {
            return Ok(());
        }

        let thread = thread::current().id();
        runtime.attach_thread(thread)?;

        let record = AttachmentRecord {
            runtime_id,
            thread,
            runtime: Arc::downgrade(runtime),
        };
        let registered = ATTACHMENTS.try_with(|attachments| {
            attachments.borrow_mut().records.push(record);
        });
        match registered {
            Ok(()) => debug!(
                runtime = runtime_id.as_raw(),
                thread = ?thread,
                "Attached thread to foreign runtime"
            ),
            Err(_) => warn!(
                runtime = runtime_id.as_raw(),
                thread = ?thread,
                "Thread is exiting; attachment will not be detached automatically"
            ),
        }
        Ok(())
    }

    /// Returns true if the current thread holds an attachment to the runtime.
    pub fn is_attached(runtime_id: RuntimeId) -> bool {
        ATTACHMENTS
            .try_with(|attachments| attachments.borrow().contains(runtime_id))
            .unwrap_or(false)
    }

    /// Returns how many runtimes the current thread is attached to.
    pub fn attachment_count() -> usize {
        ATTACHMENTS
            .try_with(|attachments| attachments.borrow().records.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{CorrelationToken, EngineParams, ForeignConstant, ForeignRef, NativeCallbacks};
    use crate::fetcher::FetchValue;
    use crate::labels::SubmitMode;
    use crate::stats::CacheStatsSnapshot;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Runtime that only records attach/detach calls.
    #[derive(Default)]
    struct CountingRuntime {
        id: u64,
        attaches: Mutex<HashMap<ThreadId, u32>>,
        detaches: Mutex<HashMap<ThreadId, u32>>,
        refuse: bool,
        calls: AtomicU64,
    }

    impl CountingRuntime {
        fn new(id: u64) -> Arc<Self> {
            Arc::new(Self {
                id,
                ..Default::default()
            })
        }

        fn attaches_for(&self, thread: ThreadId) -> u32 {
            self.attaches.lock().get(&thread).copied().unwrap_or(0)
        }

        fn detaches_for(&self, thread: ThreadId) -> u32 {
            self.detaches.lock().get(&thread).copied().unwrap_or(0)
        }

        fn unused<T>(&self) -> Result<T, ForeignFault> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ForeignFault::illegal_state("not used in this test"))
        }
    }

    impl ForeignRuntime for CountingRuntime {
        fn id(&self) -> RuntimeId {
            RuntimeId::new(self.id)
        }

        fn attach_thread(&self, thread: ThreadId) -> Result<(), ForeignFault> {
            if self.refuse {
                return Err(ForeignFault::illegal_state("runtime stopped"));
            }
            *self.attaches.lock().entry(thread).or_default() += 1;
            Ok(())
        }

        fn detach_thread(&self, thread: ThreadId) {
            *self.detaches.lock().entry(thread).or_default() += 1;
        }

        fn lookup_constant(&self, _: &str, _: &str) -> Result<ForeignConstant, ForeignFault> {
            self.unused()
        }

        fn create_engine(&self, _: &EngineParams) -> Result<ForeignRef, ForeignFault> {
            self.unused()
        }

        fn new_fetcher_proxy(
            &self,
            _: CorrelationToken,
            _: bool,
            _: Arc<dyn NativeCallbacks>,
        ) -> Result<ForeignRef, ForeignFault> {
            self.unused()
        }

        fn submit(&self, _: &ForeignRef, _: &ForeignRef, _: SubmitMode) -> Result<ForeignRef, ForeignFault> {
            self.unused()
        }

        fn task_get(&self, _: &ForeignRef) -> Result<FetchValue, ForeignFault> {
            self.unused()
        }

        fn task_get_timeout(&self, _: &ForeignRef, _: u64, _: ForeignConstant) -> Result<FetchValue, ForeignFault> {
            self.unused()
        }

        fn task_cancel(&self, _: &ForeignRef, _: bool) -> Result<bool, ForeignFault> {
            self.unused()
        }

        fn task_is_done(&self, _: &ForeignRef) -> Result<bool, ForeignFault> {
            self.unused()
        }

        fn task_is_cancelled(&self, _: &ForeignRef) -> Result<bool, ForeignFault> {
            self.unused()
        }

        fn update_goal_time(&self, _: &ForeignRef, _: u64) -> Result<(), ForeignFault> {
            self.unused()
        }

        fn engine_stats(&self, _: &ForeignRef) -> Result<CacheStatsSnapshot, ForeignFault> {
            self.unused()
        }

        fn release_ref(&self, _: ForeignRef) {}
    }

    #[test]
    fn test_attach_is_idempotent_per_thread() {
        let counting = CountingRuntime::new(9_001);
        let runtime: Arc<dyn ForeignRuntime> = counting.clone();

        let thread = thread::spawn(move || {
            ThreadAttachmentRegistry::ensure_attached(&runtime).unwrap();
            ThreadAttachmentRegistry::ensure_attached(&runtime).unwrap();
            ThreadAttachmentRegistry::ensure_attached(&runtime).unwrap();
            assert!(ThreadAttachmentRegistry::is_attached(runtime.id()));
            assert_eq!(ThreadAttachmentRegistry::attachment_count(), 1);
            thread::current().id()
        });
        let id = thread.join().unwrap();

        assert_eq!(counting.attaches_for(id), 1);
        assert_eq!(counting.detaches_for(id), 1);
    }

    #[test]
    fn test_detach_happens_at_thread_exit_not_before() {
        let counting = CountingRuntime::new(9_002);
        let runtime: Arc<dyn ForeignRuntime> = counting.clone();
        let observer = counting.clone();

        let thread = thread::spawn(move || {
            ThreadAttachmentRegistry::ensure_attached(&runtime).unwrap();
            let id = thread::current().id();
            assert_eq!(observer.detaches_for(id), 0);
            id
        });
        let id = thread.join().unwrap();
        assert_eq!(counting.detaches_for(id), 1);
    }

    #[test]
    fn test_one_record_per_runtime() {
        let first: Arc<dyn ForeignRuntime> = CountingRuntime::new(9_003);
        let second: Arc<dyn ForeignRuntime> = CountingRuntime::new(9_004);

        thread::spawn(move || {
            ThreadAttachmentRegistry::ensure_attached(&first).unwrap();
            ThreadAttachmentRegistry::ensure_attached(&second).unwrap();
            ThreadAttachmentRegistry::ensure_attached(&first).unwrap();
            assert_eq!(ThreadAttachmentRegistry::attachment_count(), 2);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_refused_attach_registers_nothing() {
        let runtime: Arc<dyn ForeignRuntime> = Arc::new(CountingRuntime {
            id: 9_005,
            refuse: true,
            ..Default::default()
        });

        thread::spawn(move || {
            assert!(ThreadAttachmentRegistry::ensure_attached(&runtime).is_err());
            assert!(!ThreadAttachmentRegistry::is_attached(runtime.id()));
            assert_eq!(ThreadAttachmentRegistry::attachment_count(), 0);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_dropped_runtime_is_not_detached() {
        let counting = CountingRuntime::new(9_006);
        let weak = Arc::downgrade(&counting);
        let runtime: Arc<dyn ForeignRuntime> = counting;

        thread::spawn(move || {
            ThreadAttachmentRegistry::ensure_attached(&runtime).unwrap();
            drop(runtime);
        })
        .join()
        .unwrap();

        assert!(weak.upgrade().is_none());
    }
}
