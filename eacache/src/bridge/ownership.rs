//! Ownership of fetchers handed to the foreign runtime.
//!
//! The foreign runtime cannot hold a native `Arc`. Instead, each submission
//! binds the fetcher into an ownership cell and passes the cell's
//! [`CorrelationToken`] to the fetcher proxy. The cell is released exactly
//! once, by exactly one of two paths:
//!
//! - proxy construction failed: [`FetcherOwnershipBridge::transfer`] releases
//!   it synchronously, since the runtime will never finalize a proxy that was
//!   never built;
//! - proxy construction succeeded: the runtime calls
//!   [`NativeCallbacks::on_proxy_released`] when the proxy is finalized.
//!
//! Tokens come from a monotonic counter and are never reused.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tracing::{debug, error, warn};

use super::{CallEnv, ForeignRef, NativeCallbacks};
use crate::error::{FetchError, FetcherError};
use crate::fetcher::{ErasedFetcher, FetchValue};
use crate::labels::FetchLabels;

/// Opaque key linking a foreign fetcher proxy to its ownership cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationToken(u64);

impl CorrelationToken {
    /// Wraps a raw token value.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw token value.
    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// One bound fetcher.
struct OwnershipCell {
    fetcher: Arc<dyn ErasedFetcher>,
    bound_at: Instant,
}

/// Holds the native side of every fetcher currently owned by a proxy.
pub struct FetcherOwnershipBridge {
    cells: DashMap<CorrelationToken, OwnershipCell>,
    next_token: AtomicU64,
    releases: AtomicU64,
}

impl FetcherOwnershipBridge {
    /// Creates an empty bridge.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            cells: DashMap::new(),
            next_token: AtomicU64::new(1),
            releases: AtomicU64::new(0),
        })
    }

    /// Binds a fetcher into a fresh ownership cell.
    pub fn bind(&self, fetcher: Arc<dyn ErasedFetcher>) -> CorrelationToken {
        let token = CorrelationToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.cells.insert(
            token,
            OwnershipCell {
                fetcher,
                bound_at: Instant::now(),
            },
        );
        token
    }

    /// Releases the cell for `token`.
    ///
    /// Returns false if the token was not bound; that indicates a second
    /// release and is logged.
    pub fn release(&self, token: CorrelationToken) -> bool {
        match self.cells.remove(&token) {
            Some((_, cell)) => {
                self.releases.fetch_add(1, Ordering::Relaxed);
                debug!(
                    token = %token,
                    held_ms = u64::try_from(cell.bound_at.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "Released fetcher ownership cell"
                );
                true
            }
            None => {
                warn!(token = %token, "Release requested for unbound correlation token");
                false
            }
        }
    }

    /// Binds `fetcher` and constructs the foreign proxy that owns it.
    ///
    /// On failure the cell is released here and the error is returned.
    pub fn transfer(
        self: &Arc<Self>,
        env: &CallEnv<'_>,
        fetcher: Arc<dyn ErasedFetcher>,
    ) -> Result<ForeignRef, FetchError> {
        let token = self.bind(fetcher);
        let callbacks: Arc<dyn NativeCallbacks> = Arc::clone(self) as _;

        match env.call(|rt| rt.new_fetcher_proxy(token, true, callbacks)) {
            Ok(proxy) => {
                debug!(token = %token, proxy = proxy.as_raw(), "Fetcher proxy constructed");
                Ok(proxy)
            }
            Err(e) => {
                // No proxy exists, so no finalizer will ever release this cell.
                let released = self.release(token);
                error!(
                    token = %token,
                    released,
                    error = %e,
                    "Fetcher proxy construction failed; reclaimed ownership cell"
                );
                Err(e)
            }
        }
    }

    /// Returns true if `token` is currently bound.
    pub fn is_bound(&self, token: CorrelationToken) -> bool {
        self.cells.contains_key(&token)
    }

    /// Returns the number of live ownership cells.
    pub fn live_cells(&self) -> usize {
        self.cells.len()
    }

    /// Returns the number of cells released so far.
    pub fn released_cells(&self) -> u64 {
        self.releases.load(Ordering::Relaxed)
    }

    fn lookup(&self, token: CorrelationToken) -> Option<Arc<dyn ErasedFetcher>> {
        self.cells.get(&token).map(|cell| Arc::clone(&cell.fetcher))
    }
}

impl NativeCallbacks for FetcherOwnershipBridge {
    fn call(&self, token: CorrelationToken, labels: FetchLabels) -> Result<FetchValue, FetcherError> {
        // Clone out of the map so the shard lock is not held during the fetch.
        let fetcher = self
            .lookup(token)
            .ok_or_else(|| FetcherError::new(format!("no fetcher bound to token {}", token)))?;
        fetcher.call_erased(labels)
    }

    fn bytes_to_transfer(&self, token: CorrelationToken) -> u64 {
        self.lookup(token).map(|f| f.bytes_to_transfer()).unwrap_or(0)
    }

    fn estimate_fetch_time(
        &self,
        token: CorrelationToken,
        bandwidth_down: u32,
        bandwidth_up: u32,
        rtt_ms: u32,
    ) -> f64 {
        self.lookup(token)
            .map(|f| f.estimate_fetch_time(bandwidth_down, bandwidth_up, rtt_ms))
            .unwrap_or(f64::INFINITY)
    }

    fn on_cancelled(&self, token: CorrelationToken) {
        if let Some(fetcher) = self.lookup(token) {
            fetcher.on_cancelled();
        }
    }

    fn on_proxy_released(&self, token: CorrelationToken) {
        self.release(token);
    }
}

impl fmt::Debug for FetcherOwnershipBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetcherOwnershipBridge")
            .field("live_cells", &self.cells.len())
            .field("released_cells", &self.releases.load(Ordering::Relaxed))
            .finish()
    }
}
