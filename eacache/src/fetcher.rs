//! The fetcher capability supplied by callers.
//!
//! A [`Fetcher`] performs the actual data retrieval. The cache engine decides
//! when to invoke it and with which [`FetchLabels`]; results cross the engine
//! boundary type-erased as a [`FetchValue`] and are recovered by the typed
//! [`FetchFuture`](crate::FetchFuture).
//!
//! # Example
//!
//! ```ignore
//! use eacache::{Fetcher, FetcherError, FetchLabels};
//!
//! struct PageFetcher {
//!     url: String,
//! }
//!
//! impl Fetcher for PageFetcher {
//!     type Output = Vec<u8>;
//!
//!     fn call(&self, labels: FetchLabels) -> Result<Vec<u8>, FetcherError> {
//!         download(&self.url, labels.is_demand())
//!     }
//!
//!     fn bytes_to_transfer(&self) -> u64 { 64 * 1024 }
//! }
//! ```

use std::any::Any;
use std::sync::Arc;

use crate::error::FetcherError;
use crate::labels::FetchLabels;

/// Type-erased fetch result as carried across the engine boundary.
pub type FetchValue = Arc<dyn Any + Send + Sync>;

/// Caller-supplied data retrieval logic.
///
/// The fetcher is shared: the caller may keep its own `Arc` while the engine
/// holds another for as long as the submission is alive.
pub trait Fetcher: Send + Sync + 'static {
    /// The value produced by a successful fetch.
    type Output: Send + Sync + 'static;

    /// Performs the fetch.
    ///
    /// Called on an engine worker thread. Long-running implementations should
    /// return promptly after [`on_cancelled`](Self::on_cancelled) fires.
    fn call(&self, labels: FetchLabels) -> Result<Self::Output, FetcherError>;

    /// Number of bytes this fetch is expected to transfer.
    fn bytes_to_transfer(&self) -> u64 {
        0
    }

    /// Estimated fetch time in seconds for the given worst-case network.
    ///
    /// The default assumes the downstream transfer dominates.
    fn estimate_fetch_time(&self, bandwidth_down: u32, _bandwidth_up: u32, _rtt_ms: u32) -> f64 {
        if bandwidth_down == 0 {
            return f64::INFINITY;
        }
        self.bytes_to_transfer() as f64 / bandwidth_down as f64
    }

    /// Notification that a running fetch was cancelled with interruption.
    ///
    /// Override this when the fetch blocks on something the engine cannot
    /// interrupt by itself.
    fn on_cancelled(&self) {}
}

/// Object-safe view of a [`Fetcher`] with its output erased.
pub trait ErasedFetcher: Send + Sync + 'static {
    /// Performs the fetch, boxing the result.
    fn call_erased(&self, labels: FetchLabels) -> Result<FetchValue, FetcherError>;

    /// See [`Fetcher::bytes_to_transfer`].
    fn bytes_to_transfer(&self) -> u64;

    /// See [`Fetcher::estimate_fetch_time`].
    fn estimate_fetch_time(&self, bandwidth_down: u32, bandwidth_up: u32, rtt_ms: u32) -> f64;

    /// See [`Fetcher::on_cancelled`].
    fn on_cancelled(&self);
}

impl<F: Fetcher> ErasedFetcher for F {
    fn call_erased(&self, labels: FetchLabels) -> Result<FetchValue, FetcherError> {
        let output = self.call(labels)?;
        Ok(Arc::new(output))
    }

    fn bytes_to_transfer(&self) -> u64 {
        Fetcher::bytes_to_transfer(self)
    }

    fn estimate_fetch_time(&self, bandwidth_down: u32, bandwidth_up: u32, rtt_ms: u32) -> f64 {
        Fetcher::estimate_fetch_time(self, bandwidth_down, bandwidth_up, rtt_ms)
    }

    fn on_cancelled(&self) {
        Fetcher::on_cancelled(self)
    }
}
