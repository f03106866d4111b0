//! EACache - energy-aware fetch scheduling behind a runtime boundary
//!
//! Callers hand [`Fetcher`]s to a [`CacheEngineHandle`] and get back
//! [`FetchFuture`]s. The engine that decides when each fetch runs lives in a
//! separately scheduled runtime reached only through the
//! [`bridge::ForeignRuntime`] trait; [`engine::LocalRuntime`] is the
//! in-process implementation.
//!
//! ```text
//! Fetcher ──► CacheEngineHandle ──► FetcherOwnershipBridge ──► engine
//!                    │                                          │
//!                    └──────────── FetchFuture ◄── task ────────┘
//! ```

pub mod bridge;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod fault;
pub mod fetcher;
pub mod future;
pub mod labels;
pub mod stats;

pub use cache::CacheEngineHandle;
pub use config::{CacheConfig, LocalRuntimeConfig};
pub use engine::{BoundaryOp, LocalRuntime};
pub use error::{ErrorKind, FetchError, FetcherError};
pub use fault::{FaultKind, FaultTranslator, ForeignFault};
pub use fetcher::{FetchValue, Fetcher};
pub use future::FetchFuture;
pub use labels::{FetchLabels, StrategyType, SubmitMode, TimeUnit};
pub use stats::{CacheStats, CacheStatsSnapshot};
