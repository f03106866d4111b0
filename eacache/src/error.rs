//! Error types surfaced to callers of the cache handle and fetch futures.
//!
//! Every fault raised on the far side of the runtime boundary is classified
//! exactly once by [`FaultTranslator`](crate::fault::FaultTranslator) and
//! arrives here as one [`FetchError`] variant.

use std::fmt;

use thiserror::Error;

/// Errors returned by [`CacheEngineHandle`](crate::CacheEngineHandle) and
/// [`FetchFuture`](crate::FetchFuture) operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The cache engine could not be constructed or is no longer reachable.
    ///
    /// Fatal to the handle; retrying will not help.
    #[error("Cache engine unavailable: {0}")]
    EngineUnavailable(String),

    /// A bounded wait expired while the fetch was still pending.
    ///
    /// The fetch keeps running; a later `get` may still succeed.
    #[error("Timed out waiting for fetch result: {0}")]
    Timeout(String),

    /// The fetch was cancelled before it produced a result.
    #[error("Fetch was cancelled: {0}")]
    Cancelled(String),

    /// Any other fault raised on the engine side, including failures of the
    /// fetcher itself.
    #[error("Foreign fault {class}: {message}")]
    Foreign {
        /// Class name of the fault as reported by the engine.
        class: String,
        /// Diagnostic message.
        message: String,
    },

    /// The operation was attempted on a future or handle that was already
    /// released.
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),
}

impl FetchError {
    /// Creates an engine-unavailable error from any displayable cause.
    pub fn engine_unavailable(cause: impl fmt::Display) -> Self {
        Self::EngineUnavailable(cause.to_string())
    }

    /// Returns the simplified kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EngineUnavailable(_) => ErrorKind::EngineUnavailable,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Cancelled(_) => ErrorKind::Cancellation,
            Self::Foreign { .. } => ErrorKind::UnclassifiedForeignFault,
            Self::InvalidState(_) => ErrorKind::InvalidState,
        }
    }

    /// Returns true if retrying the same call may succeed.
    ///
    /// Only timeouts are retryable: the underlying fetch is still running.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Returns true if this is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Returns true if this is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

/// Error kind without diagnostic payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Construction or resolution failure.
    EngineUnavailable,
    /// Bounded wait expired.
    Timeout,
    /// Task was cancelled.
    Cancellation,
    /// Any other engine-side fault.
    UnclassifiedForeignFault,
    /// Use after release.
    InvalidState,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::EngineUnavailable => "engine-unavailable",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancellation => "cancellation",
            ErrorKind::UnclassifiedForeignFault => "foreign-fault",
            ErrorKind::InvalidState => "invalid-state",
        };
        f.write_str(name)
    }
}

/// Error returned by a [`Fetcher`](crate::Fetcher) when retrieval fails.
#[derive(Debug)]
pub struct FetcherError {
    /// Human-readable error message.
    message: String,
    /// Whether this error is transient (retryable).
    transient: bool,
    /// Optional source error.
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl FetcherError {
    /// Creates a new fetcher error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
            source: None,
        }
    }

    /// Creates a new transient (retryable) error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
            source: None,
        }
    }

    /// Attaches a source error.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Returns true if this error is transient (retryable).
    pub fn is_transient(&self) -> bool {
        self.transient
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for FetcherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for FetcherError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as &_)
    }
}
