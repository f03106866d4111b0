//! Foreign faults and their translation into local errors.
//!
//! A boundary call either returns a value or raises a [`ForeignFault`]. The
//! fault is classified by its class name, once, immediately after the call:
//!
//! ```text
//! concurrent.TimeoutException       ──► FetchError::Timeout
//! concurrent.CancellationException  ──► FetchError::Cancelled
//! anything else                     ──► FetchError::Foreign { class, message }
//! ```

use thiserror::Error;
use tracing::debug;

use crate::error::FetchError;

/// Well-known fault class names raised by the engine side.
pub mod class {
    /// A bounded wait expired.
    pub const TIMEOUT: &str = "concurrent.TimeoutException";
    /// The task was cancelled.
    pub const CANCELLATION: &str = "concurrent.CancellationException";
    /// The fetcher failed; the message carries its error.
    pub const EXECUTION: &str = "concurrent.ExecutionException";
    /// The call was made in a state the engine does not accept.
    pub const ILLEGAL_STATE: &str = "lang.IllegalStateException";
    /// A reference or constant could not be resolved.
    pub const NOT_FOUND: &str = "lang.NoSuchFieldError";
    /// A value had an unexpected type.
    pub const CLASS_CAST: &str = "lang.ClassCastException";
    /// The engine could not allocate an object.
    pub const OUT_OF_MEMORY: &str = "lang.OutOfMemoryError";
}

/// A fault raised by a call into the foreign runtime.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{class}: {message}")]
pub struct ForeignFault {
    class: String,
    message: String,
}

impl ForeignFault {
    /// Creates a fault with the given class name and message.
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a timeout fault.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(class::TIMEOUT, message)
    }

    /// Shorthand for a cancellation fault.
    pub fn cancellation(message: impl Into<String>) -> Self {
        Self::new(class::CANCELLATION, message)
    }

    /// Shorthand for an illegal-state fault.
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::new(class::ILLEGAL_STATE, message)
    }

    /// Returns the fault's class name.
    pub fn class(&self) -> &str {
        &self.class
    }

    /// Returns the fault's message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Classification of a foreign fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultKind {
    /// Bounded wait expired.
    Timeout,
    /// Task was cancelled.
    Cancellation,
    /// Anything else.
    Unclassified,
}

/// Converts foreign faults into [`FetchError`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct FaultTranslator;

impl FaultTranslator {
    /// Classifies a fault by its class name.
    pub fn classify(fault: &ForeignFault) -> FaultKind {
        match fault.class() {
            class::TIMEOUT => FaultKind::Timeout,
            class::CANCELLATION => FaultKind::Cancellation,
            _ => FaultKind::Unclassified,
        }
    }

    /// Translates a fault into the matching local error.
    pub fn translate(fault: ForeignFault) -> FetchError {
        let kind = Self::classify(&fault);
        debug!(
            class = fault.class(),
            message = fault.message(),
            kind = ?kind,
            "Translating foreign fault"
        );
        let ForeignFault { class, message } = fault;
        match kind {
            FaultKind::Timeout => FetchError::Timeout(message),
            FaultKind::Cancellation => FetchError::Cancelled(message),
            FaultKind::Unclassified => FetchError::Foreign { class, message },
        }
    }
}

impl From<ForeignFault> for FetchError {
    fn from(fault: ForeignFault) -> Self {
        FaultTranslator::translate(fault)
    }
}
