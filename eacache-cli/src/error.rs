//! CLI error type.

use std::fmt;

use eacache::FetchError;

/// Errors reported by CLI commands.
#[derive(Debug)]
pub enum CliError {
    /// The engine runtime or cache handle could not be started.
    Startup(FetchError),
    /// A fetch failed.
    Fetch(FetchError),
    /// Arguments were accepted by the parser but are unusable.
    InvalidArgs(String),
    /// A state transition did not go as expected.
    Unexpected(String),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Startup(e) => write!(f, "Failed to start cache engine: {}", e),
            CliError::Fetch(e) => write!(f, "Fetch failed: {}", e),
            CliError::InvalidArgs(msg) => write!(f, "Invalid arguments: {}", msg),
            CliError::Unexpected(msg) => write!(f, "Unexpected state: {}", msg),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::Startup(e) | CliError::Fetch(e) => Some(e),
            _ => None,
        }
    }
}

impl From<FetchError> for CliError {
    fn from(e: FetchError) -> Self {
        CliError::Fetch(e)
    }
}
