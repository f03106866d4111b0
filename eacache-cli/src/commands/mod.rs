//! CLI command implementations.

pub mod cancel;
pub mod common;
pub mod fetch;
