//! `eacache cancel` - cancel a fetch that would otherwise never finish.

use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use eacache::ErrorKind;

use super::common::{start_cache, BlockingFetcher, StrategyArg};
use crate::error::CliError;

/// Arguments for the cancel command.
#[derive(Debug, Args)]
pub struct CancelArgs {
    /// Time to wait for the fetch before cancelling it
    #[arg(long, default_value_t = 100)]
    pub delay_ms: u64,
}

/// Run the cancel command.
pub fn run(args: CancelArgs) -> Result<(), CliError> {
    let (_runtime, cache) = start_cache(StrategyArg::Aggressive)?;
    let future = cache
        .fetch(Some(Arc::new(BlockingFetcher::default())))?
        .ok_or_else(|| CliError::Unexpected("no future returned for a fetcher".to_string()))?;

    report("submitted", future.is_done()?, future.is_cancelled()?);

    match future.get_for(Duration::from_millis(args.delay_ms)) {
        Err(e) if e.kind() == ErrorKind::Timeout => println!("  wait:      timed out after {} ms", args.delay_ms),
        Err(e) => return Err(e.into()),
        Ok(_) => return Err(CliError::Unexpected("blocking fetch completed".to_string())),
    }
    report("timed out", future.is_done()?, future.is_cancelled()?);

    let accepted = future.cancel(true)?;
    println!("  cancel:    {}", if accepted { "accepted" } else { "rejected" });
    report("cancelled", future.is_done()?, future.is_cancelled()?);

    match future.get() {
        Err(e) if e.kind() == ErrorKind::Cancellation => {
            println!("  get:       {}", e.kind());
            Ok(())
        }
        Err(e) => Err(CliError::Unexpected(format!("expected cancellation, got {}", e))),
        Ok(_) => Err(CliError::Unexpected("cancelled fetch produced a value".to_string())),
    }
}

fn report(stage: &str, done: bool, cancelled: bool) {
    println!("  {:<10} done={} cancelled={}", format!("{}:", stage), done, cancelled);
}
