//! `eacache fetch` - submit fetches and wait for their results.

use std::time::{Duration, Instant};

use clap::Args;
use eacache::FetchFuture;
use tracing::debug;

use super::common::{start_cache, ModeArg, SleepFetcher, StrategyArg};
use crate::error::CliError;

/// Arguments for the fetch command.
#[derive(Debug, Args)]
pub struct FetchArgs {
    /// How fetches are submitted
    #[arg(long, value_enum, default_value_t = ModeArg::Fetch)]
    pub mode: ModeArg,

    /// Prefetch strategy of the engine
    #[arg(long, value_enum, default_value_t = StrategyArg::Aggressive)]
    pub strategy: StrategyArg,

    /// Number of fetches to submit
    #[arg(long, default_value_t = 4)]
    pub count: usize,

    /// Time each fetch takes
    #[arg(long, default_value_t = 200)]
    pub delay_ms: u64,

    /// Wait at most this long per attempt, retrying after each timeout
    #[arg(long)]
    pub timeout_ms: Option<u64>,
}

/// Run the fetch command.
pub fn run(args: FetchArgs) -> Result<(), CliError> {
    if args.count == 0 {
        return Err(CliError::InvalidArgs("--count must be at least 1".to_string()));
    }

    let (_runtime, cache) = start_cache(args.strategy)?;
    let delay = Duration::from_millis(args.delay_ms);
    println!(
        "Submitting {} fetch(es) as {:?} with {:?} strategy",
        args.count, args.mode, args.strategy
    );

    let mut futures = Vec::with_capacity(args.count);
    for i in 0..args.count {
        let fetcher = Some(SleepFetcher::new(format!("item-{}", i), delay));
        let submitted = match args.mode {
            ModeArg::Prefetch => cache.prefetch(fetcher)?,
            ModeArg::PrefetchNow => cache.prefetch_now(fetcher)?,
            ModeArg::Fetch => cache.fetch(fetcher)?,
        };
        if let Some(future) = submitted {
            futures.push(future);
        }
    }

    let started = Instant::now();
    for (i, future) in futures.iter().enumerate() {
        let (value, timeouts) = wait(future, args.timeout_ms.map(Duration::from_millis))?;
        println!(
            "  #{}: {} ({} ms, {} timeout(s))",
            i,
            value,
            started.elapsed().as_millis(),
            timeouts
        );
    }

    println!();
    println!("{}", cache.stats()?);
    Ok(())
}

/// Waits for one future, retrying timed waits until the result arrives.
fn wait(future: &FetchFuture<String>, timeout: Option<Duration>) -> Result<(String, u32), CliError> {
    let Some(timeout) = timeout else {
        return Ok((future.get()?.to_string(), 0));
    };

    let mut timeouts = 0;
    loop {
        match future.get_for(timeout) {
            Ok(value) => return Ok((value.to_string(), timeouts)),
            Err(e) if e.is_retryable() => {
                timeouts += 1;
                debug!(timeouts, "Fetch still pending; waiting again");
            }
            Err(e) => return Err(e.into()),
        }
    }
}
