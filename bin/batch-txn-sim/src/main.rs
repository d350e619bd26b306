//! Batch transaction simulator
//!
//! Spawns a number of caller threads that hammer one in-memory ledger through
//! a shared batch processor, then checks the ledger against what the callers
//! were told and prints a JSON summary of how updates were coalesced.

mod args;
mod config;
mod ledger;
mod logging;

use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Context};
use args::Args;
use config::{Config, LoadConfig};
use ledger::{Adjust, AdjustOutcome, LedgerFactory, LedgerState};
use rand::Rng;
use serde::Serialize;
use strata_batch_txn::{BackoffRetryHelper, BatchError, BatchProcessor, BatchStats};
use tracing::*;

type SimProcessor = BatchProcessor<Adjust, LedgerFactory>;

/// What the callers observed.
#[derive(Debug, Default, Serialize)]
struct Tally {
    applied: u64,
    overdrawn: u64,
    failed: u64,
    net_delta: i64,
}

impl Tally {
    fn merge(&mut self, other: Tally) {
        self.applied += other.applied;
        self.overdrawn += other.overdrawn;
        self.failed += other.failed;
        self.net_delta += other.net_delta;
    }
}

#[derive(Debug, Serialize)]
struct Summary {
    elapsed_ms: u128,
    ledger_total: i64,
    conflicts: u64,
    avg_batch_size: f64,
    callers: Tally,
    processor: BatchStats,
}

fn main() -> anyhow::Result<()> {
    let args: Args = argh::from_env();
    if let Err(e) = main_inner(args) {
        eprintln!("FATAL ERROR: {e:#}");

        return Err(e);
    }

    Ok(())
}

fn main_inner(args: Args) -> anyhow::Result<()> {
    let config = Config::from_args(&args)?;

    // Init the logging before we do anything else.
    logging::init(&config.logging);
    info!(load = ?config.load, retry = ?config.retry, "starting simulation");

    let state = Arc::new(LedgerState::new());
    let factory = LedgerFactory::new(state.clone(), &config.load);
    let proc: Arc<SimProcessor> = Arc::new(BatchProcessor::new(
        factory,
        BackoffRetryHelper::new(config.retry.clone()),
    ));

    let started = Instant::now();
    let handles = (0..config.load.callers)
        .map(|id| {
            let proc = proc.clone();
            let load = config.load.clone();
            thread::Builder::new()
                .name(format!("caller-{id}"))
                .spawn(move || run_caller(&proc, &load))
                .context("failed to spawn caller thread")
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let mut tally = Tally::default();
    for handle in handles {
        let caller = handle
            .join()
            .map_err(|_| anyhow!("caller thread panicked"))??;
        tally.merge(caller);
    }
    let elapsed = started.elapsed();

    let ledger_total = state.total();
    if ledger_total != tally.net_delta {
        bail!(
            "ledger total {ledger_total} does not match acknowledged changes {}",
            tally.net_delta
        );
    }

    let summary = summarize(&proc, &state, tally, elapsed);
    info!(
        batches = %summary.processor.batches,
        avg_batch_size = %summary.avg_batch_size,
        "simulation finished"
    );
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}

/// Issues random balance changes, one blocking call at a time.
fn run_caller(proc: &SimProcessor, load: &LoadConfig) -> anyhow::Result<Tally> {
    let mut rng = rand::thread_rng();
    let mut tally = Tally::default();

    for _ in 0..load.updates_per_caller {
        let update = Adjust {
            account: rng.gen_range(0..load.accounts),
            delta: rng.gen_range(-load.max_delta..=load.max_delta),
        };

        match proc.process_update(update) {
            Ok(AdjustOutcome::Applied { .. }) => {
                tally.applied += 1;
                tally.net_delta += update.delta;
            }
            Ok(AdjustOutcome::Overdrawn { .. }) => tally.overdrawn += 1,
            Err(BatchError::Permanent(e)) => {
                debug!(err = %e, ?update, "update failed");
                tally.failed += 1;
            }
            Err(e) => return Err(e).context("batch processor unusable"),
        }
    }

    Ok(tally)
}

fn summarize(proc: &SimProcessor, state: &LedgerState, callers: Tally, elapsed: Duration) -> Summary {
    let processor = proc.stats();
    let avg_batch_size = if processor.batches == 0 {
        0.0
    } else {
        (processor.committed + processor.rejected + processor.failed) as f64
            / processor.batches as f64
    };

    Summary {
        elapsed_ms: elapsed.as_millis(),
        ledger_total: state.total(),
        conflicts: state.conflicts(),
        avg_batch_size,
        callers,
        processor,
    }
}
