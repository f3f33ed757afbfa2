//! Run one ingestion pass over every configured advisory source.
//!
//! Run with:
//! ```bash
//! ADVISORIES__GITHUB__TOKENS=ghp_xxx cargo run --example ingest
//! ```
//!
//! Without `REDIS_URL` everything is kept in memory and discarded on exit.

use std::time::{Duration, Instant};
use tokio::time::timeout;

use packagist_advisories::{Config, IngestionWorker, RunOutcome};

/// The FriendsOfPHP archive is small; a full GitHub walk is a few hundred pages.
const SYNC_TIMEOUT: Duration = Duration::from_secs(900);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    // Hold the guard until the end of main
    let _guard = packagist_advisories::logging::init_logging(&config);

    println!("=== Packagist Advisory Ingestion ===\n");
    println!(
        "Store: {}",
        config.redis_url.as_deref().unwrap_or("in-memory")
    );
    println!("GitHub tokens: {}", config.github_tokens.len());
    println!("Sources: {}", config.sources.join(", "));
    println!();

    let worker = IngestionWorker::from_config(&config)?;

    println!("Starting ingestion (timeout: {}s)...", SYNC_TIMEOUT.as_secs());
    let start = Instant::now();

    match timeout(SYNC_TIMEOUT, worker.run_all()).await {
        Ok(stats) => {
            println!(
                "\n✓ Ingestion finished in {:.1}s",
                start.elapsed().as_secs_f64()
            );
            println!("  Completed: {}", stats.completed);
            println!("  Rescheduled: {}", stats.rescheduled);
            println!("  Failed: {}", stats.failed);
            println!(
                "  Records created/updated/removed: {}/{}/{}",
                stats.created, stats.updated, stats.removed
            );

            for (source, outcome) in &stats.outcomes {
                match outcome {
                    RunOutcome::Completed(report) => println!(
                        "    - {}: fetched {}, +{} ~{} -{}",
                        source, report.fetched, report.created, report.updated, report.removed
                    ),
                    RunOutcome::Reschedule { after } => {
                        println!("    - {}: locked, retry in {}s", source, after.as_secs())
                    }
                    RunOutcome::Failed { message, .. } => {
                        println!("    - {}: failed - {}", source, message)
                    }
                }
            }
        }
        Err(_) => {
            eprintln!("\n✗ Ingestion timed out after {}s", SYNC_TIMEOUT.as_secs());
        }
    }

    Ok(())
}
