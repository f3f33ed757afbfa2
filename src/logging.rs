//! Tracing subscriber setup for the ingestion binaries.

use crate::config::Config;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

pub const LOG_FILE_NAME: &str = "packagist-advisories.log";

/// Install the global subscriber.
///
/// `RUST_LOG` overrides the default `info` filter. With `log_to_file` set,
/// output goes to a daily rolling file in `log_dir` and the returned guard
/// must be kept alive until shutdown, or buffered lines are lost.
///
/// Calling this twice leaves the first subscriber in place.
pub fn init_logging(config: &Config) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if config.log_to_file {
        let file_appender = rolling::daily(&config.log_dir, LOG_FILE_NAME);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let installed = tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
            .try_init()
            .is_ok();

        installed.then_some(guard)
    } else {
        let _ = fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .try_init();

        None
    }
}
