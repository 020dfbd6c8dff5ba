//! Subscriber setup for the command-line driver.

use std::path::Path;

use time::UtcOffset;
use time::format_description::well_known::Rfc3339;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::OffsetTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const LOG_FILE_PREFIX: &str = "arena-session.log";

fn timer() -> OffsetTime<Rfc3339> {
    // The local offset cannot always be determined once threads are running.
    OffsetTime::local_rfc_3339().unwrap_or_else(|_| OffsetTime::new(UtcOffset::UTC, Rfc3339))
}

/// Install the global subscriber. `RUST_LOG` overrides `level`.
///
/// With `log_dir` set, output is also written to a daily-rolling file there.
/// Keep the returned guard alive until exit or buffered lines are lost.
pub fn init(level: &str, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let timer = timer();

    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_timer(timer.clone())
        .with_writer(std::io::stderr);

    let (file, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_timer(timer)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file)
        .try_init();

    guard
}
