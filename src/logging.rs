//! Tracing setup for the CLI.
//!
//! Human-readable output goes to stderr, filtered by `RUST_LOG` (default
//! `warn`, or `debug` with `--verbose`). When a log directory is available a
//! JSON copy of every event at `info` and above is appended to a daily file
//! `conductor.log.<date>` there.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_FILE_PREFIX: &str = "conductor.log";

fn stderr_filter(verbose: bool) -> EnvFilter {
    let default = if verbose { "conductor=debug" } else { "warn" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the global subscriber. Keep the returned guard alive for the
/// lifetime of the process so buffered file output gets flushed.
pub fn init(log_dir: Option<&Path>, verbose: bool) -> Option<WorkerGuard> {
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .compact()
        .with_filter(stderr_filter(verbose));

    let (file_layer, guard) = match log_dir {
        Some(dir) if std::fs::create_dir_all(dir).is_ok() => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_filter(EnvFilter::new("conductor=info"));
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    // A second initialization (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init();
    guard
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_init_creates_log_directory_and_tolerates_reinit() {
        let dir = tempdir().unwrap();
        let logs = dir.path().join("logs");
        let guard = init(Some(&logs), false);
        assert!(logs.is_dir());
        assert!(guard.is_some());
        // Already installed; must not panic.
        let _ = init(None, true);
    }
}
