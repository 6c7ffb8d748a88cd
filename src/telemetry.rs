//! Tracing bootstrap for embedding processes.

use std::path::Path;

use tracing_subscriber::EnvFilter;

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialise tracing to stderr with the standard env-filter. Safe to call
/// once per process; embedding hosts that configure their own subscriber
/// skip this.
pub fn init() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(env_filter())
        .init();
}

/// Initialise tracing with an additional daily-rotated log file. Returns
/// the appender guard; dropping it stops the background log writer, so the
/// host keeps it for the process lifetime.
pub fn init_with_file(dir: &Path, prefix: &str) -> tracing_appender::non_blocking::WorkerGuard {
    let appender = tracing_appender::rolling::daily(dir, prefix);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_writer(writer)
        .with_ansi(false)
        .with_env_filter(env_filter())
        .init();
    guard
}
