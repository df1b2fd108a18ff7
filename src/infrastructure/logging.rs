//! Tracing initialisation for the daemon.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use super::config::LoggingSection;

/// Initialise the global tracing subscriber from the logging config.
///
/// Returns the appender guard when a log directory is configured; hold it for
/// the process lifetime or buffered lines are lost on exit. `RUST_LOG`
/// overrides the configured level.
pub fn init_logging(config: &LoggingSection) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    match &config.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, "hivemind.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            if config.format == "json" {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(writer)
                    .json()
                    .init();
            } else {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(writer)
                    .with_ansi(false)
                    .init();
            }
            Some(guard)
        }
        None => {
            if config.format == "json" {
                tracing_subscriber::fmt().with_env_filter(filter).json().init();
            } else {
                tracing_subscriber::fmt().with_env_filter(filter).init();
            }
            None
        }
    }
}
