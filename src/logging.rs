//! Logging setup for the dispatch service.
//!
//! Structured `tracing` output on two layers: a non-blocking file appender
//! for the service log and stdout for operators tailing the process.
//! Filtering comes from `RUST_LOG`, defaulting to `info`.

use std::fs;
use std::io;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Default directory for service logs.
pub const DEFAULT_LOG_DIR: &str = "logs";

/// Default service log file name.
pub const DEFAULT_LOG_FILE: &str = "fleetmatch.log";

/// Keeps the non-blocking file writer alive.
///
/// Dropping the guard flushes and closes the log file.
pub struct LoggingGuard {
    _file_guard: WorkerGuard,
}

/// Initializes the global tracing subscriber.
///
/// Creates the log directory if needed and truncates the previous log file
/// so each service run starts clean.
///
/// # Errors
///
/// Returns an error when the log directory or file cannot be prepared.
pub fn init_logging(log_dir: &str, log_file: &str) -> Result<LoggingGuard, io::Error> {
    fs::create_dir_all(log_dir)?;
    fs::write(Path::new(log_dir).join(log_file), "")?;

    let file_appender = tracing_appender::rolling::never(log_dir, log_file);
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .with_target(true);

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_ansi(true)
        .compact();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn scratch_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        PathBuf::from(format!("test_logs_{tag}_{nanos}"))
    }

    #[test]
    fn test_default_paths() {
        assert_eq!(DEFAULT_LOG_DIR, "logs");
        assert_eq!(DEFAULT_LOG_FILE, "fleetmatch.log");
    }

    // init_logging itself can only run once per process (global subscriber),
    // so the file preparation is exercised directly.
    #[test]
    fn test_log_file_preparation() {
        let dir = scratch_dir("prep");
        let dir_str = dir.to_str().unwrap();

        fs::create_dir_all(dir_str).unwrap();
        let log_path = dir.join(DEFAULT_LOG_FILE);
        fs::write(&log_path, "stale content").unwrap();
        fs::write(&log_path, "").unwrap();

        assert_eq!(fs::read_to_string(&log_path).unwrap(), "");
        fs::remove_dir_all(&dir).unwrap();
    }
}
