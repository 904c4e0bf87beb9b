use std::sync::OnceLock;

use tracing_appender::non_blocking;
use tracing_subscriber::EnvFilter;

static TRACING_GUARD: OnceLock<non_blocking::WorkerGuard> = OnceLock::new();

/// Initialize structured logging.
///
/// Logs go to a daily-rolling JSON file under `COWRITE_LOG_DIR` (default
/// `logs/`); set `COWRITE_LOG_TO_STDOUT` to log to stdout instead, which is
/// what local debugging and capture-by-redirection want. `RUST_LOG`
/// controls the level.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let log_to_stdout = std::env::var("COWRITE_LOG_TO_STDOUT")
        .map(|v| !v.trim().is_empty() && v.trim() != "0")
        .unwrap_or(false);

    if log_to_stdout {
        if tracing_subscriber::fmt()
            .with_env_filter(env_filter.clone())
            .with_ansi(false)
            .json()
            .with_writer(std::io::stdout)
            .try_init()
            .is_ok()
        {
            return;
        }
    }

    let log_dir = std::env::var("COWRITE_LOG_DIR").unwrap_or_else(|_| "logs".to_string());
    if let Err(err) = std::fs::create_dir_all(&log_dir) {
        eprintln!("failed to create log dir '{log_dir}': {err}");
        std::process::exit(1);
    }
    let file_appender = tracing_appender::rolling::daily(&log_dir, "cowrite.log");
    let (writer, guard) = non_blocking(file_appender);

    if tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(false)
        .json()
        .with_writer(writer)
        .try_init()
        .is_ok()
    {
        let _ = TRACING_GUARD.set(guard);
    }
}
