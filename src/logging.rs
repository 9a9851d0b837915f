use anyhow::{Context, Result};
use camino::Utf8Path;
use std::fs;
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is not set.
fn default_filter(debug_mode: bool) -> EnvFilter {
    let level = if debug_mode { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Setup logging with a daily rotating file appender and a console layer on stderr.
///
/// Logs are written to `log_dir` as `<log_prefix>.<date>`. Console output keeps the
/// workflow progress visible while the command runs; it can be turned off for
/// scripted use.
///
/// # Arguments
/// * `log_dir` - Directory for log files (e.g., "logs")
/// * `log_prefix` - Prefix for log files (e.g., "instancectl")
/// * `debug_mode` - If true, use debug level; otherwise use info level
/// * `console_output` - If true, also log to stderr
///
/// # Returns
/// A guard that must be held for the duration of the program to keep logging active
pub fn setup_logging(
    log_dir: &Utf8Path,
    log_prefix: &str,
    debug_mode: bool,
    console_output: bool,
) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    ensure_log_dir(log_dir)?;

    let file_appender = rolling::daily(log_dir, log_prefix);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false) // No ANSI codes in log files
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let console_layer = console_output.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .with_target(false)
            .without_time()
    });

    tracing_subscriber::registry()
        .with(default_filter(debug_mode))
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    tracing::debug!(
        "Logging initialized: dir={}, prefix={}, debug={}, console={}",
        log_dir,
        log_prefix,
        debug_mode,
        console_output
    );

    Ok(guard)
}

fn ensure_log_dir(log_dir: &Utf8Path) -> Result<()> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)
            .with_context(|| format!("Failed to create log directory: {}", log_dir))?;
    }
    Ok(())
}
