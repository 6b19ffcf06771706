//! Logging setup.
//!
//! Production writes JSON to daily rolling files and compact lines to
//! stdout. Development writes pretty output with span events.
//!
//! Without `RUST_LOG`, only the attendo crates and the HTTP trace layer log
//! at the chosen level. Every other dependency is held at `warn`.

use std::path::PathBuf;
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Guards of the non-blocking writers, held for the life of the process.
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();
static STDOUT_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Crates whose events pass at the configured level.
const SERVICE_TARGETS: [&str; 3] = ["attendo_core", "attendo_server", "tower_http"];

/// Installs the global subscriber.
///
/// The filter comes from `RUST_LOG`, otherwise from
/// [`default_directives`] at `ATTENDO_LOG_LEVEL` (default `info`).
/// In production, files go to `ATTENDO_LOG_DIR` or `/var/log/attendo/` on
/// Linux and stdout is left uncoloured for the journal.
///
/// # Errors
///
/// Returns an error if the env filter cannot be parsed.
pub fn init(is_production: bool) -> anyhow::Result<()> {
    let log_level = std::env::var("ATTENDO_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directives(&log_level)))?;

    if is_production {
        init_production(env_filter)?;
    } else {
        init_development(env_filter);
    }

    Ok(())
}

/// Filter directives that apply `level` to the service crates only.
fn default_directives(level: &str) -> String {
    let level = level.trim().to_ascii_lowercase();
    let mut directives = vec!["warn".to_string()];
    directives.extend(SERVICE_TARGETS.iter().map(|target| format!("{target}={level}")));
    directives.join(",")
}

/// JSON rolling file plus compact stdout.
fn init_production(env_filter: EnvFilter) -> anyhow::Result<()> {
    let log_dir = std::env::var_os("ATTENDO_LOG_DIR").map_or_else(log_directory, PathBuf::from);

    if !log_dir.exists() {
        std::fs::create_dir_all(&log_dir)?;
    }

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "attendo");

    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

    let (non_blocking_stdout, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking_file)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(non_blocking_stdout)
        .with_target(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();

    let _ = FILE_GUARD.set(file_guard);
    let _ = STDOUT_GUARD.set(stdout_guard);

    Ok(())
}

/// Pretty stdout with span open and close events.
fn init_development(env_filter: EnvFilter) {
    let stdout_layer = tracing_subscriber::fmt::layer()
        .pretty()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .init();
}

/// Log directory for the current platform.
fn log_directory() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/var/log/attendo")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "attendo")
            .map(|dirs| dirs.data_dir().join("logs"))
            .unwrap_or_else(|| PathBuf::from("./logs"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_directory_is_named_after_service() {
        let dir = log_directory();
        assert!(dir.to_string_lossy().contains("attendo"));
    }

    #[test]
    fn test_default_directives_scope_level_to_service_crates() {
        let directives = default_directives(" DEBUG ");
        assert_eq!(
            directives,
            "warn,attendo_core=debug,attendo_server=debug,tower_http=debug"
        );
        assert!(EnvFilter::try_new(&directives).is_ok());
        assert!(EnvFilter::try_new(default_directives("info")).is_ok());
    }
}
