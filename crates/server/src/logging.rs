use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,tower_http=warn,hyper=warn";
const LOG_FILE_NAME: &str = "relay.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    /// `MCP_RELAY_LOG_FORMAT` wins; otherwise files get JSON and terminals get pretty.
    fn resolve(value: Option<&str>, to_file: bool) -> Self {
        match value {
            Some(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            Some(v) if v.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            _ if to_file => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

/// Keeps the non-blocking writer flushing until dropped.
pub struct LoggingHandle {
    pub log_path: Option<PathBuf>,
    pub guard: WorkerGuard,
}

pub fn init_logging(log_dir: Option<&Path>) -> anyhow::Result<LoggingHandle> {
    let filter_source = std::env::var("MCP_RELAY_LOG_FILTER")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| DEFAULT_FILTER.to_string());
    let filter = EnvFilter::try_new(&filter_source).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let log_path = log_dir.map(prepare_log_path).transpose()?;
    let (writer, guard) = match log_dir {
        Some(dir) => tracing_appender::non_blocking(tracing_appender::rolling::never(dir, LOG_FILE_NAME)),
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let format_var = std::env::var("MCP_RELAY_LOG_FORMAT").ok();
    let format = LogFormat::resolve(format_var.as_deref(), log_path.is_some());

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(log_path.is_none())
                    .pretty()
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(true),
            )
            .try_init()?,
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .json()
                    .flatten_event(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(true)
                    .with_current_span(true),
            )
            .try_init()?,
    }

    tracing::info!(
        component = "logging",
        event = "logging.initialized",
        log_path = ?log_path,
        format = ?format,
        filter = %filter_source,
    );

    Ok(LoggingHandle { log_path, guard })
}

/// Create `dir` if needed and return the log file path inside it.
fn prepare_log_path(dir: &Path) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    Ok(dir.join(LOG_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_defaults_depend_on_destination() {
        assert_eq!(LogFormat::resolve(None, true), LogFormat::Json);
        assert_eq!(LogFormat::resolve(None, false), LogFormat::Pretty);
        assert_eq!(LogFormat::resolve(Some("PRETTY"), true), LogFormat::Pretty);
        assert_eq!(LogFormat::resolve(Some("json"), false), LogFormat::Json);
        assert_eq!(LogFormat::resolve(Some("xml"), false), LogFormat::Pretty);
    }

    #[test]
    fn prepares_nested_log_directory() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path().join("logs").join("relay");

        let path = prepare_log_path(&dir).expect("prepare");

        assert!(dir.is_dir());
        assert_eq!(path, dir.join("relay.log"));
    }
}
