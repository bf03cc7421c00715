//! Tracing subscriber setup and the `YYYY-MM-DD HH:MM:SS [LEVEL] message` event format.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

/// Local wall-clock timestamp, second precision.
pub struct LocalTimeFormatter;

impl tracing_subscriber::fmt::time::FormatTime for LocalTimeFormatter {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"))
    }
}

pub struct CustomEventFormat {
    ansi: bool,
}

impl<S, N> tracing_subscriber::fmt::FormatEvent<S, N> for CustomEventFormat
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> tracing_subscriber::fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &tracing_subscriber::fmt::FmtContext<'_, S, N>,
        mut writer: tracing_subscriber::fmt::format::Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        use tracing_subscriber::fmt::time::FormatTime;

        LocalTimeFormatter.format_time(&mut writer)?;
        write!(writer, " ")?;

        let level = event.metadata().level();
        if self.ansi {
            let level_color = match *level {
                tracing::Level::TRACE => "\x1b[2m",
                tracing::Level::DEBUG => "\x1b[34m",
                tracing::Level::INFO => "\x1b[32m",
                tracing::Level::WARN => "\x1b[33m",
                tracing::Level::ERROR => "\x1b[31m",
            };
            write!(writer, "{}[{}]\x1b[0m ", level_color, level)?;
        } else {
            write!(writer, "[{}] ", level)?;
        }

        // Structured fields (host=, ups=) follow the message
        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Map a user-facing level name to a tracing filter directive.
/// CRITICAL has no tracing counterpart and maps to ERROR.
pub fn parse_level(level: &str) -> Option<&'static str> {
    match level.trim().to_lowercase().as_str() {
        "trace" => Some("trace"),
        "debug" => Some("debug"),
        "info" => Some("info"),
        "warn" | "warning" => Some("warn"),
        "error" | "critical" => Some("error"),
        _ => None,
    }
}

/// Priority: 1. --log-level flag, 2. LOG_LEVEL env, 3. default (info)
pub fn resolve_filter(flag: Option<&str>, env: Option<&str>) -> &'static str {
    let Some(requested) = flag.or(env) else {
        return "info";
    };

    parse_level(requested).unwrap_or_else(|| {
        eprintln!(
            "Invalid log level '{}'. Using INFO. Valid levels: TRACE, DEBUG, INFO, WARN, ERROR, CRITICAL",
            requested
        );
        "info"
    })
}

/// Today's log file plus four rotated days.
const LOG_FILES_KEPT: usize = 5;

/// Log file rotated at midnight. Rotated files get a `.YYYY-MM-DD` suffix.
pub fn file_appender(path: &Path) -> Result<RollingFileAppender> {
    let dir = path.parent().filter(|d| !d.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("invalid log file path {:?}", path))?;

    std::fs::create_dir_all(dir).with_context(|| format!("cannot create log directory {:?}", dir))?;

    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(file_name)
        .max_log_files(LOG_FILES_KEPT)
        .build(dir)
        .with_context(|| format!("cannot open log file {:?}", path))
}

/// Install the global subscriber. Logs go to stderr, or to a daily-rotated `log_file` without colours.
pub fn init_tracing(filter: &str, log_file: Option<&Path>) -> Result<()> {
    use tracing_subscriber::prelude::*;

    let (writer, ansi) = match log_file {
        Some(path) => (BoxMakeWriter::new(file_appender(path)?), false),
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    tracing_subscriber::registry()
        .with(EnvFilter::new(filter))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(ansi)
                .fmt_fields(tracing_subscriber::fmt::format::DefaultFields::new())
                .event_format(CustomEventFormat { ansi }),
        )
        .try_init()
        .context("tracing subscriber already installed")?;

    Ok(())
}
