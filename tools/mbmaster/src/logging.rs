//! Console logging for mbmaster
//!
//! Events go to stderr so register output on stdout stays machine-readable.
//! Each line reads `timestamp [LEVEL] module: message`, where `module` is the
//! last path segment of the event target (`engine`, `pool`, `master`).

use chrono::{DateTime, Utc};
use colored::Colorize;
use tracing::Level;
use tracing_subscriber::{
    fmt::{format::Writer, FmtContext, FormatEvent, FormatFields},
    registry::LookupSpan,
    EnvFilter,
};

fn level_tag(level: Level, ansi: bool) -> String {
    let tag = format!("[{level}]");
    if !ansi {
        return tag;
    }
    match level {
        Level::ERROR => tag.red().bold().to_string(),
        Level::WARN => tag.yellow().to_string(),
        Level::INFO => tag.green().to_string(),
        Level::DEBUG => tag.blue().to_string(),
        Level::TRACE => tag.magenta().to_string(),
    }
}

fn short_target(target: &str) -> &str {
    target.rsplit("::").next().unwrap_or(target)
}

/// Everything before the event fields
fn line_prefix(now: DateTime<Utc>, level: Level, target: &str, ansi: bool) -> String {
    format!(
        "{} {} {}: ",
        now.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
        level_tag(level, ansi),
        short_target(target)
    )
}

/// `2025-12-02T00:50:44.809Z [WARN] engine: TCP timeout: 10.0.0.5:502 tid=7`
struct ConsoleFormat;

impl<S, N> FormatEvent<S, N> for ConsoleFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let meta = event.metadata();
        let ansi = writer.has_ansi_escapes();
        write!(writer, "{}", line_prefix(Utc::now(), *meta.level(), meta.target(), ansi))?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Install the stderr subscriber
///
/// `RUST_LOG` wins when set; otherwise `verbose` picks `debug` over `warn`.
pub fn init(verbose: bool, ansi: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(ansi)
        .event_format(ConsoleFormat)
        .init();
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_plain_prefix() {
        let now = Utc.with_ymd_and_hms(2025, 12, 2, 0, 50, 44).unwrap();
        assert_eq!(
            line_prefix(now, Level::WARN, "modbus_master::engine", false),
            "2025-12-02T00:50:44.000Z [WARN] engine: "
        );
        assert_eq!(
            line_prefix(now, Level::INFO, "mbmaster", false),
            "2025-12-02T00:50:44.000Z [INFO] mbmaster: "
        );
    }

    #[test]
    fn test_level_tags() {
        let tags: Vec<String> = [Level::TRACE, Level::DEBUG, Level::INFO, Level::WARN, Level::ERROR]
            .into_iter()
            .map(|level| level_tag(level, false))
            .collect();
        assert_eq!(tags, ["[TRACE]", "[DEBUG]", "[INFO]", "[WARN]", "[ERROR]"]);
    }

    #[test]
    fn test_colored_tag_keeps_text() {
        colored::control::set_override(true);
        let tag = level_tag(Level::ERROR, true);
        colored::control::unset_override();
        assert!(tag.contains("[ERROR]"));
        assert!(tag.starts_with("\x1b["));
    }
}
