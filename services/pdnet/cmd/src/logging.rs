use std::fmt::{self, Write as _};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_BRIGHT_YELLOW: &str = "\x1b[93m";
const COLOR_BRIGHT_RED: &str = "\x1b[91m";
const COLOR_BRIGHT_GRAY: &str = "\x1b[90m";

const SOURCE_WIDTH: usize = 16;
const LOG_LEVEL_WIDTH: usize = 9;

/// Single-line formatter: `[timestamp] [source] [level] message key=value...`
///
/// The source column is derived from the event target, so engine logs show
/// as `pdnet-session` and wire logs as `pdnet-wire`.
pub struct PdnetLogFormatter {
    service_name: String,
    color_enabled: bool,
}

impl PdnetLogFormatter {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            color_enabled: is_terminal(),
        }
    }

    #[cfg(test)]
    fn plain(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            color_enabled: false,
        }
    }

    fn format_source(&self, target: &str) -> String {
        let crate_name = target.split("::").next().unwrap_or(target);
        let name = match crate_name {
            "pdnet_session" => "pdnet-session".to_string(),
            "pdnet_wire" => "pdnet-wire".to_string(),
            "pdnet" | "" => self.service_name.clone(),
            other => other.replace('_', "-"),
        };

        if name.chars().count() > SOURCE_WIDTH {
            let truncated: String = name.chars().take(SOURCE_WIDTH - 1).collect();
            format!("{}…", truncated)
        } else {
            format!("{:<width$}", name, width = SOURCE_WIDTH)
        }
    }

    fn format_log_level(&self, level: &Level) -> String {
        let level_str = match *level {
            Level::ERROR => "✗ ERROR",
            Level::WARN => "⚠ WARN",
            Level::INFO => "ℹ INFO",
            Level::DEBUG => "◦ DEBUG",
            Level::TRACE => "◦ TRACE",
        };
        format!("{:<width$}", level_str, width = LOG_LEVEL_WIDTH)
    }

    fn color_for_level(&self, level: &Level) -> &'static str {
        if !self.color_enabled {
            return "";
        }
        match *level {
            Level::ERROR => COLOR_BRIGHT_RED,
            Level::WARN => COLOR_BRIGHT_YELLOW,
            Level::INFO => COLOR_GREEN,
            Level::DEBUG | Level::TRACE => COLOR_BRIGHT_GRAY,
        }
    }

    fn render(&self, timestamp: &str, level: &Level, target: &str, fields: &FieldVisitor) -> String {
        let color = self.color_for_level(level);
        let (reset, cyan) = if self.color_enabled {
            (COLOR_RESET, COLOR_CYAN)
        } else {
            ("", "")
        };

        let mut line = format!(
            "{}[{}] [{}] [{}{}{}] {}",
            cyan,
            timestamp,
            self.format_source(target),
            color,
            self.format_log_level(level),
            reset,
            fields.message
        );
        for (name, value) in &fields.extra {
            let _ = write!(line, " {}={}", name, value);
        }
        line.push_str(reset);
        line
    }
}

impl<S, N> FormatEvent<S, N> for PdnetLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string();
        let metadata = event.metadata();

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        writeln!(
            writer,
            "{}",
            self.render(&timestamp, metadata.level(), metadata.target(), &visitor)
        )
    }
}

/// Collects the message and the structured fields of an event
#[derive(Default)]
struct FieldVisitor {
    message: String,
    extra: Vec<(&'static str, String)>,
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.extra.push((field.name(), format!("{:?}", value)));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.extra.push((field.name(), value.to_string()));
        }
    }
}

fn is_terminal() -> bool {
    match std::env::var("TERM") {
        Ok(term) => term != "dumb",
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_from_target() {
        let formatter = PdnetLogFormatter::plain("pdnet");
        assert_eq!(formatter.format_source("pdnet_session::manager").trim_end(), "pdnet-session");
        assert_eq!(formatter.format_source("pdnet_wire::frame").trim_end(), "pdnet-wire");
        assert_eq!(formatter.format_source("pdnet::reference").trim_end(), "pdnet");
        assert_eq!(formatter.format_source("pdnet").len(), SOURCE_WIDTH);
    }

    #[test]
    fn test_long_source_is_truncated() {
        let formatter = PdnetLogFormatter::plain("pdnet");
        let source = formatter.format_source("a_very_long_dependency_name::module");
        assert_eq!(source.chars().count(), SOURCE_WIDTH);
        assert!(source.ends_with('…'));
    }

    #[test]
    fn test_render_plain_line() {
        let formatter = PdnetLogFormatter::plain("pdnet");
        let fields = FieldVisitor {
            message: "Connected".to_string(),
            extra: vec![("peer", "3".to_string())],
        };
        let line = formatter.render("2026-01-01 00:00:00.000", &Level::INFO, "pdnet_session::server", &fields);
        assert!(line.starts_with("[2026-01-01 00:00:00.000] [pdnet-session   ] [ℹ INFO"));
        assert!(line.ends_with("] Connected peer=3"));
        assert!(!line.contains('\x1b'));
    }
}
