//! Console log format for btmesh.
//!
//! Lines look like
//! `[2024-01-01 12:00:00.000] [btmesh-encode       ] [ℹ INFO   ] message key=value`.
//! Events may carry a `component` field, set through the `component_*!`
//! macros, which replaces the default service column.

use std::fmt;
use std::io::IsTerminal;

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

const COMPONENT_WIDTH: usize = 20;
const LEVEL_WIDTH: usize = 9;

#[macro_export]
macro_rules! component_info {
    ($component:expr, $($arg:tt)*) => {
        tracing::info!(component = $component, $($arg)*)
    };
}

#[macro_export]
macro_rules! component_warn {
    ($component:expr, $($arg:tt)*) => {
        tracing::warn!(component = $component, $($arg)*)
    };
}

#[macro_export]
macro_rules! component_debug {
    ($component:expr, $($arg:tt)*) => {
        tracing::debug!(component = $component, $($arg)*)
    };
}

#[macro_export]
macro_rules! component_error {
    ($component:expr, $($arg:tt)*) => {
        tracing::error!(component = $component, $($arg)*)
    };
}

/// `FormatEvent` writing one aligned, optionally colored line per event
pub struct MeshLogFormatter {
    service_name: String,
    color_enabled: bool,
}

impl MeshLogFormatter {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            color_enabled: color_supported(),
        }
    }

    /// Disable ANSI colors regardless of the terminal
    pub fn without_color(mut self) -> Self {
        self.color_enabled = false;
        self
    }

    fn component_column(&self, component: Option<&str>) -> String {
        let name = match component {
            Some(component) => format!("{}-{}", self.service_name, component),
            None => self.service_name.clone(),
        };
        if name.chars().count() > COMPONENT_WIDTH {
            let truncated: String = name.chars().take(COMPONENT_WIDTH - 1).collect();
            format!("{}…", truncated)
        } else {
            format!("{:<width$}", name, width = COMPONENT_WIDTH)
        }
    }

    fn level_column(level: &Level) -> String {
        let label = match *level {
            Level::ERROR => "✗ ERROR",
            Level::WARN => "⚠ WARN",
            Level::INFO => "ℹ INFO",
            Level::DEBUG => "◦ DEBUG",
            Level::TRACE => "◦ TRACE",
        };
        format!("{:<width$}", label, width = LEVEL_WIDTH)
    }

    fn level_color(&self, level: &Level) -> &'static str {
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

    fn paint(&self, color: &'static str) -> &'static str {
        if self.color_enabled {
            color
        } else {
            ""
        }
    }

    fn render(&self, level: &Level, timestamp: &str, fields: &EventFields) -> String {
        let mut line = format!(
            "{}[{}]{} [{}] [{}{}{}] {}",
            self.paint(COLOR_CYAN),
            timestamp,
            self.paint(COLOR_RESET),
            self.component_column(fields.component.as_deref()),
            self.level_color(level),
            Self::level_column(level),
            self.paint(COLOR_RESET),
            fields.message
        );
        for (name, value) in &fields.extra {
            line.push_str(&format!(" {}={}", name, value));
        }
        line
    }
}

impl<S, N> FormatEvent<S, N> for MeshLogFormatter
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
        let timestamp = chrono::Local::now()
            .format("%Y-%m-%d %H:%M:%S%.3f")
            .to_string();
        let mut fields = EventFields::default();
        event.record(&mut fields);
        writeln!(
            writer,
            "{}",
            self.render(event.metadata().level(), &timestamp, &fields)
        )
    }
}

/// Message, component and remaining fields of one event
#[derive(Debug, Default)]
struct EventFields {
    message: String,
    component: Option<String>,
    extra: Vec<(&'static str, String)>,
}

impl Visit for EventFields {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "component" => self.component = Some(value.to_string()),
            name => self.extra.push((name, value.to_string())),
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        match field.name() {
            // `format_args!` messages arrive here and print without quotes
            "message" => self.message = format!("{:?}", value),
            "component" => {
                self.component = Some(format!("{:?}", value).trim_matches('"').to_string())
            }
            name => self.extra.push((name, format!("{:?}", value))),
        }
    }
}

fn color_supported() -> bool {
    if std::env::var("NO_COLOR").is_ok() || std::env::var("TERM").as_deref() == Ok("dumb") {
        return false;
    }
    std::io::stderr().is_terminal()
}
