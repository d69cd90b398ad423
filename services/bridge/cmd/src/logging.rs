use std::fmt;
use std::io::IsTerminal;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_BRIGHT_YELLOW: &str = "\x1b[93m";
const COLOR_BRIGHT_RED: &str = "\x1b[91m";
const COLOR_BRIGHT_GRAY: &str = "\x1b[90m";

/// Column widths
const COMPONENT_WIDTH: usize = 18;
const LEVEL_WIDTH: usize = 9;

/// Line format: `[timestamp] [component] [level] message key=value...`
pub struct BridgeLogFormatter {
    service_name: String,
    color_enabled: bool,
}

/// Log with a `component` field, shown as `bridge-<component>`.
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

impl BridgeLogFormatter {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            color_enabled: colors_supported(),
        }
    }

    fn component_column(&self, component: Option<&str>) -> String {
        let name = match component {
            Some(comp) => format!("bridge-{}", comp),
            None => self.service_name.clone(),
        };
        if name.chars().count() > COMPONENT_WIDTH {
            let cut: String = name.chars().take(COMPONENT_WIDTH - 1).collect();
            format!("{}…", cut)
        } else {
            format!("{:<width$}", name, width = COMPONENT_WIDTH)
        }
    }

    fn level_column(&self, level: &Level) -> (String, &'static str) {
        let (label, color) = match *level {
            Level::ERROR => ("✗ ERROR", COLOR_BRIGHT_RED),
            Level::WARN => ("⚠ WARN", COLOR_BRIGHT_YELLOW),
            Level::INFO => ("ℹ INFO", COLOR_GREEN),
            Level::DEBUG => ("◦ DEBUG", COLOR_BRIGHT_GRAY),
            Level::TRACE => ("◦ TRACE", COLOR_BRIGHT_GRAY),
        };
        let color = if self.color_enabled { color } else { "" };
        (format!("{:<width$}", label, width = LEVEL_WIDTH), color)
    }
}

impl<S, N> FormatEvent<S, N> for BridgeLogFormatter
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
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let component = self.component_column(visitor.component.as_deref());
        let (level, color) = self.level_column(event.metadata().level());
        let (cyan, reset) = if self.color_enabled {
            (COLOR_CYAN, COLOR_RESET)
        } else {
            ("", "")
        };

        write!(
            writer,
            "{}[{}] [{}] [{}{}{}] {}",
            cyan, timestamp, component, color, level, reset, visitor.message
        )?;
        for (key, value) in &visitor.fields {
            write!(writer, " {}={}", key, value)?;
        }
        writeln!(writer, "{}", reset)
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    component: Option<String>,
    fields: Vec<(&'static str, String)>,
}

impl FieldVisitor {
    fn store(&mut self, name: &'static str, value: String) {
        match name {
            "message" => self.message = value,
            "component" => self.component = Some(value),
            _ => self.fields.push((name, value)),
        }
    }
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        let rendered = format!("{:?}", value);
        let rendered = rendered
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .map(str::to_owned)
            .unwrap_or(rendered);
        self.store(field.name(), rendered);
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.store(field.name(), value.to_string());
    }
}

fn colors_supported() -> bool {
    if std::env::var_os("NO_COLOR").is_some() {
        return false;
    }
    if std::env::var("TERM").map_or(true, |t| t == "dumb") {
        return false;
    }
    std::io::stdout().is_terminal()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_column_is_fixed_width() {
        let formatter = BridgeLogFormatter::new("sockbridge");
        assert_eq!(formatter.component_column(None).len(), COMPONENT_WIDTH);
        assert!(formatter
            .component_column(Some("stream"))
            .starts_with("bridge-stream "));
        let long = formatter.component_column(Some("a-very-long-component-name"));
        assert_eq!(long.chars().count(), COMPONENT_WIDTH);
        assert!(long.ends_with('…'));
    }
}
