use std::fmt;

use adstat_core::{format_line, Severity};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

pub fn severity_for(level: &Level) -> Severity {
    if *level == Level::ERROR {
        Severity::Error
    } else if *level == Level::WARN {
        Severity::Warning
    } else if *level == Level::INFO {
        Severity::Info
    } else if *level == Level::DEBUG {
        Severity::Debug
    } else {
        Severity::Trace
    }
}

/// One line per event: message and fields, colored by level.
#[derive(Debug, Clone, Copy)]
pub struct ColoredLines {
    pub color: bool,
}

impl<S, N> FormatEvent<S, N> for ColoredLines
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(&self, ctx: &FmtContext<'_, S, N>, mut writer: Writer<'_>, event: &Event<'_>) -> fmt::Result {
        let mut message = String::new();
        ctx.format_fields(Writer::new(&mut message), event)?;
        let severity = severity_for(event.metadata().level());
        writeln!(writer, "{}", format_line(severity, &message, self.color))
    }
}

pub fn color_from_env() -> bool {
    std::env::var_os("NO_COLOR").is_none()
}

/// Install the stderr subscriber. `RUST_LOG` filters (default `info`),
/// `NO_COLOR` turns colors off.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let color = color_from_env();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .event_format(ColoredLines { color })
        .init();
}
