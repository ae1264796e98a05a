//! Opt-in tracing subscriber writing one `key=value` line per event.

use crate::error::Result;
use chrono::{SecondsFormat, Utc};
use std::collections::BTreeMap;
use std::fmt;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::{DefaultFields, Writer};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

const SERVICE: &str = "courier";
const DEFAULT_FILTER: &str = "courier=info,info";

/// Installs the subscriber: `info` and below go to stdout, `warn` and above
/// to stderr. `RUST_LOG` overrides the default filter. The library never
/// calls this itself.
pub fn init_tracing() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let writer = std::io::stdout
        .with_max_level(Level::INFO)
        .or_else(std::io::stderr.with_min_level(Level::WARN));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .fmt_fields(DefaultFields::new())
        .event_format(EventLine)
        .with_writer(writer)
        .try_init()
        .map_err(|err| crate::err!("failed to install tracing subscriber: {err}"))
}

struct EventLine;

impl<S, N> FormatEvent<S, N> for EventLine
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
    N: for<'writer> FormatFields<'writer> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        let mut fields = EventFields::default();
        event.record(&mut fields);

        let mut line = Line::default();
        line.pair("ts", &Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
        line.pair("level", metadata.level().as_str());
        line.pair("service", SERVICE);
        line.pair("target", metadata.target());
        if let Some(span) = ctx.lookup_current() {
            let path: Vec<&str> = span.scope().from_root().map(|span| span.name()).collect();
            line.pair("span", &path.join("."));
        }
        if let Some(message) = &fields.message {
            line.pair("msg", message);
        }
        for (key, value) in &fields.values {
            line.pair(key, value);
        }
        writeln!(writer, "{}", line.0)
    }
}

/// Event fields in key order, with `message` pulled out.
#[derive(Default)]
struct EventFields {
    message: Option<String>,
    values: BTreeMap<&'static str, String>,
}

impl EventFields {
    fn insert(&mut self, field: &Field, value: String) {
        match field.name() {
            "" => {}
            "message" => self.message = Some(value),
            name => {
                self.values.insert(name, value);
            }
        }
    }
}

impl Visit for EventFields {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.insert(field, format!("{value:?}"));
    }
}

#[derive(Default)]
struct Line(String);

impl Line {
    /// Appends `key=value`, quoting and escaping values that would break the
    /// line apart.
    fn pair(&mut self, key: &str, value: &str) {
        if !self.0.is_empty() {
            self.0.push(' ');
        }
        self.0.push_str(key);
        self.0.push('=');

        let plain = !value.is_empty()
            && !value
                .chars()
                .any(|ch| ch.is_whitespace() || matches!(ch, '"' | '\\' | '=' | ','));
        if plain {
            self.0.push_str(value);
            return;
        }
        self.0.push('"');
        for ch in value.chars() {
            match ch {
                '"' => self.0.push_str("\\\""),
                '\\' => self.0.push_str("\\\\"),
                '\n' => self.0.push_str("\\n"),
                '\r' => self.0.push_str("\\r"),
                '\t' => self.0.push_str("\\t"),
                other => self.0.push(other),
            }
        }
        self.0.push('"');
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_that_split_the_line_are_quoted() {
        let mut line = Line::default();
        line.pair("route", "orders");
        line.pair("msg", "exchange failed: a=b");
        line.pair("body", "");
        assert_eq!(line.0, "route=orders msg=\"exchange failed: a=b\" body=\"\"");
    }

    #[test]
    fn quotes_and_newlines_are_escaped() {
        let mut line = Line::default();
        line.pair("error", "say \"hi\"\nnow");
        assert_eq!(line.0, "error=\"say \\\"hi\\\"\\nnow\"");
    }
}
