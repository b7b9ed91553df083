//! Test logging: a compact formatter and a once-only subscriber setup.
//!
//! Verbosity follows `RUST_LOG`, e.g. `RUST_LOG=tiered_malloc::caches=debug`.

use std::fmt;
use std::sync::Once;

use nu_ansi_term::Color;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::{self, FormatEvent, FormatFields};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Registry};

/// Prints `LEVEL thread: span: fields` with a coloured level.
#[derive(Default)]
pub struct CompactFormatter;

impl<S, N> FormatEvent<S, N> for CompactFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let level = *event.metadata().level();
        let painted = match level {
            Level::TRACE => Color::Purple.paint("TRACE"),
            Level::DEBUG => Color::Blue.paint("DEBUG"),
            Level::INFO => Color::Green.paint(" INFO"),
            Level::WARN => Color::Yellow.paint(" WARN"),
            Level::ERROR => Color::Red.paint("ERROR"),
        };
        write!(writer, "{painted} ")?;

        let thread = std::thread::current();
        write!(writer, "{}: ", thread.name().unwrap_or("?"))?;

        if let Some(span) = ctx.lookup_current() {
            write!(writer, "{}: ", Color::Cyan.paint(span.name()))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Installs the test subscriber once per test binary.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let subscriber = Registry::default().with(EnvFilter::from_default_env()).with(
            tracing_subscriber::fmt::layer()
                .with_test_writer()
                .event_format(CompactFormatter),
        );
        // Another harness may already own the global default.
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}
