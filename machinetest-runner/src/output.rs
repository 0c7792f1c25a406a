// Copyright (c) The machinetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration of harness output: verbosity, colorization and log formatting.

use owo_colors::{OwoColorize, Style, style};
use serde::Deserialize;
use std::{fmt, sync::Once};
use tracing::{
    Event, Level, Subscriber,
    field::{Field, Visit},
    level_filters::LevelFilter,
    warn,
};
use tracing_subscriber::{
    Layer,
    filter::Targets,
    fmt::{FmtContext, FormatEvent, FormatFields, format},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
};

/// The environment variable holding a log filter, in `tracing_subscriber` `Targets` syntax.
pub const LOG_ENV: &str = "MACHINETEST_LOG";

/// Log events with this target are printed without a level heading, such as the paths of exported
/// artifacts.
pub(crate) const NO_HEADING_TARGET: &str = "machinetest_runner::no_heading";

/// How much the harness says about what it is doing.
#[derive(Copy, Clone, Debug, Default, Deserialize, Eq, PartialEq, Ord, PartialOrd)]
#[serde(rename_all = "kebab-case")]
pub enum Verbosity {
    /// Only warnings and errors.
    Quiet,

    /// Progress messages as well.
    #[default]
    Normal,

    /// Everything, including every remote command.
    Verbose,
}

impl Verbosity {
    fn level_filter(self) -> LevelFilter {
        match self {
            Self::Quiet => LevelFilter::WARN,
            Self::Normal => LevelFilter::INFO,
            Self::Verbose => LevelFilter::DEBUG,
        }
    }
}

/// Whether to colorize output.
#[derive(Copy, Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[must_use]
pub enum Color {
    /// Colorize if the stream is a terminal that supports it and `NO_COLOR` is unset.
    #[default]
    Auto,

    /// Always colorize.
    Always,

    /// Never colorize.
    Never,
}

impl Color {
    /// Determines whether output to the given stream should be colorized.
    pub fn should_colorize(self, stream: supports_color::Stream) -> bool {
        match self {
            Color::Auto => supports_color::on_cached(stream).is_some(),
            Color::Always => true,
            Color::Never => false,
        }
    }
}

/// Output options for a run.
#[derive(Copy, Clone, Debug, Default)]
#[must_use]
pub struct OutputContext {
    /// How much to log.
    pub verbosity: Verbosity,

    /// How colorization is determined.
    pub color: Color,
}

impl OutputContext {
    /// Installs the global log subscriber.
    ///
    /// Only the first call in a process has any effect.
    pub fn init_logging(self) {
        let mut log_styles = LogStyles::default();
        if self.color.should_colorize(supports_color::Stream::Stderr) {
            log_styles.colorize();
        }

        INIT_LOGGER.call_once(|| {
            let filter = std::env::var(LOG_ENV).unwrap_or_default();
            let default_targets = Targets::new().with_default(self.verbosity.level_filter());
            let (targets, parse_error) = if filter.is_empty() {
                (default_targets, None)
            } else {
                match filter.parse::<Targets>() {
                    Ok(targets) => (targets, None),
                    Err(error) => (default_targets, Some(error)),
                }
            };

            let layer = tracing_subscriber::fmt::layer()
                .event_format(SimpleFormatter { styles: log_styles })
                .with_writer(std::io::stderr)
                .with_filter(targets);

            // Another subscriber may already be installed, for example by a test harness.
            if tracing_subscriber::registry().with(layer).try_init().is_ok() {
                if let Some(error) = parse_error {
                    warn!("ignoring invalid {LOG_ENV} `{filter}`: {error}");
                }
            }
        });
    }
}

struct SimpleFormatter {
    styles: LogStyles,
}

impl<S, N> FormatEvent<S, N> for SimpleFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();

        if metadata.target() != NO_HEADING_TARGET {
            let (heading, style) = match *metadata.level() {
                Level::ERROR => ("error", self.styles.error),
                Level::WARN => ("warning", self.styles.warning),
                Level::INFO => ("info", self.styles.info),
                Level::DEBUG => ("debug", self.styles.debug),
                Level::TRACE => ("trace", self.styles.trace),
            };
            write!(writer, "{}: ", heading.style(style))?;
        }

        let mut visitor = MessageVisitor {
            writer: &mut writer,
            show_other: *metadata.level() >= Level::DEBUG,
            error: None,
        };
        event.record(&mut visitor);
        if let Some(error) = visitor.error {
            return Err(error);
        }

        writeln!(writer)
    }
}

static MESSAGE_FIELD: &str = "message";

struct MessageVisitor<'writer, 'a> {
    writer: &'a mut format::Writer<'writer>,
    show_other: bool,
    error: Option<fmt::Error>,
}

impl Visit for MessageVisitor<'_, '_> {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let res = if field.name() == MESSAGE_FIELD {
            write!(self.writer, "{value:?}")
        } else if self.show_other {
            write!(self.writer, "; {} = {:?}", field.name(), value)
        } else {
            Ok(())
        };
        if let Err(error) = res {
            self.error = Some(error);
        }
    }
}

static INIT_LOGGER: Once = Once::new();

#[derive(Debug, Default)]
struct LogStyles {
    error: Style,
    warning: Style,
    info: Style,
    debug: Style,
    trace: Style,
}

impl LogStyles {
    fn colorize(&mut self) {
        self.error = style().red().bold();
        self.warning = style().yellow().bold();
        self.info = style().bold();
        self.debug = style().bold();
        self.trace = style().dimmed();
    }
}
