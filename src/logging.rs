use anyhow::{Context, Result};
use colored::*;
use std::fmt;
use std::path::Path;
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Which process emitted a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Receiver,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => write!(f, "client"),
            Role::Receiver => write!(f, "receiver"),
        }
    }
}

/// Event formatter that tags every line with the process role.
///
/// Client and receiver share one terminal, so each line starts with
/// `[client]` or `[receiver]`. With ANSI enabled the whole line is colored by
/// level and nothing else is printed; without it (log files) the level is
/// written out instead.
pub struct RoleFormatter {
    role: Role,
    ansi: bool,
}

impl RoleFormatter {
    pub fn new(role: Role) -> Self {
        Self { role, ansi: true }
    }

    pub fn without_ansi(mut self) -> Self {
        self.ansi = false;
        self
    }
}

impl<S, N> FormatEvent<S, N> for RoleFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        // format_fields writes straight to its writer; buffer to color the
        // line as a whole.
        let mut buffer = String::new();
        ctx.format_fields(Writer::new(&mut buffer), event)?;

        let level = *event.metadata().level();
        if !self.ansi {
            return writeln!(writer, "[{}] {:>5} {}", self.role, level, buffer);
        }

        let line = format!("[{}] {}", self.role, buffer);
        let colored_output = match level {
            Level::INFO => line.white(),
            Level::WARN => line.yellow(),
            Level::ERROR => line.red(),
            Level::DEBUG => line.blue(),
            Level::TRACE => line.purple(),
        };
        writeln!(writer, "{}", colored_output)
    }
}

/// Default filter directive for the given flags. `RUST_LOG` takes precedence.
pub fn level_filter(verbosity: u8, quiet: bool) -> &'static str {
    if quiet {
        return "warn";
    }
    match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Install the global subscriber.
///
/// Logs go to stderr (the receiver's stdout carries its event channel). With
/// `log_file` set, lines are also appended to that file through a
/// non-blocking writer; keep the returned guard alive until exit so buffered
/// lines are flushed.
pub fn init(
    role: Role,
    verbosity: u8,
    quiet: bool,
    log_file: Option<&Path>,
) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_filter(verbosity, quiet)));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .event_format(RoleFormatter::new(role))
        .with_writer(std::io::stderr);

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {:?}", path))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            let layer = tracing_subscriber::fmt::layer()
                .event_format(RoleFormatter::new(role).without_ansi())
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install log subscriber")?;
    Ok(guard)
}
