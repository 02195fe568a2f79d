//! Structured logging for the flow tunnel.
//!
//! The crate logs through `tracing` and tags records with `session_id`,
//! `flow_id` and `frame_type` fields, so one flow can be followed across the
//! session task, its reader and its adapter. Hosts call [`init_logging`] once
//! at startup. Library users who install their own subscriber can skip it.

use std::path::PathBuf;

use tracing::{Level, Subscriber};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_log::LogTracer;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer, prelude::*};

/// Daily rolling log file; files are named `<prefix>.<date>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFile {
    pub dir: PathBuf,
    pub prefix: String,
}

impl LogFile {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        LogFile {
            dir: dir.into(),
            prefix: "flowtunnel".to_string(),
        }
    }
}

/// Where and how tunnel logs are written.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Most verbose level kept, unless `RUST_LOG` says otherwise
    pub level: Level,
    pub stdout: bool,
    pub file: Option<LogFile>,
    /// One JSON object per record instead of text
    pub json: bool,
    pub source_location: bool,
    /// Also log when flow and session spans open and close
    pub span_events: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        LogOptions {
            level: Level::INFO,
            stdout: true,
            file: None,
            json: false,
            source_location: true,
            span_events: false,
        }
    }
}

/// Map a configured level name to a [`Level`]; unknown names mean INFO.
pub fn parse_level(name: &str) -> Level {
    match name.trim().to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

fn span_events(enabled: bool) -> FmtSpan {
    if enabled {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    }
}

/// One formatting layer writing to `writer`.
fn format_layer<S, W>(
    options: &LogOptions,
    writer: W,
    ansi: bool,
) -> Box<dyn Layer<S> + Send + Sync + 'static>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(true)
        .with_file(options.source_location)
        .with_line_number(options.source_location)
        .with_span_events(span_events(options.span_events));
    if options.json {
        layer.json().boxed()
    } else {
        layer.boxed()
    }
}

/// Install the global subscriber described by `options`.
///
/// Keep the returned guard alive while the tunnel runs; dropping it flushes
/// the file writer. A second call leaves the first subscriber in place.
///
/// ```
/// use tunnel_core::logging::{LogOptions, init_logging};
///
/// let _guard = init_logging(LogOptions {
///     level: tracing::Level::DEBUG,
///     ..Default::default()
/// });
/// ```
pub fn init_logging(options: LogOptions) -> Option<WorkerGuard> {
    // `log` records from dependencies
    let _ = LogTracer::init();

    let filter = EnvFilter::from_default_env().add_directive(options.level.into());
    let mut layers = Vec::new();
    let mut guard = None;

    if options.stdout {
        layers.push(format_layer(&options, std::io::stdout, true));
    }
    if let Some(file) = &options.file {
        let appender = RollingFileAppender::new(Rotation::DAILY, &file.dir, &file.prefix);
        let (writer, worker_guard) = NonBlocking::new(appender);
        guard = Some(worker_guard);
        layers.push(format_layer(&options, writer, false));
    }

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(layers)
        .try_init();
    guard
}

/// Install logging at the level named in the configuration file.
pub fn init_logging_from_config(config: &crate::config::Config) -> Option<WorkerGuard> {
    init_logging(LogOptions {
        level: parse_level(&config.log_level),
        ..Default::default()
    })
}
