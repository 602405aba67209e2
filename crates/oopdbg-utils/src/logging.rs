//! # Logging Utilities
//!
//! Structured logging for the debugger using `tracing`:
//! - Pretty (development) or JSON (machine-readable) output
//! - Level filtering through `RUST_LOG` or an explicit level
//! - Optional file output next to the console
//!
//! Console output goes to stderr so that a tool's own stdout stays clean.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use oopdbg_utils::init_logging;
//!
//! // Keep the guard alive for as long as logs should be written.
//! let _guard = init_logging().expect("Failed to initialize logging");
//! tracing::info!("debugger started");
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: level filter (e.g. `RUST_LOG=debug`, `RUST_LOG=oopdbg_core=trace`)
//! - `OOPDBG_LOG_FORMAT`: `pretty` (default) or `json`
//! - `OOPDBG_LOG_FILE`: also write logs to this file; a directory gets a
//!   dated `YYYY-MM-DD-oopdbg.log` inside it

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, io};

use chrono::Utc;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::writer::MakeWriter;
use tracing_subscriber::fmt::{self};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat
{
    /// Pretty-printed, human-readable format
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

impl FromStr for LogFormat
{
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "pretty" | "dev" | "development" => Ok(LogFormat::Pretty),
            "json" | "prod" | "production" => Ok(LogFormat::Json),
            _ => Err(format!("Unknown log format: {s}. Use 'pretty' or 'json'")),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel
{
    Error,
    Warn,
    Info,
    Debug,
    /// Most verbose; includes every debug event dispatched
    Trace,
}

impl From<LogLevel> for Level
{
    fn from(level: LogLevel) -> Self
    {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

impl FromStr for LogLevel
{
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "error" | "err" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" | "dbg" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(format!(
                "Unknown log level: {s}. Use 'error', 'warn', 'info', 'debug', or 'trace'"
            )),
        }
    }
}

/// Logging setup
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogConfig
{
    /// Output format for console and file.
    pub format: LogFormat,
    /// Explicit level. Overrides `RUST_LOG` when set.
    pub level: Option<LogLevel>,
    /// Extra file (or directory for a dated file) to log into.
    pub file: Option<PathBuf>,
}

impl LogConfig
{
    /// Read `OOPDBG_LOG_FORMAT` and `OOPDBG_LOG_FILE`.
    ///
    /// ## Errors
    ///
    /// `InvalidFormat` when `OOPDBG_LOG_FORMAT` is set to an unknown format.
    pub fn from_env() -> Result<Self, LoggingError>
    {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env), with a custom variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, LoggingError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let format = match lookup("OOPDBG_LOG_FORMAT") {
            Some(value) => value.parse().map_err(LoggingError::InvalidFormat)?,
            None => LogFormat::default(),
        };
        let file = lookup("OOPDBG_LOG_FILE")
            .filter(|path| !path.is_empty())
            .map(PathBuf::from);
        Ok(Self {
            format,
            level: None,
            file,
        })
    }

    #[must_use]
    pub fn with_level(mut self, level: LogLevel) -> Self
    {
        self.level = Some(level);
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self
    {
        self.format = format;
        self
    }

    /// Filter from the explicit level, else `RUST_LOG`, else `info`.
    fn env_filter(&self) -> EnvFilter
    {
        match self.level {
            Some(level) => EnvFilter::new(Level::from(level).to_string()),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string())),
        }
    }
}

/// Resolve the configured log file: directories get a dated file name.
pub fn resolve_log_path(path: &Path) -> PathBuf
{
    if path.is_dir() || path.as_os_str().to_string_lossy().ends_with('/') {
        let today = Utc::now().format("%Y-%m-%d");
        path.join(format!("{today}-oopdbg.log"))
    } else {
        path.to_path_buf()
    }
}

/// Keeps the background file writer alive
///
/// Dropping the guard flushes and stops file logging.
#[derive(Debug)]
#[must_use = "file logging stops when the guard is dropped"]
pub struct LoggingGuard
{
    _file_writer: Option<WorkerGuard>,
    log_file: Option<PathBuf>,
}

impl LoggingGuard
{
    /// File receiving log output, if any.
    pub fn log_file(&self) -> Option<&Path>
    {
        self.log_file.as_deref()
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn format_layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .with_timer(ChronoUtc::rfc_3339())
            .with_ansi(ansi)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(writer)
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .with_timer(ChronoUtc::rfc_3339())
            .with_current_span(true)
            .with_span_list(true)
            .boxed(),
    }
}

/// Initialize logging from the environment
///
/// ## Errors
///
/// Returns an error if:
/// - `OOPDBG_LOG_FORMAT` holds an unknown format
/// - a global subscriber is already installed
/// - the log file directory cannot be created
pub fn init_logging() -> Result<LoggingGuard, LoggingError>
{
    init_logging_with(&LogConfig::from_env()?)
}

/// Initialize logging with an explicit configuration
///
/// ## Example
///
/// ```rust,no_run
/// use oopdbg_utils::{init_logging_with, LogConfig, LogFormat, LogLevel};
///
/// let config = LogConfig::default()
///     .with_level(LogLevel::Debug)
///     .with_format(LogFormat::Json);
/// let _guard = init_logging_with(&config).expect("Failed to initialize logging");
/// ```
///
/// ## Errors
///
/// Returns an error if a global subscriber is already installed or the log
/// file directory cannot be created.
pub fn init_logging_with(config: &LogConfig) -> Result<LoggingGuard, LoggingError>
{
    let mut layers: Vec<BoxedLayer> = vec![format_layer(config.format, io::stderr, true)];
    let mut file_writer = None;
    let mut log_file = None;

    if let Some(path) = &config.file {
        let path = resolve_log_path(path);
        let directory = path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        std::fs::create_dir_all(&directory)?;
        let file_name = path
            .file_name()
            .ok_or_else(|| LoggingError::InitializationFailed(format!("no file name in {}", path.display())))?;

        // The date is already part of directory-derived names.
        let appender = tracing_appender::rolling::never(&directory, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        layers.push(format_layer(config.format, non_blocking, false));
        file_writer = Some(guard);
        log_file = Some(path);
    }

    Registry::default()
        .with(layers)
        .with(config.env_filter())
        .try_init()
        .map_err(|e| LoggingError::InitializationFailed(e.to_string()))?;

    Ok(LoggingGuard {
        _file_writer: file_writer,
        log_file,
    })
}

/// Logging initialization error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError
{
    /// Invalid log format
    #[error("Invalid log format: {0}")]
    InvalidFormat(String),

    /// Invalid log level
    #[error("Invalid log level: {0}")]
    InvalidLevel(String),

    /// Failed to initialize logging
    #[error("Failed to initialize logging: {0}")]
    InitializationFailed(String),

    /// File logging error
    #[error("File logging error: {0}")]
    FileError(#[from] io::Error),
}
