//! Logging configuration and startup.
//!
//! Logs go to stdout (JSON or pretty) and, when configured, to a JSON log
//! file. The file is rotated at startup once it reaches the configured size,
//! and rotated files older than the retention period are removed.

use std::fmt as std_fmt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use chrono::Local;
use tracing::level_filters::LevelFilter;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{ConfigurationError, Settings};

/// Log level enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Trace-level logging (most verbose)
    Trace,
    /// Debug-level logging
    Debug,
    /// Info-level logging
    Info,
    /// Warning-level logging
    Warn,
    /// Error-level logging (least verbose)
    Error,
}

impl FromStr for LogLevel {
    type Err = String;

    /// Parses level names case-insensitively. `WARNING` and `CRITICAL` are
    /// accepted as aliases.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TRACE" => Ok(LogLevel::Trace),
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARN" | "WARNING" => Ok(LogLevel::Warn),
            "ERROR" | "CRITICAL" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

impl std_fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std_fmt::Formatter<'_>) -> std_fmt::Result {
        std_fmt::Display::fmt(&Level::from(*self), f)
    }
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        LevelFilter::from_level(level.into())
    }
}

/// Stdout format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format (for development)
    Pretty,
    /// JSON format (for structured logging in production)
    Json,
}

/// Log file with startup rotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFile {
    /// File path.
    pub path: PathBuf,
    /// Rotate when the file is at least this large.
    pub rotation_bytes: u64,
    /// Remove rotated files older than this.
    pub retention: Duration,
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// The minimum log level to capture
    pub level: LogLevel,
    /// The stdout format
    pub format: LogFormat,
    /// Whether to include the module target
    pub include_target: bool,
    /// Optional JSON log file
    pub file: Option<LogFile>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Pretty,
            include_target: true,
            file: None,
        }
    }
}

impl LoggingConfig {
    /// Creates a configuration logging INFO and above to stdout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Derives the configuration from application settings.
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigurationError> {
        let level = settings
            .log_level
            .parse()
            .map_err(|reason: String| ConfigurationError::invalid("log_level", reason))?;

        Ok(Self {
            level,
            format: if settings.enable_structured_logging {
                LogFormat::Json
            } else {
                LogFormat::Pretty
            },
            include_target: true,
            file: Some(LogFile {
                path: settings.log_file(),
                rotation_bytes: settings.log_rotation_bytes()?,
                retention: Duration::from_secs(u64::from(settings.log_retention_days) * 86_400),
            }),
        })
    }

    /// Sets the log level.
    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    /// Sets the stdout format.
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Disables the log file.
    pub fn without_file(mut self) -> Self {
        self.file = None;
        self
    }

    /// Installs the global subscriber. Call once at startup.
    ///
    /// `RUST_LOG` directives are honored on top of the configured level.
    pub fn init(self) -> Result<(), ConfigurationError> {
        let filter = EnvFilter::from_default_env().add_directive(LevelFilter::from(self.level).into());

        let json = (self.format == LogFormat::Json)
            .then(|| fmt::layer().json().with_target(self.include_target));
        let pretty = (self.format == LogFormat::Pretty)
            .then(|| fmt::layer().with_target(self.include_target));
        let file = match &self.file {
            Some(log_file) => Some(
                fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_writer(Mutex::new(open_log_file(log_file)?)),
            ),
            None => None,
        };

        tracing_subscriber::registry()
            .with(filter)
            .with(json)
            .with(pretty)
            .with(file)
            .try_init()
            .map_err(|e| ConfigurationError::Logging(e.to_string()))
    }
}

/// Opens the log file for appending, rotating and pruning first.
pub fn open_log_file(log_file: &LogFile) -> Result<File, ConfigurationError> {
    let path = &log_file.path;
    let io_error = |source| ConfigurationError::Io {
        path: path.clone(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| ConfigurationError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    rotate_if_needed(path, log_file.rotation_bytes).map_err(io_error)?;
    prune_rotated(path, log_file.retention);

    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_error)
}

/// Renames `path` to `path.<timestamp>` if it is at least `threshold` bytes.
/// Returns the rotated path, if any.
pub fn rotate_if_needed(path: &Path, threshold: u64) -> std::io::Result<Option<PathBuf>> {
    let size = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    if size < threshold {
        return Ok(None);
    }

    let stamp = Local::now().format("%Y%m%d-%H%M%S%.3f");
    let mut rotated = path.as_os_str().to_owned();
    rotated.push(format!(".{}", stamp));
    let rotated = PathBuf::from(rotated);
    fs::rename(path, &rotated)?;
    Ok(Some(rotated))
}

/// Removes rotated siblings of `path` last modified before `retention` ago.
/// Returns the number of files removed. Files that cannot be inspected or
/// removed are skipped.
pub fn prune_rotated(path: &Path, retention: Duration) -> usize {
    let (Some(dir), Some(name)) = (path.parent(), path.file_name()) else {
        return 0;
    };
    let dir = if dir.as_os_str().is_empty() { Path::new(".") } else { dir };
    let prefix = format!("{}.", name.to_string_lossy());
    let Some(cutoff) = SystemTime::now().checked_sub(retention) else {
        return 0;
    };
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };

    entries
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(&prefix))
        .filter(|entry| {
            entry
                .metadata()
                .and_then(|meta| meta.modified())
                .map(|modified| modified < cutoff)
                .unwrap_or(false)
        })
        .filter(|entry| fs::remove_file(entry.path()).is_ok())
        .count()
}
