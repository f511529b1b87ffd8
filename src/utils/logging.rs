use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, Once};

use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use crate::error::{EngineError, Result};

static INIT: Once = Once::new();

/// Logging configuration options
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum log level, `RUST_LOG` directives refine it
    pub level: Level,
    /// Whether to include timestamps
    pub timestamps: bool,
    /// Whether to include source code locations
    pub source_location: bool,
    /// Whether to log span open and close events
    pub log_spans: bool,
    /// Append to this file instead of writing to stderr
    pub file_path: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            timestamps: true,
            source_location: false,
            log_spans: false,
            file_path: None,
        }
    }
}

/// Installs the global subscriber. Only the first call has an effect.
pub fn setup_logging(config: LogConfig) -> Result<()> {
    let mut result = Ok(());
    INIT.call_once(|| {
        result = setup_logging_internal(config);
    });
    result
}

fn setup_logging_internal(config: LogConfig) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive(LevelFilter::from_level(config.level).into());

    let writer = match &config.file_path {
        Some(path) => BoxMakeWriter::new(Mutex::new(open_log_file(path)?)),
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(config.file_path.is_none())
        .with_thread_names(true)
        .with_target(true)
        .with_file(config.source_location)
        .with_line_number(config.source_location)
        .with_span_events(if config.log_spans {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        });

    let installed = if config.timestamps {
        builder.try_init()
    } else {
        builder.without_time().try_init()
    };
    installed.map_err(|e| EngineError::config("logging", format!("Failed to set global subscriber: {e}")))
}

fn open_log_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| EngineError::Io {
            path: path.to_path_buf(),
            source,
        })
}
