//! Daily log files with JSON payload fields.
//!
//! Three append-only streams under the log directory:
//! `<YYYY-MM-DD>.log` with everything, `<YYYY-MM-DD>_errors.log` with
//! ERROR events, and `<YYYY-MM-DD>_sri.log` with events targeting the
//! `sri` wire protocol.

use crate::clock;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use thiserror::Error;
use tracing_subscriber::filter::{filter_fn, LevelFilter};
use tracing_subscriber::fmt::writer::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to install the tracing subscriber: {0}")]
    Install(String),
}

/// Logging options; `level` takes an `EnvFilter` directive such as
/// `info` or `facturero_core=debug`.
#[derive(Debug, Clone)]
pub struct LoggingOptions {
    pub directory: PathBuf,
    pub level: String,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        LoggingOptions {
            directory: PathBuf::from("logs"),
            level: "info".to_string(),
        }
    }
}

/// Install the global subscriber. Call once at startup.
pub fn init(options: LoggingOptions) -> Result<(), LoggingError> {
    let level_filter =
        EnvFilter::try_new(&options.level).map_err(|e| LoggingError::Install(e.to_string()))?;

    let general = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(DailyWriter::new(options.directory.clone(), ""));
    let errors = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(DailyWriter::new(options.directory.clone(), "_errors"))
        .with_filter(LevelFilter::ERROR);
    let sri = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(DailyWriter::new(options.directory, "_sri"))
        .with_filter(filter_fn(|metadata| metadata.target().starts_with("sri")));

    tracing_subscriber::registry()
        .with(level_filter)
        .with(general)
        .with(errors)
        .with(sri)
        .try_init()
        .map_err(|e| LoggingError::Install(e.to_string()))
}

/// Opens the day's file on every write batch so the stream rolls over
/// at midnight without a background task.
struct DailyWriter {
    directory: PathBuf,
    suffix: &'static str,
}

impl DailyWriter {
    fn new(directory: PathBuf, suffix: &'static str) -> DailyWriter {
        DailyWriter { directory, suffix }
    }

    fn open_today(&self) -> Option<std::fs::File> {
        let date = clock::now_in_ecuador().format("%Y-%m-%d");
        let path = self.directory.join(format!("{date}{}.log", self.suffix));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok()?;
        }
        OpenOptions::new().create(true).append(true).open(path).ok()
    }
}

impl<'a> MakeWriter<'a> for DailyWriter {
    type Writer = DailyFile;

    fn make_writer(&'a self) -> Self::Writer {
        DailyFile {
            file: self.open_today(),
        }
    }
}

/// A best-effort file handle: when the log directory is unavailable the
/// write is dropped rather than poisoning the subscriber.
struct DailyFile {
    file: Option<std::fs::File>,
}

impl Write for DailyFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.as_mut() {
            Some(file) => file.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}
