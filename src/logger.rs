// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Structured run logging.
//!
//! Every step of a provisioning run reports status through one [`Logger`].
//! The logger appends a timestamped, leveled line to a persistent log file,
//! and mirrors a color-coded copy of the same line to the terminal's error
//! stream when the current verbosity threshold permits.
//!
//! # Log File
//!
//! The log file is append-only. Entries are never mutated or deleted by the
//! running process, so the file doubles as a durable record of every run that
//! touched the machine. The file is created on first use with mode 600, since
//! step messages may mention paths and account names that do not belong in a
//! world-readable file.
//!
//! # Degraded Mode
//!
//! A logger must never take down the run it is observing. If the log file
//! cannot be created or written, the logger degrades to terminal-only output
//! and emits a one-time warning about the degradation. No logging call ever
//! returns an error or panics.

use chrono::Local;
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs::{File, OpenOptions},
    io::Write,
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Mutex,
};

/// Severity level of a log entry.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// ANSI color escape for terminal mirroring.
    ///
    /// Color selection is a pure function of level: INFO is green, WARN is
    /// yellow, ERROR is red, DEBUG is blue.
    pub fn color(&self) -> &'static str {
        match self {
            Self::Debug => "\x1b[34m",
            Self::Info => "\x1b[32m",
            Self::Warn => "\x1b[33m",
            Self::Error => "\x1b[31m",
        }
    }

    /// Tag used inside the bracketed level field of a log line.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

impl Display for LogLevel {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.tag())
    }
}

impl FromStr for LogLevel {
    type Err = std::convert::Infallible;

    /// Parse level tag leniently.
    ///
    /// Unrecognized level strings fall back to [`LogLevel::Info`] rather than
    /// failing, so a sloppy caller still produces a well-formed log line.
    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        Ok(match tag.to_uppercase().as_str() {
            "DEBUG" => Self::Debug,
            "WARN" | "WARNING" => Self::Warn,
            "ERROR" => Self::Error,
            _ => Self::Info,
        })
    }
}

/// Threshold controlling how much output is mirrored to the terminal.
///
/// The log file always receives everything. The terminal receives nothing at
/// [`Verbosity::Silent`], only ERROR entries at [`Verbosity::ErrorsOnly`], and
/// every entry at [`Verbosity::Everything`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    Silent,
    ErrorsOnly,
    #[default]
    Everything,
}

impl Verbosity {
    fn permits(&self, level: LogLevel) -> bool {
        match self {
            Self::Silent => false,
            Self::ErrorsOnly => level == LogLevel::Error,
            Self::Everything => true,
        }
    }
}

/// Leveled, timestamped logger shared by every step of a run.
#[derive(Debug)]
pub struct Logger {
    path: PathBuf,
    verbosity: Verbosity,
    sink: Mutex<Sink>,
}

#[derive(Debug)]
struct Sink {
    file: Option<File>,
    degradation_warned: bool,
}

impl Logger {
    /// Open logger over target log file.
    ///
    /// Creates the log file and its parent directory if needed. Construction
    /// never fails: when the file cannot be opened the logger starts in
    /// degraded terminal-only mode instead.
    pub fn open(path: impl Into<PathBuf>, verbosity: Verbosity) -> Self {
        let path = path.into();

        if let Some(parent) = path.parent() {
            let _ = mkdirp::mkdirp(parent);
        }

        // INVARIANT: Log file is append-only with restrictive permissions.
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o600)
            .open(&path)
            .ok();

        Self {
            path,
            verbosity,
            sink: Mutex::new(Sink {
                file,
                degradation_warned: false,
            }),
        }
    }

    /// Path of the log file this logger appends to.
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// Record message at target severity level.
    ///
    /// Appends `[timestamp] [LEVEL] message` to the log file, and mirrors a
    /// color-coded copy to stderr when the verbosity threshold permits. Never
    /// fails; a broken log file downgrades to terminal-only output with a
    /// one-time warning.
    pub fn log(&self, level: LogLevel, message: impl AsRef<str>) {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let line = format_entry(&timestamp, level, message.as_ref());

        // INVARIANT: A panic elsewhere must not silence the log.
        let mut sink = self
            .sink
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut broken = false;
        if let Some(file) = sink.file.as_mut() {
            if writeln!(file, "{line}").is_err() {
                broken = true;
            }
        }
        if broken {
            sink.file = None;
        }

        if sink.file.is_none() && !sink.degradation_warned {
            sink.degradation_warned = true;
            let warning = format_entry(
                &timestamp,
                LogLevel::Warn,
                &format!(
                    "cannot write log file at {:?}, continuing with terminal output only",
                    self.path.display()
                ),
            );
            eprintln!("{}{warning}{}", LogLevel::Warn.color(), RESET);
        }

        if self.verbosity.permits(level) {
            eprintln!("{}{line}{}", level.color(), RESET);
        }
    }

    /// Record message at INFO level.
    pub fn info(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Info, message);
    }

    /// Record message at WARN level.
    pub fn warn(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Warn, message);
    }

    /// Record message at ERROR level.
    pub fn error(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Error, message);
    }

    /// Record message at DEBUG level.
    pub fn debug(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Debug, message);
    }
}

const RESET: &str = "\x1b[0m";

/// Render one log line in the stable `[timestamp] [LEVEL] message` format.
fn format_entry(timestamp: &str, level: LogLevel, message: &str) -> String {
    format!("[{timestamp}] [{level}] {message}")
}
