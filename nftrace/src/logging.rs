// SPDX-FileCopyrightText: 2026 The nftrace-rs Authors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Logger setup. A console appender is always present; an optional file
//! appender is added when `--log-file` is set. `PANIC`/`FATAL` (spec §6)
//! are not `log::Level`s — they are a local `Severity` wrapper so callers
//! can ask for "log at Error, then abort" without adding custom levels to
//! the `log` facade itself.

use anyhow::{Context, Result};
use log4rs::append::console::ConsoleAppender;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
    Panic,
    Fatal,
}

impl Severity {
    pub fn as_level_filter(self) -> log::LevelFilter {
        match self {
            Severity::Debug => log::LevelFilter::Debug,
            Severity::Info => log::LevelFilter::Info,
            Severity::Warn => log::LevelFilter::Warn,
            // PANIC/FATAL still need every Error line visible.
            Severity::Error | Severity::Panic | Severity::Fatal => log::LevelFilter::Error,
        }
    }

    /// PANIC/FATAL abort the process after logging; the others don't.
    pub fn aborts(self) -> bool {
        matches!(self, Severity::Panic | Severity::Fatal)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
            Severity::Panic => "PANIC",
            Severity::Fatal => "FATAL",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug)]
pub struct ParseSeverityError(String);

impl fmt::Display for ParseSeverityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid log level '{}' (use: info|debug|warn|error|panic|fatal)", self.0)
    }
}
impl std::error::Error for ParseSeverityError {}

impl FromStr for Severity {
    type Err = ParseSeverityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(Severity::Debug),
            "INFO" => Ok(Severity::Info),
            "WARN" | "WARNING" => Ok(Severity::Warn),
            "ERROR" => Ok(Severity::Error),
            "PANIC" => Ok(Severity::Panic),
            "FATAL" => Ok(Severity::Fatal),
            _ => Err(ParseSeverityError(s.to_string())),
        }
    }
}

/// Initializes the global `log` logger. `file_path` mirrors the teacher's
/// optional-file-appender pattern; `None` means console-only.
pub fn init(level: Severity, file_path: Option<&str>) -> Result<()> {
    let pattern = "{d(%Y-%m-%d %H:%M:%S%.3f)} {l:<5} [{T}] {m}{n}";

    let console = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(pattern)))
        .build();

    let mut builder =
        Config::builder().appender(Appender::builder().build("console", Box::new(console)));
    let mut root = Root::builder().appender("console");

    if let Some(path) = file_path {
        let file = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(pattern)))
            .build(path)
            .with_context(|| format!("opening log file {path}"))?;
        builder = builder.appender(Appender::builder().build("file", Box::new(file)));
        root = root.appender("file");
    }

    let config = builder
        .build(root.build(level.as_level_filter()))
        .context("building log4rs config")?;

    log4rs::init_config(config).context("installing logger")?;
    Ok(())
}

/// Logs at Error and aborts, for the PANIC/FATAL severities named in §6.
pub fn fatal(msg: &str) -> ! {
    log::error!("{msg}");
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_named_levels() {
        for (s, want) in [
            ("info", Severity::Info),
            ("DEBUG", Severity::Debug),
            ("Warn", Severity::Warn),
            ("error", Severity::Error),
            ("panic", Severity::Panic),
            ("fatal", Severity::Fatal),
        ] {
            assert_eq!(s.parse::<Severity>().unwrap(), want);
        }
    }

    #[test]
    fn rejects_unknown_level() {
        assert!("verbose".parse::<Severity>().is_err());
    }

    #[test]
    fn panic_and_fatal_abort_others_dont() {
        assert!(Severity::Panic.aborts());
        assert!(Severity::Fatal.aborts());
        assert!(!Severity::Error.aborts());
        assert!(!Severity::Info.aborts());
    }
}
