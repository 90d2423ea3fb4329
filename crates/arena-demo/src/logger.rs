use std::fmt;

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};

struct StderrLogger;

static LOGGER: StderrLogger = StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let module = record.module_path().unwrap_or_else(|| record.target());
        eprintln!("{} [{module}] {}", LevelFormat(record.level()), record.args());
    }

    fn flush(&self) {}
}

/// Installs the stderr logger, printing records up to `level`.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(level);
    Ok(())
}

struct LevelFormat(Level);

impl fmt::Display for LevelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let color = match self.0 {
            Level::Trace => 35,
            Level::Debug => 34,
            Level::Info => 32,
            Level::Warn => 33,
            Level::Error => 31,
        };
        let msg = match self.0 {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => " INFO",
            Level::Warn => " WARN",
            Level::Error => "ERROR",
        };
        write!(f, "\x1B[{color};1m{msg}\x1B[0m")
    }
}
