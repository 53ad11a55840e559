use std::io::{self, Write};

use chrono::Local;
use crossterm::style::{Color, Stylize};
use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};

struct StderrLogger;

static LOGGER: StderrLogger = StderrLogger;

fn level_color(level: Level) -> Color {
    match level {
        Level::Error => Color::Red,
        Level::Warn => Color::Yellow,
        Level::Info => Color::AnsiValue(208),
        Level::Debug => Color::Cyan,
        Level::Trace => Color::DarkGrey,
    }
}

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let level = format!("{:<5}", record.level()).with(level_color(record.level()));
        let mut err = io::stderr().lock();
        // Nowhere to report a failed write to stderr.
        let _ = writeln!(
            err,
            "{} {} [{}] {}",
            Local::now().format("%H:%M:%S%.3f"),
            level,
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {
        let _ = io::stderr().flush();
    }
}

pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(level);
    Ok(())
}
