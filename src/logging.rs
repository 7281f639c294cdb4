//! Logging for btwake
//!
//! A small `log::Log` implementation: timestamped, colourised lines on
//! stderr, plain lines in an optional log file, and per-category gating of
//! debug output so a noisy subsystem can be enabled on its own.

use chrono::Local;
use log::{Level, LevelFilter, Metadata, Record};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Mutex, Once, RwLock};

use crate::config::LogLevel;

/// Timestamp format for log entries
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Global initialization guard
static INIT_LOGGER: Once = Once::new();

/// Debug flag categories for selective logging
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebugFlags {
    pub bluetooth: bool,  // executor, backends, pairing guard
    pub controller: bool, // state machine phases, retries
    pub monitor: bool,    // poller and state mirror
    pub config: bool,     // configuration loading and validation
    pub all: bool,
}

impl DebugFlags {
    /// Every category on
    pub fn all() -> Self {
        Self {
            all: true,
            ..Self::default()
        }
    }

    /// Turn on one category by name
    pub fn enable(&mut self, category: &str) -> Result<(), String> {
        match category.trim().to_ascii_lowercase().as_str() {
            "bluetooth" => self.bluetooth = true,
            "controller" => self.controller = true,
            "monitor" => self.monitor = true,
            "config" => self.config = true,
            "all" => self.all = true,
            other => {
                return Err(format!(
                    "unknown debug category '{}', expected bluetooth, controller, monitor, config or all",
                    other
                ))
            }
        }
        Ok(())
    }
}

static DEBUG_FLAGS: RwLock<DebugFlags> = RwLock::new(DebugFlags {
    bluetooth: false,
    controller: false,
    monitor: false,
    config: false,
    all: false,
});

/// Logger installed by [`configure_logging`]
pub struct WakeLogger {
    file: Option<Mutex<File>>,
    level: LevelFilter,
    console_output: bool,
}

impl log::Log for WakeLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        if metadata.level() > self.level {
            return false;
        }
        // debug and trace are additionally gated per category
        if metadata.level() >= Level::Debug {
            return should_log_debug(metadata.target());
        }
        true
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let timestamp = Local::now().format(TIMESTAMP_FORMAT).to_string();
        let module = record.module_path().unwrap_or("<unknown>");

        if self.console_output {
            let line = format_line(&timestamp, colour_level(record.level()), module, record.args());
            let _ = io::stderr().write_all(line.as_bytes());
        }

        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let line = format_line(&timestamp, record.level().as_str(), module, record.args());
                let _ = file.write_all(line.as_bytes());
                let _ = file.flush();
            }
        }
    }

    fn flush(&self) {
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
    }
}

fn colour_level(level: Level) -> &'static str {
    match level {
        Level::Error => "\x1B[31mERROR\x1B[0m",
        Level::Warn => "\x1B[33mWARN \x1B[0m",
        Level::Info => "\x1B[32mINFO \x1B[0m",
        Level::Debug => "\x1B[36mDEBUG\x1B[0m",
        Level::Trace => "\x1B[90mTRACE\x1B[0m",
    }
}

fn format_line(timestamp: &str, level: &str, module: &str, args: impl std::fmt::Display) -> String {
    format!("[{}] {} [{}] {}\n", timestamp, level, module, args)
}

/// Install the global logger. Only the first call has any effect.
pub fn configure_logging(
    level: LogLevel,
    log_file: Option<PathBuf>,
    console_output: bool,
) -> Result<(), String> {
    let mut result = Ok(());

    INIT_LOGGER.call_once(|| {
        let level_filter = LevelFilter::from(level);

        let file = match &log_file {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    if let Err(e) = std::fs::create_dir_all(parent) {
                        result = Err(format!("Failed to create log directory: {}", e));
                        return;
                    }
                }
                match OpenOptions::new().create(true).append(true).open(path) {
                    Ok(file) => Some(Mutex::new(file)),
                    Err(e) => {
                        result = Err(format!("Failed to open log file: {}", e));
                        return;
                    }
                }
            }
            None => None,
        };

        let logger = Box::new(WakeLogger {
            file,
            level: level_filter,
            console_output,
        });

        if let Err(e) = log::set_boxed_logger(logger) {
            result = Err(format!("Failed to set logger: {}", e));
            return;
        }
        log::set_max_level(level_filter);

        log::info!("Logging initialized at level: {}", level_filter);
        if let Some(path) = log_file {
            log::info!("Log file: {}", path.display());
        }
    });

    result
}

/// Set global debug flags for selective logging
pub fn set_debug_flags(flags: DebugFlags) {
    if let Ok(mut debug_flags) = DEBUG_FLAGS.write() {
        *debug_flags = flags;
    }
}

/// Whether debug output from `module_path` is enabled by the current flags
pub fn should_log_debug(module_path: &str) -> bool {
    let Ok(flags) = DEBUG_FLAGS.read() else {
        return false;
    };
    if flags.all {
        return true;
    }

    if module_path.contains("::bluetooth") {
        return flags.bluetooth;
    }
    if module_path.contains("::controller") || module_path.contains("lifecycle") {
        return flags.controller;
    }
    if module_path.contains("::monitor") {
        return flags.monitor;
    }
    if module_path.contains("::config") {
        return flags.config;
    }
    // binary and anything uncategorised
    flags.controller
}
